pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod object;
pub mod source;
pub mod tokenizer;
pub mod vm;

pub use compiler::{compile, CompileError};
pub use config::Config;
pub use source::SourceFile;
pub use vm::{InterpretError, RuntimeError, Vm};
