use std::{cell::RefCell, io::Write, rc::Rc};

use clap::{Args, Parser, Subcommand};
use comet::{
    object::Strings,
    tokenizer::Tokenizer,
    Config, InterpretError, SourceFile, Vm,
};

const EXIT_COMPILE_ERROR: i32 = 65;
const EXIT_RUNTIME_ERROR: i32 = 70;
const EXIT_IO_ERROR: i32 = 74;

#[derive(Debug, Parser)]
#[command(name = "comet", about = "Compiles and runs comet scripts")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Print the operand stack and each instruction as it executes
    #[arg(long, global = true)]
    trace: bool,

    /// Print the bytecode of every compiled function before running it
    #[arg(long, global = true)]
    print_code: bool,

    /// Print how often each instruction ran after every run
    #[arg(long, global = true)]
    profile: bool,
}

impl Cli {
    pub fn command(&self) -> &Command {
        self.command.as_ref().unwrap_or(&Command::Repl)
    }

    fn config(&self) -> Config {
        let defaults = Config::default();
        Config {
            trace_execution: self.trace || defaults.trace_execution,
            print_code: self.print_code || defaults.print_code,
            profile: self.profile,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one or more script files
    Run(RunArgs),
    /// Print the token stream of a file
    Tokens(FileArgs),
    /// Print the bytecode a file compiles to
    Disassemble(FileArgs),
    Repl,
    Benchmark,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(required = true)]
    files: Vec<String>,
}

#[derive(Debug, Args)]
struct FileArgs {
    file: String,
}

fn main() {
    env_logger::init();
    let args = Cli::parse();
    let config = args.config();

    let status = match args.command() {
        Command::Repl => {
            repl_command(config);
            0
        }
        Command::Run(run) => run_command(run, config),
        Command::Tokens(file) => tokens_command(file),
        Command::Disassemble(file) => disassemble_command(file),
        Command::Benchmark => benchmark_command(config),
    };

    std::process::exit(status);
}

fn new_vm(config: Config) -> Vm {
    Vm::new(Rc::new(RefCell::new(std::io::stdout()))).with_config(config)
}

fn repl_command(config: Config) {
    println!("Welcome to the comet REPL!");
    println!("EOF to exit. (Ctrl+D on *nix, Ctrl+Z on Windows)");

    let mut vm = new_vm(config);
    let mut input = String::new();
    loop {
        print!("> ");
        std::io::stdout()
            .flush()
            .expect("should be able to flush stdout");

        let read = std::io::stdin()
            .read_line(&mut input)
            .expect("should be able to read line from stdin");

        if read == 0 {
            break;
        }

        let source = SourceFile::new("repl", input.trim());
        if let Err(e) = vm.interpret(&source) {
            println!("Error: {}", e);
        }

        input.clear()
    }
}

/// Runs every file in turn with a fresh VM each, returning the exit status
/// of the last failure.
fn run_command(args: &RunArgs, config: Config) -> i32 {
    let mut status = 0;
    for file in &args.files {
        let source = match SourceFile::load(file) {
            Ok(source) => source,
            Err(e) => {
                eprintln!("{}", e);
                status = EXIT_IO_ERROR;
                continue;
            }
        };

        let mut vm = new_vm(config);
        match vm.interpret(&source) {
            Ok(()) => {}
            Err(e @ InterpretError::Compile(_)) => {
                eprintln!("{}", e);
                status = EXIT_COMPILE_ERROR;
            }
            Err(e @ InterpretError::Runtime { .. }) => {
                eprintln!("{}", e);
                status = EXIT_RUNTIME_ERROR;
            }
        }
    }
    status
}

fn tokens_command(args: &FileArgs) -> i32 {
    let source = match SourceFile::load(&args.file) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_IO_ERROR;
        }
    };

    let mut line = 0;
    for token in Tokenizer::new(source.content()) {
        if token.line != line {
            print!("{:4} ", token.line);
            line = token.line;
        } else {
            print!("   | ");
        }
        println!(
            "{:<16} '{}'",
            format!("{:?}", token.token_type),
            token.lexeme.escape_debug()
        );
    }

    0
}

fn disassemble_command(args: &FileArgs) -> i32 {
    let source = match SourceFile::load(&args.file) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{}", e);
            return EXIT_IO_ERROR;
        }
    };

    let mut strings = Strings::new();
    match comet::compile(&source, &mut strings) {
        Ok(function) => {
            print!("{}", function.disassemble_all());
            0
        }
        Err(e) => {
            eprintln!("{}", e);
            EXIT_COMPILE_ERROR
        }
    }
}

fn benchmark_command(config: Config) -> i32 {
    let source = SourceFile::new("benchmark", comet_fib_source());

    let start = std::time::Instant::now();
    if let Err(e) = new_vm(config).interpret(&source) {
        println!("Failed to run comet fib code: {e}");
        return EXIT_RUNTIME_ERROR;
    }
    let comet_elapsed = start.elapsed();
    println!("Comet Took: {:?}", comet_elapsed);

    let start = std::time::Instant::now();
    rust_fib();
    let fib_elapsed = start.elapsed();
    println!("Fib Took: {:?}", fib_elapsed);

    println!(
        "Rust is {}x faster than comet",
        comet_elapsed.as_secs_f64() / fib_elapsed.as_secs_f64()
    );
    0
}

fn comet_fib_source() -> &'static str {
    r#"
function fib(n) {
    if (n <= 1) {
        return n
    }
    return fib(n - 1) + fib(n - 2)
}

print(fib(30))
"#
}

fn rust_fib() {
    println!("{}", fib(30));
}

fn fib(n: i64) -> i64 {
    if n <= 1 {
        return n;
    }
    fib(n - 1) + fib(n - 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repl_is_default() {
        let cli = Cli::parse_from(["comet"]);
        assert!(matches!(cli.command(), Command::Repl));
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["comet", "run", "a.cmt", "b.cmt", "--profile", "--trace"]);
        let Command::Run(run) = cli.command() else {
            panic!("expected the run subcommand");
        };
        assert_eq!(run.files, vec!["a.cmt", "b.cmt"]);

        let config = cli.config();
        assert!(config.profile);
        assert!(config.trace_execution);
    }

    #[test]
    fn test_run_reports_missing_file() {
        let args = RunArgs {
            files: vec!["definitely/missing.cmt".to_string()],
        };
        assert_eq!(run_command(&args, Config::default()), EXIT_IO_ERROR);
    }
}
