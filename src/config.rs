/// Runtime switches for the virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Print the operand stack and the next instruction before each dispatch.
    pub trace_execution: bool,
    /// Print the disassembly of every compiled function before running it.
    pub print_code: bool,
    /// Count instruction executions and print them after each run.
    pub profile: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace_execution: cfg!(feature = "trace"),
            print_code: cfg!(feature = "disassemble"),
            profile: false,
        }
    }
}
