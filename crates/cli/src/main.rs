//! Lox CLI: run a script, read from stdin, or drop into the REPL.
//!
//! Exit codes follow the usual sysexits split: 65 for compile errors, 70
//! for runtime errors, 74 for I/O errors.

use std::io::{self, Read};
use std::process::ExitCode;

use clap::Parser;

use lox_core::DebugOptions;
use lox_runtime::{InterpretResult, Vm};

mod repl;

#[derive(Parser)]
#[command(name = "lox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lox bytecode interpreter", long_about = None)]
struct Cli {
    /// Disassemble each function after it compiles
    #[arg(long)]
    dump: bool,

    /// Trace the stack and every instruction while executing
    #[arg(long)]
    trace: bool,

    /// Log garbage collection cycles
    #[arg(long = "log-gc")]
    log_gc: bool,

    /// Collect garbage before every allocation
    #[arg(long = "stress-gc")]
    stress_gc: bool,

    /// Script to run, or '-' for stdin; starts a REPL when omitted
    path: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let opts = DebugOptions {
        print_code: cli.dump,
        trace_execution: cli.trace,
        log_gc: cli.log_gc,
        stress_gc: cli.stress_gc,
    };

    match cli.path {
        Some(path) => run_file(&path, opts),
        None => repl::run(opts),
    }
}

fn read_source(path: &str) -> io::Result<String> {
    if path == "-" {
        let mut source = String::new();
        io::stdin().read_to_string(&mut source)?;
        return Ok(source);
    }
    std::fs::read_to_string(path)
}

fn run_file(path: &str, opts: DebugOptions) -> ExitCode {
    let source = match read_source(path) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("Could not open file '{}': {}", path, error);
            return ExitCode::from(74);
        }
    };

    let mut out = io::stdout();
    let mut err = io::stderr();
    let mut vm = Vm::new(opts, &mut out, &mut err);
    match vm.interpret(&source) {
        InterpretResult::Ok => ExitCode::SUCCESS,
        InterpretResult::CompileError => ExitCode::from(65),
        InterpretResult::RuntimeError => ExitCode::from(70),
    }
}
