//! Interactive read-eval-print loop.
//!
//! One VM lives for the whole session, so globals, classes, and interned
//! strings persist between lines. Two conveniences carried over from the
//! original shell:
//! - a line ending in `\` continues on the next line;
//! - a line starting with `=` prints the expression, so `=1+2` is
//!   shorthand for `print 1+2;`.

use std::io;
use std::process::ExitCode;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use lox_core::DebugOptions;
use lox_runtime::Vm;

pub fn run(opts: DebugOptions) -> ExitCode {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(error) => {
            eprintln!("Could not start line editor: {}", error);
            return ExitCode::from(74);
        }
    };

    println!("lox {}", env!("CARGO_PKG_VERSION"));

    let mut out = io::stdout();
    let mut err = io::stderr();
    let mut vm = Vm::new(opts, &mut out, &mut err);
    let mut pending = String::new();

    loop {
        let prompt = if pending.is_empty() { "> " } else { ". " };
        let line = match editor.readline(prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                pending.clear();
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(error) => {
                eprintln!("Read error: {}", error);
                return ExitCode::from(74);
            }
        };

        let _ = editor.add_history_entry(&line);

        if let Some(continued) = line.strip_suffix('\\') {
            pending.push_str(continued);
            pending.push('\n');
            continue;
        }
        pending.push_str(&line);

        let source = if let Some(expression) = pending.strip_prefix('=') {
            format!("print {};", expression)
        } else {
            pending.clone()
        };
        pending.clear();

        if source.trim().is_empty() {
            continue;
        }
        vm.interpret(&source);
    }

    ExitCode::SUCCESS
}
