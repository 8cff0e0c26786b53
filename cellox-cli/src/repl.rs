//! Line-oriented REPL (§6). No multi-line continuation: each line is
//! compiled and run as an independent top-level program. Globals and
//! the heap persist across lines on the same [`Vm`]; locals do not,
//! since every line is its own script-function call frame. An empty
//! line ends the session.

use anyhow::Result;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use cellox_core::vm::StdoutSink;
use cellox_core::{InterpretOutcome, Vm};

use crate::cli::ExitCode;
use crate::natives;

pub fn run() -> Result<ExitCode> {
    let mut vm = Vm::new();
    natives::install(&mut vm);
    let mut sink = StdoutSink;
    let mut editor = DefaultEditor::new()?;

    loop {
        match editor.readline("cellox> ") {
            Ok(line) if line.is_empty() => break,
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                match vm.interpret(&line, &mut sink) {
                    InterpretOutcome::Ok => {}
                    InterpretOutcome::CompileError(errors) => {
                        for e in &errors {
                            eprintln!("{e}");
                        }
                    }
                    InterpretOutcome::RuntimeError(e) => eprintln!("{e}"),
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(ExitCode::Ok)
}
