//! The non-REPL run paths: compiling a `.clx` source file to a `.cxcf`
//! chunk file, and running either kind of file directly (§6).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use cellox_core::vm::StdoutSink;
use cellox_core::{InterpretOutcome, Vm};

use crate::cli::ExitCode;
use crate::natives;

/// `cellox PATH`: dispatches on suffix (§6 "Source file recognition").
pub fn run_path(path: &Path) -> Result<ExitCode> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("clx") => run_source_file(path),
        Some("cxcf") => run_chunk_file(path),
        _ => {
            eprintln!("error: {} has neither a .clx nor a .cxcf suffix", path.display());
            Ok(ExitCode::Usage)
        }
    }
}

/// `cellox -c|--compile PATH`: compiles PATH to a `.cxcf` file beside it.
pub fn compile_to_file(path: &Path) -> Result<ExitCode> {
    if path.extension().and_then(|e| e.to_str()) != Some("clx") {
        eprintln!("error: --compile requires a .clx source file, got {}", path.display());
        return Ok(ExitCode::Usage);
    }
    let source = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

    let mut heap = cellox_core::heap::Heap::new();
    let script = match cellox_core::compiler::compile(&source, &mut heap) {
        Ok(id) => id,
        Err(errors) => {
            for e in &errors {
                eprintln!("{e}");
            }
            return Ok(ExitCode::Compile);
        }
    };
    let encoded = cellox_core::codec::encode(&heap, script).context("encoding chunk file")?;

    let out_path = path.with_extension("cxcf");
    fs::write(&out_path, encoded).with_context(|| format!("writing {}", out_path.display()))?;
    println!("{}", out_path.display());
    Ok(ExitCode::Ok)
}

fn run_source_file(path: &Path) -> Result<ExitCode> {
    let source = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut vm = Vm::new();
    natives::install(&mut vm);
    let mut sink = StdoutSink;
    Ok(outcome_to_exit_code(vm.interpret(&source, &mut sink)))
}

fn run_chunk_file(path: &Path) -> Result<ExitCode> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut vm = Vm::new();
    natives::install(&mut vm);
    let mut sink = StdoutSink;
    match vm.interpret_chunk_file(&bytes, &mut sink) {
        Ok(outcome) => Ok(outcome_to_exit_code(outcome)),
        Err(codec_error) => {
            eprintln!("error: {codec_error}");
            Ok(ExitCode::Io)
        }
    }
}

fn outcome_to_exit_code(outcome: InterpretOutcome) -> ExitCode {
    match outcome {
        InterpretOutcome::Ok => ExitCode::Ok,
        InterpretOutcome::CompileError(errors) => {
            for e in &errors {
                eprintln!("{e}");
            }
            ExitCode::Compile
        }
        InterpretOutcome::RuntimeError(e) => {
            eprintln!("{e}");
            ExitCode::Runtime
        }
    }
}
