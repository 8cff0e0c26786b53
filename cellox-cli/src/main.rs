//! `cellox`: the CLI front end for the Cellox language (spec §6). Owns
//! every piece of I/O the core crate deliberately has none of — argv
//! parsing, source/chunk file reading and writing, the REPL prompt
//! loop, and exit-code mapping.

mod cli;
mod driver;
mod natives;
mod repl;

use std::process::ExitCode as ProcessExitCode;

use clap::Parser;

use cli::{Args, ExitCode};

fn main() -> ProcessExitCode {
    install_tracing();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap's own exit codes don't match spec §6; print its
            // message ourselves and map to the usage-error code.
            let _ = e.print();
            return ExitCode::Usage.into();
        }
    };

    match run(args) {
        Ok(code) => code.into(),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::Io.into()
        }
    }
}

fn run(args: Args) -> anyhow::Result<ExitCode> {
    if let Some(path) = args.compile {
        return driver::compile_to_file(&path);
    }
    if let Some(path) = args.path {
        return driver::run_path(&path);
    }
    repl::run()
}

/// Installs a `tracing-subscriber` filtered by `CELLOX_LOG` (§B of
/// `SPEC_FULL.md`), defaulting to `warn` when unset. The library never
/// installs a subscriber of its own; only the binary front door does.
fn install_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("CELLOX_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}
