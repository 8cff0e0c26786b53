//! Command-line argument surface (spec §6) and the process exit codes
//! that every run path ultimately resolves to.

use std::path::PathBuf;

use clap::Parser;

/// A small, dynamically typed, class-based scripting language.
#[derive(Debug, Parser)]
#[command(name = "cellox", version, about, long_about = None, disable_version_flag = true)]
pub struct Args {
    /// Source (`.clx`) or precompiled chunk (`.cxcf`) file to run.
    /// Omit to start the REPL.
    #[arg(conflicts_with = "compile")]
    pub path: Option<PathBuf>,

    /// Compile PATH to a `.cxcf` file beside it instead of running it.
    #[arg(short = 'c', long = "compile", value_name = "PATH")]
    pub compile: Option<PathBuf>,

    /// Print version information and exit.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    pub version: (),
}

/// The process exit codes named in spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Ok = 0,
    Usage = 64,
    Compile = 65,
    Runtime = 70,
    Internal = 71,
    Io = 74,
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        Self::from(code as u8)
    }
}
