//! `cellox_core`: lexer, single-pass bytecode compiler, peephole
//! optimizer, tracing mark-sweep heap, and the stack-based virtual
//! machine for the Cellox language.
//!
//! This crate has no I/O of its own: it never prints, reads a file, or
//! calls `std::process::exit`. `print` is the one exception the
//! language's own semantics require (§5 "stdout from `print`/natives"
//! is an ordering guarantee the core must honor) — it is routed through
//! [`vm::PrintSink`], an injected sink rather than a direct stdout call,
//! so embedders (the `cellox-cli` binary, or a test harness) choose
//! where that output goes.

pub mod chunk;
pub mod codec;
pub mod compiler;
pub mod error;
pub mod gc;
pub mod heap;
pub mod lexer;
pub mod optimizer;
pub mod table;
pub mod value;
pub mod vm;

pub use error::{CodecError, CompileError, RuntimeError};
pub use value::Value;
pub use vm::{InterpretOutcome, PrintSink, Vm};
