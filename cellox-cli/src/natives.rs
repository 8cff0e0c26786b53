//! The reference native-function library: `clock`, `strlen`, and
//! `read_line`, registered into the VM's globals at startup.
//!
//! Individual native semantics are an external-collaborator concern
//! (spec §1) — only the contract by which a native plugs into the VM
//! (§4.10) belongs to `cellox-core`. This module is the minimal set that
//! exercises that contract end to end, named after the originals'
//! `native_functions.c` library without reproducing its full surface
//! (`append_to_file`, `read_key`, `system`, … stay out of scope).

use std::io::{self, BufRead, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use cellox_core::Vm;
use cellox_core::heap::{Heap, HeapData};
use cellox_core::value::{Value, ValueKind};

/// Registers every native in this module into `vm`'s globals.
pub fn install(vm: &mut Vm) {
    vm.define_native("clock", clock);
    vm.define_native("strlen", strlen);
    vm.define_native("read_line", read_line);
}

/// `clock() -> Number`: seconds elapsed since the Unix epoch.
fn clock(_heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    if !args.is_empty() {
        return Err(format!("clock() expects 0 arguments but got {}.", args.len()));
    }
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| format!("system clock is set before the Unix epoch: {e}"))?;
    Ok(Value::number(elapsed.as_secs_f64()))
}

/// `strlen(s) -> Number`: byte length of a string argument.
fn strlen(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    let [arg] = args else {
        return Err(format!("strlen() expects 1 argument but got {}.", args.len()));
    };
    if arg.kind() != ValueKind::Obj {
        return Err("strlen() expects a string argument.".to_owned());
    }
    match heap.get(arg.as_obj_unchecked()) {
        HeapData::String(s) => Ok(Value::number(s.bytes.len() as f64)),
        other => Err(format!("strlen() expects a string argument, got a {}.", other.kind_name())),
    }
}

/// `read_line() -> String`: one line from stdin, newline stripped,
/// interned into the heap.
fn read_line(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    if !args.is_empty() {
        return Err(format!("read_line() expects 0 arguments but got {}.", args.len()));
    }
    io::stdout().flush().map_err(|e| e.to_string())?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).map_err(|e| e.to_string())?;
    let trimmed = line.trim_end_matches(['\n', '\r']);
    Ok(Value::obj(heap.intern_string(trimmed.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellox_core::vm::CollectSink;
    use cellox_core::{InterpretOutcome, Vm};

    #[test]
    fn clock_and_strlen_are_callable_from_a_script() {
        let mut vm = Vm::new();
        install(&mut vm);
        let mut sink = CollectSink::default();
        let outcome = vm.interpret("print strlen(\"hello\"); print clock() >= 0;", &mut sink);
        assert!(matches!(outcome, InterpretOutcome::Ok), "{outcome}");
        assert_eq!(sink.lines, vec!["5", "true"]);
    }

    #[test]
    fn strlen_rejects_non_string_arguments() {
        let mut vm = Vm::new();
        install(&mut vm);
        let mut sink = CollectSink::default();
        let outcome = vm.interpret("strlen(1);", &mut sink);
        assert!(matches!(outcome, InterpretOutcome::RuntimeError(_)));
    }
}
