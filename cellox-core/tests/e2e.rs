//! End-to-end tests driving `Vm::interpret` directly over the six
//! source -> stdout scenarios named in `spec.md` §8, plus the runtime-error
//! stack-trace scenario. Each test compiles and runs a whole program on a
//! fresh `Vm` and asserts on the lines collected by `CollectSink`.

use pretty_assertions::assert_eq;

use cellox_core::vm::CollectSink;
use cellox_core::{InterpretOutcome, Vm};

fn run_ok(src: &str) -> Vec<String> {
    let mut vm = Vm::new();
    let mut sink = CollectSink::default();
    match vm.interpret(src, &mut sink) {
        InterpretOutcome::Ok => sink.lines,
        other => panic!("expected success, got: {other}"),
    }
}

/// Scenario 1: Fibonacci recursion.
#[test]
fn fibonacci_recursion() {
    let src = "fun fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); } print fib(10);";
    assert_eq!(run_ok(src), vec!["55"]);
}

/// Scenario 2: closure over a mutable counter.
#[test]
fn closure_over_mutable_counter() {
    let src = "fun mk() { var i = 0; fun step() { i = i + 1; return i; } return step; } \
               var s = mk(); print s(); print s(); print s();";
    assert_eq!(run_ok(src), vec!["1", "2", "3"]);
}

/// Scenario 3: class with initializer and inheritance.
#[test]
fn class_with_initializer_and_inheritance() {
    let src = "class A { greet() { print \"hi from A\"; } } class B : A { } B().greet();";
    assert_eq!(run_ok(src), vec!["hi from A"]);
}

/// Scenario 4: string interning observable via identity-like equality.
#[test]
fn string_interning_observable_via_equality() {
    let src = "var a = \"foo\" + \"bar\"; var b = \"foobar\"; print a == b;";
    assert_eq!(run_ok(src), vec!["true"]);
}

/// Scenario 5: array slice and index.
#[test]
fn array_slice_and_index() {
    let src = "var a = [10,20,30,40]; print a[2]; print a[1..3];";
    assert_eq!(run_ok(src), vec!["30", "[20, 30]"]);
}

/// Scenario 6: a runtime error unwinds with a stack trace citing every
/// active frame, innermost first.
#[test]
fn runtime_error_stack_trace() {
    let src = "fun g() { return 1 + \"x\"; }\nfun f() { return g(); }\nf();";
    let mut vm = Vm::new();
    let mut sink = CollectSink::default();
    match vm.interpret(src, &mut sink) {
        InterpretOutcome::RuntimeError(e) => {
            assert_eq!(e.trace.len(), 3);
            assert_eq!(e.trace[0].function_name.as_deref(), Some("g"));
            assert_eq!(e.trace[1].function_name.as_deref(), Some("f"));
            assert_eq!(e.trace[2].function_name, None);
        }
        other => panic!("expected a runtime error, got {other:?}"),
    }
}
