//! Chunk-file (`.cxcf`) round-trip tests (§4.6, §8 "Chunk-file round-trip"
//! invariant): compiling a program, encoding its chunk, and decoding it
//! back must reproduce the same bytecode and constant pool, including
//! constants belonging to nested function declarations.

use pretty_assertions::assert_eq;

use cellox_core::heap::{Heap, HeapData};
use cellox_core::{codec, compiler};

fn round_trip(source: &str) -> (Vec<u8>, Vec<u8>) {
    let mut write_heap = Heap::new();
    let script = compiler::compile(source, &mut write_heap).expect("compiles");
    let encoded = codec::encode(&write_heap, script).expect("encodes");

    let mut read_heap = Heap::new();
    let decoded = codec::decode(&mut read_heap, &encoded).expect("decodes");
    let HeapData::Function(original) = write_heap.get(script) else { unreachable!() };
    let HeapData::Function(restored) = read_heap.get(decoded) else { unreachable!() };
    (original.chunk.code().to_vec(), restored.chunk.code().to_vec())
}

#[test]
fn bytecode_survives_a_round_trip() {
    let (before, after) = round_trip("print 1 + 2;");
    assert_eq!(before, after);
}

#[test]
fn nested_function_constants_keep_their_original_indices() {
    let source = "var a = \"before\"; fun f() { return 1; } var b = \"after\"; print a; print b; print f();";
    let mut write_heap = Heap::new();
    let script = compiler::compile(source, &mut write_heap).expect("compiles");
    let encoded = codec::encode(&write_heap, script).expect("encodes");

    let mut read_heap = Heap::new();
    let decoded = codec::decode(&mut read_heap, &encoded).expect("decodes");
    let HeapData::Function(original) = write_heap.get(script) else { unreachable!() };
    let HeapData::Function(restored) = read_heap.get(decoded) else { unreachable!() };
    assert_eq!(original.chunk.constants().len(), restored.chunk.constants().len());
    assert_eq!(original.chunk.code(), restored.chunk.code());
}

#[test]
fn round_trip_preserves_a_deeper_nesting_of_functions() {
    let source = "fun outer() { fun inner() { return 1; } return inner(); } print outer();";
    let (before, after) = round_trip(source);
    assert_eq!(before, after);
}
