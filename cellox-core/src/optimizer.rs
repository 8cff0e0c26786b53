//! Peephole constant folding over already-emitted bytecode (§4.5).
//!
//! Runs once, after compilation of a function's body completes. Looks
//! for the pattern `CONSTANT a  CONSTANT b  BINOP` where both operands
//! are numbers and `BINOP` is one of the four numeric arithmetic ops,
//! and collapses it to a single folded `CONSTANT`. String, boolean,
//! method, and property forms are never touched.

use crate::chunk::{Chunk, LineRun, OpCode};
use crate::value::{Value, ValueKind};

/// Runs the peephole pass over `chunk` in place. The compiler calls this
/// once per function body, right as that function finishes compiling —
/// innermost functions first, since a nested `fun` always finishes
/// before the enclosing body that references its closure does, so every
/// chunk in the program gets folded independently without this pass
/// needing to reach into the heap to find nested function chunks.
pub fn optimize(chunk: &mut Chunk) {
    fold_arithmetic(chunk);
}

fn foldable_op(byte: u8) -> bool {
    matches!(
        OpCode::from_repr(byte),
        Some(OpCode::Add | OpCode::Subtract | OpCode::Multiply | OpCode::Divide)
    )
}

fn apply(op: OpCode, a: f64, b: f64) -> f64 {
    match op {
        OpCode::Add => a + b,
        OpCode::Subtract => a - b,
        OpCode::Multiply => a * b,
        OpCode::Divide => a / b,
        _ => unreachable!("apply called with a non-foldable opcode"),
    }
}

/// A run of `CONSTANT a CONSTANT b BINOP` is 2+2+1 = 5 bytes; folding
/// collapses it to a single `CONSTANT` (2 bytes), a reduction of 3.
fn fold_arithmetic(chunk: &mut Chunk) {
    let mut i = 0;
    while i + 4 < chunk.code.len() {
        let is_pattern = chunk.code[i] == OpCode::Constant.to_byte()
            && chunk.code[i + 2] == OpCode::Constant.to_byte()
            && foldable_op(chunk.code[i + 4]);
        if !is_pattern {
            i += 1;
            continue;
        }
        let idx_a = chunk.code[i + 1] as usize;
        let idx_b = chunk.code[i + 3] as usize;
        let (Some(ca), Some(cb)) = (chunk.constants.get(idx_a).copied(), chunk.constants.get(idx_b).copied()) else {
            i += 1;
            continue;
        };
        if ca.kind() != ValueKind::Number || cb.kind() != ValueKind::Number {
            i += 1;
            continue;
        }
        let (a, b) = (ca.as_number_unchecked(), cb.as_number_unchecked());
        let op = OpCode::from_repr(chunk.code[i + 4]).unwrap();
        let folded = apply(op, a, b);
        let new_index = chunk.add_constant(Value::number(folded));
        chunk.code[i + 1] = new_index;
        chunk.code.drain(i + 2..i + 5);
        shift_line_runs(&mut chunk.lines, i + 2, 3);

        // Cascade: if the two bytes immediately before this fold are
        // themselves a CONSTANT, rewind so the next pass iteration sees
        // `CONSTANT x  CONSTANT (folded)  BINOP` as a fresh candidate.
        if i >= 2 && chunk.code[i - 2] == OpCode::Constant.to_byte() {
            i -= 2;
        }
    }
}

/// After removing `removed` bytes starting at `from`, every line run
/// whose `last_index` falls at or past the cut shifts down by `removed`;
/// runs that become empty (collapsed entirely into the cut) are dropped.
fn shift_line_runs(lines: &mut Vec<LineRun>, from: usize, removed: usize) {
    lines.retain_mut(|run| {
        if run.last_index >= from + removed {
            run.last_index -= removed;
            true
        } else if run.last_index >= from {
            false
        } else {
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::OpCode;

    #[test]
    fn folds_simple_numeric_add() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::number(2.0));
        let b = chunk.add_constant(Value::number(3.0));
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_byte(a, 1);
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_byte(b, 1);
        chunk.write_op(OpCode::Add, 1);
        optimize(&mut chunk);
        assert_eq!(chunk.code().len(), 2);
        assert_eq!(chunk.code()[0], OpCode::Constant.to_byte());
        let folded_idx = chunk.code()[1] as usize;
        assert_eq!(chunk.constants()[folded_idx], Value::number(5.0));
    }

    #[test]
    fn cascades_through_a_chain() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::number(1.0));
        let b = chunk.add_constant(Value::number(2.0));
        let c = chunk.add_constant(Value::number(3.0));
        // (1 + 2) + 3
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_byte(a, 1);
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_byte(b, 1);
        chunk.write_op(OpCode::Add, 1);
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_byte(c, 1);
        chunk.write_op(OpCode::Add, 1);
        optimize(&mut chunk);
        assert_eq!(chunk.code().len(), 2);
        let folded_idx = chunk.code()[1] as usize;
        assert_eq!(chunk.constants()[folded_idx], Value::number(6.0));
    }

    #[test]
    fn leaves_non_arithmetic_sequences_untouched() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::number(1.0));
        chunk.write_op(OpCode::Constant, 1);
        chunk.write_byte(a, 1);
        chunk.write_op(OpCode::GetLocal, 1);
        chunk.write_byte(0, 1);
        chunk.write_op(OpCode::Equal, 1);
        let before = chunk.code().to_vec();
        optimize(&mut chunk);
        assert_eq!(chunk.code(), before.as_slice());
    }
}
