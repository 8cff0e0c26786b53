//! Bytecode chunks: the instruction stream, its constant pool, and the
//! run-length line-info table that maps offsets back to source lines
//! (§3 component 3, §4.3, §4.4).

use crate::value::Value;

/// One opcode byte. Operand bytes (if any) immediately follow in `code`;
/// see each variant's comment for its operand shape. `#[repr(u8)]` plus
/// `strum::FromRepr` is how the chunk-file codec and disassembly-style
/// tooling turn a raw byte back into an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
#[repr(u8)]
pub enum OpCode {
    /// operand: 1-byte constant-pool index
    Constant,
    Null,
    True,
    False,
    Pop,
    /// pops and writes the value's display form to the VM's output sink,
    /// followed by a newline. Supplements the distilled `spec.md`'s
    /// opcode table with the `print` statement the keyword list there
    /// omitted but every example program and the original source use.
    Print,
    /// operand: 1-byte local slot
    GetLocal,
    /// operand: 1-byte local slot
    SetLocal,
    /// operand: 1-byte upvalue index
    GetUpvalue,
    /// operand: 1-byte upvalue index
    SetUpvalue,
    /// operand: 1-byte constant-pool index of the name
    GetGlobal,
    /// operand: 1-byte constant-pool index of the name
    SetGlobal,
    /// operand: 1-byte constant-pool index of the name
    DefineGlobal,
    /// operand: 1-byte constant-pool index of the name
    GetProperty,
    /// operand: 1-byte constant-pool index of the name
    SetProperty,
    /// operand: 1-byte constant-pool index of the name
    GetSuper,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Exponent,
    Negate,
    Not,
    /// operand: 2-byte big-endian forward offset
    Jump,
    /// operand: 2-byte big-endian forward offset; peeks, does not pop
    JumpIfFalse,
    /// operand: 2-byte big-endian backward offset
    Loop,
    /// operand: 1-byte argument count
    Call,
    /// operands: 1-byte name constant index, 1-byte argument count
    Invoke,
    /// operands: 1-byte name constant index, 1-byte argument count
    SuperInvoke,
    /// operands: 1-byte function-constant index, then
    /// `upvalue_count * (is_local: u8, index: u8)`
    Closure,
    CloseUpvalue,
    Return,
    /// operand: 1-byte constant-pool index of the class name
    Class,
    Inherit,
    /// operand: 1-byte constant-pool index of the method name
    Method,
    /// operand: 1-byte element count
    ArrayLiteral,
    GetIndexOf,
    SetIndexOf,
    GetSliceOf,
}

impl OpCode {
    #[must_use]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// One run in the line-info table: every instruction byte at an offset
/// `<= last_index` (and after the previous run's `last_index`) was
/// emitted on `line`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LineRun {
    pub(crate) line: u32,
    pub(crate) last_index: usize,
}

/// An instruction stream, its constant pool, and line information. Owned
/// exclusively by the [`crate::heap::FunctionObj`] it belongs to (§3
/// invariant): dropping the function drops the chunk, its code, and its
/// constants together.
#[derive(Clone, Default)]
pub struct Chunk {
    pub(crate) code: Vec<u8>,
    pub(crate) lines: Vec<LineRun>,
    pub(crate) constants: Vec<Value>,
}

impl Chunk {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[must_use]
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Appends a single byte, recording `line` in the run-length table. A
    /// new run is only opened when the line changes from the previous
    /// emission, per the original's run-length encoding.
    pub fn write_byte(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        let index = self.code.len() - 1;
        match self.lines.last_mut() {
            Some(run) if run.line == line => run.last_index = index,
            _ => self.lines.push(LineRun { line, last_index: index }),
        }
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write_byte(op.to_byte(), line);
    }

    /// Adds `value` to the constant pool and returns its index. Panics if
    /// the pool would exceed 256 entries, since every constant reference
    /// in the bytecode is a single byte (§4.3).
    pub fn add_constant(&mut self, value: Value) -> u8 {
        assert!(self.constants.len() < 256, "constant pool exceeded 256 entries");
        self.constants.push(value);
        u8::try_from(self.constants.len() - 1).expect("bounds-checked above")
    }

    /// Looks up the source line an instruction offset was emitted at, by
    /// forward-scanning to the first run whose `last_index >= offset`
    /// (§4.4; preserved as specified rather than binary-searched).
    #[must_use]
    pub fn get_line(&self, offset: usize) -> u32 {
        self.lines
            .iter()
            .find(|run| run.last_index >= offset)
            .map_or(0, |run| run.line)
    }

    /// Emits a jump opcode with a placeholder 2-byte operand and returns
    /// the offset of the first operand byte, to be back-patched by
    /// [`Chunk::patch_jump`] once the target is known.
    pub fn emit_jump(&mut self, op: OpCode, line: u32) -> usize {
        self.write_op(op, line);
        self.write_byte(0xff, line);
        self.write_byte(0xff, line);
        self.code.len() - 2
    }

    /// Back-patches the 2-byte operand at `offset` to jump to the current
    /// end of the chunk.
    ///
    /// # Panics
    /// If the resulting jump distance does not fit in 16 bits.
    pub fn patch_jump(&mut self, offset: usize) {
        let jump = self.code.len() - offset - 2;
        let jump = u16::try_from(jump).expect("jump target too far to encode in 16 bits");
        let bytes = jump.to_be_bytes();
        self.code[offset] = bytes[0];
        self.code[offset + 1] = bytes[1];
    }

    /// Emits `OP_LOOP` with a backward offset to `loop_start`.
    ///
    /// # Panics
    /// If the resulting jump distance does not fit in 16 bits.
    pub fn emit_loop(&mut self, loop_start: usize, line: u32) {
        self.write_op(OpCode::Loop, line);
        let offset = self.code.len() - loop_start + 2;
        let offset = u16::try_from(offset).expect("loop body too large to encode in 16 bits");
        let bytes = offset.to_be_bytes();
        self.write_byte(bytes[0], line);
        self.write_byte(bytes[1], line);
    }

    pub(crate) fn approx_size(&self) -> usize {
        self.code.len() + self.constants.len() * size_of::<Value>() + self.lines.len() * size_of::<LineRun>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_info_is_monotonic_across_runs() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Null, 1);
        chunk.write_op(OpCode::Null, 1);
        chunk.write_op(OpCode::Null, 3);
        chunk.write_op(OpCode::Null, 3);
        assert_eq!(chunk.get_line(0), 1);
        assert_eq!(chunk.get_line(1), 1);
        assert_eq!(chunk.get_line(2), 3);
        assert_eq!(chunk.get_line(3), 3);
    }

    #[test]
    fn jump_patch_round_trips() {
        let mut chunk = Chunk::new();
        let jump = chunk.emit_jump(OpCode::Jump, 1);
        chunk.write_op(OpCode::Null, 1);
        chunk.write_op(OpCode::Null, 1);
        chunk.patch_jump(jump);
        let hi = chunk.code()[jump];
        let lo = chunk.code()[jump + 1];
        assert_eq!(u16::from_be_bytes([hi, lo]), 2);
    }

    #[test]
    fn opcode_byte_round_trips_through_from_repr() {
        for op in [OpCode::Constant, OpCode::Call, OpCode::GetSliceOf] {
            assert_eq!(OpCode::from_repr(op.to_byte()), Some(op));
        }
    }
}
