//! The `.cxcf` chunk-file binary codec (§4.6): serializes a compiled
//! chunk (and every chunk nested inside it, recursively) to a segmented
//! byte format, and reads it back.
//!
//! Grounded on `chunk_file.c` in the original implementation, with one
//! deliberate fix: the original appends rematerialized inner functions
//! to the *end* of the reconstructed constant pool regardless of where
//! they originally sat, which silently corrupts every constant index
//! emitted *after* a function constant in the same chunk. This codec
//! instead records each function constant's original pool index in the
//! inner segment and reinserts it there on load, so bytecode operand
//! indices stay valid after a round trip. See `DESIGN.md`.

use crate::chunk::{Chunk, LineRun};
use crate::error::CodecError;
use crate::heap::{FunctionObj, Heap, HeapData, HeapId};
use crate::value::{Value, ValueKind};

const SEGMENT_CONSTANTS: u8 = 0x00;
const SEGMENT_LINE_INFO: u8 = 0x01;
const SEGMENT_INNER: u8 = 0x02;
const SEGMENT_BYTECODE: u8 = 0x03;

const CONSTANT_NUMBER: u8 = 0x00;
const CONSTANT_STRING: u8 = 0x01;

const VERSION_MAJOR: u8 = 0;
const VERSION_MINOR: u8 = 1;

/// Encodes the top-level script's chunk to the on-disk `.cxcf` format.
/// `script` must be a `HeapData::Function` (the synthetic script
/// function `compiler::compile` returns).
pub fn encode(heap: &Heap, script: HeapId) -> Result<Vec<u8>, CodecError> {
    let HeapData::Function(f) = heap.get(script) else {
        panic!("codec::encode called on a non-Function HeapId");
    };
    let mut out = Vec::new();
    out.push(0); // flag byte: no optional switches are implemented
    out.push(VERSION_MAJOR);
    out.push(VERSION_MINOR);
    encode_chunk(heap, &f.chunk, &mut out)?;
    Ok(out)
}

/// Decodes a `.cxcf` byte stream into a fresh script `FunctionObj`,
/// allocated into `heap`. Returns the new function's `HeapId`.
pub fn decode(heap: &mut Heap, bytes: &[u8]) -> Result<HeapId, CodecError> {
    let mut cursor = Cursor { data: bytes, pos: 0 };
    let flags = cursor.read_u8()?;
    if flags != 0 {
        return Err(CodecError::UnsupportedFlags(flags));
    }
    let major = cursor.read_u8()?;
    let minor = cursor.read_u8()?;
    if major != VERSION_MAJOR {
        return Err(CodecError::UnsupportedVersion { major, minor });
    }
    let chunk = decode_chunk(heap, &mut cursor)?;
    Ok(heap.allocate(HeapData::Function(FunctionObj {
        arity: 0,
        upvalue_count: 0,
        name: None,
        chunk,
    })))
}

fn encode_chunk(heap: &Heap, chunk: &Chunk, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let mut plain_constants = Vec::new();
    let mut functions = Vec::new(); // (original_index, HeapId of FunctionObj)
    for (index, value) in chunk.constants().iter().enumerate() {
        if value.kind() == ValueKind::Obj {
            let id = value.as_obj_unchecked();
            if matches!(heap.get(id), HeapData::Function(_)) {
                functions.push((index, id));
                continue;
            }
        }
        plain_constants.push(*value);
    }

    out.push(SEGMENT_CONSTANTS);
    write_u32(out, u32::try_from(plain_constants.len()).expect("constant pool exceeds u32"));
    for value in &plain_constants {
        encode_constant(heap, *value, out)?;
    }

    out.push(SEGMENT_LINE_INFO);
    write_u32(out, u32::try_from(chunk.lines.len()).expect("line-info table exceeds u32"));
    for run in &chunk.lines {
        write_u32(out, run.line);
        write_u32(out, u32::try_from(run.last_index).expect("chunk longer than u32::MAX bytes"));
    }

    out.push(SEGMENT_INNER);
    write_u32(out, u32::try_from(functions.len()).expect("inner function count exceeds u32"));
    for (index, function_id) in functions {
        let HeapData::Function(f) = heap.get(function_id) else {
            unreachable!("functions list holds a non-Function HeapId")
        };
        write_u32(out, u32::try_from(index).expect("constant index exceeds u32"));
        let name_bytes = f.name.map_or(&[][..], |n| heap.string_bytes(n));
        write_zstring(out, name_bytes)?;
        write_u32(out, u32::from(f.arity));
        write_u32(out, u32::try_from(f.upvalue_count).expect("upvalue count exceeds u32"));
        encode_chunk(heap, &f.chunk, out)?;
    }

    out.push(SEGMENT_BYTECODE);
    write_u32(out, u32::try_from(chunk.code().len()).expect("bytecode exceeds u32"));
    out.extend_from_slice(chunk.code());

    Ok(())
}

fn decode_chunk(heap: &mut Heap, cursor: &mut Cursor<'_>) -> Result<Chunk, CodecError> {
    let tag = cursor.read_u8()?;
    if tag != SEGMENT_CONSTANTS {
        return Err(CodecError::UnknownSegment(tag));
    }
    let constant_count = cursor.read_u32()?;
    let mut plain_constants = Vec::with_capacity(constant_count as usize);
    for _ in 0..constant_count {
        plain_constants.push(decode_constant(heap, cursor)?);
    }

    let tag = cursor.read_u8()?;
    if tag != SEGMENT_LINE_INFO {
        return Err(CodecError::UnknownSegment(tag));
    }
    let line_count = cursor.read_u32()?;
    let mut lines = Vec::with_capacity(line_count as usize);
    for _ in 0..line_count {
        let line = cursor.read_u32()?;
        let last_index = cursor.read_u32()? as usize;
        lines.push(LineRun { line, last_index });
    }

    let tag = cursor.read_u8()?;
    if tag != SEGMENT_INNER {
        return Err(CodecError::UnknownSegment(tag));
    }
    let inner_count = cursor.read_u32()?;
    let mut functions = Vec::with_capacity(inner_count as usize);
    for _ in 0..inner_count {
        let original_index = cursor.read_u32()? as usize;
        let name_bytes = cursor.read_zstring()?;
        let arity = u8::try_from(cursor.read_u32()?).unwrap_or(u8::MAX);
        let upvalue_count = cursor.read_u32()? as usize;
        let nested = decode_chunk(heap, cursor)?;
        let name = if name_bytes.is_empty() { None } else { Some(heap.intern_string(&name_bytes)) };
        let function_id = heap.allocate(HeapData::Function(FunctionObj {
            arity,
            upvalue_count,
            name,
            chunk: nested,
        }));
        functions.push((original_index, Value::obj(function_id)));
    }

    let tag = cursor.read_u8()?;
    if tag != SEGMENT_BYTECODE {
        return Err(CodecError::UnknownSegment(tag));
    }
    let code_count = cursor.read_u32()? as usize;
    let code = cursor.read_bytes(code_count)?.to_vec();

    let total = plain_constants.len() + functions.len();
    let mut constants: Vec<Option<Value>> = vec![None; total];
    for (index, value) in functions {
        if index >= total {
            return Err(CodecError::Truncated { expected: 0 });
        }
        constants[index] = Some(value);
    }
    let mut plain_iter = plain_constants.into_iter();
    for slot in &mut constants {
        if slot.is_none() {
            *slot = plain_iter.next();
        }
    }
    let constants = constants.into_iter().collect::<Option<Vec<_>>>().ok_or(CodecError::Truncated { expected: 0 })?;

    Ok(Chunk { code, lines, constants })
}

fn encode_constant(heap: &Heap, value: Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match value.kind() {
        ValueKind::Number => {
            out.push(CONSTANT_NUMBER);
            out.extend_from_slice(&value.as_number_unchecked().to_bits().to_be_bytes());
        }
        ValueKind::Obj => {
            let id = value.as_obj_unchecked();
            let HeapData::String(_) = heap.get(id) else {
                panic!("non-string, non-function object in constant pool: {}", heap.get(id).kind_name());
            };
            out.push(CONSTANT_STRING);
            write_zstring(out, heap.string_bytes(id))?;
        }
        ValueKind::Bool | ValueKind::Null => {
            panic!("bool/null constants never appear in a chunk's constant pool");
        }
    }
    Ok(())
}

fn decode_constant(heap: &mut Heap, cursor: &mut Cursor<'_>) -> Result<Value, CodecError> {
    match cursor.read_u8()? {
        CONSTANT_NUMBER => {
            let bits = cursor.read_u64()?;
            Ok(Value::number(f64::from_bits(bits)))
        }
        CONSTANT_STRING => {
            let bytes = cursor.read_zstring()?;
            Ok(Value::obj(heap.intern_string(&bytes)))
        }
        other => Err(CodecError::UnknownSegment(other)),
    }
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn write_zstring(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CodecError> {
    if bytes.contains(&0) {
        return Err(CodecError::EmbeddedNul);
    }
    out.extend_from_slice(bytes);
    out.push(0);
    Ok(())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn read_bytes(&mut self, n: usize) -> Result<&[u8], CodecError> {
        if self.pos + n > self.data.len() {
            return Err(CodecError::Truncated { expected: self.pos + n - self.data.len() });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_zstring(&mut self) -> Result<Vec<u8>, CodecError> {
        let start = self.pos;
        loop {
            let byte = self.read_u8()?;
            if byte == 0 {
                return Ok(self.data[start..self.pos - 1].to_vec());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;

    // Round-trip coverage lives in `tests/chunk_roundtrip.rs`; these are the
    // decode error-path cases, which stay as unit tests.

    #[test]
    fn rejects_truncated_input() {
        let mut write_heap = Heap::new();
        let script = compiler::compile("print 1;", &mut write_heap).expect("compiles");
        let mut encoded = encode(&write_heap, script).expect("encodes");
        encoded.truncate(encoded.len() - 2);
        let mut read_heap = Heap::new();
        assert!(matches!(decode(&mut read_heap, &encoded), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn rejects_unsupported_flags() {
        let mut write_heap = Heap::new();
        let script = compiler::compile("print 1;", &mut write_heap).expect("compiles");
        let mut encoded = encode(&write_heap, script).expect("encodes");
        encoded[0] = 0b0000_0001;
        let mut read_heap = Heap::new();
        assert!(matches!(decode(&mut read_heap, &encoded), Err(CodecError::UnsupportedFlags(_))));
    }
}
