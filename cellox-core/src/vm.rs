//! The stack-based dispatch loop (§4.8): a fixed value stack, a fixed
//! call-frame array, and a single tight `match` over [`OpCode`] bytes.
//!
//! `Vm` owns every piece of process-wide state the spec calls out as
//! shared (§5): the value stack, call frames, open-upvalue list, globals
//! table, and the GC heap. Nothing here is a global singleton — tests
//! instantiate and tear down as many `Vm`s as they like.

use std::fmt;

use crate::chunk::{Chunk, OpCode};
use crate::compiler;
use crate::error::{CompileError, RuntimeError, TraceFrame};
use crate::gc::{self, Roots};
use crate::heap::{
    BoundMethodObj, ClassObj, ClosureObj, Heap, HeapData, HeapId, InstanceObj, NativeFn, NativeObj, UpvalueLocation,
    UpvalueObj,
};
use crate::table::Table;
use crate::value::{Value, ValueKind, values_equal};

const STACK_MAX: usize = 16384;
const FRAMES_MAX: usize = 64;

/// Destination for `print` output (§5 "stdout from `print`/natives").
/// Kept as a trait rather than a bare `std::io::Write` so tests can
/// collect output in memory without touching the process's real stdout,
/// the same shape the corpus uses to let embedders capture a scripting
/// language's print output.
pub trait PrintSink {
    fn write_line(&mut self, text: &str);
}

/// Writes every line to the process's real standard output.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl PrintSink for StdoutSink {
    fn write_line(&mut self, text: &str) {
        println!("{text}");
    }
}

/// Collects every printed line into an in-memory buffer, for tests.
#[derive(Debug, Default)]
pub struct CollectSink {
    pub lines: Vec<String>,
}

impl PrintSink for CollectSink {
    fn write_line(&mut self, text: &str) {
        self.lines.push(text.to_owned());
    }
}

struct CallFrame {
    closure: HeapId,
    ip: usize,
    /// Index into `Vm::stack` of this call's slot 0 (receiver or reserved).
    slot_base: usize,
}

/// The three-way result of running a program end to end, carrying the
/// diagnostics each non-`Ok` outcome produced (glossary: "Interpret
/// result").
#[derive(Debug)]
pub enum InterpretOutcome {
    Ok,
    CompileError(Vec<CompileError>),
    RuntimeError(RuntimeError),
}

impl fmt::Display for InterpretOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => Ok(()),
            Self::CompileError(errs) => {
                for (i, e) in errs.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{e}")?;
                }
                Ok(())
            }
            Self::RuntimeError(e) => write!(f, "{e}"),
        }
    }
}

/// One process-wide virtual machine: value stack, call frames,
/// open-upvalue list, globals, and the GC heap it all roots into.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<HeapId>,
    init_string: HeapId,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    #[must_use]
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let init_string = heap.intern_string(b"init");
        Self {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
        }
    }

    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Registers a native function into globals under `name` (§4.10).
    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_id = self.heap.intern_string(name.as_bytes());
        let native_id = self.heap.allocate(HeapData::Native(NativeObj { name: name_id, function }));
        let hash = self.heap.string_hash(name_id);
        self.globals.set(name_id, hash, Value::obj(native_id));
    }

    /// Compiles and runs `source` as an independent top-level program.
    /// Globals and the heap persist across calls on the same `Vm` (the
    /// REPL's per-line semantics); locals do not, since each call gets
    /// its own script-function call frame.
    pub fn interpret(&mut self, source: &str, sink: &mut dyn PrintSink) -> InterpretOutcome {
        let script = match compiler::compile(source, &mut self.heap) {
            Ok(id) => id,
            Err(errors) => return InterpretOutcome::CompileError(errors),
        };
        self.run_script(script, sink)
    }

    /// Loads a precompiled `.cxcf` chunk file (§4.6, §6) and runs it
    /// directly, skipping the compiler entirely.
    ///
    /// # Errors
    /// Returns a [`crate::error::CodecError`] if `bytes` is malformed,
    /// truncated, or names an unsupported flag/version.
    pub fn interpret_chunk_file(&mut self, bytes: &[u8], sink: &mut dyn PrintSink) -> Result<InterpretOutcome, crate::error::CodecError> {
        let script = crate::codec::decode(&mut self.heap, bytes)?;
        Ok(self.run_script(script, sink))
    }

    /// Wraps a compiled top-level script function in a closure, pushes
    /// its call frame, and runs the dispatch loop to completion.
    fn run_script(&mut self, script: HeapId, sink: &mut dyn PrintSink) -> InterpretOutcome {
        let closure_id = self.heap.allocate(HeapData::Closure(ClosureObj {
            function: script,
            upvalues: Vec::new(),
        }));
        self.stack.push(Value::obj(closure_id));
        self.frames.push(CallFrame {
            closure: closure_id,
            ip: 0,
            slot_base: 0,
        });
        match self.run(sink) {
            Ok(()) => InterpretOutcome::Ok,
            Err(e) => InterpretOutcome::RuntimeError(e),
        }
    }

    // ----- stack helpers -------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ----- bytecode cursor -------------------------------------------

    fn current_chunk(&self) -> &Chunk {
        let frame = self.frames.last().unwrap();
        let HeapData::Closure(c) = self.heap.get(frame.closure) else {
            unreachable!("call frame closure is not a Closure")
        };
        let HeapData::Function(f) = self.heap.get(c.function) else {
            unreachable!("closure function is not a Function")
        };
        &f.chunk
    }

    fn read_byte(&mut self) -> u8 {
        let frame_idx = self.frames.len() - 1;
        let ip = self.frames[frame_idx].ip;
        let byte = self.current_chunk().code()[ip];
        self.frames[frame_idx].ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let idx = usize::from(self.read_byte());
        self.current_chunk().constants()[idx]
    }

    fn name_str(&self, id: HeapId) -> String {
        String::from_utf8_lossy(self.heap.string_bytes(id)).into_owned()
    }

    // ----- the dispatch loop -------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn run(&mut self, sink: &mut dyn PrintSink) -> Result<(), RuntimeError> {
        loop {
            let op_byte = self.read_byte();
            let Some(op) = OpCode::from_repr(op_byte) else {
                return Err(self.runtime_error(format!("corrupt bytecode: opcode byte {op_byte:#04x}")));
            };
            match op {
                OpCode::Constant => {
                    let v = self.read_constant();
                    self.push(v);
                }
                OpCode::Null => self.push(Value::null()),
                OpCode::True => self.push(Value::boolean(true)),
                OpCode::False => self.push(Value::boolean(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Print => {
                    let v = self.pop();
                    let text = self.stringify(v);
                    sink.write_line(&text);
                }
                OpCode::GetLocal => {
                    let slot = usize::from(self.read_byte());
                    let base = self.frames.last().unwrap().slot_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = usize::from(self.read_byte());
                    let base = self.frames.last().unwrap().slot_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let idx = usize::from(self.read_byte());
                    let v = self.read_upvalue(idx);
                    self.push(v);
                }
                OpCode::SetUpvalue => {
                    let idx = usize::from(self.read_byte());
                    let v = self.peek(0);
                    self.write_upvalue(idx, v);
                }
                OpCode::GetGlobal => {
                    let name = self.read_constant().as_obj_unchecked();
                    let hash = self.heap.string_hash(name);
                    match self.globals.get(name, hash) {
                        Some(v) => self.push(v),
                        None => {
                            let message = format!("Undefined variable '{}'.", self.name_str(name));
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_constant().as_obj_unchecked();
                    let hash = self.heap.string_hash(name);
                    let v = self.peek(0);
                    if self.globals.set(name, hash, v) {
                        self.globals.delete(name, hash);
                        let message = format!("Undefined variable '{}'.", self.name_str(name));
                        return Err(self.runtime_error(message));
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_constant().as_obj_unchecked();
                    let hash = self.heap.string_hash(name);
                    let v = self.pop();
                    self.globals.set(name, hash, v);
                }
                OpCode::GetProperty => {
                    let name = self.read_constant().as_obj_unchecked();
                    let receiver = self.peek(0);
                    if receiver.kind() != ValueKind::Obj {
                        return Err(self.runtime_error("Only instances have properties."));
                    }
                    let HeapData::Instance(instance) = self.heap.get(receiver.as_obj_unchecked()) else {
                        return Err(self.runtime_error("Only instances have properties."));
                    };
                    let hash = self.heap.string_hash(name);
                    if let Some(value) = instance.fields.get(name, hash) {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = instance.class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_constant().as_obj_unchecked();
                    let value = self.peek(0);
                    let receiver = self.peek(1);
                    if receiver.kind() != ValueKind::Obj {
                        return Err(self.runtime_error("Only instances have fields."));
                    }
                    let receiver_id = receiver.as_obj_unchecked();
                    let hash = self.heap.string_hash(name);
                    let HeapData::Instance(instance) = self.heap.get_mut(receiver_id) else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };
                    instance.fields.set(name, hash, value);
                    self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_constant().as_obj_unchecked();
                    let superclass = self.pop().as_obj_unchecked();
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(values_equal(&a, &b, &self.heap)));
                }
                OpCode::Greater => self.numeric_compare(|a, b| a > b)?,
                OpCode::Less => self.numeric_compare(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.numeric_binary(|a, b| a - b)?,
                OpCode::Multiply => self.numeric_binary(|a, b| a * b)?,
                OpCode::Divide => self.numeric_binary(|a, b| a / b)?,
                OpCode::Modulo => self.modulo()?,
                OpCode::Exponent => self.numeric_binary(f64::powf)?,
                OpCode::Negate => {
                    let v = self.peek(0);
                    if v.kind() != ValueKind::Number {
                        return Err(self.runtime_error(format!("Operand must be a number, was {}.", self.type_name(v))));
                    }
                    self.pop();
                    self.push(Value::number(-v.as_number_unchecked()));
                }
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::boolean(v.is_falsy()));
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += usize::from(offset);
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsy() {
                        self.frames.last_mut().unwrap().ip += usize::from(offset);
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= usize::from(offset);
                }
                OpCode::Call => {
                    let argc = usize::from(self.read_byte());
                    self.call_value(argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_constant().as_obj_unchecked();
                    let argc = usize::from(self.read_byte());
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_constant().as_obj_unchecked();
                    let argc = usize::from(self.read_byte());
                    let superclass = self.pop().as_obj_unchecked();
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure => {
                    let function_id = self.read_constant().as_obj_unchecked();
                    let HeapData::Function(f) = self.heap.get(function_id) else {
                        unreachable!("CLOSURE operand is not a Function")
                    };
                    let upvalue_count = f.upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = usize::from(self.read_byte());
                        if is_local {
                            let base = self.frames.last().unwrap().slot_base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            let enclosing = self.frames.last().unwrap().closure;
                            let HeapData::Closure(c) = self.heap.get(enclosing) else {
                                unreachable!()
                            };
                            upvalues.push(c.upvalues[index]);
                        }
                    }
                    let closure_id = self.heap.allocate(HeapData::Closure(ClosureObj { function: function_id, upvalues }));
                    self.push(Value::obj(closure_id));
                    self.collect_if_needed();
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues_from(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues_from(frame.slot_base);
                    self.stack.truncate(frame.slot_base);
                    if self.frames.is_empty() {
                        self.stack.pop();
                        return Ok(());
                    }
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_constant().as_obj_unchecked();
                    let class_id = self.heap.allocate(HeapData::Class(ClassObj { name, methods: Table::new() }));
                    self.push(Value::obj(class_id));
                    self.collect_if_needed();
                }
                OpCode::Inherit => {
                    let subclass = self.peek(0).as_obj_unchecked();
                    let superclass_val = self.peek(1);
                    if superclass_val.kind() != ValueKind::Obj {
                        return Err(self.runtime_error("Superclass must be a class."));
                    }
                    let superclass = superclass_val.as_obj_unchecked();
                    let HeapData::Class(super_class) = self.heap.get(superclass) else {
                        return Err(self.runtime_error("Superclass must be a class."));
                    };
                    let methods: Vec<_> = super_class.methods.iter().collect();
                    let HeapData::Class(sub) = self.heap.get_mut(subclass) else {
                        unreachable!()
                    };
                    for (k, h, v) in methods {
                        sub.methods.set(k, h, v);
                    }
                    self.pop(); // subclass stays at peek(1)
                }
                OpCode::Method => {
                    let name = self.read_constant().as_obj_unchecked();
                    let method = self.peek(0);
                    let class_id = self.peek(1).as_obj_unchecked();
                    let hash = self.heap.string_hash(name);
                    let HeapData::Class(class) = self.heap.get_mut(class_id) else {
                        unreachable!("METHOD target is not a Class")
                    };
                    class.methods.set(name, hash, method);
                    self.pop();
                }
                OpCode::ArrayLiteral => {
                    let count = usize::from(self.read_byte());
                    let start = self.stack.len() - count;
                    let elements = self.stack.split_off(start);
                    let array_id = self.heap.allocate(HeapData::Array(elements));
                    self.push(Value::obj(array_id));
                    self.collect_if_needed();
                }
                OpCode::GetIndexOf => self.get_index()?,
                OpCode::SetIndexOf => self.set_index()?,
                OpCode::GetSliceOf => self.get_slice()?,
            }
        }
    }

    // ----- calls -------------------------------------------------------

    fn call_value(&mut self, argc: usize) -> Result<(), RuntimeError> {
        let callee = self.peek(argc);
        if callee.kind() != ValueKind::Obj {
            return Err(self.runtime_error("Can only call functions and classes."));
        }
        let id = callee.as_obj_unchecked();
        match self.heap.get(id).call_shape() {
            HeapShape::Closure => self.call_closure(id, argc),
            HeapShape::Native => self.call_native(id, argc),
            HeapShape::Class => self.call_class(id, argc),
            HeapShape::BoundMethod => self.call_bound_method(id, argc),
            HeapShape::Other => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure_id: HeapId, argc: usize) -> Result<(), RuntimeError> {
        let HeapData::Closure(c) = self.heap.get(closure_id) else {
            unreachable!()
        };
        let HeapData::Function(f) = self.heap.get(c.function) else {
            unreachable!()
        };
        let arity = usize::from(f.arity);
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slot_base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure: closure_id, ip: 0, slot_base });
        Ok(())
    }

    fn call_native(&mut self, native_id: HeapId, argc: usize) -> Result<(), RuntimeError> {
        let HeapData::Native(n) = self.heap.get(native_id) else {
            unreachable!()
        };
        let function = n.function;
        let args_start = self.stack.len() - argc;
        let result = function(&mut self.heap, &self.stack[args_start..]);
        match result {
            Ok(value) => {
                self.stack.truncate(args_start - 1);
                self.push(value);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    fn call_class(&mut self, class_id: HeapId, argc: usize) -> Result<(), RuntimeError> {
        let instance_id = self.heap.allocate(HeapData::Instance(InstanceObj { class: class_id, fields: Table::new() }));
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = Value::obj(instance_id);
        self.collect_if_needed();

        let HeapData::Class(class) = self.heap.get(class_id) else {
            unreachable!()
        };
        let init_hash = self.heap.string_hash(self.init_string);
        if let Some(initializer) = class.methods.get(self.init_string, init_hash) {
            let closure_id = initializer.as_obj_unchecked();
            self.call_closure(closure_id, argc)
        } else if argc == 0 {
            Ok(())
        } else {
            Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")))
        }
    }

    fn call_bound_method(&mut self, bound_id: HeapId, argc: usize) -> Result<(), RuntimeError> {
        let HeapData::BoundMethod(b) = self.heap.get(bound_id) else {
            unreachable!()
        };
        let receiver = b.receiver;
        let closure = b.closure;
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = receiver;
        self.call_closure(closure, argc)
    }

    fn invoke(&mut self, name: HeapId, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        if receiver.kind() != ValueKind::Obj {
            return Err(self.runtime_error("Only instances have methods."));
        }
        let receiver_id = receiver.as_obj_unchecked();
        let HeapData::Instance(instance) = self.heap.get(receiver_id) else {
            return Err(self.runtime_error("Only instances have methods."));
        };
        let hash = self.heap.string_hash(name);
        if let Some(field_value) = instance.fields.get(name, hash) {
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = field_value;
            return self.call_value(argc);
        }
        let class = instance.class;
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(&mut self, class_id: HeapId, name: HeapId, argc: usize) -> Result<(), RuntimeError> {
        let HeapData::Class(class) = self.heap.get(class_id) else {
            unreachable!("invoke target is not a Class")
        };
        let hash = self.heap.string_hash(name);
        match class.methods.get(name, hash) {
            Some(method) => self.call_closure(method.as_obj_unchecked(), argc),
            None => Err(self.runtime_error(format!("Undefined property '{}'.", self.name_str(name)))),
        }
    }

    fn bind_method(&mut self, class_id: HeapId, name: HeapId) -> Result<(), RuntimeError> {
        let HeapData::Class(class) = self.heap.get(class_id) else {
            unreachable!("bind_method target is not a Class")
        };
        let hash = self.heap.string_hash(name);
        let Some(method) = class.methods.get(name, hash) else {
            return Err(self.runtime_error(format!("Undefined property '{}'.", self.name_str(name))));
        };
        let receiver = self.pop();
        let bound_id = self.heap.allocate(HeapData::BoundMethod(BoundMethodObj {
            receiver,
            closure: method.as_obj_unchecked(),
        }));
        self.push(Value::obj(bound_id));
        self.collect_if_needed();
        Ok(())
    }

    // ----- upvalues -------------------------------------------------

    fn read_upvalue(&self, idx: usize) -> Value {
        let frame = self.frames.last().unwrap();
        let HeapData::Closure(c) = self.heap.get(frame.closure) else {
            unreachable!()
        };
        let upvalue_id = c.upvalues[idx];
        let HeapData::Upvalue(u) = self.heap.get(upvalue_id) else {
            unreachable!()
        };
        match u.location {
            UpvalueLocation::Open(stack_index) => self.stack[stack_index],
            UpvalueLocation::Closed => u.closed,
        }
    }

    fn write_upvalue(&mut self, idx: usize, value: Value) {
        let frame = self.frames.last().unwrap();
        let HeapData::Closure(c) = self.heap.get(frame.closure) else {
            unreachable!()
        };
        let upvalue_id = c.upvalues[idx];
        let HeapData::Upvalue(u) = self.heap.get(upvalue_id) else {
            unreachable!()
        };
        match u.location {
            UpvalueLocation::Open(stack_index) => self.stack[stack_index] = value,
            UpvalueLocation::Closed => {
                let HeapData::Upvalue(u) = self.heap.get_mut(upvalue_id) else {
                    unreachable!()
                };
                u.closed = value;
            }
        }
    }

    fn capture_upvalue(&mut self, stack_index: usize) -> HeapId {
        for &id in &self.open_upvalues {
            let HeapData::Upvalue(u) = self.heap.get(id) else { unreachable!() };
            if u.location == UpvalueLocation::Open(stack_index) {
                return id;
            }
        }
        let id = self.heap.allocate(HeapData::Upvalue(UpvalueObj {
            location: UpvalueLocation::Open(stack_index),
            closed: Value::null(),
            next_open: None,
        }));
        self.open_upvalues.push(id);
        id
    }

    /// Closes every open upvalue whose stack index is `>= last` (§4.8).
    fn close_upvalues_from(&mut self, last: usize) {
        let stack = &self.stack;
        let heap = &mut self.heap;
        self.open_upvalues.retain(|&id| {
            let HeapData::Upvalue(u) = heap.get(id) else { unreachable!() };
            if let UpvalueLocation::Open(stack_index) = u.location
                && stack_index >= last
            {
                let value = stack[stack_index];
                let HeapData::Upvalue(u) = heap.get_mut(id) else { unreachable!() };
                u.closed = value;
                u.location = UpvalueLocation::Closed;
                return false;
            }
            true
        });
    }

    // ----- arithmetic (§4.9) -------------------------------------------

    fn numeric_binary(&mut self, f: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_number_pair()?;
        self.push(Value::number(f(a, b)));
        Ok(())
    }

    fn numeric_compare(&mut self, f: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_number_pair()?;
        self.push(Value::boolean(f(a, b)));
        Ok(())
    }

    fn pop_number_pair(&mut self) -> Result<(f64, f64), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if a.kind() != ValueKind::Number || b.kind() != ValueKind::Number {
            let message = format!("Operands must be numbers, were {} and {}.", self.type_name(a), self.type_name(b));
            return Err(self.runtime_error(message));
        }
        self.pop();
        self.pop();
        Ok((a.as_number_unchecked(), b.as_number_unchecked()))
    }

    fn modulo(&mut self) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_number_pair()?;
        let divisor = b.trunc();
        if divisor == 0.0 {
            return Err(self.runtime_error("Modulo by truncated zero divisor."));
        }
        self.push(Value::number(a.trunc() % divisor));
        Ok(())
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if a.kind() == ValueKind::Number && b.kind() == ValueKind::Number {
            self.pop();
            self.pop();
            self.push(Value::number(a.as_number_unchecked() + b.as_number_unchecked()));
            return Ok(());
        }
        if a.kind() == ValueKind::Obj && b.kind() == ValueKind::Obj {
            let (ao, bo) = (a.as_obj_unchecked(), b.as_obj_unchecked());
            match (self.heap.get(ao), self.heap.get(bo)) {
                (HeapData::String(_), HeapData::String(_)) => {
                    let mut bytes = self.heap.string_bytes(ao).to_vec();
                    bytes.extend_from_slice(self.heap.string_bytes(bo));
                    let id = self.heap.intern_string(&bytes);
                    self.pop();
                    self.pop();
                    self.push(Value::obj(id));
                    return Ok(());
                }
                (HeapData::Array(xs), HeapData::Array(ys)) => {
                    let mut combined = xs.clone();
                    combined.extend_from_slice(ys);
                    self.pop();
                    self.pop();
                    let id = self.heap.allocate(HeapData::Array(combined));
                    self.push(Value::obj(id));
                    self.collect_if_needed();
                    return Ok(());
                }
                (HeapData::Array(xs), _) => {
                    let mut combined = xs.clone();
                    combined.push(b);
                    self.pop();
                    self.pop();
                    let id = self.heap.allocate(HeapData::Array(combined));
                    self.push(Value::obj(id));
                    self.collect_if_needed();
                    return Ok(());
                }
                _ => {}
            }
        }
        let message = format!("Operands must be two numbers, two strings, or an array, were {} and {}.", self.type_name(a), self.type_name(b));
        Err(self.runtime_error(message))
    }

    // ----- indexing and slicing (§4.9) ---------------------------------

    fn as_index(&mut self, value: Value, len: usize) -> Result<usize, RuntimeError> {
        if value.kind() != ValueKind::Number {
            return Err(self.runtime_error(format!("Index must be a number, was {}.", self.type_name(value))));
        }
        let n = value.as_number_unchecked();
        if n.fract() != 0.0 || n < 0.0 {
            return Err(self.runtime_error("Index must be a non-negative integer."));
        }
        let idx = n as usize;
        if idx >= len {
            return Err(self.runtime_error(format!("Index {idx} out of bounds for length {len}.")));
        }
        Ok(idx)
    }

    fn get_index(&mut self) -> Result<(), RuntimeError> {
        let index = self.pop();
        let collection = self.pop();
        if collection.kind() != ValueKind::Obj {
            return Err(self.runtime_error("Only strings and arrays support indexing."));
        }
        let id = collection.as_obj_unchecked();
        match self.heap.get(id) {
            HeapData::String(s) => {
                let len = s.bytes.len();
                let idx = self.as_index(index, len)?;
                let byte = self.heap.string_bytes(id)[idx];
                let new_id = self.heap.intern_string(&[byte]);
                self.push(Value::obj(new_id));
                Ok(())
            }
            HeapData::Array(items) => {
                let len = items.len();
                let idx = self.as_index(index, len)?;
                let HeapData::Array(items) = self.heap.get(id) else { unreachable!() };
                self.push(items[idx]);
                Ok(())
            }
            _ => Err(self.runtime_error("Only strings and arrays support indexing.")),
        }
    }

    fn set_index(&mut self) -> Result<(), RuntimeError> {
        let value = self.pop();
        let index = self.pop();
        let collection = self.pop();
        if collection.kind() != ValueKind::Obj {
            return Err(self.runtime_error("Only strings and arrays support index assignment."));
        }
        let id = collection.as_obj_unchecked();
        match self.heap.get(id) {
            HeapData::Array(items) => {
                let len = items.len();
                let idx = self.as_index(index, len)?;
                let HeapData::Array(items) = self.heap.get_mut(id) else { unreachable!() };
                items[idx] = value;
                self.push(value);
                Ok(())
            }
            HeapData::String(s) => {
                let len = s.bytes.len();
                let idx = self.as_index(index, len)?;
                if value.kind() != ValueKind::Obj {
                    return Err(self.runtime_error("Replacement must be a one-character string."));
                }
                let replacement_id = value.as_obj_unchecked();
                let HeapData::String(replacement) = self.heap.get(replacement_id) else {
                    return Err(self.runtime_error("Replacement must be a one-character string."));
                };
                if replacement.bytes.len() != 1 {
                    return Err(self.runtime_error("Replacement must be a one-character string."));
                }
                let new_byte = replacement.bytes[0];
                let mut bytes = self.heap.string_bytes(id).to_vec();
                bytes[idx] = new_byte;
                let new_id = self.heap.intern_string(&bytes);
                self.push(Value::obj(new_id));
                Ok(())
            }
            _ => Err(self.runtime_error("Only strings and arrays support index assignment.")),
        }
    }

    fn get_slice(&mut self) -> Result<(), RuntimeError> {
        let hi_val = self.pop();
        let lo_val = self.pop();
        let collection = self.pop();
        if collection.kind() != ValueKind::Obj {
            return Err(self.runtime_error("Only strings and arrays support slicing."));
        }
        let id = collection.as_obj_unchecked();
        let len = match self.heap.get(id) {
            HeapData::String(s) => s.bytes.len(),
            HeapData::Array(items) => items.len(),
            _ => return Err(self.runtime_error("Only strings and arrays support slicing.")),
        };
        let lo = self.as_index(lo_val, len)?;
        let hi = self.as_index(hi_val, len)?;
        if !(lo < hi) {
            return Err(self.runtime_error("Slice requires lo < hi < len."));
        }
        match self.heap.get(id) {
            HeapData::String(s) => {
                let bytes = s.bytes[lo..hi].to_vec();
                let new_id = self.heap.intern_string(&bytes);
                self.push(Value::obj(new_id));
            }
            HeapData::Array(items) => {
                let slice = items[lo..hi].to_vec();
                let new_id = self.heap.allocate(HeapData::Array(slice));
                self.push(Value::obj(new_id));
                self.collect_if_needed();
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    // ----- printing and diagnostics -------------------------------------

    fn stringify(&self, value: Value) -> String {
        match value.kind() {
            ValueKind::Bool => value.as_bool_unchecked().to_string(),
            ValueKind::Null => "null".to_owned(),
            ValueKind::Number => value.as_number_unchecked().to_string(),
            ValueKind::Obj => self.stringify_object(value.as_obj_unchecked()),
        }
    }

    fn stringify_object(&self, id: HeapId) -> String {
        match self.heap.get(id) {
            HeapData::String(s) => String::from_utf8_lossy(&s.bytes).into_owned(),
            HeapData::Function(f) => match f.name {
                Some(name) => format!("<fn {}>", self.name_str(name)),
                None => "<script>".to_owned(),
            },
            HeapData::Closure(c) => self.stringify_object(c.function),
            HeapData::Native(_) => "<native fn>".to_owned(),
            HeapData::Class(c) => self.name_str(c.name),
            HeapData::Instance(i) => {
                let HeapData::Class(c) = self.heap.get(i.class) else { unreachable!() };
                format!("{} instance", self.name_str(c.name))
            }
            HeapData::BoundMethod(b) => self.stringify_object(b.closure),
            HeapData::Array(items) => {
                let parts: Vec<String> = items.iter().map(|v| self.stringify(*v)).collect();
                format!("[{}]", parts.join(", "))
            }
            HeapData::Upvalue(_) => "<upvalue>".to_owned(),
        }
    }

    fn type_name(&self, value: Value) -> String {
        match value.kind() {
            ValueKind::Bool => "boolean".to_owned(),
            ValueKind::Null => "null".to_owned(),
            ValueKind::Number => "number".to_owned(),
            ValueKind::Obj => {
                let id = value.as_obj_unchecked();
                match self.heap.get(id) {
                    HeapData::Instance(i) => {
                        let HeapData::Class(c) = self.heap.get(i.class) else { unreachable!() };
                        self.name_str(c.name)
                    }
                    other => other.kind_name().to_owned(),
                }
            }
        }
    }

    /// Builds the call-stack trace (innermost first), resets the VM to a
    /// clean slate (§4.8 "reset the stack"), and returns the error.
    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let HeapData::Closure(c) = self.heap.get(frame.closure) else { unreachable!() };
            let HeapData::Function(f) = self.heap.get(c.function) else { unreachable!() };
            let line = f.chunk.get_line(frame.ip.saturating_sub(1));
            let function_name = f.name.map(|n| self.name_str(n));
            trace.push(TraceFrame { line, function_name });
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        RuntimeError::new(message, trace)
    }

    fn collect_if_needed(&mut self) {
        let should_collect = cfg!(feature = "gc-stress") || self.heap.bytes_allocated > self.heap.next_gc;
        if !should_collect {
            return;
        }
        let frame_closures: Vec<HeapId> = self.frames.iter().map(|f| f.closure).collect();
        let roots = Roots {
            stack: &self.stack,
            frame_closures: &frame_closures,
            open_upvalues: &self.open_upvalues,
            globals: &self.globals,
            init_string: Some(self.init_string),
            compiler_functions: &[],
        };
        gc::collect_garbage(&mut self.heap, &roots);
    }
}

/// A cheap tag for `call_value`'s dispatch, avoiding a second full match
/// over `HeapData` once the callee's broad shape is known.
enum HeapShape {
    Closure,
    Native,
    Class,
    BoundMethod,
    Other,
}

trait ClassifyHeap {
    fn call_shape(&self) -> HeapShape;
}

impl ClassifyHeap for HeapData {
    fn call_shape(&self) -> HeapShape {
        match self {
            Self::Closure(_) => HeapShape::Closure,
            Self::Native(_) => HeapShape::Native,
            Self::Class(_) => HeapShape::Class,
            Self::BoundMethod(_) => HeapShape::BoundMethod,
            _ => HeapShape::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(src: &str) -> Vec<String> {
        let mut vm = Vm::new();
        let mut sink = CollectSink::default();
        match vm.interpret(src, &mut sink) {
            InterpretOutcome::Ok => sink.lines,
            other => panic!("expected success, got: {other}"),
        }
    }

    #[test]
    fn prints_a_number() {
        assert_eq!(run_ok("print 1 + 2;"), vec!["3"]);
    }

    // Closure capture, class inheritance, string interning, array
    // index/slice, and the runtime-error stack trace are the six `spec.md`
    // §8 scenarios; they live in `tests/e2e.rs` as integration tests.

    #[test]
    fn class_inheritance_dispatches_overridden_methods_via_super() {
        let src = "class A { greet() { print \"hi from A\"; } } \
                    class B : A { greet() { super.greet(); } } \
                    B().greet();";
        assert_eq!(run_ok(src), vec!["hi from A"]);
    }

    #[test]
    fn array_concatenation_and_append() {
        assert_eq!(run_ok("print [1,2] + [3]; print [1] + 2;"), vec!["[1, 2, 3]", "[1, 2]"]);
    }

    #[test]
    fn undefined_global_get_is_a_runtime_error() {
        let mut vm = Vm::new();
        let mut sink = CollectSink::default();
        assert!(matches!(vm.interpret("print nope;", &mut sink), InterpretOutcome::RuntimeError(_)));
    }
}
