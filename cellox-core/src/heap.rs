//! The heap: a handle-addressed arena of GC-tracked runtime objects plus
//! the string interner (§3 Heap object kinds).
//!
//! Per the Design Notes' guidance on the original's raw `next`-pointer
//! object list, objects here are **not** threaded by pointer: the "object
//! list" that `§4.7` sweeps is just every occupied arena slot, and a free
//! list reclaims slots vacated by a previous sweep. `HeapId` is a stable,
//! `Copy`-cheap handle with no lifetime, never a raw pointer.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a over raw bytes, cached on every interned string (§3 String).
#[must_use]
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// A stable handle to a heap-allocated object. Carries no lifetime;
/// dereference through [`Heap::get`]/[`Heap::get_mut`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(u32);

impl HeapId {
    #[must_use]
    pub fn to_raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone)]
pub struct StringObj {
    pub bytes: Vec<u8>,
    pub hash: u32,
}

#[derive(Clone)]
pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: usize,
    /// `None` for the synthetic top-level script function.
    pub name: Option<HeapId>,
    pub chunk: Chunk,
}

/// An upvalue is open while it still refers to a live stack slot, and
/// closed once that slot leaves scope (§3 Upvalue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalueLocation {
    Open(usize),
    Closed,
}

#[derive(Clone)]
pub struct UpvalueObj {
    pub location: UpvalueLocation,
    pub closed: Value,
    /// Thread pointer for the VM's open-upvalue list, sorted by descending
    /// stack index. `None` once closed or at the tail of the list.
    pub next_open: Option<HeapId>,
}

#[derive(Clone)]
pub struct ClosureObj {
    pub function: HeapId,
    pub upvalues: Vec<HeapId>,
}

/// Native-ABI function pointer (§4.10): takes the heap (so a native can
/// intern a fresh string or read an existing one's bytes — `strlen` and
/// `read_line` cannot be expressed without it) and the argument slice
/// (its length is argc), and returns a value or an error message that
/// the host maps to a runtime error.
pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, String>;

#[derive(Clone, Copy)]
pub struct NativeObj {
    pub name: HeapId,
    pub function: NativeFn,
}

#[derive(Clone)]
pub struct ClassObj {
    pub name: HeapId,
    pub methods: Table,
}

#[derive(Clone)]
pub struct InstanceObj {
    pub class: HeapId,
    pub fields: Table,
}

#[derive(Clone, Copy)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub closure: HeapId,
}

/// The payload of a heap object, tagged by [`HeapData::kind_name`] for GC
/// bookkeeping and diagnostics.
#[derive(Clone)]
pub enum HeapData {
    String(StringObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Native(NativeObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    Array(Vec<Value>),
}

impl HeapData {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Function(_) => "function",
            Self::Closure(_) => "closure",
            Self::Upvalue(_) => "upvalue",
            Self::Native(_) => "native",
            Self::Class(_) => "class",
            Self::Instance(_) => "instance",
            Self::BoundMethod(_) => "bound method",
            Self::Array(_) => "array",
        }
    }

    /// A coarse per-object byte estimate for the `bytes_allocated` GC
    /// trigger (§4.7), not an exact size.
    fn approx_size(&self) -> usize {
        let base = size_of::<Self>();
        match self {
            Self::String(s) => base + s.bytes.len(),
            Self::Array(a) => base + a.len() * size_of::<Value>(),
            Self::Function(f) => base + f.chunk.approx_size(),
            Self::Class(c) => base + c.methods.len() * 24,
            Self::Instance(i) => base + i.fields.len() * 24,
            _ => base,
        }
    }
}

enum Slot {
    Free(Option<usize>),
    Occupied { marked: bool, data: HeapData },
}

/// The GC heap: an arena of [`HeapData`] keyed by [`HeapId`], plus the
/// string intern set. One `Heap` backs one VM; nothing here is global.
pub struct Heap {
    entries: Vec<Slot>,
    free_head: Option<usize>,
    /// Intern set: keys are `HeapId`s of `String` objects, values are
    /// unused (the key's existence is the fact being recorded).
    pub intern: Table,
    pub bytes_allocated: usize,
    pub next_gc: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    const INITIAL_NEXT_GC: usize = 1024 * 1024;

    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: None,
            intern: Table::new(),
            bytes_allocated: 0,
            next_gc: Self::INITIAL_NEXT_GC,
        }
    }

    /// Allocates `data` as a fresh heap object. The caller is responsible
    /// for the root-before-further-allocation discipline of §4.7's write
    /// barrier note: push the resulting value onto the VM stack before
    /// performing any allocation that could trigger a GC cycle.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        self.bytes_allocated += data.approx_size();
        if let Some(index) = self.free_head {
            let Slot::Free(next) = self.entries[index] else {
                unreachable!("free_head pointed at an occupied slot");
            };
            self.free_head = next;
            self.entries[index] = Slot::Occupied { marked: false, data };
            HeapId(u32::try_from(index).expect("heap arena index overflowed u32"))
        } else {
            let index = self.entries.len();
            self.entries.push(Slot::Occupied { marked: false, data });
            HeapId(u32::try_from(index).expect("heap arena index overflowed u32"))
        }
    }

    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        match &self.entries[id.index()] {
            Slot::Occupied { data, .. } => data,
            Slot::Free(_) => unreachable!("dereferenced a freed HeapId"),
        }
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        match &mut self.entries[id.index()] {
            Slot::Occupied { data, .. } => data,
            Slot::Free(_) => unreachable!("dereferenced a freed HeapId"),
        }
    }

    /// Interns `bytes`, reusing an existing string object with equal
    /// content if one exists (§3 invariant: equal-bytes strings share one
    /// reference).
    pub fn intern_string(&mut self, bytes: &[u8]) -> HeapId {
        let hash = fnv1a_hash(bytes);
        if let Some(id) = self.intern.find_string(self, bytes, hash) {
            return id;
        }
        let id = self.allocate(HeapData::String(StringObj {
            bytes: bytes.to_vec(),
            hash,
        }));
        self.intern.set(id, hash, Value::obj(id));
        id
    }

    #[must_use]
    pub fn string_bytes(&self, id: HeapId) -> &[u8] {
        match self.get(id) {
            HeapData::String(s) => &s.bytes,
            other => unreachable!("string_bytes called on a {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn string_hash(&self, id: HeapId) -> u32 {
        match self.get(id) {
            HeapData::String(s) => s.hash,
            other => unreachable!("string_hash called on a {}", other.kind_name()),
        }
    }

    #[must_use]
    pub fn is_marked(&self, id: HeapId) -> bool {
        match &self.entries[id.index()] {
            Slot::Occupied { marked, .. } => *marked,
            Slot::Free(_) => false,
        }
    }

    /// Marks `id` black. Returns `true` the first time (so the GC's grey
    /// worklist only enqueues an object once).
    pub(crate) fn mark(&mut self, id: HeapId) -> bool {
        match &mut self.entries[id.index()] {
            Slot::Occupied { marked, .. } if !*marked => {
                *marked = true;
                true
            }
            _ => false,
        }
    }

    /// Sweeps every unmarked slot, clears the mark bit on survivors, and
    /// returns the number of objects freed. Callers trace roots and mark
    /// reachable objects first.
    pub(crate) fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for index in 0..self.entries.len() {
            match &self.entries[index] {
                Slot::Occupied { marked: false, .. } => {
                    let Slot::Occupied { data, .. } =
                        std::mem::replace(&mut self.entries[index], Slot::Free(self.free_head))
                    else {
                        unreachable!()
                    };
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(data.approx_size());
                    self.free_head = Some(index);
                    freed += 1;
                }
                Slot::Occupied { marked: true, .. } => {
                    if let Slot::Occupied { marked, .. } = &mut self.entries[index] {
                        *marked = false;
                    }
                }
                Slot::Free(_) => {}
            }
        }
        freed
    }

    /// Iterates the ids of every currently-occupied slot.
    pub(crate) fn iter_ids(&self) -> impl Iterator<Item = HeapId> + '_ {
        self.entries.iter().enumerate().filter_map(|(i, slot)| match slot {
            Slot::Occupied { .. } => Some(HeapId(u32::try_from(i).unwrap())),
            Slot::Free(_) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedupes_equal_bytes() {
        let mut heap = Heap::new();
        let a = heap.intern_string(b"hello");
        let b = heap.intern_string(b"hello");
        let c = heap.intern_string(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let a = heap.allocate(HeapData::Array(vec![]));
        heap.mark(a);
        let _b = heap.allocate(HeapData::Array(vec![Value::number(1.0)]));
        heap.sweep();
        // `a` survived (marked), `b` was collected; next allocation should
        // reuse b's freed slot rather than growing the arena.
        let before_len = heap.entries.len();
        let _c = heap.allocate(HeapData::Array(vec![]));
        assert_eq!(heap.entries.len(), before_len);
    }

    #[test]
    fn fnv1a_matches_known_vector() {
        // FNV-1a 32-bit of the empty string is the offset basis.
        assert_eq!(fnv1a_hash(b""), FNV_OFFSET_BASIS);
    }
}
