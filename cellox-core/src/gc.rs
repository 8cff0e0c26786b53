//! Tri-colour mark-and-sweep garbage collection over the [`Heap`] (§4.7).
//!
//! This module owns only the tracing algorithm; root enumeration is the
//! VM's job (it alone knows the value stack, call frames, and globals),
//! so a collection is driven by handing `collect` a fully-populated
//! [`Roots`] snapshot.

use crate::heap::{Heap, HeapData};
use crate::table::Table;
use crate::value::{Value, ValueKind};

/// Every GC root, gathered by the caller (§4.7 "Mark roots"):
/// everything reachable from here is live going into the cycle.
pub struct Roots<'a> {
    pub stack: &'a [Value],
    /// The closure of every active call frame.
    pub frame_closures: &'a [crate::heap::HeapId],
    /// Every open upvalue (also reachable transitively from frames that
    /// captured it, but cheaper to just hand over the VM's own list).
    pub open_upvalues: &'a [crate::heap::HeapId],
    pub globals: &'a Table,
    /// The interned `"init"` string, kept alive even when no instance
    /// currently defines an initializer.
    pub init_string: Option<crate::heap::HeapId>,
    /// Functions currently being built by the compiler's frame stack.
    ///
    /// `spec.md` names this as one of the GC's root categories because the
    /// original design allows a collection to interleave with compilation.
    /// Here `compile()` always runs to full completion, allocating a
    /// function's constants and nested functions without ever calling
    /// `Vm::collect_if_needed`, before the resulting script is handed to a
    /// `Vm` for execution. The compiler's frame stack and a live `Vm`
    /// dispatch loop therefore never coexist, so this is always `&[]`; the
    /// field stays to keep `Roots` a complete mirror of every category
    /// `spec.md` §4.7 lists, and to give a future incremental or
    /// concurrent compiler a root to populate without changing this type.
    pub compiler_functions: &'a [crate::heap::HeapId],
}

/// Runs one full mark-and-sweep cycle and returns the number of objects
/// freed. `next_gc` is updated to `bytes_allocated * 2` per §4.7.
pub fn collect_garbage(heap: &mut Heap, roots: &Roots<'_>) -> usize {
    tracing::trace!(bytes_allocated = heap.bytes_allocated, next_gc = heap.next_gc, "gc cycle begin");
    let mut grey: Vec<crate::heap::HeapId> = Vec::new();

    for value in roots.stack {
        mark_value(heap, &mut grey, *value);
    }
    for &id in roots.frame_closures {
        mark_object(heap, &mut grey, id);
    }
    for &id in roots.open_upvalues {
        mark_object(heap, &mut grey, id);
    }
    for (key, _, value) in roots.globals.iter() {
        mark_object(heap, &mut grey, key);
        mark_value(heap, &mut grey, value);
    }
    if let Some(init) = roots.init_string {
        mark_object(heap, &mut grey, init);
    }
    for &id in roots.compiler_functions {
        mark_object(heap, &mut grey, id);
    }

    trace(heap, &mut grey);

    // Weak roots: drop any interned string the trace never reached,
    // rather than keeping it alive just because it's in the intern set.
    let marked: std::collections::HashSet<_> = heap.iter_ids().filter(|id| heap.is_marked(*id)).collect();
    heap.intern.retain_keys(|id| marked.contains(&id));

    let freed = heap.sweep();
    heap.next_gc = heap.bytes_allocated.max(1) * 2;
    tracing::debug!(freed, bytes_allocated = heap.bytes_allocated, next_gc = heap.next_gc, "gc cycle end");
    freed
}

fn mark_value(heap: &mut Heap, grey: &mut Vec<crate::heap::HeapId>, value: Value) {
    if value.kind() == ValueKind::Obj {
        mark_object(heap, grey, value.as_obj_unchecked());
    }
}

fn mark_object(heap: &mut Heap, grey: &mut Vec<crate::heap::HeapId>, id: crate::heap::HeapId) {
    if heap.mark(id) {
        grey.push(id);
    }
}

/// Drains the grey worklist, marking every referent of each grey object
/// before it is considered black (§4.7 per-kind tracing rules).
fn trace(heap: &mut Heap, grey: &mut Vec<crate::heap::HeapId>) {
    while let Some(id) = grey.pop() {
        // `HeapData` is cloned out so we can mutably touch the heap while
        // tracing referents; cloning is cheap here since every referent
        // we need is a `HeapId`/`Value` (Copy), not heap-owned bytes,
        // except `String`/`Array`/tables, which have no outgoing refs to
        // the arena we'd need during tracing (arrays are handled inline
        // via indices instead of cloning their payload).
        match heap.get(id) {
            HeapData::String(_) | HeapData::Native(_) => {}
            HeapData::Function(f) => {
                let name = f.name;
                let constants: Vec<Value> = f.chunk.constants().to_vec();
                if let Some(name) = name {
                    mark_object(heap, grey, name);
                }
                for constant in constants {
                    mark_value(heap, grey, constant);
                }
            }
            HeapData::Closure(c) => {
                let function = c.function;
                let upvalues = c.upvalues.clone();
                mark_object(heap, grey, function);
                for up in upvalues {
                    mark_object(heap, grey, up);
                }
            }
            HeapData::Upvalue(u) => {
                let closed = u.closed;
                mark_value(heap, grey, closed);
            }
            HeapData::Class(c) => {
                let name = c.name;
                let methods: Vec<_> = c.methods.iter().collect();
                mark_object(heap, grey, name);
                for (key, _, value) in methods {
                    mark_object(heap, grey, key);
                    mark_value(heap, grey, value);
                }
            }
            HeapData::Instance(i) => {
                let class = i.class;
                let fields: Vec<_> = i.fields.iter().collect();
                mark_object(heap, grey, class);
                for (key, _, value) in fields {
                    mark_object(heap, grey, key);
                    mark_value(heap, grey, value);
                }
            }
            HeapData::BoundMethod(b) => {
                let receiver = b.receiver;
                let closure = b.closure;
                mark_value(heap, grey, receiver);
                mark_object(heap, grey, closure);
            }
            HeapData::Array(items) => {
                let items = items.clone();
                for item in items {
                    mark_value(heap, grey, item);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapData;

    #[test]
    fn unreachable_object_is_collected() {
        let mut heap = Heap::new();
        let _dead = heap.allocate(HeapData::Array(vec![]));
        let alive = heap.allocate(HeapData::Array(vec![]));
        let roots = Roots {
            stack: &[Value::obj(alive)],
            frame_closures: &[],
            open_upvalues: &[],
            globals: &Table::new(),
            init_string: None,
            compiler_functions: &[],
        };
        let freed = collect_garbage(&mut heap, &roots);
        assert_eq!(freed, 1);
        // survivors have their mark bit cleared so the next cycle starts white
        assert!(!heap.is_marked(alive));
    }

    #[test]
    fn reachable_through_array_element_survives() {
        let mut heap = Heap::new();
        let inner = heap.allocate(HeapData::Array(vec![]));
        let outer = heap.allocate(HeapData::Array(vec![Value::obj(inner)]));
        let roots = Roots {
            stack: &[Value::obj(outer)],
            frame_closures: &[],
            open_upvalues: &[],
            globals: &Table::new(),
            init_string: None,
            compiler_functions: &[],
        };
        let freed = collect_garbage(&mut heap, &roots);
        assert_eq!(freed, 0);
    }
}
