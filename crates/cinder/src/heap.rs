//! The object arena and the tracing garbage collector.
//!
//! Objects are not individually heap-allocated and linked through raw
//! pointers; they live in a single arena (`Heap`) indexed by [`ObjId`]. The
//! spec's "intrusive singly-linked list rooted at the VM" becomes the
//! arena's slot table plus a free list of reclaimed slots: every live
//! object is still reachable by walking the arena, and sweep still reclaims
//! dead slots (for reuse, rather than for `free()`), which is what the
//! property tests in the spec actually observe.

use crate::config::VmConfig;
use crate::object::{Obj, ObjId, UpvalueState, fnv1a_32};
use crate::table::Table;
use crate::value::Value;

struct Slot {
    obj: Obj,
    marked: bool,
}

pub struct Heap {
    slots: Vec<Option<Slot>>,
    free_list: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    grow_factor: usize,
    pub stress_gc: bool,
    /// Interns all live string content; keys are `ObjId`s of `Obj::String`,
    /// values are unused (`Value::Nil`), matching clox's `vm.strings`.
    strings: Table,
    init_string: ObjId,
}

/// Every place a live object can be reached from at the moment a
/// collection runs. Assembled fresh by the caller (the VM at runtime, or
/// nothing at compile time — see `DESIGN.md`) immediately before
/// `Heap::collect_garbage`.
pub struct GcRoots<'a> {
    pub stack: &'a [Value],
    pub frame_closures: &'a [ObjId],
    pub open_upvalues: &'a [ObjId],
    pub tables: &'a [&'a Table],
    pub extra: &'a [ObjId],
}

pub struct CollectStats {
    pub bytes_before: usize,
    pub bytes_after: usize,
    pub next_gc: usize,
}

impl Heap {
    pub fn new(config: &VmConfig) -> Self {
        let mut heap = Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            bytes_allocated: 0,
            next_gc: config.gc_initial_threshold,
            grow_factor: config.gc_heap_grow_factor,
            stress_gc: config.stress_gc,
            strings: Table::new(),
            // Placeholder; replaced immediately below once the table
            // exists. `intern_new` does not read `init_string`, so this is
            // safe.
            init_string: ObjId::from_index(0),
        };
        heap.init_string = heap.intern_new(b"init");
        heap
    }

    pub fn init_string(&self) -> ObjId {
        self.init_string
    }

    pub fn init_string_hash(&self) -> u32 {
        self.obj(self.init_string).as_string().expect("init_string is always a string").hash
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    pub fn obj(&self, id: ObjId) -> &Obj {
        &self.slots[id.index()].as_ref().expect("dangling ObjId").obj
    }

    pub fn obj_mut(&mut self, id: ObjId) -> &mut Obj {
        &mut self.slots[id.index()].as_mut().expect("dangling ObjId").obj
    }

    pub fn is_marked(&self, id: ObjId) -> bool {
        self.slots[id.index()].as_ref().map(|s| s.marked).unwrap_or(false)
    }

    /// Allocates a fresh object. Callers are responsible for checking
    /// `should_collect` and running a collection *before* calling this if
    /// so — allocation itself never collects, since `Heap` alone cannot see
    /// the VM's stack or call-frame roots.
    pub fn alloc(&mut self, obj: Obj) -> ObjId {
        self.bytes_allocated += obj.approx_size();
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx as usize] = Some(Slot { obj, marked: false });
            ObjId::from_index(idx as usize)
        } else {
            self.slots.push(Some(Slot { obj, marked: false }));
            ObjId::from_index(self.slots.len() - 1)
        }
    }

    /// Looks up an already-interned string by content, without allocating.
    pub fn find_interned(&self, bytes: &[u8]) -> Option<ObjId> {
        let hash = fnv1a_32(bytes);
        self.strings.find_string(self, bytes, hash)
    }

    /// Allocates and interns a new string. Callers must already have
    /// checked `find_interned` returned `None` (the "intern lookup first;
    /// allocate only on miss" rule from the spec's `Add` semantics).
    pub fn intern_new(&mut self, bytes: &[u8]) -> ObjId {
        let hash = fnv1a_32(bytes);
        let id = self.alloc(Obj::String(crate::object::LString { bytes: bytes.to_vec().into_boxed_slice(), hash }));
        self.strings.set(id, hash, Value::Nil);
        id
    }

    fn mark_object(&mut self, id: ObjId, gray: &mut Vec<ObjId>) {
        if self.is_marked(id) {
            return;
        }
        if let Some(slot) = self.slots[id.index()].as_mut() {
            slot.marked = true;
        }
        gray.push(id);
    }

    fn mark_value(&mut self, value: Value, gray: &mut Vec<ObjId>) {
        if let Value::Object(id) = value {
            self.mark_object(id, gray);
        }
    }

    /// Pushes every child of `id` onto the gray worklist via `mark_value` /
    /// `mark_object`. Object fields are read first into an owned buffer so
    /// this doesn't need to hold a borrow of `self` across the marking
    /// calls that follow.
    fn blacken(&mut self, id: ObjId, gray: &mut Vec<ObjId>) {
        let mut children: Vec<Value> = Vec::new();
        match self.obj(id) {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    children.push(Value::Object(name));
                }
                children.extend(f.chunk.constants().iter().copied());
            }
            Obj::Closure(c) => {
                children.push(Value::Object(c.function));
                children.extend(c.upvalues.iter().map(|id| Value::Object(*id)));
            }
            Obj::Upvalue(u) => {
                if let UpvalueState::Closed(v) = &u.state {
                    children.push(*v);
                }
            }
            Obj::Class(c) => {
                children.push(Value::Object(c.name));
                for (k, v) in c.methods.iter() {
                    children.push(Value::Object(k));
                    children.push(v);
                }
            }
            Obj::Instance(i) => {
                children.push(Value::Object(i.class));
                for (k, v) in i.fields.iter() {
                    children.push(Value::Object(k));
                    children.push(v);
                }
            }
            Obj::BoundMethod(b) => {
                children.push(b.receiver);
                children.push(Value::Object(b.method));
            }
        }
        for v in children {
            self.mark_value(v, gray);
        }
    }

    /// Tri-color mark-sweep over the object arena, driven by `roots`. The
    /// string intern table is deliberately not a root: after tracing,
    /// unmarked strings are dropped from it (`remove_white`) before sweep,
    /// so a swept string can never linger as a dangling intern-table key.
    pub fn collect_garbage(&mut self, roots: GcRoots<'_>) -> CollectStats {
        let bytes_before = self.bytes_allocated;
        let mut gray: Vec<ObjId> = Vec::new();

        for value in roots.stack {
            self.mark_value(*value, &mut gray);
        }
        for id in roots.frame_closures {
            self.mark_object(*id, &mut gray);
        }
        for id in roots.open_upvalues {
            self.mark_object(*id, &mut gray);
        }
        for id in roots.extra {
            self.mark_object(*id, &mut gray);
        }
        for table in roots.tables {
            let entries: Vec<(ObjId, Value)> = table.iter().collect();
            for (k, v) in entries {
                self.mark_object(k, &mut gray);
                self.mark_value(v, &mut gray);
            }
        }

        while let Some(id) = gray.pop() {
            self.blacken(id, &mut gray);
        }

        self.strings.remove_white(self);
        self.sweep();

        self.next_gc = self.bytes_allocated * self.grow_factor.max(1);
        CollectStats { bytes_before, bytes_after: self.bytes_allocated, next_gc: self.next_gc }
    }

    fn sweep(&mut self) {
        for idx in 0..self.slots.len() {
            let Some(slot) = self.slots[idx].as_mut() else { continue };
            if slot.marked {
                slot.marked = false;
            } else {
                self.bytes_allocated -= slot.obj.approx_size();
                self.slots[idx] = None;
                self.free_list.push(idx as u32);
            }
        }
    }

    /// Renders a heap object for `print` / string concatenation /
    /// diagnostics. Functions, closures and bound methods print their name;
    /// classes and instances print `ClassName` / `ClassName instance`.
    pub fn format_object(&self, id: ObjId) -> String {
        match self.obj(id) {
            Obj::String(s) => s.as_str().to_owned(),
            Obj::Function(f) => match f.name {
                Some(name) => format!("<fn {}>", self.obj(name).as_string().expect("fn name is a string").as_str()),
                None => "<script>".to_owned(),
            },
            Obj::Native(n) => {
                format!("<native fn {}>", self.obj(n.name).as_string().expect("native name is a string").as_str())
            }
            Obj::Closure(c) => self.format_object(c.function),
            Obj::Upvalue(_) => "upvalue".to_owned(),
            Obj::Class(c) => self.obj(c.name).as_string().expect("class name is a string").as_str().to_owned(),
            Obj::Instance(i) => {
                let class_name = self.obj(i.class).as_class().expect("instance.class is a class").name;
                format!("{} instance", self.obj(class_name).as_string().expect("class name is a string").as_str())
            }
            Obj::BoundMethod(b) => self.format_object(b.method),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::LString;

    #[test]
    fn interning_dedups_by_content() {
        let mut heap = Heap::new(&VmConfig::default());
        let a = heap.intern_new(b"hello");
        assert_eq!(heap.find_interned(b"hello"), Some(a));
        assert_eq!(heap.find_interned(b"goodbye"), None);
    }

    #[test]
    fn unreachable_object_is_collected() {
        let mut heap = Heap::new(&VmConfig::default());
        let garbage = heap.alloc(Obj::String(LString { bytes: b"garbage".to_vec().into_boxed_slice(), hash: 0 }));
        let before = heap.bytes_allocated();
        heap.collect_garbage(GcRoots {
            stack: &[],
            frame_closures: &[],
            open_upvalues: &[],
            tables: &[],
            extra: &[heap.init_string()],
        });
        assert!(heap.bytes_allocated() < before);
        let _ = garbage;
    }

    #[test]
    fn rooted_object_survives_collection() {
        let mut heap = Heap::new(&VmConfig::default());
        let kept = heap.alloc(Obj::String(LString { bytes: b"kept".to_vec().into_boxed_slice(), hash: 0 }));
        heap.collect_garbage(GcRoots {
            stack: &[Value::Object(kept)],
            frame_closures: &[],
            open_upvalues: &[],
            tables: &[],
            extra: &[heap.init_string()],
        });
        assert!(!heap.is_marked(kept), "marks are cleared again after sweep");
        assert_eq!(heap.obj(kept).as_string().unwrap().as_str(), "kept");
    }
}
