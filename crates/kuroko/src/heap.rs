//! Arena-allocated heap with string interning and a mark-and-sweep collector.
//!
//! Objects live in slots addressed by [`HeapId`]; freed slots are recycled
//! through a free list. Collection runs only at safe points: the VM checks
//! [`Heap::should_collect`] between instructions and gathers its roots, so no
//! write barriers are needed. Native code holding values across allocations
//! must keep them reachable from the VM stack or its protected-root list.

use std::{cell::Cell, collections::BTreeMap};

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    object::{BoundMethod, Bytes, Class, Closure, Dict, Function, Generator, Instance, List, Native, Property, Set,
        Str, Tuple, Upvalue},
    value::{Value, hash_bytes, hash_u64, value_hash},
};

/// Handle to an object slot in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct HeapId(usize);

impl HeapId {
    /// Raw slot index; exposed for `id()` and debug output.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Per-object header: mark state, repr re-entrancy flag, generation bits,
/// immortality, and the cached hash.
#[derive(Debug)]
pub struct ObjHeader {
    marked: bool,
    /// Set while the object is on the active repr path; repr emits `...`
    /// instead of recursing.
    pub in_repr: bool,
    immortal: bool,
    /// Survival count, saturating. Tracked for future generational
    /// collection; the collector itself is single-generation.
    generation: u8,
    hash: Cell<Option<u32>>,
}

impl ObjHeader {
    fn new() -> Self {
        Self {
            marked: false,
            in_repr: false,
            immortal: false,
            generation: 0,
            hash: Cell::new(None),
        }
    }
}

/// Every heap-resident object kind.
#[derive(Debug)]
pub enum HeapData {
    Str(Str),
    Bytes(Bytes),
    Tuple(Tuple),
    List(List),
    Dict(Dict),
    Set(Set),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    Native(Native),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    Property(Property),
    Generator(Generator),
}

impl HeapData {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Set(_) => "set",
            Self::Function(_) | Self::Closure(_) => "function",
            Self::Upvalue(_) => "upvalue",
            Self::Native(_) => "builtin function",
            Self::Class(_) => "type",
            Self::Instance(_) => "object",
            Self::BoundMethod(_) => "method",
            Self::Property(_) => "property",
            Self::Generator(_) => "generator",
        }
    }

    fn estimate_size(&self) -> usize {
        match self {
            Self::Str(s) => s.estimate_size(),
            Self::Bytes(b) => b.estimate_size(),
            Self::Tuple(t) => t.estimate_size(),
            Self::List(l) => l.estimate_size(),
            Self::Dict(d) => d.estimate_size(),
            Self::Set(s) => s.estimate_size(),
            Self::Function(f) => f.estimate_size(),
            Self::Class(c) => c.estimate_size(),
            Self::Instance(i) => i.estimate_size(),
            Self::Generator(g) => g.estimate_size(),
            Self::Closure(c) => std::mem::size_of::<Closure>() + c.upvalues.len() * std::mem::size_of::<HeapId>(),
            Self::Upvalue(_) | Self::Native(_) | Self::BoundMethod(_) | Self::Property(_) => {
                std::mem::size_of::<Self>()
            }
        }
    }
}

#[derive(Debug)]
struct HeapEntry {
    header: ObjHeader,
    data: HeapData,
}

/// Heap snapshot used by tooling and tests.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HeapStats {
    pub live_objects: usize,
    pub free_slots: usize,
    pub total_slots: usize,
    /// Live objects broken down by kind name; `BTreeMap` keeps display
    /// order deterministic.
    pub objects_by_type: BTreeMap<&'static str, usize>,
    pub interned_strings: usize,
    pub bytes_allocated: usize,
    pub collections: usize,
}

const GC_GROW_FACTOR: usize = 2;
const GC_INITIAL_THRESHOLD: usize = 1024 * 1024;

/// The arena, intern index, and collector state.
#[derive(Debug)]
pub struct Heap {
    entries: Vec<Option<HeapEntry>>,
    free: Vec<usize>,
    /// Content-hash buckets for interned strings. Pruned during sweep, so
    /// interning never keeps an otherwise-dead string alive.
    interned: AHashMap<u32, SmallVec<[HeapId; 2]>>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Collect on every allocation safe point (debug aid).
    pub stress: bool,
    /// Set during compilation, where chunk constants are not yet reachable
    /// from any root.
    pub gc_paused: bool,
    gray: Vec<HeapId>,
    collections: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            interned: AHashMap::new(),
            bytes_allocated: 0,
            next_gc: GC_INITIAL_THRESHOLD,
            stress: false,
            gc_paused: false,
            gray: Vec::new(),
            collections: 0,
        }
    }

    /// Places `data` into the arena, reusing a free slot when available.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        self.bytes_allocated += data.estimate_size();
        let entry = HeapEntry {
            header: ObjHeader::new(),
            data,
        };
        if let Some(slot) = self.free.pop() {
            debug_assert!(self.entries[slot].is_none());
            self.entries[slot] = Some(entry);
            HeapId(slot)
        } else {
            self.entries.push(Some(entry));
            HeapId(self.entries.len() - 1)
        }
    }

    /// Interns `text`, returning the canonical string object for its
    /// content.
    pub fn intern_string(&mut self, text: &str) -> HeapId {
        let hash = hash_bytes(text.as_bytes());
        if let Some(bucket) = self.interned.get(&hash) {
            for &id in bucket {
                if let HeapData::Str(s) = &self.entry(id).data
                    && s.as_str() == text
                {
                    return id;
                }
            }
        }
        let id = self.allocate(HeapData::Str(Str::new(text)));
        self.entry(id).header.hash.set(Some(hash));
        self.interned.entry(hash).or_default().push(id);
        id
    }

    /// Takes ownership of an already-built string, interning it.
    pub fn take_string(&mut self, text: String) -> HeapId {
        self.intern_string(&text)
    }

    /// Marks an object as immortal: it is treated as a root by every
    /// collection. Used for boot objects (base classes, special-method
    /// names).
    pub fn make_immortal(&mut self, id: HeapId) {
        self.entry_mut(id).header.immortal = true;
    }

    #[inline]
    fn entry(&self, id: HeapId) -> &HeapEntry {
        self.entries[id.0].as_ref().expect("use of collected heap id")
    }

    #[inline]
    fn entry_mut(&mut self, id: HeapId) -> &mut HeapEntry {
        self.entries[id.0].as_mut().expect("use of collected heap id")
    }

    #[inline]
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self.entry(id).data
    }

    #[inline]
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.entry_mut(id).data
    }

    /// The interned `&str` for a string object.
    ///
    /// # Panics
    /// Panics if `id` is not a string; callers hold ids produced by
    /// `intern_string`.
    #[must_use]
    pub fn str_value(&self, id: HeapId) -> &str {
        match self.get(id) {
            HeapData::Str(s) => s.as_str(),
            other => panic!("expected interned string, found {}", other.type_name()),
        }
    }

    /// Temporarily removes an entry's data so it can be mutated while the
    /// rest of the heap stays readable (hash/equality of dict keys walk the
    /// heap). The closure must not touch `id` itself.
    pub fn with_data_mut<R>(&mut self, id: HeapId, f: impl FnOnce(&mut Self, &mut HeapData) -> R) -> R {
        let placeholder = HeapData::Tuple(Tuple::new(Vec::new()));
        let mut data = std::mem::replace(self.get_mut(id), placeholder);
        let result = f(self, &mut data);
        *self.get_mut(id) = data;
        result
    }

    /// Repr re-entrancy flag accessors.
    pub fn set_in_repr(&mut self, id: HeapId, value: bool) {
        self.entry_mut(id).header.in_repr = value;
    }

    #[must_use]
    pub fn in_repr(&self, id: HeapId) -> bool {
        self.entry(id).header.in_repr
    }

    /// Hash of an immutable object, cached in its header. `None` marks the
    /// kind unhashable.
    #[must_use]
    pub fn hash_object(&self, id: HeapId) -> Option<u32> {
        let entry = self.entry(id);
        if let Some(cached) = entry.header.hash.get() {
            return Some(cached);
        }
        let computed = match &entry.data {
            HeapData::Str(s) => Some(hash_bytes(s.as_str().as_bytes())),
            HeapData::Bytes(b) => Some(hash_bytes(b.as_slice())),
            HeapData::Tuple(t) => {
                let mut acc: u32 = 0x345678;
                for &item in &t.items {
                    let h = value_hash(self, item)?;
                    acc = acc.rotate_left(5).wrapping_mul(0x0100_0193) ^ h;
                }
                Some(acc)
            }
            // Mutable containers are unhashable.
            HeapData::List(_) | HeapData::Dict(_) | HeapData::Set(_) | HeapData::Upvalue(_) => None,
            // Everything else hashes by identity.
            _ => Some(hash_u64(id.0 as u64)),
        };
        if let Some(hash) = computed {
            entry.header.hash.set(Some(hash));
        }
        computed
    }

    // ---- collection ----

    /// Whether the VM should run a collection at the next safe point.
    #[must_use]
    pub fn should_collect(&self) -> bool {
        !self.gc_paused && (self.stress || self.bytes_allocated > self.next_gc)
    }

    /// Begins a mark phase; immortal objects are marked as implicit roots.
    pub fn begin_mark(&mut self) {
        self.gray.clear();
        let immortals: Vec<HeapId> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                e.as_ref()
                    .filter(|entry| entry.header.immortal)
                    .map(|_| HeapId(i))
            })
            .collect();
        for id in immortals {
            self.mark_object(id);
        }
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Ref(id) = value {
            self.mark_object(id);
        }
    }

    pub fn mark_object(&mut self, id: HeapId) {
        let entry = self.entry_mut(id);
        if entry.header.marked {
            return;
        }
        entry.header.marked = true;
        self.gray.push(id);
    }

    /// Drains the gray worklist, marking every reachable object.
    pub fn trace_references(&mut self) {
        let mut scratch: SmallVec<[HeapId; 16]> = SmallVec::new();
        while let Some(id) = self.gray.pop() {
            scratch.clear();
            collect_children(&self.entry(id).data, &mut scratch);
            for &child in &scratch {
                self.mark_object(child);
            }
        }
    }

    /// Frees every unmarked, non-immortal object and prunes the intern
    /// index. Returns the number of freed objects.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for slot in 0..self.entries.len() {
            let Some(entry) = &mut self.entries[slot] else { continue };
            if entry.header.immortal || entry.header.marked {
                entry.header.marked = false;
                entry.header.generation = entry.header.generation.saturating_add(1);
                continue;
            }
            let entry = self.entries[slot].take().expect("slot checked above");
            self.bytes_allocated = self.bytes_allocated.saturating_sub(entry.data.estimate_size());
            if let HeapData::Str(s) = &entry.data {
                let hash = entry.header.hash.get().unwrap_or_else(|| hash_bytes(s.as_str().as_bytes()));
                if let Some(bucket) = self.interned.get_mut(&hash) {
                    bucket.retain(|id| id.0 != slot);
                    if bucket.is_empty() {
                        self.interned.remove(&hash);
                    }
                }
            }
            self.free.push(slot);
            freed += 1;
        }
        self.next_gc = (self.bytes_allocated * GC_GROW_FACTOR).max(GC_INITIAL_THRESHOLD);
        self.collections += 1;
        freed
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut objects_by_type = BTreeMap::new();
        let mut live = 0;
        for entry in self.entries.iter().flatten() {
            live += 1;
            *objects_by_type.entry(entry.data.type_name()).or_insert(0) += 1;
        }
        HeapStats {
            live_objects: live,
            free_slots: self.free.len(),
            total_slots: self.entries.len(),
            objects_by_type,
            interned_strings: self.interned.values().map(SmallVec::len).sum(),
            bytes_allocated: self.bytes_allocated,
            collections: self.collections,
        }
    }
}

/// Pushes every heap id referenced by `data` into `out`.
fn collect_children(data: &HeapData, out: &mut SmallVec<[HeapId; 16]>) {
    let mut push_value = |v: Value, out: &mut SmallVec<[HeapId; 16]>| {
        if let Value::Ref(id) = v {
            out.push(id);
        }
    };
    match data {
        HeapData::Str(_) | HeapData::Bytes(_) | HeapData::Native(_) => {}
        HeapData::Tuple(t) => {
            for &v in &t.items {
                push_value(v, out);
            }
        }
        HeapData::List(l) => {
            for &v in &l.items {
                push_value(v, out);
            }
        }
        HeapData::Dict(d) => {
            for (k, v) in d.iter() {
                push_value(k, out);
                push_value(v, out);
            }
        }
        HeapData::Set(s) => {
            for v in s.iter() {
                push_value(v, out);
            }
        }
        HeapData::Function(f) => {
            out.push(f.name);
            for &c in f.chunk.constants() {
                push_value(c, out);
            }
            for &name in f.required_args.iter().chain(&f.keyword_args) {
                out.push(name);
            }
            for local in &f.locals_debug {
                out.push(local.name);
            }
            push_value(f.docstring, out);
        }
        HeapData::Closure(c) => {
            out.push(c.function);
            out.push(c.globals);
            out.extend(c.upvalues.iter().copied());
        }
        HeapData::Upvalue(u) => {
            if let Upvalue::Closed(v) = u {
                push_value(*v, out);
            }
        }
        HeapData::Class(c) => {
            out.push(c.name);
            if let Some(base) = c.base {
                out.push(base);
            }
            for (&name, &v) in c.methods.iter().chain(c.statics.iter()) {
                out.push(name);
                push_value(v, out);
            }
            for slot in c.slots.iter().flatten() {
                push_value(*slot, out);
            }
            push_value(c.docstring, out);
        }
        HeapData::Instance(i) => {
            out.push(i.class);
            for (&name, &v) in &i.fields {
                out.push(name);
                push_value(v, out);
            }
        }
        HeapData::BoundMethod(b) => {
            push_value(b.receiver, out);
            push_value(b.method, out);
        }
        HeapData::Property(p) => {
            push_value(p.getter, out);
            if let Some(setter) = p.setter {
                push_value(setter, out);
            }
        }
        HeapData::Generator(g) => {
            out.push(g.closure);
            for &v in &g.stack {
                push_value(v, out);
            }
            push_value(g.result, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_canonical() {
        let mut heap = Heap::new();
        let a = heap.intern_string("hello");
        let b = heap.intern_string("hello");
        let c = heap.intern_string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.str_value(a), "hello");
    }

    #[test]
    fn sweep_frees_unreachable_and_prunes_interns() {
        let mut heap = Heap::new();
        let kept = heap.intern_string("kept");
        let dropped = heap.intern_string("dropped");
        heap.begin_mark();
        heap.mark_object(kept);
        heap.trace_references();
        let freed = heap.sweep();
        assert_eq!(freed, 1);
        assert_eq!(heap.str_value(kept), "kept");
        // The dead string is gone from the intern index: re-interning the
        // same content produces a fresh object in the recycled slot.
        let again = heap.intern_string("dropped");
        assert_eq!(again.index(), dropped.index());
        assert_eq!(heap.stats().live_objects, 2);
    }

    #[test]
    fn containers_keep_children_alive() {
        let mut heap = Heap::new();
        let s = heap.intern_string("element");
        let list = heap.allocate(HeapData::List(List::new(vec![Value::Ref(s)])));
        heap.begin_mark();
        heap.mark_object(list);
        heap.trace_references();
        assert_eq!(heap.sweep(), 0);
        assert_eq!(heap.str_value(s), "element");
    }

    #[test]
    fn immortals_survive_unrooted() {
        let mut heap = Heap::new();
        let name = heap.intern_string("__init__");
        heap.make_immortal(name);
        heap.begin_mark();
        heap.trace_references();
        assert_eq!(heap.sweep(), 0);
        assert_eq!(heap.str_value(name), "__init__");
    }

    #[test]
    fn tuple_hash_combines_elements() {
        let mut heap = Heap::new();
        let t1 = heap.allocate(HeapData::Tuple(Tuple::new(vec![Value::Int(1), Value::Int(2)])));
        let t2 = heap.allocate(HeapData::Tuple(Tuple::new(vec![Value::Int(1), Value::Int(2)])));
        let t3 = heap.allocate(HeapData::Tuple(Tuple::new(vec![Value::Int(2), Value::Int(1)])));
        assert_eq!(heap.hash_object(t1), heap.hash_object(t2));
        assert_ne!(heap.hash_object(t1), heap.hash_object(t3));
        let with_list = {
            let l = heap.allocate(HeapData::List(List::default()));
            heap.allocate(HeapData::Tuple(Tuple::new(vec![Value::Ref(l)])))
        };
        assert_eq!(heap.hash_object(with_list), None);
    }
}
