//! Heap arena and the mark-sweep garbage collector.
//!
//! Every heap object lives in a slot of the arena and is addressed by a
//! [`HeapId`]; the slot carries the mark bit and a size estimate recorded at
//! allocation time. Freed slots go onto a free list for reuse.
//!
//! Collection is precise, stop-the-world, tri-color mark-sweep driven by
//! allocation pressure: allocations grow `bytes_allocated`, and callers check
//! [`Heap::should_collect`] at their allocation safe points, supplying their
//! roots to [`Heap::collect`] through a closure. The string intern pool is a
//! weak set: it is pruned of unmarked strings after marking, before the
//! sweep, so a dead string never leaves a dangling pool entry behind.

use crate::{
    bytecode::chunk::Chunk,
    bytecode::vm::natives::NativeFn,
    intern::Interner,
    table::Table,
    value::Value,
};

/// First collection triggers once a megabyte of estimated data is live.
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;
/// After a collection the threshold doubles from the surviving size.
const GC_HEAP_GROWTH_FACTOR: usize = 2;

/// Unique identifier for values stored inside the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HeapId(usize);

impl HeapId {
    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }

    /// Builds an id from a raw index. Unit tests use this to fabricate keys;
    /// the arena itself only hands out ids it has allocated.
    #[cfg(test)]
    pub fn from_raw(index: usize) -> Self {
        Self(index)
    }
}

/// An interned string plus its precomputed FNV-1a hash.
#[derive(Debug)]
pub(crate) struct Str {
    pub text: Box<str>,
    pub hash: u32,
}

/// A compiled function: parameter count, captured-variable count, optional
/// name (the top-level script has none), and its bytecode chunk.
#[derive(Debug)]
pub(crate) struct Function {
    pub arity: u8,
    pub upvalue_count: usize,
    pub name: Option<HeapId>,
    pub chunk: Chunk,
}

/// A built-in callable implemented in Rust.
#[derive(Debug)]
pub(crate) struct Native {
    pub name: HeapId,
    pub func: NativeFn,
}

/// A function bound to the upvalues it captured.
#[derive(Debug)]
pub(crate) struct Closure {
    pub function: HeapId,
    pub upvalues: Vec<HeapId>,
}

/// Indirection cell sharing one local variable across its capturing closures.
///
/// `Open` aliases an operand-stack slot; closing moves the value inline. The
/// transition happens exactly once, when the variable's scope exits.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Upvalue {
    Open(usize),
    Closed(Value),
}

/// A class: its name and method table (interned name -> closure).
#[derive(Debug)]
pub(crate) struct Class {
    pub name: HeapId,
    pub methods: Table,
}

/// A class instance with its mutable field table.
#[derive(Debug)]
pub(crate) struct Instance {
    pub class: HeapId,
    pub fields: Table,
}

/// A method closure paired with the receiver it was read from.
#[derive(Debug)]
pub(crate) struct BoundMethod {
    pub receiver: Value,
    pub method: HeapId,
}

/// Payload of one heap slot.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(Str),
    Function(Function),
    Native(Native),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    Array(Vec<Value>),
    Map(Table),
}

impl HeapData {
    /// Static variant name, for GC logging and stats.
    fn variant_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "Str",
            Self::Function(_) => "Function",
            Self::Native(_) => "Native",
            Self::Closure(_) => "Closure",
            Self::Upvalue(_) => "Upvalue",
            Self::Class(_) => "Class",
            Self::Instance(_) => "Instance",
            Self::BoundMethod(_) => "BoundMethod",
            Self::Array(_) => "Array",
            Self::Map(_) => "Map",
        }
    }

    /// Estimated footprint of this object, recorded at allocation time.
    ///
    /// Tables and vectors may grow afterwards; the estimate is intentionally
    /// a snapshot — the slot remembers what it charged so the sweep can
    /// refund exactly that amount.
    fn estimate_size(&self) -> usize {
        let payload = match self {
            Self::Str(s) => s.text.len(),
            Self::Function(f) => f.chunk.footprint(),
            Self::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<HeapId>(),
            Self::Class(c) => c.methods.footprint(),
            Self::Instance(i) => i.fields.footprint(),
            Self::Array(items) => items.capacity() * std::mem::size_of::<Value>(),
            Self::Map(t) => t.footprint(),
            Self::Native(_) | Self::Upvalue(_) | Self::BoundMethod(_) => 0,
        };
        std::mem::size_of::<Self>() + payload
    }
}

#[derive(Debug)]
struct Slot {
    marked: bool,
    size: usize,
    data: HeapData,
}

/// Snapshot of heap state at a point in time.
///
/// Used by tests to assert GC behavior and by embedders to monitor growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of live objects on the heap.
    pub live_objects: usize,
    /// Number of free (recycled) slots available for reuse.
    pub free_slots: usize,
    /// Total arena capacity (live + free).
    pub total_slots: usize,
    /// Estimated bytes owned by live objects.
    pub bytes_allocated: usize,
    /// Allocation level that will trigger the next collection.
    pub next_gc: usize,
    /// Number of strings currently in the intern pool.
    pub interned_strings: usize,
}

/// The heap arena plus GC bookkeeping.
#[derive(Debug)]
pub(crate) struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Gray worklist, reused across cycles.
    gray: Vec<HeapId>,
    /// Collect on every allocation; for shaking out missing roots.
    stress: bool,
    /// Log allocation, mark, and sweep events to stderr.
    log: bool,
}

impl Heap {
    pub fn new(stress: bool, log: bool) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            gray: Vec::new(),
            stress,
            log,
        }
    }

    /// Allocates `data` into a fresh or recycled slot.
    ///
    /// Never collects; callers run [`Heap::collect`] at their safe points
    /// first, while the object's inputs are still rooted.
    pub fn alloc(&mut self, data: HeapData) -> HeapId {
        let size = data.estimate_size();
        self.bytes_allocated += size;
        if self.log {
            eprintln!("allocate {size} for {}", data.variant_name());
        }
        let slot = Slot {
            marked: false,
            size,
            data,
        };
        if let Some(index) = self.free.pop() {
            debug_assert!(self.slots[index].is_none());
            self.slots[index] = Some(slot);
            HeapId(index)
        } else {
            self.slots.push(Some(slot));
            HeapId(self.slots.len() - 1)
        }
    }

    /// Whether the next allocation safe point should run a collection.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Runs a full mark-sweep cycle.
    ///
    /// `mark_roots` receives a [`Marker`] and must mark every root: the
    /// operand stack, call-frame closures, open upvalues, globals, the cached
    /// `init` string, and any compiler-in-progress constants. The intern pool
    /// is pruned of unmarked strings after marking, before the sweep.
    pub fn collect(&mut self, strings: &mut Interner, mark_roots: impl FnOnce(&mut Marker<'_>)) {
        if self.log {
            eprintln!("-- gc begin");
        }
        let before = self.bytes_allocated;

        debug_assert!(self.gray.is_empty());
        let mut marker = Marker { heap: &mut *self };
        mark_roots(&mut marker);
        self.trace_references();
        strings.prune_unmarked(self);
        self.sweep();

        self.next_gc = self.bytes_allocated * GC_HEAP_GROWTH_FACTOR;
        if self.log {
            eprintln!(
                "-- gc end: collected {} bytes (from {before} to {}) next at {}",
                before - self.bytes_allocated,
                self.bytes_allocated,
                self.next_gc
            );
        }
    }

    /// Estimated bytes owned by live objects.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live_objects: self.slots.len() - self.free.len(),
            free_slots: self.free.len(),
            total_slots: self.slots.len(),
            bytes_allocated: self.bytes_allocated,
            next_gc: self.next_gc,
            interned_strings: 0,
        }
    }

    /// Marks `id` and queues it for tracing if it was white.
    pub fn mark(&mut self, id: HeapId) {
        let slot = self.slots[id.index()].as_mut().expect("marked a freed heap id");
        if slot.marked {
            return;
        }
        slot.marked = true;
        if self.log {
            eprintln!("mark {} ({})", id.index(), slot.data.variant_name());
        }
        self.gray.push(id);
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Ref(id) = value {
            self.mark(id);
        }
    }

    /// Whether `id` survived the current mark phase. Used by the intern
    /// pool's weak-set pruning between mark and sweep.
    pub fn is_marked(&self, id: HeapId) -> bool {
        self.slots[id.index()].as_ref().is_some_and(|slot| slot.marked)
    }

    /// Drains the gray worklist, blackening each object by marking its
    /// outgoing references. Strings and natives' functions have none.
    fn trace_references(&mut self) {
        let mut children: Vec<HeapId> = Vec::new();
        while let Some(id) = self.gray.pop() {
            children.clear();
            self.collect_children(id, &mut children);
            for &child in &children {
                self.mark(child);
            }
        }
    }

    fn collect_children(&self, id: HeapId, out: &mut Vec<HeapId>) {
        let mut push_value = |out: &mut Vec<HeapId>, value: Value| {
            if let Value::Ref(child) = value {
                out.push(child);
            }
        };
        match self.get(id) {
            HeapData::Str(_) => {}
            HeapData::Function(function) => {
                if let Some(name) = function.name {
                    out.push(name);
                }
                for &constant in function.chunk.constants() {
                    push_value(out, constant);
                }
            }
            HeapData::Native(native) => out.push(native.name),
            HeapData::Closure(closure) => {
                out.push(closure.function);
                out.extend_from_slice(&closure.upvalues);
            }
            HeapData::Upvalue(upvalue) => {
                if let Upvalue::Closed(value) = upvalue {
                    push_value(out, *value);
                }
            }
            HeapData::Class(class) => {
                out.push(class.name);
                for (key, value) in class.methods.iter() {
                    out.push(key);
                    push_value(out, value);
                }
            }
            HeapData::Instance(instance) => {
                out.push(instance.class);
                for (key, value) in instance.fields.iter() {
                    out.push(key);
                    push_value(out, value);
                }
            }
            HeapData::BoundMethod(bound) => {
                push_value(out, bound.receiver);
                out.push(bound.method);
            }
            HeapData::Array(items) => {
                for &item in items {
                    push_value(out, item);
                }
            }
            HeapData::Map(table) => {
                for (key, value) in table.iter() {
                    out.push(key);
                    push_value(out, value);
                }
            }
        }
    }

    /// Frees every unmarked slot and clears marks for the next cycle.
    fn sweep(&mut self) {
        for index in 0..self.slots.len() {
            let Some(slot) = &mut self.slots[index] else {
                continue;
            };
            if slot.marked {
                slot.marked = false;
                continue;
            }
            let freed = self.slots[index].take().expect("slot checked above");
            if self.log {
                eprintln!("free {index} ({})", freed.data.variant_name());
            }
            self.bytes_allocated -= freed.size;
            self.free.push(index);
        }
    }

    pub fn get(&self, id: HeapId) -> &HeapData {
        self.slots[id.index()]
            .as_ref()
            .map(|slot| &slot.data)
            .expect("dangling heap id")
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        self.slots[id.index()]
            .as_mut()
            .map(|slot| &mut slot.data)
            .expect("dangling heap id")
    }

    // Typed accessors. The VM checks value shapes before using these, so a
    // mismatch is an interpreter bug, not a user error.

    pub fn str_text(&self, id: HeapId) -> &str {
        match self.get(id) {
            HeapData::Str(s) => &s.text,
            other => unreachable!("expected Str, found {}", other.variant_name()),
        }
    }

    pub fn str_hash(&self, id: HeapId) -> u32 {
        match self.get(id) {
            HeapData::Str(s) => s.hash,
            other => unreachable!("expected Str, found {}", other.variant_name()),
        }
    }

    pub fn function(&self, id: HeapId) -> &Function {
        match self.get(id) {
            HeapData::Function(f) => f,
            other => unreachable!("expected Function, found {}", other.variant_name()),
        }
    }

    pub fn closure(&self, id: HeapId) -> &Closure {
        match self.get(id) {
            HeapData::Closure(c) => c,
            other => unreachable!("expected Closure, found {}", other.variant_name()),
        }
    }

    pub fn closure_mut(&mut self, id: HeapId) -> &mut Closure {
        match self.get_mut(id) {
            HeapData::Closure(c) => c,
            _ => unreachable!("expected Closure"),
        }
    }

    pub fn class(&self, id: HeapId) -> &Class {
        match self.get(id) {
            HeapData::Class(c) => c,
            other => unreachable!("expected Class, found {}", other.variant_name()),
        }
    }

    pub fn class_mut(&mut self, id: HeapId) -> &mut Class {
        match self.get_mut(id) {
            HeapData::Class(c) => c,
            _ => unreachable!("expected Class"),
        }
    }

    pub fn instance(&self, id: HeapId) -> &Instance {
        match self.get(id) {
            HeapData::Instance(i) => i,
            other => unreachable!("expected Instance, found {}", other.variant_name()),
        }
    }

    pub fn instance_mut(&mut self, id: HeapId) -> &mut Instance {
        match self.get_mut(id) {
            HeapData::Instance(i) => i,
            _ => unreachable!("expected Instance"),
        }
    }

    pub fn upvalue(&self, id: HeapId) -> &Upvalue {
        match self.get(id) {
            HeapData::Upvalue(u) => u,
            other => unreachable!("expected Upvalue, found {}", other.variant_name()),
        }
    }

    pub fn upvalue_mut(&mut self, id: HeapId) -> &mut Upvalue {
        match self.get_mut(id) {
            HeapData::Upvalue(u) => u,
            _ => unreachable!("expected Upvalue"),
        }
    }

    pub fn array(&self, id: HeapId) -> &Vec<Value> {
        match self.get(id) {
            HeapData::Array(items) => items,
            other => unreachable!("expected Array, found {}", other.variant_name()),
        }
    }

    pub fn array_mut(&mut self, id: HeapId) -> &mut Vec<Value> {
        match self.get_mut(id) {
            HeapData::Array(items) => items,
            _ => unreachable!("expected Array"),
        }
    }

    pub fn map(&self, id: HeapId) -> &Table {
        match self.get(id) {
            HeapData::Map(table) => table,
            other => unreachable!("expected Map, found {}", other.variant_name()),
        }
    }

    pub fn map_mut(&mut self, id: HeapId) -> &mut Table {
        match self.get_mut(id) {
            HeapData::Map(table) => table,
            _ => unreachable!("expected Map"),
        }
    }
}

/// Root-marking handle passed to the closure given to [`Heap::collect`].
pub(crate) struct Marker<'h> {
    heap: &'h mut Heap,
}

impl Marker<'_> {
    pub fn mark(&mut self, id: HeapId) {
        self.heap.mark(id);
    }

    pub fn mark_value(&mut self, value: Value) {
        self.heap.mark_value(value);
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.heap.mark(key);
            self.heap.mark_value(value);
        }
    }
}
