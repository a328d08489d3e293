//! Engine heap and mark-sweep collector
//!
//! The heap is bounded by the capability it is created over: its length,
//! minus the emergency buffer reserved at the base, is the byte budget for
//! live objects. Objects get stable addresses inside that region so a
//! capability to an object can be carried through registers and mapped
//! back.

use std::cell::Cell;
use std::rc::Rc;

use capvm_arch::Capability;

use crate::ast::FunctionDef;
use crate::native::NativeObject;
use crate::value::{ExcKind, ObjRef, Value};

/// Bytes reserved at the base of the heap for the emergency buffer.
pub const EMERGENCY_RESERVE: u32 = 16;

/// Per-object header charge.
const OBJECT_HEADER: u32 = 16;

/// Address stride between object slots.
const SLOT_STRIDE: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracebackEntry {
    pub file: Rc<str>,
    pub line: u32,
    pub scope: Rc<str>,
}

#[derive(Debug, Clone)]
pub struct ExceptionObject {
    pub kind: ExcKind,
    pub args: Vec<Value>,
    pub traceback: Vec<TracebackEntry>,
}

pub enum HeapObject {
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Tuple(Rc<[Value]>),
    Function { def: Rc<FunctionDef>, file: Rc<str> },
    Exception(ExceptionObject),
    Native(Rc<dyn NativeObject>),
}

impl HeapObject {
    fn payload_size(&self) -> u32 {
        let size = match self {
            HeapObject::Str(s) => s.len(),
            HeapObject::Bytes(b) => b.len(),
            HeapObject::Tuple(items) => items.len() * 8,
            HeapObject::Function { .. } => 16,
            HeapObject::Exception(e) => e.args.len() * 8,
            HeapObject::Native(n) => n.size_hint() as usize,
        };
        u32::try_from(size).unwrap_or(u32::MAX)
    }

    /// Bytes charged for this object.
    pub fn size(&self) -> u32 {
        OBJECT_HEADER.saturating_add(self.payload_size().div_ceil(8).saturating_mul(8))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            HeapObject::Str(_) => "str",
            HeapObject::Bytes(_) => "bytes",
            HeapObject::Tuple(_) => "tuple",
            HeapObject::Function { .. } => "function",
            HeapObject::Exception(e) => e.kind.name(),
            HeapObject::Native(n) => n.type_name(),
        }
    }

    pub(crate) fn children(&self, out: &mut Vec<Value>) {
        match self {
            HeapObject::Tuple(items) => out.extend(items.iter().copied()),
            HeapObject::Exception(e) => out.extend(e.args.iter().copied()),
            HeapObject::Native(n) => n.trace(out),
            HeapObject::Str(_) | HeapObject::Bytes(_) | HeapObject::Function { .. } => {}
        }
    }
}

struct Entry {
    object: HeapObject,
    size: u32,
    marked: bool,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Collection statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub collections: u64,
    pub freed_objects: usize,
    pub freed_bytes: u32,
    pub live_objects: usize,
    pub live_bytes: u32,
}

/// Point-in-time heap usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity: u32,
    pub used: u32,
    pub objects: usize,
    pub collections: u64,
}

pub(crate) struct Heap {
    region: Capability,
    capacity: u32,
    used: u32,
    slots: Vec<Slot>,
    free: Vec<u32>,
    collections: u64,
}

impl Heap {
    pub(crate) fn new(region: Capability) -> Self {
        Heap {
            region,
            capacity: region.length().saturating_sub(EMERGENCY_RESERVE),
            used: 0,
            slots: Vec::new(),
            free: Vec::new(),
            collections: 0,
        }
    }

    pub(crate) fn region(&self) -> Capability {
        self.region
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    pub(crate) fn used(&self) -> u32 {
        self.used
    }

    pub(crate) fn fits(&self, size: u32) -> bool {
        self.used.checked_add(size).is_some_and(|total| total <= self.capacity)
    }

    /// Stores `object`; `None` when it does not fit.
    pub(crate) fn alloc(&mut self, object: HeapObject) -> Option<ObjRef> {
        let size = object.size();
        if !self.fits(size) {
            return None;
        }
        self.used += size;
        let entry = Entry {
            object,
            size,
            marked: false,
        };
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        Some(ObjRef {
            index,
            generation: slot.generation,
        })
    }

    pub(crate) fn get(&self, r: ObjRef) -> Option<&HeapObject> {
        let slot = self.slots.get(r.index as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        slot.entry.as_ref().map(|e| &e.object)
    }

    pub(crate) fn get_mut(&mut self, r: ObjRef) -> Option<&mut HeapObject> {
        let slot = self.slots.get_mut(r.index as usize)?;
        if slot.generation != r.generation {
            return None;
        }
        slot.entry.as_mut().map(|e| &mut e.object)
    }

    /// Address of an object inside the heap region.
    pub(crate) fn address_of(&self, r: ObjRef) -> u32 {
        self.region
            .base()
            .wrapping_add(EMERGENCY_RESERVE)
            .wrapping_add(r.index.wrapping_mul(SLOT_STRIDE))
    }

    /// A capability to an object, derived from the heap capability.
    pub(crate) fn pointer(&self, r: ObjRef) -> Capability {
        self.region.with_address(self.address_of(r))
    }

    /// Maps an address produced by [`pointer`](Self::pointer) back to the
    /// live object currently at that slot.
    pub(crate) fn ref_at(&self, address: u32) -> Option<ObjRef> {
        let offset = address.checked_sub(self.region.base().wrapping_add(EMERGENCY_RESERVE))?;
        if offset % SLOT_STRIDE != 0 {
            return None;
        }
        let index = offset / SLOT_STRIDE;
        let slot = self.slots.get(index as usize)?;
        slot.entry.as_ref()?;
        Some(ObjRef {
            index,
            generation: slot.generation,
        })
    }

    pub(crate) fn live_objects(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub(crate) fn stats(&self) -> HeapStats {
        HeapStats {
            capacity: self.capacity,
            used: self.used,
            objects: self.live_objects(),
            collections: self.collections,
        }
    }

    /// Marks everything reachable from `roots` and frees the rest.
    pub(crate) fn collect(&mut self, roots: Vec<Value>) -> GcStats {
        let mut pending = roots;
        let mut children = Vec::new();
        while let Some(value) = pending.pop() {
            let Value::Obj(r) = value else { continue };
            let Some(slot) = self.slots.get_mut(r.index as usize) else { continue };
            if slot.generation != r.generation {
                continue;
            }
            let Some(entry) = slot.entry.as_mut() else { continue };
            if entry.marked {
                continue;
            }
            entry.marked = true;
            entry.object.children(&mut children);
            pending.append(&mut children);
        }

        let mut stats = GcStats::default();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(entry) = slot.entry.as_mut() else { continue };
            if entry.marked {
                entry.marked = false;
                stats.live_objects += 1;
                stats.live_bytes += entry.size;
                continue;
            }
            stats.freed_objects += 1;
            stats.freed_bytes += entry.size;
            slot.entry = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index as u32);
        }
        self.used -= stats.freed_bytes;
        self.collections += 1;
        stats.collections = self.collections;
        stats
    }

    /// Drops every object; used on teardown.
    pub(crate) fn clear(&mut self) {
        for slot in &mut self.slots {
            if slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
        self.used = 0;
    }
}

/// Fixed buffer through which trap handlers post an exception without
/// touching the heap.
///
/// The handler records what to raise and hands out [`capability`](Self::capability)
/// as the unwind value; the engine recognises that address when the unwind
/// lands and materialises the exception then.
#[derive(Debug)]
pub struct EmergencyBuffer {
    slot: Capability,
    pending: Cell<Option<(ExcKind, i64)>>,
}

impl EmergencyBuffer {
    pub(crate) fn new(heap: Capability) -> Self {
        EmergencyBuffer {
            slot: heap.bounded(EMERGENCY_RESERVE),
            pending: Cell::new(None),
        }
    }

    pub fn capability(&self) -> Capability {
        self.slot
    }

    /// Records an exception `kind(arg)` and returns the value to unwind
    /// with.
    pub fn post(&self, kind: ExcKind, arg: i64) -> Capability {
        self.pending.set(Some((kind, arg)));
        self.slot
    }

    pub fn is_pending(&self) -> bool {
        self.pending.get().is_some()
    }

    pub(crate) fn take(&self) -> Option<(ExcKind, i64)> {
        self.pending.take()
    }
}
