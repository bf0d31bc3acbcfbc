//! Tri-color mark-and-sweep garbage collection.
//!
//! Two collector instances exist per running program: each [`Context`](crate::host::Context)
//! owns exactly one mutable [`Collector`] that is actually swept, and the
//! [`Engine`](crate::host::Engine) owns one append-only [`Collector`] (`immutable = true`)
//! used for permanent literals (interned strings, compiled ACLs) shared by
//! every `Context` built from the same `CompiledCode`. Objects allocated in
//! the immutable collector are pre-colored black and the sweep phase never
//! visits them.
//!
//! A [`HeapId`] records both a slot index and which collector it was
//! allocated from, so a `Value` can point into either collector
//! transparently.

use std::cell::Cell;

use crate::object::Object;

/// Tri-color mark state. `White` = unvisited this cycle (candidate for
/// collection), `Gray` = reachable but children not yet traced, `Black` =
/// reachable and fully traced (or permanently exempt, for immutable slots).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    White,
    Gray,
    Black,
}

/// Which collector a [`HeapId`] was allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// The per-`Context` mutable collector; swept every cycle.
    Context,
    /// The `Engine`'s append-only collector; never swept.
    Engine,
}

/// An index into the slot table of one of the two collectors, tagged with
/// which one. `Copy`, small, and safe to embed in `Value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId {
    pub origin: Origin,
    pub index: u32,
}

struct Slot {
    object: Option<Object>,
    color: Cell<Color>,
}

/// Optional host plug-in for bounding or instrumenting allocations
/// (§4.8/§4.10). Returning `Err` aborts the allocation; the caller is
/// expected to turn that into a `fail` status at the embedding boundary.
pub trait AllocatorHook {
    fn on_alloc(&mut self, approx_bytes: usize) -> Result<(), String>;
    fn on_free(&mut self, approx_bytes: usize);
}

/// A no-op hook used when the host does not want allocation accounting.
#[derive(Default)]
pub struct NoAllocatorHook;

impl AllocatorHook for NoAllocatorHook {
    fn on_alloc(&mut self, _approx_bytes: usize) -> Result<(), String> {
        Ok(())
    }
    fn on_free(&mut self, _approx_bytes: usize) {}
}

/// GC trigger tuning, read from [`crate::config::ContextOptions`].
#[derive(Debug, Clone, Copy)]
pub struct GcParams {
    /// Target fraction of the heap expected to survive a cycle; drives the
    /// next trigger threshold up or down based on the last cycle's yield.
    pub target_survivor_ratio: f64,
    /// Minimum number of allocations between cycles, regardless of the
    /// computed trigger.
    pub min_allocation_gap: usize,
}

impl Default for GcParams {
    fn default() -> Self {
        Self { target_survivor_ratio: 0.5, min_allocation_gap: 256 }
    }
}

/// A single mark-and-sweep collector. `immutable = true` configures it as
/// the Engine's append-only collector: [`Collector::alloc`] pre-colors new
/// slots black and [`Collector::collect`] refuses to run.
pub struct Collector {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    roots: Vec<(HeapId, u32)>,
    origin: Origin,
    immutable: bool,
    params: GcParams,
    allocations_since_gc: usize,
    next_trigger: usize,
    last_cycle_reclaimed: usize,
    total_collections: u64,
    hook: Option<Box<dyn AllocatorHook>>,
}

impl Collector {
    pub fn new_context(params: GcParams) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            roots: Vec::new(),
            origin: Origin::Context,
            immutable: false,
            params,
            allocations_since_gc: 0,
            next_trigger: params.min_allocation_gap,
            last_cycle_reclaimed: 0,
            total_collections: 0,
            hook: None,
        }
    }

    pub fn new_engine() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            roots: Vec::new(),
            origin: Origin::Engine,
            immutable: true,
            params: GcParams::default(),
            allocations_since_gc: 0,
            next_trigger: usize::MAX,
            last_cycle_reclaimed: 0,
            total_collections: 0,
            hook: None,
        }
    }

    pub fn set_allocator_hook(&mut self, hook: Box<dyn AllocatorHook>) {
        self.hook = Some(hook);
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocates `object` and returns its id. In the immutable collector the
    /// new slot is pre-colored black so it is exempt from every future
    /// sweep.
    pub fn alloc(&mut self, object: Object) -> Result<HeapId, String> {
        if let Some(hook) = self.hook.as_mut() {
            hook.on_alloc(object.approx_size())?;
        }
        let color = if self.immutable { Color::Black } else { Color::White };
        let index = if let Some(free) = self.free_list.pop() {
            self.slots[free as usize] = Slot { object: Some(object), color: Cell::new(color) };
            free
        } else {
            self.slots.push(Slot { object: Some(object), color: Cell::new(color) });
            (self.slots.len() - 1) as u32
        };
        if !self.immutable {
            self.allocations_since_gc += 1;
        }
        Ok(HeapId { origin: self.origin, index })
    }

    fn slot(&self, id: HeapId) -> &Slot {
        debug_assert_eq!(id.origin, self.origin, "HeapId used against the wrong collector");
        &self.slots[id.index as usize]
    }

    pub fn get(&self, id: HeapId) -> &Object {
        self.slot(id).object.as_ref().expect("dereferenced a collected HeapId")
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut Object {
        debug_assert_eq!(id.origin, self.origin, "HeapId used against the wrong collector");
        self.slots[id.index as usize].object.as_mut().expect("dereferenced a collected HeapId")
    }

    pub fn is_live(&self, id: HeapId) -> bool {
        id.origin == self.origin
            && (id.index as usize) < self.slots.len()
            && self.slots[id.index as usize].object.is_some()
    }

    /// Registers `id` as a root, bumping its reference count. Used by
    /// [`Handle`] and by the runtime for the value stack / scratch
    /// registers / frame caller slots (§4.8).
    pub fn add_root(&mut self, id: HeapId) {
        if let Some(entry) = self.roots.iter_mut().find(|(r, _)| *r == id) {
            entry.1 += 1;
        } else {
            self.roots.push((id, 1));
        }
    }

    /// Decrements `id`'s root reference count, removing it once it reaches
    /// zero.
    pub fn remove_root(&mut self, id: HeapId) {
        if let Some(pos) = self.roots.iter().position(|(r, _)| *r == id) {
            self.roots[pos].1 -= 1;
            if self.roots[pos].1 == 0 {
                self.roots.swap_remove(pos);
            }
        }
    }

    pub fn root_ids(&self) -> impl Iterator<Item = HeapId> + '_ {
        self.roots.iter().map(|(id, _)| *id)
    }

    /// Whether an allocation-triggered cycle is due. The immutable
    /// collector is never due.
    pub fn cycle_due(&self) -> bool {
        !self.immutable && self.allocations_since_gc >= self.next_trigger
    }

    fn mark_slot(&self, id: HeapId) {
        if id.origin != self.origin {
            return;
        }
        let slot = &self.slots[id.index as usize];
        if matches!(slot.color.get(), Color::White) {
            slot.color.set(Color::Gray);
        }
    }

    /// Runs one full stop-the-world mark-and-sweep cycle against this
    /// (context) collector. `extra_roots` supplies transient roots beyond
    /// those registered via [`Handle`] — the VM's value stack, frame
    /// caller slots, and scratch registers (§4.8/§4.9). `engine` is passed
    /// so marking can walk into engine-owned objects reachable from
    /// context roots without attempting to sweep them.
    pub fn collect(&mut self, extra_roots: impl Iterator<Item = HeapId>, engine: &Collector) {
        if self.immutable {
            return;
        }
        for slot in &self.slots {
            if slot.object.is_some() {
                slot.color.set(Color::White);
            }
        }

        let mut gray_stack: Vec<HeapId> = Vec::new();
        for id in self.root_ids().chain(extra_roots) {
            self.mark_slot(id);
            if id.origin == self.origin {
                gray_stack.push(id);
            }
        }

        while let Some(id) = gray_stack.pop() {
            let slot = &self.slots[id.index as usize];
            if slot.color.get() != Color::Gray {
                continue;
            }
            slot.color.set(Color::Black);
            let object = slot.object.as_ref().expect("gray slot must be occupied");
            object.trace(&mut |child| {
                if child.origin == self.origin {
                    let child_slot = &self.slots[child.index as usize];
                    if matches!(child_slot.color.get(), Color::White) {
                        child_slot.color.set(Color::Gray);
                        gray_stack.push(child);
                    }
                } else {
                    // Engine-owned children are always black; nothing to do,
                    // but touch `engine` so its liveness is documented here.
                    let _ = engine;
                }
            });
        }

        let before = self.len();
        for index in 0..self.slots.len() {
            let white = matches!(self.slots[index].color.get(), Color::White);
            if white && self.slots[index].object.is_some() {
                self.slots[index].object = None;
                self.free_list.push(index as u32);
            }
        }
        let after = self.len();
        self.last_cycle_reclaimed = before.saturating_sub(after);
        self.allocations_since_gc = 0;
        self.total_collections += 1;
        self.recompute_trigger();
    }

    fn recompute_trigger(&mut self) {
        let survivors = self.len().max(1);
        let target = (survivors as f64 / self.params.target_survivor_ratio) as usize;
        self.next_trigger = target.max(self.params.min_allocation_gap);
    }

    pub fn last_cycle_reclaimed(&self) -> usize {
        self.last_cycle_reclaimed
    }

    pub fn total_collections(&self) -> u64 {
        self.total_collections
    }
}

/// Bundles a `Context`'s mutable collector with its `Engine`'s immutable
/// one so object-protocol dispatch (`crate::object`) can resolve a
/// [`HeapId`] regardless of which collector it came from, while only ever
/// mutating the context side.
pub struct Heaps<'a> {
    pub context: &'a mut Collector,
    pub engine: &'a Collector,
}

impl Heaps<'_> {
    pub fn get(&self, id: HeapId) -> &Object {
        match id.origin {
            Origin::Context => self.context.get(id),
            Origin::Engine => self.engine.get(id),
        }
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut Object {
        assert_eq!(id.origin, Origin::Context, "engine-owned objects are immutable");
        self.context.get_mut(id)
    }

    pub fn alloc(&mut self, object: Object) -> Result<HeapId, String> {
        self.context.alloc(object)
    }
}

/// An RAII root binding. Constructing one registers `id` as a root with the
/// collector it belongs to (via the supplied registrar closure); dropping it
/// removes that root. Required whenever host code composes heap values
/// across more than one allocation point, since any allocation may trigger a
/// collection cycle in between (§4.8).
pub struct Handle<'a> {
    collector: &'a Cell<*mut Collector>,
    id: HeapId,
}

impl<'a> Handle<'a> {
    /// # Safety
    /// `collector` must outlive the `Handle` and must not be mutably
    /// aliased while the handle is alive except through the very
    /// `add_root`/`remove_root` calls this type makes.
    pub fn new(collector: &'a Cell<*mut Collector>, id: HeapId) -> Self {
        unsafe { &mut *collector.get() }.add_root(id);
        Self { collector, id }
    }

    pub fn id(&self) -> HeapId {
        self.id
    }
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        unsafe { &mut *self.collector.get() }.remove_root(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ListObj, Object};

    fn dummy_string(s: &str) -> Object {
        Object::Str(crate::object::StrObj::new(s.to_string()))
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut ctx = Collector::new_context(GcParams::default());
        let engine = Collector::new_engine();
        let _keep = ctx.alloc(dummy_string("kept")).unwrap();
        let gone = ctx.alloc(dummy_string("gone")).unwrap();
        assert_eq!(ctx.len(), 2);

        ctx.add_root(_keep);
        ctx.collect(std::iter::empty(), &engine);

        assert!(ctx.is_live(_keep));
        assert!(!ctx.is_live(gone));
        assert_eq!(ctx.last_cycle_reclaimed(), 1);
    }

    #[test]
    fn handle_keeps_object_alive_across_allocations() {
        let cell = Cell::new(std::ptr::null_mut());
        let mut ctx = Collector::new_context(GcParams::default());
        cell.set(&mut ctx as *mut Collector);
        let engine = Collector::new_engine();

        let id = ctx.alloc(dummy_string("rooted")).unwrap();
        let handle = Handle::new(&cell, id);
        for _ in 0..10 {
            let _ = ctx.alloc(dummy_string("churn")).unwrap();
        }
        ctx.collect(std::iter::empty(), &engine);
        assert!(ctx.is_live(handle.id()));
        drop(handle);
        ctx.collect(std::iter::empty(), &engine);
        assert!(!ctx.is_live(id));
    }

    #[test]
    fn cycles_are_collected_without_refcounting() {
        let mut ctx = Collector::new_context(GcParams::default());
        let engine = Collector::new_engine();
        let a = ctx.alloc(Object::List(ListObj::new(64))).unwrap();
        let b = ctx.alloc(Object::List(ListObj::new(64))).unwrap();
        if let Object::List(list) = ctx.get_mut(a) {
            list.push(crate::value::Value::List(b)).unwrap();
        }
        if let Object::List(list) = ctx.get_mut(b) {
            list.push(crate::value::Value::List(a)).unwrap();
        }
        // No roots reference either list: both are garbage despite the cycle.
        ctx.collect(std::iter::empty(), &engine);
        assert!(!ctx.is_live(a));
        assert!(!ctx.is_live(b));
    }

    #[test]
    fn engine_objects_are_never_swept() {
        let mut engine = Collector::new_engine();
        let id = engine.alloc(dummy_string("permanent")).unwrap();
        // Collecting an immutable collector is a no-op by construction.
        let snapshot = Collector::new_context(GcParams::default());
        engine.collect(std::iter::empty(), &snapshot);
        assert!(engine.is_live(id));
    }
}
