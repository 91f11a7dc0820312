//! Fixed-size message slab, handed out as refcounted handles.
//!
//! `MessagePool::create` pops a body from the free queue, wraps it with a
//! refcount, and stamps origin/id. The refcount's `Drop` clears the
//! body's property bag and pushes it back to the free queue; if the pool
//! is exhausted, `create` instead reports failure to the caller (this
//! kernel has no heap, so the source's heap-allocated fallback branch is
//! not available — see DESIGN.md).

use core::cell::Cell;

use abi::config::{MESSAGE_BANK_SIZE, PROPERTY_BAG_SIZE, PROPERTY_NAME_SIZE};
use abi::{EndpointHandle, PropertyValue};
use heapless::{String, Vec};

use crate::queue::{IntrusiveQueue, Links, QueueNode, NIL};

/// A string -> typed-value map attached to each message. Closed tagged
/// union in place of the source's runtime-type-id `PropertyDescriptor<T>`.
#[derive(Clone, Debug, Default)]
pub struct PropertySet {
    entries: Vec<(String<PROPERTY_NAME_SIZE>, PropertyValue), PROPERTY_BAG_SIZE>,
}

impl PropertySet {
    pub const fn new() -> Self {
        PropertySet { entries: Vec::new() }
    }

    /// Sets (or replaces) a property. Silently drops the write if the
    /// bag is at capacity — message property bags are meant to be small
    /// and fixed-shape, not a general map.
    pub fn set(&mut self, name: &str, value: PropertyValue) {
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| n.as_str() == name) {
            slot.1 = value;
            return;
        }
        if let Ok(key) = String::try_from(name) {
            let _ = self.entries.push((key, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.entries.iter().find(|(n, _)| n.as_str() == name).map(|(_, v)| v)
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.as_str() == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A pooled message body. Lives inside the pool's fixed array; queue
/// links double as free-list links when the body is not in use.
#[derive(Debug)]
pub struct MessageBody {
    links: Links,
    refs: Cell<u16>,
    pub origin: EndpointHandle,
    pub id: u32,
    pub properties: PropertySet,
}

impl MessageBody {
    const fn empty() -> Self {
        MessageBody {
            links: Links::new(),
            refs: Cell::new(0),
            origin: EndpointHandle::EMPTY,
            id: 0,
            properties: PropertySet::new(),
        }
    }
}

impl Default for MessageBody {
    fn default() -> Self {
        MessageBody::empty()
    }
}

impl QueueNode for MessageBody {
    fn links(&self) -> Links {
        self.links
    }
    fn set_links(&mut self, links: Links) {
        self.links = links;
    }
}

/// A refcounted handle to a pooled message. On last drop, the body is
/// cleared and returned to the pool's free queue.
pub struct MessageRef {
    index: u16,
}

impl Clone for MessageRef {
    fn clone(&self) -> Self {
        MessagePool::with(|pool| {
            let refs = &pool.bodies[self.index as usize].refs;
            refs.set(refs.get() + 1);
        });
        MessageRef { index: self.index }
    }
}

impl Drop for MessageRef {
    fn drop(&mut self) {
        MessagePool::with(|pool| pool.release(self.index));
    }
}

impl MessageRef {
    pub fn id(&self) -> u32 {
        MessagePool::with(|pool| pool.bodies[self.index as usize].id)
    }

    pub fn origin(&self) -> EndpointHandle {
        MessagePool::with(|pool| pool.bodies[self.index as usize].origin)
    }

    pub fn get_property(&self, name: &str) -> Option<PropertyValue> {
        MessagePool::with(|pool| pool.bodies[self.index as usize].properties.get(name).cloned())
    }

    pub fn set_property(&self, name: &str, value: PropertyValue) {
        MessagePool::with(|pool| pool.bodies[self.index as usize].properties.set(name, value));
    }

    pub(crate) fn index(&self) -> u16 {
        self.index
    }
}

/// Fixed-capacity slab of reusable message bodies.
pub struct MessagePool {
    bodies: [MessageBody; MESSAGE_BANK_SIZE],
    free: IntrusiveQueue,
    next_id: u32,
}

impl MessagePool {
    pub const fn new() -> Self {
        MessagePool {
            bodies: [const { MessageBody::empty() }; MESSAGE_BANK_SIZE],
            free: IntrusiveQueue::new(),
            next_id: 0,
        }
    }

    /// Populate the free queue with every body in the bank. Called once
    /// at kernel start.
    pub fn init(&mut self) {
        for i in 0..MESSAGE_BANK_SIZE as u16 {
            self.free.push(&mut self.bodies, i);
        }
    }

    /// Allocate a message body from the bank, stamping `origin` and the
    /// next monotonic id. Returns `None` if the bank is exhausted (this
    /// build carries no heap fallback; see DESIGN.md).
    pub fn create(&mut self, origin: EndpointHandle) -> Option<MessageRef> {
        let index = self.free.pop(&mut self.bodies)?;
        self.next_id += 1;
        let body = &mut self.bodies[index as usize];
        body.origin = origin;
        body.id = self.next_id;
        body.properties.clear();
        body.refs.set(1);
        Some(MessageRef { index })
    }

    fn release(&mut self, index: u16) {
        let refs = &self.bodies[index as usize].refs;
        let remaining = refs.get().saturating_sub(1);
        refs.set(remaining);
        if remaining == 0 {
            self.bodies[index as usize].properties.clear();
            self.bodies[index as usize].origin = EndpointHandle::EMPTY;
            self.free.push(&mut self.bodies, index);
        }
    }

    /// Runs `f` against the process-wide message pool singleton.
    pub(crate) fn with<R>(f: impl FnOnce(&mut MessagePool) -> R) -> R {
        critical_section::with(|_| {
            // SAFETY: access to the singleton is serialized by the
            // critical section, matching every other global kernel
            // structure's locking discipline.
            let pool = unsafe { &mut *POOL.get() };
            f(pool)
        })
    }
}

use core::cell::UnsafeCell;

struct PoolCell(UnsafeCell<MessagePool>);
// SAFETY: all access goes through `MessagePool::with`, which holds the
// global critical section for the duration of the borrow.
unsafe impl Sync for PoolCell {}

impl PoolCell {
    fn get(&self) -> *mut MessagePool {
        self.0.get()
    }
}

static POOL: PoolCell = PoolCell(UnsafeCell::new(MessagePool::new()));

#[cfg(test)]
mod tests {
    use super::*;

    /// Resets the global `MessagePool` singleton to a known-empty,
    /// freshly-initialized state. Tests here share the pool across the
    /// whole crate, so every test takes [`crate::test_lock`] first and
    /// starts from this reset rather than assuming whatever a previous
    /// test left behind.
    fn reset() -> std::sync::MutexGuard<'static, ()> {
        let guard = crate::test_lock();
        MessagePool::with(|pool| {
            pool.free = IntrusiveQueue::new();
            pool.next_id = 0;
            pool.init();
        });
        guard
    }

    #[test]
    fn create_assigns_monotonic_ids() {
        let _g = reset();
        let origin = EndpointHandle { index: 0, generation: 1 };
        let a = MessagePool::with(|pool| pool.create(origin)).unwrap();
        let b = MessagePool::with(|pool| pool.create(origin)).unwrap();
        assert!(b.id() > a.id());
    }

    #[test]
    fn pool_exhaustion_returns_none() {
        let _g = reset();
        let origin = EndpointHandle { index: 0, generation: 1 };
        let mut held = alloc_all(origin);
        assert!(MessagePool::with(|pool| pool.create(origin)).is_none());
        held.clear();
        // After dropping every held ref, the pool is refilled.
        assert!(MessagePool::with(|pool| pool.create(origin)).is_some());
    }

    fn alloc_all(origin: EndpointHandle) -> std::vec::Vec<MessageRef> {
        let mut v = std::vec::Vec::new();
        while let Some(m) = MessagePool::with(|pool| pool.create(origin)) {
            v.push(m);
        }
        v
    }

    #[test]
    fn property_bag_roundtrips_and_clears_on_release() {
        let _g = reset();
        let origin = EndpointHandle { index: 0, generation: 1 };
        let msg = MessagePool::with(|pool| pool.create(origin)).unwrap();
        msg.set_property("time", PropertyValue::U32(42));
        assert_eq!(msg.get_property("time"), Some(PropertyValue::U32(42)));
        let index = msg.index();
        drop(msg);
        MessagePool::with(|pool| {
            assert!(pool.bodies[index as usize].properties.is_empty());
        });
    }
}
