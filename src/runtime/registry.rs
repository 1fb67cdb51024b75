//! Handle registry for host objects referenced by foreign code.
//!
//! Foreign code cannot hold host objects, so every closure, accumulator or
//! error object it needs is registered here and passed across the boundary as
//! a [`Handle`]. Lifetimes are driven entirely by the engine: an object stays
//! registered until the engine detaches it.

use crate::runtime::error::contract_violation;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Integer reference to a registered host object. Ids start at 1 so that a
/// negated id is always a valid negative sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    pub fn from_raw(id: u32) -> Self {
        Handle(id)
    }

    pub fn id(self) -> u32 {
        self.0
    }

    /// The negative sentinel the engine returns to name this handle.
    pub fn as_sentinel(self) -> i64 {
        -i64::from(self.0)
    }

    /// Inverse of [`Handle::as_sentinel`]; `None` for non-negative results.
    pub fn from_sentinel(result: i64) -> Option<Self> {
        if result >= 0 {
            return None;
        }
        match u32::try_from(-result) {
            Ok(id) => Some(Handle(id)),
            Err(_) => contract_violation(format!("sentinel {result} is not a handle")),
        }
    }
}

/// Slot table with smallest-id-first reuse.
pub struct HandleRegistry<T> {
    slots: Vec<Option<T>>,
    free: BinaryHeap<Reverse<u32>>,
    live: usize,
}

impl<T> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleRegistry<T> {
    pub fn new() -> Self {
        Self {
            // slot 0 is never handed out
            slots: vec![None],
            free: BinaryHeap::new(),
            live: 0,
        }
    }

    pub fn register(&mut self, object: T) -> Handle {
        let id = match self.free.pop() {
            Some(Reverse(id)) => {
                self.slots[id as usize] = Some(object);
                id
            }
            None => {
                let id = self.slots.len();
                let id = u32::try_from(id)
                    .unwrap_or_else(|_| contract_violation("handle space exhausted"));
                self.slots.push(Some(object));
                id
            }
        };
        self.live += 1;
        Handle(id)
    }

    pub fn get(&self, handle: Handle) -> &T {
        match self.slots.get(handle.0 as usize).and_then(Option::as_ref) {
            Some(object) => object,
            None => contract_violation(format!("unknown handle {}", handle.0)),
        }
    }

    /// Runs `f` against the registered object.
    pub fn apply<R>(&self, handle: Handle, f: impl FnOnce(&T) -> R) -> R {
        f(self.get(handle))
    }

    pub fn delete(&mut self, handle: Handle) -> T {
        let object = match self.slots.get_mut(handle.0 as usize).and_then(Option::take) {
            Some(object) => object,
            None => contract_violation(format!("unknown handle {}", handle.0)),
        };
        self.free.push(Reverse(handle.0));
        self.live -= 1;
        object
    }

    pub fn contains(&self, handle: Handle) -> bool {
        matches!(self.slots.get(handle.0 as usize), Some(Some(_)))
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Drops every registered object, returning how many were still live.
    pub fn clear(&mut self) -> usize {
        let leaked = self.live;
        self.slots.truncate(1);
        self.slots[0] = None;
        self.free.clear();
        self.live = 0;
        leaked
    }
}
