/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use arc_swap::ArcSwap;

/// Server contexts for one listener, one slot for each worker.
///
/// Every slot starts out sharing the same context. A slot can be replaced
/// without touching the others, and connections already accepted keep the
/// context they were created with.
pub struct ListenerContextTable<C> {
    slots: Vec<ArcSwap<C>>,
}

impl<C> ListenerContextTable<C> {
    pub fn new(context: Arc<C>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let mut slots = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            slots.push(ArcSwap::new(Arc::clone(&context)));
        }
        ListenerContextTable { slots }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, worker_id: usize) -> Option<Arc<C>> {
        self.slots.get(worker_id).map(|slot| slot.load_full())
    }

    /// Replace the context used by one worker, returning the old one.
    pub fn swap(&self, worker_id: usize, context: Arc<C>) -> Option<Arc<C>> {
        self.slots.get(worker_id).map(|slot| slot.swap(context))
    }

    pub fn set_all(&self, context: Arc<C>) {
        for slot in &self.slots {
            slot.store(Arc::clone(&context));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_on_create() {
        let ctx = Arc::new(1);
        let table = ListenerContextTable::new(Arc::clone(&ctx), 4);
        assert_eq!(table.len(), 4);
        for i in 0..4 {
            assert!(Arc::ptr_eq(&table.get(i).unwrap(), &ctx));
        }
        assert!(table.get(4).is_none());
        // one held here and one for each slot
        assert_eq!(Arc::strong_count(&ctx), 5);
    }

    #[test]
    fn swap_one_slot() {
        let table = ListenerContextTable::new(Arc::new(1), 3);
        let in_use = table.get(1).unwrap();

        let old = table.swap(1, Arc::new(2)).unwrap();
        assert!(Arc::ptr_eq(&old, &in_use));
        assert_eq!(*table.get(0).unwrap(), 1);
        assert_eq!(*table.get(1).unwrap(), 2);
        assert_eq!(*table.get(2).unwrap(), 1);
        drop(old);
        // still alive for the connection holding it
        assert_eq!(*in_use, 1);

        assert!(table.swap(3, Arc::new(3)).is_none());
    }

    #[test]
    fn set_all() {
        let table = ListenerContextTable::new(Arc::new("a"), 2);
        table.set_all(Arc::new("b"));
        assert_eq!(*table.get(0).unwrap(), "b");
        assert_eq!(*table.get(1).unwrap(), "b");
    }

    #[test]
    fn at_least_one_slot() {
        let table = ListenerContextTable::new(Arc::new(()), 0);
        assert_eq!(table.len(), 1);
        assert!(!table.is_empty());
    }
}
