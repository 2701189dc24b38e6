//! Thread-safe registry of dispatch records.
//!
//! Every handle the engine hands to the interpreter carries nothing but an
//! integer id; this registry is the only authority on what an id currently
//! means. Ids increase monotonically and are never reused while a record
//! with that id could still be referenced from interpreter-side closures.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;

use crate::engine::CallbackFn;
use crate::object::{CallbackObject, ControlBlock};
use crate::sync::lock;

#[derive(Clone)]
pub(crate) enum DispatchTarget {
    /// A registered free function.
    Function(CallbackFn),
    /// A method bound to a registered object.
    Method {
        object: Weak<dyn CallbackObject>,
        control: Arc<ControlBlock>,
        name: String,
    },
    /// Auto-generated disposal record of a managed object, wired to the
    /// interpreter's `__gc`/`__close` metamethods.
    Dispose {
        object_key: usize,
        control: Arc<ControlBlock>,
    },
}

#[derive(Clone)]
pub(crate) struct DispatchRecord {
    pub(crate) target: DispatchTarget,
}

#[derive(Default)]
pub(crate) struct RegistryInner {
    pub(crate) records: BTreeMap<i64, DispatchRecord>,
    /// Control-block key -> record ids, for bulk unregistration.
    pub(crate) objects: HashMap<usize, Vec<i64>>,
    /// Objects the engine owns and will drop itself.
    pub(crate) managed: HashMap<usize, Arc<dyn CallbackObject>>,
    /// Callback mutexes currently held somewhere in the running call chain.
    pub(crate) held_mutexes: Vec<usize>,
    last_id: i64,
}

impl RegistryInner {
    pub(crate) fn make_unique_id(&mut self) -> i64 {
        loop {
            self.last_id += 1;
            if !self.records.contains_key(&self.last_id) {
                return self.last_id;
            }
        }
    }
}

pub(crate) struct Registry {
    pub(crate) inner: Mutex<RegistryInner>,
    pub(crate) cv: Condvar,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            cv: Condvar::new(),
        }
    }

    /// Remove every record of the object identified by `key`, blocking until
    /// no other thread is mid-callback on it.
    ///
    /// Proceeds immediately when the object's thread stack is empty, when the
    /// innermost running callback belongs to the calling thread, or when
    /// unsafe destruction was enabled from the calling thread.
    pub(crate) fn unregister_object_blocking(&self, key: usize, control: &Arc<ControlBlock>) {
        let mut inner = lock(&self.inner);
        if !inner.objects.contains_key(&key) {
            return;
        }
        loop {
            if control.unsafe_destruction_allowed() {
                break;
            }
            {
                let stack = lock(&control.thread_stack);
                if stack.is_empty() || stack.last() == Some(&thread::current().id()) {
                    break;
                }
            }
            inner = self.cv.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
        // Another thread may have finished the unregistration while we waited
        if let Some(ids) = inner.objects.remove(&key) {
            for id in ids {
                inner.records.remove(&id);
            }
        }
    }

    /// Drop all records and managed objects. Objects are dropped outside the
    /// registry lock so their destructors may call back into the registry.
    pub(crate) fn clear(&self) {
        let objects: Vec<Arc<dyn CallbackObject>> = {
            let mut inner = lock(&self.inner);
            inner.records.clear();
            inner.objects.clear();
            inner.managed.drain().map(|(_, obj)| obj).collect()
        };
        for obj in objects {
            *lock(&obj.control().block.owner) = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn record_count(&self) -> usize {
        lock(&self.inner).records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_ids_are_monotonic() {
        let mut inner = RegistryInner::default();
        let a = inner.make_unique_id();
        let b = inner.make_unique_id();
        assert!(b > a);
    }

    #[test]
    fn test_unique_id_skips_live_records() {
        let mut inner = RegistryInner::default();
        let a = inner.make_unique_id();
        inner.records.insert(
            a + 1,
            DispatchRecord {
                target: DispatchTarget::Dispose {
                    object_key: 0,
                    control: Arc::new(ControlBlock::default()),
                },
            },
        );
        let b = inner.make_unique_id();
        assert_eq!(b, a + 2);
    }

    #[test]
    fn test_unregister_unknown_object_is_a_no_op() {
        let registry = Registry::new();
        let control = Arc::new(ControlBlock::default());
        registry.unregister_object_blocking(42, &control);
        assert_eq!(registry.record_count(), 0);
    }
}
