//! Host objects callable from scripts.
//!
//! An object exposes its scriptable methods through [`CallbackObject`]; the
//! engine turns the method list into a handle table and routes every call
//! back through [`CallbackObject::invoke`]. Each object carries a shared
//! control block that in-flight calls hold on to, which is what makes
//! unregistration safe while a callback is still running on another thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::engine::CallContext;
use crate::error::BridgeError;
use crate::sync::lock;
use crate::value::Value;

/// One scriptable method: its name and the values captured as upvalues.
/// Names starting with `__` become metamethods of the handle table.
#[derive(Debug, Clone)]
pub struct MethodDef {
    pub name: String,
    pub upvalues: Vec<Value>,
}

impl MethodDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            upvalues: Vec::new(),
        }
    }

    pub fn with_upvalues(name: impl Into<String>, upvalues: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            upvalues,
        }
    }
}

/// A host object whose methods can be registered with a script engine.
pub trait CallbackObject: Send + Sync {
    /// Short type name, stored under the `type` key of the handle table.
    fn object_type(&self) -> String;

    /// The methods this object exposes.
    fn lua_methods(&self) -> Vec<MethodDef>;

    /// Invoke a method previously returned by [`lua_methods`](Self::lua_methods).
    fn invoke(&self, method: &str, ctx: &mut CallContext<'_>) -> Result<Vec<Value>, BridgeError>;

    /// The object's control handle. Implementors embed a [`ControlHandle`]
    /// field and return a reference to it here.
    fn control(&self) -> &ControlHandle;
}

#[derive(Debug, Default)]
pub(crate) struct ControlBlock {
    /// Identity token of the engine managing this object's lifecycle, if any.
    pub(crate) owner: Mutex<Option<u64>>,
    unsafe_destruction: AtomicBool,
    unsafe_thread: Mutex<Option<ThreadId>>,
    /// Threads currently running a callback on this object, in call order.
    /// Pushed and popped under the registry lock of the dispatching engine.
    pub(crate) thread_stack: Mutex<Vec<ThreadId>>,
    pub(crate) callback_mutex: Mutex<Option<Arc<Mutex<()>>>>,
}

impl ControlBlock {
    pub(crate) fn unsafe_destruction_allowed(&self) -> bool {
        self.unsafe_destruction.load(Ordering::SeqCst)
            && *lock(&self.unsafe_thread) == Some(thread::current().id())
    }
}

/// Shared control state of a callback object.
///
/// The block lives as long as the longest holder: the object itself or any
/// in-flight callback invocation referencing it.
pub struct ControlHandle {
    pub(crate) block: Arc<ControlBlock>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self {
            block: Arc::new(ControlBlock::default()),
        }
    }

    /// Install a mutex the engine acquires around every callback on this
    /// object, except when the same call chain already holds it.
    pub fn set_callback_mutex(&self, mutex: Option<Arc<Mutex<()>>>) {
        *lock(&self.block.callback_mutex) = mutex;
    }

    pub fn callback_mutex(&self) -> Option<Arc<Mutex<()>>> {
        lock(&self.block.callback_mutex).clone()
    }

    /// Allow unregistration from the current thread even while callbacks are
    /// running elsewhere. Needed when the object is destroyed from the
    /// interpreter's own worker thread, which cannot wait on itself.
    pub fn enable_unsafe_destruction(&self, enable: bool) {
        if enable {
            *lock(&self.block.unsafe_thread) = Some(thread::current().id());
            self.block.unsafe_destruction.store(true, Ordering::SeqCst);
        } else {
            self.block.unsafe_destruction.store(false, Ordering::SeqCst);
        }
    }

    /// True while this engine-managed object still belongs to an engine.
    pub fn managed(&self) -> bool {
        lock(&self.block.owner).is_some()
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.block) as usize
    }

    pub(crate) fn block(&self) -> Arc<ControlBlock> {
        self.block.clone()
    }
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

// A copied object starts with a fresh control block: from the bridge's point
// of view it is unregistered until it registers itself again.
impl Clone for ControlHandle {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlHandle")
            .field("key", &self.key())
            .finish()
    }
}
