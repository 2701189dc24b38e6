//! The script engine: interpreter ownership, the value boundary, the unified
//! dispatch protocol and the execution engine.
//!
//! Thread safety: the registry surface (`register_*`, `unregister_*`,
//! `add_managed_object`, `detach_managed_object`) and the execution controls
//! (`busy`, `terminate`, `wait`) may be called from any thread, including
//! from inside a callback. The stack and global surfaces serialize on
//! internal locks; while an asynchronous run is in flight, `execute_sync`
//! reports the engine as busy unless called re-entrantly from the running
//! interpreter thread itself.

use std::collections::HashSet;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use mlua::{
    Function, HookTriggers, LightUserData, Lua, MultiValue, Table as LuaTable, Value as LuaValue,
    VmState,
};
use tracing::{debug, trace, warn};

use crate::cursor::TableCursor;
use crate::error::BridgeError;
use crate::object::{CallbackObject, ControlBlock};
use crate::registry::{DispatchRecord, DispatchTarget, Registry, RegistryInner};
use crate::sync::lock;
use crate::value::{Callable, TableData, Value, ValueKind};

/// How often the interpreter checks the cooperative termination flag while
/// running pure script code, in VM instructions.
const TERMINATION_CHECK_INSTRUCTIONS: u32 = 5000;

static NEXT_ENGINE_TOKEN: AtomicU64 = AtomicU64::new(1);

/// A registered free-function callback.
pub type CallbackFn = fn(&mut CallContext<'_>) -> Result<Vec<Value>, BridgeError>;

/// Outcome of running a chunk. Parse and runtime failures are reported here
/// as data, never as panics or thrown errors.
#[derive(Debug, Clone, Default)]
pub struct CallResult {
    pub success: bool,
    /// The parse failure looks like truncated interactive input; the caller
    /// may retry with more text appended.
    pub incomplete: bool,
    pub results: Vec<Value>,
    pub error_message: String,
}

type Finalizer = Box<dyn FnOnce() + Send>;
type Completer = Box<dyn FnOnce(CallResult) + Send>;

struct Task {
    func: Function,
    completer: Completer,
}

pub(crate) struct EngineShared {
    token: u64,
    lua: Lua,
    /// Weak-keyed interpreter-side map from pushed handle functions to their
    /// upvalue lists, so handles can be pulled back as `Callable` values.
    handle_map: LuaTable,
    pub(crate) registry: Registry,
    stack: Mutex<Vec<LuaValue>>,
    running: AtomicBool,
    termination: Arc<AtomicBool>,
    run_lock: Mutex<()>,
    run_cv: Condvar,
    /// Thread currently inside an interpreter call, for re-entrancy checks.
    runner: Mutex<Option<ThreadId>>,
    /// One frame per nested interpreter call; finalizers run LIFO when the
    /// call that queued them returns.
    finalizers: Mutex<Vec<Vec<Finalizer>>>,
    auto_clear_stack: AtomicBool,
}

impl EngineShared {
    pub(crate) fn lua(&self) -> &Lua {
        &self.lua
    }

    fn finish_run(&self) {
        let guard = lock(&self.run_lock);
        self.running.store(false, Ordering::SeqCst);
        drop(guard);
        self.run_cv.notify_all();
    }

    fn register_callback(&self, func: CallbackFn, upvalues: &[Value]) -> Value {
        let mut inner = lock(&self.registry.inner);
        let id = inner.make_unique_id();
        inner.records.insert(
            id,
            DispatchRecord {
                target: DispatchTarget::Function(func),
            },
        );
        drop(inner);
        trace!(id, "callback registered");
        make_handle(self.token, id, false, upvalues)
    }

    fn unregister_callback(&self, handle: &Value) -> Result<(), BridgeError> {
        let callable = handle.as_callable()?;
        let Some((token, id, _)) = callable.prelude() else {
            return Err(BridgeError::TypeMismatch {
                expected: "dispatch handle",
                actual: handle.type_name(),
            });
        };
        if token != self.token {
            return Err(BridgeError::EngineMismatch);
        }
        lock(&self.registry.inner).records.remove(&id);
        trace!(id, "callback unregistered");
        Ok(())
    }

    fn register_object_locked(
        &self,
        inner: &mut RegistryInner,
        obj: &Arc<dyn CallbackObject>,
    ) -> Value {
        let control = obj.control().block();
        let key = obj.control().key();
        let weak = Arc::downgrade(obj);
        let mut handle_table = Value::Nil;
        let data = handle_table.new_table();
        for method in obj.lua_methods() {
            if method.name.is_empty() {
                continue;
            }
            // Garbage-collection and close metamethods may legitimately fire
            // after the object was unregistered by hand, so they fail quietly.
            let grace = method.name == "__gc" || method.name == "__close";
            let is_meta = method.name.starts_with("__");
            let id = inner.make_unique_id();
            inner.records.insert(
                id,
                DispatchRecord {
                    target: DispatchTarget::Method {
                        object: weak.clone(),
                        control: control.clone(),
                        name: method.name.clone(),
                    },
                },
            );
            inner.objects.entry(key).or_default().push(id);
            let handle = make_handle(self.token, id, grace, &method.upvalues);
            let slot = if is_meta { &mut data.meta } else { &mut data.entries };
            slot.insert(Value::String(method.name), handle);
        }
        data.entries
            .insert(Value::from("type"), Value::String(obj.object_type()));
        handle_table
    }

    fn register_object(&self, obj: Arc<dyn CallbackObject>) -> Value {
        let mut inner = lock(&self.registry.inner);
        let handle_table = self.register_object_locked(&mut inner, &obj);
        drop(inner);
        debug!(object_type = %obj.object_type(), "object registered");
        handle_table
    }

    fn unregister_object(&self, obj: &dyn CallbackObject) {
        self.registry
            .unregister_object_blocking(obj.control().key(), &obj.control().block());
    }

    fn add_managed_object(&self, obj: Arc<dyn CallbackObject>) -> Value {
        let control = obj.control().block();
        let key = obj.control().key();
        let mut inner = lock(&self.registry.inner);
        inner.managed.insert(key, obj.clone());
        *lock(&control.owner) = Some(self.token);
        let mut handle_table = self.register_object_locked(&mut inner, &obj);
        if let Ok(data) = handle_table.table_mut() {
            // Interpreter-side garbage collection drives deletion, exactly once
            for name in ["__gc", "__close"] {
                let meta_key = Value::from(name);
                if !data.meta.contains_key(&meta_key) {
                    let id = inner.make_unique_id();
                    inner.records.insert(
                        id,
                        DispatchRecord {
                            target: DispatchTarget::Dispose {
                                object_key: key,
                                control: control.clone(),
                            },
                        },
                    );
                    inner.objects.entry(key).or_default().push(id);
                    data.meta.insert(meta_key, make_handle(self.token, id, true, &[]));
                }
            }
        }
        drop(inner);
        debug!(object_type = %obj.object_type(), "managed object added");
        handle_table
    }

    fn detach_managed_object(&self, obj: &dyn CallbackObject) {
        self.unregister_object(obj);
        let key = obj.control().key();
        lock(&self.registry.inner).managed.remove(&key);
        *lock(&obj.control().block().owner) = None;
    }

    fn add_finalizer(&self, finalizer: Finalizer) {
        let mut frames = lock(&self.finalizers);
        match frames.last_mut() {
            Some(frame) => frame.push(finalizer),
            None => warn!("finalizer registered outside of a run; dropped"),
        }
    }
}

/// Embeds one interpreter instance and bridges it to host code.
pub struct ScriptEngine {
    shared: Arc<EngineShared>,
    worker: Mutex<Option<WorkerHandle>>,
}

struct WorkerHandle {
    tx: Sender<Task>,
    handle: JoinHandle<()>,
}

impl ScriptEngine {
    pub fn new() -> Result<Self, BridgeError> {
        let lua = Lua::new();
        let termination = Arc::new(AtomicBool::new(false));
        let flag = termination.clone();
        let _ = lua.set_hook(
            HookTriggers::new().every_nth_instruction(TERMINATION_CHECK_INSTRUCTIONS),
            move |_lua, _debug| {
                if flag.swap(false, Ordering::SeqCst) {
                    return Err(mlua::Error::RuntimeError(
                        "termination has been requested".into(),
                    ));
                }
                Ok(VmState::Continue)
            },
        );

        let handle_map = lua.create_table()?;
        let mode = lua.create_table()?;
        mode.raw_set("__mode", "k")?;
        handle_map.set_metatable(Some(mode));

        let token = NEXT_ENGINE_TOKEN.fetch_add(1, Ordering::Relaxed);
        debug!(token, "script engine created");

        Ok(Self {
            shared: Arc::new(EngineShared {
                token,
                lua,
                handle_map,
                registry: Registry::new(),
                stack: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                termination,
                run_lock: Mutex::new(()),
                run_cv: Condvar::new(),
                runner: Mutex::new(None),
                finalizers: Mutex::new(Vec::new()),
                auto_clear_stack: AtomicBool::new(true),
            }),
            worker: Mutex::new(None),
        })
    }

    // --- stack surface ---

    /// Convert a value into the interpreter and push it onto the stack.
    pub fn push(&self, value: &Value) -> Result<(), BridgeError> {
        let converted = push_value(&self.shared, value)?;
        lock(&self.shared.stack).push(converted);
        Ok(())
    }

    /// Deep-copy the value at `pos` out of the interpreter. Positive
    /// positions count from the bottom starting at 1, negative from the top.
    /// An empty or out-of-range slot yields `Invalid`.
    pub fn pull(&self, pos: isize) -> Value {
        match self.stack_get(pos) {
            Some(v) => pull_root(&self.shared, &v, false),
            None => Value::Invalid,
        }
    }

    /// Like [`pull`](Self::pull), but reads tables as sequential arrays.
    pub fn pull_as_array(&self, pos: isize) -> Value {
        match self.stack_get(pos) {
            Some(v) => pull_root(&self.shared, &v, true),
            None => Value::Invalid,
        }
    }

    pub fn pop(&self) -> Value {
        let value = self.pull(-1);
        lock(&self.shared.stack).pop();
        value
    }

    /// Probe the type at `pos` without copying the value.
    pub fn value_type(&self, pos: isize) -> ValueKind {
        match self.stack_get(pos) {
            Some(v) => probe_kind(&self.shared, &v),
            None => ValueKind::Invalid,
        }
    }

    pub fn stack_size(&self) -> usize {
        lock(&self.shared.stack).len()
    }

    pub fn clear_stack(&self) {
        lock(&self.shared.stack).clear();
    }

    pub fn auto_clear_stack(&self) -> bool {
        self.shared.auto_clear_stack.load(Ordering::SeqCst)
    }

    /// Controls whether chunk results are dropped from the stack after each
    /// run (the default) or left for stack-surface consumers.
    pub fn set_auto_clear_stack(&self, clear: bool) {
        self.shared.auto_clear_stack.store(clear, Ordering::SeqCst);
    }

    fn stack_get(&self, pos: isize) -> Option<LuaValue> {
        let stack = lock(&self.shared.stack);
        let index = if pos > 0 {
            pos as usize - 1
        } else if pos < 0 {
            let from_top = stack.len() as isize + pos;
            if from_top < 0 {
                return None;
            }
            from_top as usize
        } else {
            return None;
        };
        stack.get(index).cloned()
    }

    // --- globals ---

    pub fn set_global(&self, name: &str, value: &Value) -> Result<(), BridgeError> {
        let converted = push_value(&self.shared, value)?;
        self.shared.lua.globals().set(name, converted)?;
        Ok(())
    }

    pub fn get_global(&self, name: &str) -> Result<Value, BridgeError> {
        let value: LuaValue = self.shared.lua.globals().get(name)?;
        Ok(pull_root(&self.shared, &value, false))
    }

    /// Cursor over the table at `pos`; a non-table slot yields a finished
    /// cursor. `first_key` positions the cursor on a known key instead of the
    /// first entry.
    pub fn cursor(&self, pos: isize, first_key: Option<&Value>) -> Result<TableCursor, BridgeError> {
        match self.stack_get(pos) {
            Some(v) => TableCursor::over(self.shared.clone(), &v, first_key),
            None => Ok(TableCursor::finished(self.shared.clone())),
        }
    }

    /// Cursor over the interpreter's global table.
    pub fn global_cursor(&self, first_key: Option<&Value>) -> Result<TableCursor, BridgeError> {
        let globals = LuaValue::Table(self.shared.lua.globals());
        TableCursor::over(self.shared.clone(), &globals, first_key)
    }

    // --- registry surface (thread-safe) ---

    pub fn register_callback(&self, func: CallbackFn, upvalues: &[Value]) -> Value {
        self.shared.register_callback(func, upvalues)
    }

    pub fn unregister_callback(&self, handle: &Value) -> Result<(), BridgeError> {
        self.shared.unregister_callback(handle)
    }

    /// Register a host-owned object; the returned table maps method names to
    /// handles (metamethods in its metatable) plus a `type` entry.
    pub fn register_object(&self, obj: Arc<dyn CallbackObject>) -> Value {
        self.shared.register_object(obj)
    }

    /// Remove the object's records, blocking until no other thread is
    /// mid-callback on it (see [`ControlHandle`](crate::ControlHandle) for
    /// the unsafe-destruction escape hatch). Idempotent.
    pub fn unregister_object(&self, obj: &dyn CallbackObject) {
        self.shared.unregister_object(obj)
    }

    /// Register an object the engine takes ownership of; interpreter garbage
    /// collection of the handle table drives deletion, exactly once.
    pub fn add_managed_object(&self, obj: Arc<dyn CallbackObject>) -> Value {
        self.shared.add_managed_object(obj)
    }

    /// Unregister a managed object and release the engine's ownership of it
    /// without destroying it.
    pub fn detach_managed_object(&self, obj: &dyn CallbackObject) {
        self.shared.detach_managed_object(obj)
    }

    // --- execution ---

    /// Load and run a chunk on the calling thread.
    pub fn execute_sync(&self, source: &str, name: &str) -> CallResult {
        execute_chunk_sync(&self.shared, source, name)
    }

    /// Load a chunk (reporting parse errors through the completer right
    /// away), then run it on the persistent worker thread. The completer
    /// observes the engine as not busy and may queue the next run itself.
    pub fn execute_async<F>(&self, source: &str, name: &str, completer: F) -> Result<(), BridgeError>
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::Busy);
        }
        match load_chunk(&self.shared, source, name) {
            Err(err) => {
                self.shared.finish_run();
                completer(failed_result(err));
                Ok(())
            }
            Ok(func) => {
                let tx = match self.ensure_worker() {
                    Ok(tx) => tx,
                    Err(err) => {
                        self.shared.finish_run();
                        return Err(err);
                    }
                };
                debug!(chunk = name, "asynchronous run queued");
                if tx
                    .send(Task {
                        func,
                        completer: Box::new(completer),
                    })
                    .is_err()
                {
                    self.shared.finish_run();
                    return Err(BridgeError::Runtime("worker thread is unavailable".into()));
                }
                Ok(())
            }
        }
    }

    /// True while an asynchronous run is queued or executing.
    pub fn busy(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Request cooperative termination of the current asynchronous run. The
    /// flag is observed at dispatch entry and at the periodic instruction
    /// checkpoint; a host call already in progress is not interrupted.
    pub fn terminate(&self) {
        if self.shared.running.load(Ordering::SeqCst) {
            self.shared.termination.store(true, Ordering::SeqCst);
            debug!("termination requested");
        }
    }

    /// Block until the current asynchronous run, if any, has finished.
    pub fn wait(&self) {
        let mut guard = lock(&self.shared.run_lock);
        while self.shared.running.load(Ordering::SeqCst) {
            guard = self
                .shared
                .run_cv
                .wait(guard)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn ensure_worker(&self) -> Result<Sender<Task>, BridgeError> {
        let mut slot = lock(&self.worker);
        if let Some(worker) = slot.as_ref() {
            return Ok(worker.tx.clone());
        }
        let (tx, rx) = mpsc::channel();
        let weak = Arc::downgrade(&self.shared);
        let handle = thread::Builder::new()
            .name("luna-script-worker".into())
            .spawn(move || worker_loop(weak, rx))
            .map_err(|e| BridgeError::Runtime(format!("cannot spawn worker thread: {e}")))?;
        *slot = Some(WorkerHandle {
            tx: tx.clone(),
            handle,
        });
        Ok(tx)
    }

    #[cfg(test)]
    pub(crate) fn record_count(&self) -> usize {
        self.shared.registry.record_count()
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::SeqCst) {
            self.shared.termination.store(true, Ordering::SeqCst);
        }
        if let Some(worker) = lock(&self.worker).take() {
            drop(worker.tx);
            if worker.handle.join().is_err() {
                warn!("script worker thread panicked");
            }
        }
        self.shared.registry.clear();
    }
}

fn worker_loop(weak: Weak<EngineShared>, tasks: Receiver<Task>) {
    while let Ok(task) = tasks.recv() {
        let Task { func, completer } = task;
        let Some(shared) = weak.upgrade() else { break };
        let result = run_loaded(&shared, func);
        shared.finish_run();
        drop(shared);
        // The engine counts as ready while the completer runs
        if panic::catch_unwind(AssertUnwindSafe(|| completer(result))).is_err() {
            warn!("completion callback panicked");
        }
    }
    trace!("script worker thread finished");
}

// --- chunk loading and running ---

fn load_chunk(shared: &Arc<EngineShared>, source: &str, name: &str) -> Result<Function, BridgeError> {
    match shared.lua.load(source).set_name(name).into_function() {
        Ok(func) => Ok(func),
        Err(mlua::Error::SyntaxError {
            message,
            incomplete_input,
        }) => Err(BridgeError::Parse {
            message,
            incomplete: incomplete_input,
        }),
        Err(other) => Err(BridgeError::Parse {
            message: other.to_string(),
            incomplete: false,
        }),
    }
}

fn failed_result(err: BridgeError) -> CallResult {
    CallResult {
        success: false,
        incomplete: matches!(&err, BridgeError::Parse { incomplete: true, .. }),
        results: Vec::new(),
        error_message: err.to_string(),
    }
}

pub(crate) fn execute_chunk_sync(shared: &Arc<EngineShared>, source: &str, name: &str) -> CallResult {
    let reentrant = *lock(&shared.runner) == Some(thread::current().id());
    if shared.running.load(Ordering::SeqCst) && !reentrant {
        return failed_result(BridgeError::Busy);
    }
    match load_chunk(shared, source, name) {
        Err(err) => failed_result(err),
        Ok(func) => run_loaded(shared, func),
    }
}

fn run_loaded(shared: &Arc<EngineShared>, func: Function) -> CallResult {
    let me = thread::current().id();
    let top_level = {
        let mut runner = lock(&shared.runner);
        if runner.is_none() {
            *runner = Some(me);
            true
        } else {
            false
        }
    };
    lock(&shared.finalizers).push(Vec::new());

    let call = func.call::<MultiValue>(());
    let mut result = CallResult::default();
    match call {
        Ok(values) => {
            result.success = true;
            let values: Vec<LuaValue> = values.into_iter().collect();
            for value in &values {
                result.results.push(pull_root(shared, value, false));
            }
            if shared.auto_clear_stack.load(Ordering::SeqCst) {
                lock(&shared.stack).clear();
            } else {
                lock(&shared.stack).extend(values);
            }
        }
        Err(err) => {
            result.error_message = err.to_string();
            lock(&shared.stack).clear();
        }
    }

    run_finalizers(shared);
    if top_level {
        *lock(&shared.runner) = None;
    }
    result
}

// Finalizers always run, success or failure, newest first; a finalizer may
// queue further finalizers onto its own frame.
fn run_finalizers(shared: &Arc<EngineShared>) {
    loop {
        let next = {
            let mut frames = lock(&shared.finalizers);
            let Some(frame) = frames.last_mut() else { break };
            match frame.pop() {
                Some(finalizer) => Some(finalizer),
                None => {
                    frames.pop();
                    None
                }
            }
        };
        match next {
            Some(finalizer) => finalizer(),
            None => break,
        }
    }
}

// --- value conversion across the boundary ---

fn make_handle(token: u64, id: i64, grace: bool, extra: &[Value]) -> Value {
    let mut upvalues = Vec::with_capacity(3 + extra.len());
    upvalues.push(Value::OpaquePointer(token as usize));
    upvalues.push(Value::Integer(id));
    upvalues.push(Value::Boolean(grace));
    upvalues.extend_from_slice(extra);
    Value::Callable(Callable::from_upvalues(upvalues))
}

pub(crate) fn push_value(shared: &Arc<EngineShared>, value: &Value) -> Result<LuaValue, BridgeError> {
    Ok(match value {
        Value::Nil | Value::Invalid => LuaValue::Nil,
        Value::Boolean(b) => LuaValue::Boolean(*b),
        Value::Number(d) => LuaValue::Number(*d),
        Value::Integer(i) => LuaValue::Integer(*i),
        Value::String(s) => LuaValue::String(shared.lua.create_string(s)?),
        Value::Array(items) => {
            let table = shared.lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i as i64 + 1, push_value(shared, item)?)?;
            }
            LuaValue::Table(table)
        }
        Value::Table(data) => {
            let table = shared.lua.create_table()?;
            for (k, v) in &data.entries {
                table.raw_set(push_value(shared, k)?, push_value(shared, v)?)?;
            }
            if !data.meta.is_empty() {
                let meta = shared.lua.create_table()?;
                for (k, v) in &data.meta {
                    meta.raw_set(push_value(shared, k)?, push_value(shared, v)?)?;
                }
                table.set_metatable(Some(meta));
            }
            LuaValue::Table(table)
        }
        Value::Callable(callable) => LuaValue::Function(make_dispatcher(shared, callable)?),
        Value::OpaquePointer(p) => LuaValue::LightUserData(LightUserData(*p as *mut c_void)),
        // Identity-only on the host side; an interpreter file handle cannot
        // be rebuilt from it
        Value::FileHandle(_) => LuaValue::Nil,
    })
}

pub(crate) fn pull_root(shared: &Arc<EngineShared>, value: &LuaValue, as_array: bool) -> Value {
    let mut seen = HashSet::new();
    pull_value(shared, value, as_array, &mut seen)
}

fn pull_value(
    shared: &Arc<EngineShared>,
    value: &LuaValue,
    as_array: bool,
    seen: &mut HashSet<usize>,
) -> Value {
    match value {
        LuaValue::Nil => Value::Nil,
        LuaValue::Boolean(b) => Value::Boolean(*b),
        LuaValue::Integer(i) => Value::Integer(*i),
        LuaValue::Number(n) => Value::Number(*n),
        LuaValue::String(s) => Value::String(s.to_string_lossy().to_string()),
        LuaValue::Table(table) => {
            if as_array {
                let len = table.raw_len();
                let mut items = Vec::with_capacity(len);
                for i in 1..=len {
                    let element: LuaValue = table.raw_get(i as i64).unwrap_or(LuaValue::Nil);
                    items.push(pull_value(shared, &element, true, seen));
                }
                Value::Array(items)
            } else {
                let ptr = value.to_pointer() as usize;
                // A table reachable from itself degrades to Invalid instead
                // of recursing forever
                if !seen.insert(ptr) {
                    return Value::Invalid;
                }
                let mut data = TableData::default();
                for pair in table.clone().pairs::<LuaValue, LuaValue>() {
                    let Ok((k, v)) = pair else { continue };
                    data.entries.insert(
                        pull_value(shared, &k, false, seen),
                        pull_value(shared, &v, false, seen),
                    );
                }
                if let Some(meta) = table.metatable() {
                    for pair in meta.pairs::<LuaValue, LuaValue>() {
                        let Ok((k, v)) = pair else { continue };
                        data.meta.insert(
                            pull_value(shared, &k, false, seen),
                            pull_value(shared, &v, false, seen),
                        );
                    }
                }
                seen.remove(&ptr);
                Value::Table(Box::new(data))
            }
        }
        LuaValue::Function(func) => {
            let ptr = value.to_pointer() as usize;
            if !seen.insert(ptr) {
                return Value::Invalid;
            }
            let pulled = match shared.handle_map.raw_get::<LuaValue>(func.clone()) {
                Ok(LuaValue::Table(upvalue_list)) => {
                    let len = upvalue_list.raw_len();
                    let mut upvalues = Vec::with_capacity(len);
                    for i in 1..=len {
                        let element: LuaValue =
                            upvalue_list.raw_get(i as i64).unwrap_or(LuaValue::Nil);
                        upvalues.push(pull_value(shared, &element, false, seen));
                    }
                    Value::Callable(Callable::from_upvalues(upvalues))
                }
                // Interpreter-side functions have no host representation
                _ => Value::Invalid,
            };
            seen.remove(&ptr);
            pulled
        }
        LuaValue::LightUserData(p) => Value::OpaquePointer(p.0 as usize),
        LuaValue::UserData(_) => {
            if is_file_handle(&shared.lua, value) {
                Value::FileHandle(value.to_pointer() as usize)
            } else {
                Value::Invalid
            }
        }
        _ => Value::Invalid,
    }
}

pub(crate) fn probe_kind(shared: &Arc<EngineShared>, value: &LuaValue) -> ValueKind {
    match value {
        LuaValue::Nil => ValueKind::Nil,
        LuaValue::Boolean(_) => ValueKind::Boolean,
        LuaValue::Integer(_) => ValueKind::Integer,
        LuaValue::Number(_) => ValueKind::Number,
        LuaValue::String(_) => ValueKind::String,
        LuaValue::Table(_) => ValueKind::Table,
        LuaValue::Function(func) => match shared.handle_map.raw_get::<LuaValue>(func.clone()) {
            Ok(LuaValue::Table(_)) => ValueKind::Callable,
            _ => ValueKind::Invalid,
        },
        LuaValue::LightUserData(_) => ValueKind::OpaquePointer,
        LuaValue::UserData(_) => {
            if is_file_handle(&shared.lua, value) {
                ValueKind::FileHandle
            } else {
                ValueKind::Invalid
            }
        }
        _ => ValueKind::Invalid,
    }
}

fn is_file_handle(lua: &Lua, value: &LuaValue) -> bool {
    let probe = || -> mlua::Result<bool> {
        let io: LuaTable = lua.globals().get("io")?;
        let io_type: Function = io.get("type")?;
        let verdict: LuaValue = io_type.call(value.clone())?;
        if let LuaValue::String(s) = verdict {
            let s = s.to_string_lossy();
            return Ok(s == "file" || s == "closed file");
        }
        Ok(false)
    };
    probe().unwrap_or(false)
}

// --- the dispatch protocol ---

enum DispatchFailure {
    /// Return no results without raising an interpreter error; used for
    /// finalizer-shaped handles racing explicit unregistration.
    Quiet,
    Fail(String),
}

fn fail(lua: &Lua, message: impl std::fmt::Display) -> DispatchFailure {
    DispatchFailure::Fail(format!("{}{}", where_prefix(lua), message))
}

/// Current interpreter source position, like the error prefix the
/// interpreter itself produces. Level 2 is the script frame that invoked the
/// dispatcher; when no such frame exists the prefix is empty.
fn where_prefix(lua: &Lua) -> String {
    let probe = || -> mlua::Result<String> {
        let debug_table: LuaTable = lua.globals().get("debug")?;
        let getinfo: Function = debug_table.get("getinfo")?;
        let info: LuaTable = getinfo.call((2, "Sl"))?;
        let line: i64 = info.get("currentline").unwrap_or(-1);
        if line <= 0 {
            return Ok(String::new());
        }
        let short_src: String = info.get("short_src").unwrap_or_default();
        Ok(format!("{short_src}:{line}: "))
    };
    probe().unwrap_or_default()
}

/// Build the interpreter-visible closure for a dispatch handle.
///
/// The closure body is the outermost boundary: the inner [`dispatch`] only
/// ever returns data, and the error is raised through the interpreter's own
/// mechanism from this single place.
fn make_dispatcher(shared: &Arc<EngineShared>, callable: &Callable) -> Result<Function, BridgeError> {
    let Some((token, id, grace)) = callable.prelude() else {
        return Err(BridgeError::TypeMismatch {
            expected: "dispatch handle",
            actual: "callable",
        });
    };
    let extra: Vec<Value> = callable.extra().to_vec();
    let weak = Arc::downgrade(shared);
    let func = shared
        .lua
        .create_function(move |lua, args: MultiValue| {
            match dispatch(lua, &weak, token, id, grace, &extra, args) {
                Ok(results) => Ok(results),
                Err(DispatchFailure::Quiet) => Ok(MultiValue::new()),
                Err(DispatchFailure::Fail(message)) => Err(mlua::Error::RuntimeError(message)),
            }
        })?;

    // Remember the upvalue list so the handle can be pulled back as a value.
    // The map is weak-keyed, so collected handles drop out on their own.
    let upvalue_list = shared
        .lua
        .create_table_with_capacity(callable.upvalues().len(), 0)?;
    for (i, upvalue) in callable.upvalues().iter().enumerate() {
        upvalue_list.raw_set(i as i64 + 1, push_value(shared, upvalue)?)?;
    }
    shared.handle_map.raw_set(func.clone(), upvalue_list)?;
    Ok(func)
}

fn dispatch(
    lua: &Lua,
    weak: &Weak<EngineShared>,
    token: u64,
    id: i64,
    grace: bool,
    upvalues: &[Value],
    args: MultiValue,
) -> Result<MultiValue, DispatchFailure> {
    let Some(shared) = weak.upgrade() else {
        if grace {
            return Err(DispatchFailure::Quiet);
        }
        return Err(fail(lua, BridgeError::HandleExpired));
    };
    if token != shared.token {
        return Err(fail(lua, BridgeError::EngineMismatch));
    }
    if shared.termination.swap(false, Ordering::SeqCst) {
        return Err(fail(lua, BridgeError::Terminated));
    }

    let target = {
        let inner = lock(&shared.registry.inner);
        match inner.records.get(&id) {
            Some(record) => record.target.clone(),
            None => {
                if grace {
                    return Err(DispatchFailure::Quiet);
                }
                return Err(fail(lua, BridgeError::HandleExpired));
            }
        }
    };

    let args: Vec<LuaValue> = args.into_iter().collect();
    let outcome = match target {
        DispatchTarget::Function(func) => {
            let mut ctx = CallContext {
                shared: &shared,
                args,
                upvalues,
            };
            func(&mut ctx)
        }
        DispatchTarget::Method {
            object,
            control,
            name,
        } => invoke_on_object(&shared, &control, || match object.upgrade() {
            Some(obj) => {
                let mut ctx = CallContext {
                    shared: &shared,
                    args,
                    upvalues,
                };
                obj.invoke(&name, &mut ctx)
            }
            None => Err(BridgeError::HandleExpired),
        }),
        DispatchTarget::Dispose {
            object_key,
            control,
        } => invoke_on_object(&shared, &control, || {
            dispose_managed(&shared, object_key, &control);
            Ok(Vec::new())
        }),
    };

    match outcome {
        Ok(results) => {
            let mut out = Vec::with_capacity(results.len());
            for value in &results {
                out.push(push_value(&shared, value).map_err(|e| fail(lua, e))?);
            }
            Ok(out.into_iter().collect())
        }
        Err(BridgeError::HandleExpired) if grace => Err(DispatchFailure::Quiet),
        Err(err) => Err(fail(lua, err)),
    }
}

/// Run `invoke` with the calling thread recorded on the object's thread
/// stack and the object's callback mutex held, unless this call chain
/// already holds it. The bookkeeping is undone by a drop guard, so an
/// unwinding invocation still releases everything and wakes waiters.
fn invoke_on_object<F>(
    shared: &Arc<EngineShared>,
    control: &Arc<ControlBlock>,
    invoke: F,
) -> Result<Vec<Value>, BridgeError>
where
    F: FnOnce() -> Result<Vec<Value>, BridgeError>,
{
    let mut inner = lock(&shared.registry.inner);
    lock(&control.thread_stack).push(thread::current().id());
    let callback_mutex = lock(&control.callback_mutex).clone();
    let mut held_key = None;
    let mut mutex_guard = None;
    if let Some(m) = callback_mutex.as_ref() {
        let key = Arc::as_ptr(m) as usize;
        if !inner.held_mutexes.contains(&key) {
            mutex_guard = Some(lock(m));
        }
        inner.held_mutexes.push(key);
        held_key = Some(key);
    }
    drop(inner);

    let cleanup = InvokeCleanup {
        registry: &shared.registry,
        control,
        held_key,
    };
    let result = invoke();
    drop(cleanup);
    drop(mutex_guard);
    result
}

struct InvokeCleanup<'a> {
    registry: &'a Registry,
    control: &'a Arc<ControlBlock>,
    held_key: Option<usize>,
}

impl Drop for InvokeCleanup<'_> {
    fn drop(&mut self) {
        // The pop happens under the registry lock so a blocked unregistration
        // cannot miss the wakeup
        let mut inner = lock(&self.registry.inner);
        lock(&self.control.thread_stack).pop();
        if let Some(key) = self.held_key {
            if let Some(pos) = inner.held_mutexes.iter().position(|k| *k == key) {
                inner.held_mutexes.remove(pos);
            }
        }
        drop(inner);
        self.registry.cv.notify_all();
    }
}

fn dispose_managed(shared: &Arc<EngineShared>, object_key: usize, control: &Arc<ControlBlock>) {
    // The disposing thread sits on top of the object's thread stack, so the
    // blocking unregistration proceeds without waiting on itself
    shared
        .registry
        .unregister_object_blocking(object_key, control);
    let removed = lock(&shared.registry.inner).managed.remove(&object_key);
    if let Some(obj) = removed {
        *lock(&obj.control().block().owner) = None;
        trace!(object_type = %obj.object_type(), "managed object disposed");
    }
}

/// Argument and upvalue surface visible inside a callback, plus the engine
/// operations that are safe to use from there.
pub struct CallContext<'a> {
    shared: &'a Arc<EngineShared>,
    args: Vec<LuaValue>,
    upvalues: &'a [Value],
}

impl CallContext<'_> {
    pub fn argc(&self) -> usize {
        self.args.len()
    }

    /// Argument type without copying; out-of-range probes yield `Invalid`.
    pub fn arg_type(&self, i: usize) -> ValueKind {
        match self.args.get(i) {
            Some(v) => probe_kind(self.shared, v),
            None => ValueKind::Invalid,
        }
    }

    /// Deep-copy argument `i`; out of range yields `Invalid`.
    pub fn arg(&self, i: usize) -> Value {
        match self.args.get(i) {
            Some(v) => pull_root(self.shared, v, false),
            None => Value::Invalid,
        }
    }

    /// Like [`arg`](Self::arg), but reads a table argument as an array.
    pub fn arg_as_array(&self, i: usize) -> Value {
        match self.args.get(i) {
            Some(v) => pull_root(self.shared, v, true),
            None => Value::Invalid,
        }
    }

    pub fn upvalue_count(&self) -> usize {
        self.upvalues.len()
    }

    /// Value captured at registration time; out of range yields `Invalid`.
    pub fn upvalue(&self, i: usize) -> Value {
        self.upvalues.get(i).cloned().unwrap_or(Value::Invalid)
    }

    /// Queue a closure to run once the current interpreter call returns,
    /// success or failure, before any completion callback. Finalizers run
    /// newest first.
    pub fn add_finalizer<F: FnOnce() + Send + 'static>(&self, finalizer: F) {
        self.shared.add_finalizer(Box::new(finalizer));
    }

    /// Run a chunk re-entrantly on the current interpreter thread.
    pub fn execute(&self, source: &str, name: &str) -> CallResult {
        execute_chunk_sync(self.shared, source, name)
    }

    pub fn register_callback(&self, func: CallbackFn, upvalues: &[Value]) -> Value {
        self.shared.register_callback(func, upvalues)
    }

    pub fn unregister_callback(&self, handle: &Value) -> Result<(), BridgeError> {
        self.shared.unregister_callback(handle)
    }

    pub fn register_object(&self, obj: Arc<dyn CallbackObject>) -> Value {
        self.shared.register_object(obj)
    }

    pub fn unregister_object(&self, obj: &dyn CallbackObject) {
        self.shared.unregister_object(obj)
    }

    pub fn add_managed_object(&self, obj: Arc<dyn CallbackObject>) -> Value {
        self.shared.add_managed_object(obj)
    }

    pub fn detach_managed_object(&self, obj: &dyn CallbackObject) {
        self.shared.detach_managed_object(obj)
    }
}
