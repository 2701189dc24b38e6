//! lunabridge — embeds a Lua interpreter inside a host application and lets
//! host callables and objects be called safely from scripts, and vice versa.
//!
//! ## Architecture
//!
//! - **Value model** ([`Value`]): lossless host-side representation of
//!   interpreter values, deep-copied on every boundary crossing.
//! - **Dispatch protocol**: every interpreter-to-host call goes through one
//!   entry point that resolves an integer handle against the registry and
//!   converts host errors into interpreter errors at a single place.
//! - **Registry**: thread-safe table of dispatch records; handles carry ids,
//!   never pointers.
//! - **Object lifecycle** ([`CallbackObject`]): registered objects stay owned
//!   by the host, managed objects are deleted by the engine through the
//!   interpreter's garbage collector; unregistration is safe against
//!   callbacks in flight on other threads.
//! - **Execution engine** ([`ScriptEngine`]): synchronous runs on the calling
//!   thread, one-shot asynchronous runs on a persistent worker thread with
//!   cooperative termination.
//! - **Table cursor** ([`TableCursor`]): lazy traversal of interpreter
//!   tables without copying them whole.

pub mod console;
pub mod cursor;
pub mod engine;
pub mod error;
pub mod object;
pub mod value;

mod registry;
mod sync;

pub use console::{Console, ConsoleAction, ConsoleReply, Prompt};
pub use cursor::TableCursor;
pub use engine::{CallContext, CallResult, CallbackFn, ScriptEngine};
pub use error::{BridgeError, BridgeResult};
pub use object::{CallbackObject, ControlHandle, MethodDef};
pub use value::{Callable, TableData, Value, ValueKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
