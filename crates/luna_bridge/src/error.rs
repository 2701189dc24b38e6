use thiserror::Error;

/// Errors produced by the bridge.
///
/// Parse and runtime failures coming out of `execute_sync`/`execute_async`
/// are reported as data inside [`CallResult`](crate::CallResult); this enum
/// is what the rest of the API surface returns.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("parse error: {message}")]
    Parse { message: String, incomplete: bool },

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("no such function or object, or it has been unregistered")]
    HandleExpired,

    #[error("handle does not belong to this engine")]
    EngineMismatch,

    #[error("interpreter is busy")]
    Busy,

    #[error("termination has been requested")]
    Terminated,

    #[error("cannot use {actual} value as {expected}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error(transparent)]
    Interpreter(#[from] mlua::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
