use thiserror::Error;

/// Errors surfaced by signal registration and dispatch.
///
/// Registration errors are fatal at startup: a handler declared by the
/// application must register cleanly or the process fails closed. Dispatch
/// keeps a much smaller surface on purpose: validation and authorization
/// rejections are logged and contained, never raised past the engine.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("invalid signal path: {0:?}")]
    InvalidPath(String),

    #[error("duplicate function path: {0:?}")]
    DuplicatePath(String),

    #[error("handler {0:?} must take \"context\" as its first parameter")]
    MissingContextParameter(String),

    #[error("handler {path:?} cannot declare the variadic parameter *{name}")]
    VariadicParameter { path: String, name: String },

    #[error("eta, countdown and expires require a scheduling-capable backend ({backend})")]
    SchedulingUnsupported { backend: &'static str },

    #[error("signal payload is not JSON-serializable: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("subscription store error: {0}")]
    Store(#[from] redis::RedisError),
}

pub type SignalResult<T> = Result<T, SignalError>;
