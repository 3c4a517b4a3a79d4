use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrandError {
    // Routing errors — structural mismatch between graph and message stream
    #[error("no port registered with id '{0}'")]
    UnknownPort(String),

    #[error("executor '{executor}' is not registered to handle message type '{type_tag}'")]
    UnroutedMessage { executor: String, type_tag: String },

    #[error("executor '{0}' is not registered in the workflow")]
    UnknownExecutor(String),

    #[error("no outstanding request with id '{0}'")]
    UnknownRequest(String),

    // State errors
    #[error("scope '{scope}' key '{key}' is owned by executor '{owner}'; write from '{writer}' rejected")]
    StateConflict {
        scope: String,
        key: String,
        owner: String,
        writer: String,
    },

    #[error("payload type mismatch: expected '{expected}', got '{actual}'")]
    TypeMismatch { expected: String, actual: String },

    // Executor invocation errors
    #[error("executor '{executor}' failed: {message}")]
    Executor { executor: String, message: String },

    // Graph construction errors
    #[error("invalid workflow graph: {0}")]
    GraphBuild(String),

    // Checkpoint errors
    #[error("checkpoint precondition violated: {0}")]
    CheckpointPrecondition(String),

    #[error("checkpoint storage error: {0}")]
    Checkpoint(String),

    // Run lifecycle
    #[error("run exceeded maximum super-steps ({0})")]
    MaxStepsExceeded(u64),

    #[error("event stream already taken for this run")]
    StreamTaken,

    #[error("run cancelled")]
    Cancelled,

    // Config errors
    #[error("config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StrandError>;
