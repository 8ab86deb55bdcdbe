use thiserror::Error;

#[derive(Debug, Error)]
pub enum LibrariumError {
    #[error("failed to load {path}: {message}")]
    ConfigLoad { path: String, message: String },

    #[error("Provider \"{0}\" not found")]
    ProviderNotFound(String),

    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },

    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("request aborted")]
    Cancelled,

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("response too large: {size} bytes (max {max})")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("process exited with code {code}: {stderr}")]
    ProcessExit { code: i32, stderr: String },

    #[error("provider protocol error from {provider}: {message}")]
    Protocol { provider: String, message: String },

    #[error("unknown task {task_id} for {provider}")]
    UnknownTask { provider: String, task_id: String },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl LibrariumError {
    /// True for a per-attempt deadline expiry; the retrieve path leaves
    /// the task handle in place for these.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
