use thiserror::Error;

/// Error taxonomy shared by every layer of the relay.
///
/// Subprocess and filesystem failures are mapped into these variants at the
/// agent/tunnel boundary; HTTP handlers translate them into structured
/// `{error:{message}}` JSON, so no raw error ever escapes a route.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("executable '{0}' not found; install it or configure an explicit path")]
    ExecutableNotFound(String),

    #[error("'{command}' timed out after {timeout_secs}s")]
    ProcessTimeout { command: String, timeout_secs: u64 },

    #[error("'{command}' exited with {}: {stderr}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()))]
    ProcessFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Structured output could not be decoded. Callers on the generation
    /// path fall back to raw trimmed text instead of surfacing this.
    #[error("failed to parse {context}: {detail}")]
    ParseFailure { context: String, detail: String },

    #[error("Invalid API key")]
    AuthInvalid,

    #[error("{0} not found")]
    NotFound(String),

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// True when the failure is the caller's fault rather than the relay's.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::AuthInvalid | Self::NotFound(_))
    }
}
