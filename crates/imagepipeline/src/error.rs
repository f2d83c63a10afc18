//! Error taxonomy for the pipeline engine.
//!
//! [`FetchError`] covers network-delegate failures and carries enough shape
//! for the priority fetch queue's retry classifier. [`PipelineError`] covers
//! everything else a stage can fail with. Both end up wrapped in the shared
//! `DynError` payload when they reach a consumer.

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("unknown host `{host}`")]
    UnknownHost { host: String },

    #[error("connection failed: {reason}")]
    Connection { reason: String },

    #[error("I/O error: {reason}")]
    Io { reason: String },

    #[error("request failed with HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("fetch timed out: {reason}")]
    Timeout { reason: String },

    /// Explicitly marked retriable by the delegate, whatever the cause.
    #[error("{reason}")]
    Retriable { reason: String },

    /// Marked permanent by the delegate; requeueing cannot help.
    #[error("{reason}")]
    NonRecoverable { reason: String },

    #[error("{reason}")]
    Other { reason: String },
}

impl FetchError {
    pub fn unknown_host(host: impl Into<String>) -> FetchError {
        FetchError::UnknownHost { host: host.into() }
    }

    pub fn connection(reason: impl Into<String>) -> FetchError {
        FetchError::Connection {
            reason: reason.into(),
        }
    }

    pub fn io(source: &std::io::Error) -> FetchError {
        FetchError::Io {
            reason: source.to_string(),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> FetchError {
        FetchError::Timeout {
            reason: reason.into(),
        }
    }

    pub fn retriable(reason: impl Into<String>) -> FetchError {
        FetchError::Retriable {
            reason: reason.into(),
        }
    }

    pub fn non_recoverable(reason: impl Into<String>) -> FetchError {
        FetchError::NonRecoverable {
            reason: reason.into(),
        }
    }

    pub fn other(reason: impl Into<String>) -> FetchError {
        FetchError::Other {
            reason: reason.into(),
        }
    }

    /// Whether this failure counts against the connect-attempt threshold.
    pub fn is_connect_error(&self) -> bool {
        matches!(self, FetchError::Connection { .. })
    }

    pub fn is_non_recoverable(&self) -> bool {
        matches!(self, FetchError::NonRecoverable { .. })
    }

    pub fn is_marked_retriable(&self) -> bool {
        matches!(self, FetchError::Retriable { .. })
    }

    /// Failure messages that indicate the peer or transport tore the
    /// request down (cancelled mid-flight, socket closed under us). These
    /// are retried even for low-priority requests.
    pub fn matches_cancellation_pattern(&self) -> bool {
        let message = self.to_string().to_ascii_lowercase();
        message.contains("cancel") || message.contains("socket closed") || message.contains("closed socket")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("fetch failed: {source}")]
    Fetch {
        #[from]
        source: FetchError,
    },

    #[error("decode failed: {reason}")]
    Decode { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl PipelineError {
    pub fn decode(reason: impl Into<String>) -> PipelineError {
        PipelineError::Decode {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> PipelineError {
        PipelineError::Configuration {
            reason: reason.into(),
        }
    }
}
