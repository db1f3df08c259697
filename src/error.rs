//! Typed errors for the library-style modules. Commands wrap these in
//! `anyhow` at the binary boundary.

use std::path::PathBuf;

use crate::domain::result::FailureKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no config file found (looked in: {})", .0.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    NotFound(Vec<PathBuf>),

    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(String),

    /// Every validation problem found, not just the first.
    #[error("invalid config:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DirectoryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("authentication rejected ({status}): {body}")]
    Auth { status: u16, body: String },

    #[error("directory returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl DirectoryError {
    /// Map an HTTP status with its body into the matching variant.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            401 | 403 => Self::Auth { status, body },
            _ => Self::Status { status, body },
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Auth { status, .. } | Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Transport failures, timeouts, 5xx and 429 may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Auth { .. } | Self::Decode(_) => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    /// Terminal state of a mutation that failed with this error after the
    /// client's retry policy ran.
    pub fn failure_kind(&self) -> FailureKind {
        if self.is_retryable() {
            FailureKind::Terminal
        } else {
            FailureKind::NonRetryable
        }
    }
}

impl From<reqwest::Error> for DirectoryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16(), err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("{provider} transport error: {message}")]
    Transport { provider: &'static str, message: String },

    #[error("{provider} returned {status}: {body}")]
    Status {
        provider: &'static str,
        status: u16,
        body: String,
    },

    #[error("{provider} response could not be decoded: {message}")]
    Decode { provider: &'static str, message: String },

    #[error("{provider} request could not be signed: {message}")]
    Signing { provider: &'static str, message: String },
}

/// Reasons an account sync stops before or during execution.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("instance count mismatch: provider reported {expected}, enumerated {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("every region failed to enumerate: {}", .0.join(", "))]
    EnumerationFailed(Vec<String>),

    #[error("root node '{0}' not found in directory")]
    RootNodeMissing(String),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}
