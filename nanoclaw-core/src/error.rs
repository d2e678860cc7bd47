//! Error taxonomy shared across the orchestrator.
//!
//! Storage and Config errors are fatal: at startup they abort launch, during
//! steady state the daemon exits non-zero. Sandbox errors feed the queue's
//! retry/backoff path and roll the per-chat agent cursor back. Channel errors
//! are logged and swallowed. IPC errors quarantine the offending file.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("channel error ({channel}): {detail}")]
    Channel { channel: String, detail: String },

    #[error("sandbox exited with code {code:?}: {detail}")]
    SandboxExit { code: Option<i32>, detail: String },

    #[error("sandbox timed out after {elapsed_ms}ms")]
    SandboxTimeout { elapsed_ms: u64 },

    #[error("sandbox emitted unparseable output: {0}")]
    SandboxOutput(String),

    #[error("malformed IPC file: {0}")]
    IpcMalformed(String),

    #[error("unauthorized IPC command from folder {folder}: {detail}")]
    IpcUnauthorized { folder: String, detail: String },

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that must abort the daemon.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_is_fatal() {
        let err = Error::Storage(rusqlite::Error::InvalidQuery);
        assert!(err.is_fatal());
    }

    #[test]
    fn sandbox_errors_are_not_fatal() {
        let err = Error::SandboxTimeout { elapsed_ms: 1000 };
        assert!(!err.is_fatal());
        let err = Error::SandboxExit {
            code: Some(1),
            detail: "boom".into(),
        };
        assert!(!err.is_fatal());
    }

    #[test]
    fn display_includes_folder_for_unauthorized() {
        let err = Error::IpcUnauthorized {
            folder: "team-eng".into(),
            detail: "cross-folder target".into(),
        };
        assert!(err.to_string().contains("team-eng"));
    }
}
