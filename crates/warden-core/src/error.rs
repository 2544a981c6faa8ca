//! Error types for warden.
//!
//! Transport failures (anything that breaks the pipe connection to the worker)
//! are collapsed into [`WardenError::SubprocessCrashed`] at the subprocess
//! manager boundary. Errors raised by a called function travel back as data and
//! surface as [`WardenError::Remote`], except for stale handle lookups which get
//! their own variant so callers can re-derive the object instead of giving up.

use crate::value::{ContextId, ErrorKind, HandleId, RemoteError};
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for warden.
#[derive(Debug, Error)]
pub enum WardenError {
    // Transport errors
    #[error("The subprocess {executable:?} has crashed ({message})")]
    SubprocessCrashed { executable: PathBuf, message: String },

    #[error("The subprocess {executable:?} is unavailable: {reason}")]
    SubprocessUnavailable { executable: PathBuf, reason: String },

    #[error("Failed to spawn subprocess {executable:?}: {source}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Errors carried back from the worker
    #[error("{0}")]
    Remote(RemoteError),

    #[error("Stale handle {handle_id} (context {context_id:?})")]
    StaleHandle {
        handle_id: HandleId,
        context_id: Option<ContextId>,
    },

    // Local errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

impl From<std::io::Error> for WardenError {
    fn from(err: std::io::Error) -> Self {
        WardenError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rmp_serde::encode::Error> for WardenError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        WardenError::Codec {
            message: format!("encode failed: {}", err),
        }
    }
}

impl From<rmp_serde::decode::Error> for WardenError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        WardenError::Codec {
            message: format!("decode failed: {}", err),
        }
    }
}

impl WardenError {
    /// Map an error carried back from a function call to its local variant.
    ///
    /// Stale handle errors keep their own variant; every other kind (including
    /// tags this build does not know) stays a [`WardenError::Remote`].
    pub fn from_remote(err: RemoteError, context_id: Option<ContextId>) -> Self {
        if err.kind == ErrorKind::StaleHandle {
            if let Some(handle_id) = err.handle_id() {
                return WardenError::StaleHandle {
                    handle_id,
                    context_id,
                };
            }
        }
        WardenError::Remote(err)
    }

    /// Whether this error came from the pipe connection breaking down.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            WardenError::SubprocessCrashed { .. } | WardenError::SubprocessUnavailable { .. }
        )
    }

    /// Whether this error refers to a handle the worker no longer knows.
    pub fn is_stale_handle(&self) -> bool {
        matches!(self, WardenError::StaleHandle { .. })
    }

    /// The carried remote error, if this is one.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            WardenError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WardenError::SubprocessUnavailable {
            executable: PathBuf::from("/usr/bin/warden-worker"),
            reason: "crashed earlier".into(),
        };
        assert_eq!(
            err.to_string(),
            "The subprocess \"/usr/bin/warden-worker\" is unavailable: crashed earlier"
        );
    }

    #[test]
    fn test_from_remote_maps_stale_handle() {
        let err = WardenError::from_remote(RemoteError::stale_handle(HandleId(4)), Some(9));
        match err {
            WardenError::StaleHandle {
                handle_id,
                context_id,
            } => {
                assert_eq!(handle_id, HandleId(4));
                assert_eq!(context_id, Some(9));
            }
            other => panic!("Expected StaleHandle, got: {:?}", other),
        }
    }

    #[test]
    fn test_from_remote_keeps_unknown_kinds() {
        let remote = RemoteError::new(ErrorKind::Other("zero_division".into()), "division by zero");
        let err = WardenError::from_remote(remote, None);
        assert_eq!(
            err.as_remote().map(|e| &e.kind),
            Some(&ErrorKind::Other("zero_division".into()))
        );
        assert!(!err.is_transport_failure());
    }

    #[test]
    fn test_transport_failures() {
        assert!(WardenError::SubprocessCrashed {
            executable: PathBuf::from("w"),
            message: "EOF".into(),
        }
        .is_transport_failure());
        assert!(!WardenError::Codec {
            message: "bad".into()
        }
        .is_transport_failure());
    }
}
