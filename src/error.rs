use std::fmt;

use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, SendError as BroadcastSendError};
use tokio::sync::mpsc::error::SendError as MpscSendError;
use tokio::task::JoinError;

/// Coarse failure taxonomy shared by every public operation in the crate.
///
/// Callers branch on `kind`, not on the specific variant of whatever failed
/// underneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Network,
    Timeout,
    ProtocolHandshake,
    Cancelled,
    BackendNotReady,
    BackendDisposed,
    UnsupportedFeature,
    Persistence,
    Upstream,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProtocolHandshake => "protocol-handshake",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::BackendNotReady => "backend-not-ready",
            ErrorKind::BackendDisposed => "backend-disposed",
            ErrorKind::UnsupportedFeature => "unsupported-feature",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Upstream => "upstream",
        };
        f.write_str(s)
    }
}

/// The crate's single error type. Every public boundary returns this (or a
/// typed result wrapping it) rather than throwing — see `ConnectionResult`
/// and `BackendResult` for boundaries that also carry a timestamp.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct FlotillaError {
    pub kind: ErrorKind,
    pub message: String,
}

impl FlotillaError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        FlotillaError {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }
    pub fn protocol_handshake(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolHandshake, message)
    }
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }
    pub fn backend_not_ready(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BackendNotReady, message)
    }
    pub fn backend_disposed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BackendDisposed, message)
    }
    pub fn unsupported_feature(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedFeature, message)
    }
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Persistence, message)
    }
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, message)
    }
}

impl From<std::io::Error> for FlotillaError {
    fn from(err: std::io::Error) -> Self {
        FlotillaError::persistence(err.to_string())
    }
}

impl From<serde_json::Error> for FlotillaError {
    fn from(err: serde_json::Error) -> Self {
        FlotillaError::persistence(err.to_string())
    }
}

impl From<RecvError> for FlotillaError {
    fn from(err: RecvError) -> Self {
        FlotillaError::new(ErrorKind::Upstream, err.to_string())
    }
}

impl<T> From<BroadcastSendError<T>> for FlotillaError {
    fn from(err: BroadcastSendError<T>) -> Self {
        FlotillaError::new(ErrorKind::Upstream, err.to_string())
    }
}

impl<T> From<MpscSendError<T>> for FlotillaError {
    fn from(err: MpscSendError<T>) -> Self {
        FlotillaError::new(ErrorKind::Upstream, err.to_string())
    }
}

impl From<JoinError> for FlotillaError {
    fn from(err: JoinError) -> Self {
        FlotillaError::new(ErrorKind::Upstream, err.to_string())
    }
}

impl From<reqwest::Error> for FlotillaError {
    fn from(err: reqwest::Error) -> Self {
        FlotillaError::upstream(err.to_string())
    }
}
