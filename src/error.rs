//! Error
//!
//! This module provides the errors raised by drivers and by the [`crate::Server`]
//! with [`thiserror`], plus the cloneable [`ErrorInfo`] carried inside events.
//!
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result use the [`BridgeError`] as error.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// BridgeError is the specific error for drivers and the [`crate::Server`]
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("connection failed: {0}")]
    /// Transport level failure while connecting or talking to the backend
    Connection(String),

    #[error("authentication failed: {0}")]
    /// The backend refused our credentials
    Authentication(String),

    #[error("not connected")]
    /// An operation needed a live session
    NotConnected,

    #[error("{0}")]
    /// The backend rejected or failed the operation
    Operation(String),

    #[error("can not translate command: {0}")]
    /// No backend-native command exists for the intent
    Translation(String),

    #[error("operation interrupted")]
    /// The in-flight operation was interrupted
    Interrupted,

    #[error("{0} is not supported by this backend")]
    /// The backend has no such capability
    Unsupported(&'static str),

    #[error("the database {0} is not existent")]
    /// Reference to a database the backend does not know
    UnknownDatabase(String),

    #[error("io error {0}")]
    /// IO relevant errors
    IOError(#[from] io::Error),

    #[error("serde error {0}")]
    /// Serialized or Deserialized errors
    SerdeError(#[from] serde_json::Error),

    #[error("sled error {0}")]
    /// Errors of the embedded sled backend
    SledError(#[from] sled::Error),

    #[error("the worker is gone")]
    /// The connection worker stopped before answering
    WorkerGone,

    #[error("driver panicked: {0}")]
    /// A driver job panicked on the worker
    Panicked(String),
}

/// Coarse classes of failures.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Authentication or transport failure.
    Connection,
    /// Bad command or backend-reported failure.
    Operation,
    /// A backend command could not be built.
    Translation,
    /// The caller referenced state that no longer exists.
    Inconsistency,
    /// The operation was interrupted.
    Interrupted,
    /// Bugs and environment failures.
    Internal,
}

impl BridgeError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Connection(_)
            | BridgeError::Authentication(_)
            | BridgeError::NotConnected => ErrorKind::Connection,
            BridgeError::Operation(_) | BridgeError::Unsupported(_) => ErrorKind::Operation,
            BridgeError::Translation(_) => ErrorKind::Translation,
            BridgeError::UnknownDatabase(_) => ErrorKind::Inconsistency,
            BridgeError::Interrupted => ErrorKind::Interrupted,
            BridgeError::IOError(_)
            | BridgeError::SerdeError(_)
            | BridgeError::SledError(_)
            | BridgeError::WorkerGone
            | BridgeError::Panicked(_) => ErrorKind::Internal,
        }
    }
}

/// The error payload of a finished operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Class of the failure.
    pub kind: ErrorKind,
    /// Human readable description.
    pub message: String,
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<BridgeError> for ErrorInfo {
    fn from(err: BridgeError) -> Self {
        ErrorInfo {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
