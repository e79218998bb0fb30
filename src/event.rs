//! Events the [`crate::Server`] publishes to its caller.

use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;
use crate::mirror::DatabaseMirror;
use crate::protocol::{Operation, Reply, RequestId};
use crate::types::{ConnectionMode, Key, KeyValue, Ttl};

/// Everything a caller can observe about a connection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Event {
    /// A request was submitted.
    Started {
        /// Request id.
        id: RequestId,
        /// What was asked.
        operation: Operation,
    },
    /// A request completed. Failures carry the error in `result`.
    Finished {
        /// Request id.
        id: RequestId,
        /// What was asked.
        operation: Operation,
        /// Reply or error.
        result: Result<Reply, ErrorInfo>,
    },
    /// A key was inserted into the mirror.
    KeyAdded {
        /// Database name.
        database: String,
        /// The key.
        key: KeyValue,
    },
    /// A known key was observed again.
    KeyLoaded {
        /// Database name.
        database: String,
        /// The key.
        key: KeyValue,
    },
    /// A key left the mirror.
    KeyRemoved {
        /// Database name.
        database: String,
        /// The key.
        key: Key,
    },
    /// A key was renamed.
    KeyRenamed {
        /// Database name.
        database: String,
        /// The key under its old name.
        key: Key,
        /// The new name.
        new_name: String,
    },
    /// A key's ttl changed.
    KeyTtlChanged {
        /// Database name.
        database: String,
        /// The key.
        key: Key,
        /// The new ttl.
        ttl: Ttl,
    },
    /// Another database is current now.
    CurrentDatabaseChanged(DatabaseMirror),
    /// The current database lost all keys.
    FlushedDb(DatabaseMirror),
    /// Progress of the running operation, 0 to 100.
    ProgressChanged(u8),
    /// An interactive sub-mode started.
    ModeEntered(ConnectionMode),
    /// An interactive sub-mode ended.
    ModeLeft(ConnectionMode),
}

impl Event {
    /// The finished request's id, if this is a completion.
    pub fn finished_id(&self) -> Option<RequestId> {
        match self {
            Event::Finished { id, .. } => Some(*id),
            _ => None,
        }
    }
}
