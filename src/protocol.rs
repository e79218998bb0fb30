//! Request/response definitions.
//!
//! This module defines the message types exchanged between the
//! [`crate::Server`] and the worker running its driver, plus the key-level
//! notices a driver reports while it works.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ErrorInfo;
use crate::mirror::DatabaseMirror;
use crate::types::{
    Channel, ConnectionMode, Key, KeyValue, Property, ServerInfo, ServerInfoSnapshot, Ttl,
};

/// Correlates one request with its response.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Who asked for a command.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOrigin {
    /// Typed or triggered by the user.
    User,
    /// Issued by the bridge itself, never reported to the user.
    Inner,
}

/// A backend-native command to run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    /// One command per line.
    pub text: String,
    /// How many times to run the whole text.
    pub repeat: u32,
    /// Pause between repeats.
    pub interval_ms: u64,
    /// Whether the command belongs in the user's history.
    pub history: bool,
    /// Whether output should be suppressed.
    pub silent: bool,
    /// Who issued it.
    pub origin: CommandOrigin,
}

impl ExecuteRequest {
    /// Run `text` once on behalf of the user.
    pub fn new(text: impl Into<String>) -> Self {
        ExecuteRequest {
            text: text.into(),
            repeat: 1,
            interval_ms: 0,
            history: true,
            silent: false,
            origin: CommandOrigin::User,
        }
    }

    /// A silent background command.
    pub fn inner(text: impl Into<String>) -> Self {
        ExecuteRequest {
            text: text.into(),
            repeat: 1,
            interval_ms: 0,
            history: false,
            silent: true,
            origin: CommandOrigin::Inner,
        }
    }
}

/// Which keys of a database to list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoadContentRequest {
    /// Target database.
    pub database: String,
    /// Glob pattern, `*` and `?` supported.
    pub pattern: String,
    /// Position to resume from, `0` to start over.
    pub cursor: u64,
    /// Maximum number of keys to return.
    pub count: u64,
}

impl LoadContentRequest {
    /// Every key of `database`, up to `count`.
    pub fn new(database: impl Into<String>, count: u64) -> Self {
        LoadContentRequest {
            database: database.into(),
            pattern: "*".to_string(),
            cursor: 0,
            count,
        }
    }
}

/// Operations a caller can submit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Open the session.
    Connect,
    /// Close the session.
    Disconnect,
    /// Enumerate databases.
    LoadDatabases,
    /// List keys of one database.
    LoadDatabaseContent(LoadContentRequest),
    /// Run a backend command.
    Execute(ExecuteRequest),
    /// Shut the backend down.
    ShutDown,
    /// Dump the backend to a file.
    Backup {
        /// Destination.
        path: PathBuf,
    },
    /// Load a dump file into the backend.
    Export {
        /// Source.
        path: PathBuf,
    },
    /// Change the session password.
    ChangePassword {
        /// Current password.
        old_password: String,
        /// Replacement.
        new_password: String,
    },
    /// Change the backend's connection limit.
    SetMaxConnection {
        /// New limit.
        max_connections: u32,
    },
    /// Fetch server info.
    LoadServerInfo,
    /// Fetch server properties.
    LoadServerProperties,
    /// Change one server property.
    ChangeServerProperty(Property),
    /// Fetch recorded server info samples.
    LoadServerHistory,
    /// Drop recorded server info samples.
    ClearHistory,
    /// List publish/subscribe channels.
    LoadChannels {
        /// Glob pattern for channel names.
        pattern: String,
    },
    /// Fetch server info and the default database in one step.
    DiscoveryInfo,
}

impl RequestKind {
    /// The operation tag.
    pub fn operation(&self) -> Operation {
        match self {
            RequestKind::Connect => Operation::Connect,
            RequestKind::Disconnect => Operation::Disconnect,
            RequestKind::LoadDatabases => Operation::LoadDatabases,
            RequestKind::LoadDatabaseContent(_) => Operation::LoadDatabaseContent,
            RequestKind::Execute(_) => Operation::Execute,
            RequestKind::ShutDown => Operation::ShutDown,
            RequestKind::Backup { .. } => Operation::Backup,
            RequestKind::Export { .. } => Operation::Export,
            RequestKind::ChangePassword { .. } => Operation::ChangePassword,
            RequestKind::SetMaxConnection { .. } => Operation::SetMaxConnection,
            RequestKind::LoadServerInfo => Operation::LoadServerInfo,
            RequestKind::LoadServerProperties => Operation::LoadServerProperties,
            RequestKind::ChangeServerProperty(_) => Operation::ChangeServerProperty,
            RequestKind::LoadServerHistory => Operation::LoadServerHistory,
            RequestKind::ClearHistory => Operation::ClearHistory,
            RequestKind::LoadChannels { .. } => Operation::LoadChannels,
            RequestKind::DiscoveryInfo => Operation::DiscoveryInfo,
        }
    }
}

/// Operation tags, one per [`RequestKind`] variant.
#[allow(missing_docs)]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Disconnect,
    LoadDatabases,
    LoadDatabaseContent,
    Execute,
    ShutDown,
    Backup,
    Export,
    ChangePassword,
    SetMaxConnection,
    LoadServerInfo,
    LoadServerProperties,
    ChangeServerProperty,
    LoadServerHistory,
    ClearHistory,
    LoadChannels,
    DiscoveryInfo,
}

/// A request as handed to the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Correlation id.
    pub id: RequestId,
    /// What to do.
    pub kind: RequestKind,
}

/// Keys returned for a [`LoadContentRequest`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DatabaseContent {
    /// Database the keys belong to.
    pub database: String,
    /// The keys found.
    pub keys: Vec<KeyValue>,
    /// Authoritative number of keys in the database.
    pub key_count: usize,
    /// Cursor for the next page, `0` when exhausted.
    pub next_cursor: u64,
}

/// Output of an [`ExecuteRequest`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// One entry per executed command line.
    pub lines: Vec<String>,
}

/// Successful results, one variant per operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Session open.
    Connected,
    /// Session closed.
    Disconnected,
    /// Every database known after the merge.
    Databases(Vec<DatabaseMirror>),
    /// Listed keys.
    DatabaseContent(DatabaseContent),
    /// Command output.
    Executed(CommandOutput),
    /// Backend going down.
    ShutDown,
    /// Dump written.
    BackedUp(PathBuf),
    /// Dump loaded.
    Exported(PathBuf),
    /// Password changed.
    PasswordChanged,
    /// Connection limit now in effect.
    MaxConnectionChanged(u32),
    /// Fresh server info.
    ServerInfo(ServerInfo),
    /// Server properties.
    ServerProperties(Vec<Property>),
    /// Property after the change, with whether the backend applied it.
    ServerPropertyChanged {
        /// Property as requested.
        property: Property,
        /// Whether the backend applied it.
        changed: bool,
    },
    /// Recorded server info samples.
    ServerHistory(Vec<ServerInfoSnapshot>),
    /// Samples dropped.
    HistoryCleared,
    /// Matching channels.
    Channels(Vec<Channel>),
    /// Server info and the default database.
    Discovery {
        /// Server info.
        info: ServerInfo,
        /// Default database, as resolved against the cache.
        database: DatabaseMirror,
    },
}

/// The worker's answer to one [`Request`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    /// Id of the answered request.
    pub id: RequestId,
    /// Reply or error.
    pub result: Result<Reply, ErrorInfo>,
}

/// Things a driver observed about the backend while working.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A key was created.
    KeyAdded(KeyValue),
    /// A key was read.
    KeyLoaded(KeyValue),
    /// A key was deleted.
    KeyRemoved(Key),
    /// A key got a new name.
    KeyRenamed(Key, String),
    /// A key's ttl was set.
    KeyTtlChanged(Key, Ttl),
    /// A key's ttl was read.
    KeyTtlLoaded(Key, Ttl),
    /// Another database got selected.
    CurrentDatabaseChanged(DatabaseMirror),
    /// The current database was flushed.
    Flushed,
    /// Operation progress, 0 to 100.
    Progress(u8),
    /// An interactive sub-mode started.
    EnterMode(ConnectionMode),
    /// An interactive sub-mode ended.
    LeaveMode(ConnectionMode),
}

/// Messages flowing from the worker back to the server, in the order the
/// driver produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A notice raised during a request.
    Notice(Notice),
    /// The final answer to a request.
    Response(Response),
}
