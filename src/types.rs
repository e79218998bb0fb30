//! Value types shared by drivers, the mirror and events.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Remaining time-to-live of a key.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ttl {
    /// The key never expires.
    NoExpiry,
    /// The backend confirmed the key is gone.
    Expired,
    /// Seconds left before the key expires.
    Remaining(u64),
}

impl Ttl {
    /// Build from the Redis convention: `-1` no expiry, `-2` (or below) expired.
    pub fn from_secs(secs: i64) -> Ttl {
        match secs {
            -1 => Ttl::NoExpiry,
            s if s < -1 => Ttl::Expired,
            s => Ttl::Remaining(s as u64),
        }
    }

    /// Inverse of [`Ttl::from_secs`].
    pub fn as_secs(&self) -> i64 {
        match self {
            Ttl::NoExpiry => -1,
            Ttl::Expired => -2,
            Ttl::Remaining(s) => i64::try_from(*s).unwrap_or(i64::MAX),
        }
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::NoExpiry => write!(f, "no expiry"),
            Ttl::Expired => write!(f, "expired"),
            Ttl::Remaining(s) => write!(f, "{s}s"),
        }
    }
}

/// A key of a database, identified by its name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    /// Name, unique within a database.
    pub name: String,
    /// Last known time-to-live.
    pub ttl: Ttl,
}

impl Key {
    /// A key that never expires.
    pub fn new(name: impl Into<String>) -> Self {
        Key {
            name: name.into(),
            ttl: Ttl::NoExpiry,
        }
    }

    /// A key with the given ttl.
    pub fn with_ttl(name: impl Into<String>, ttl: Ttl) -> Self {
        Key {
            name: name.into(),
            ttl,
        }
    }
}

/// A key plus the value last observed from the backend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key.
    pub key: Key,
    /// Value snapshot, `None` if it was never loaded.
    pub value: Option<String>,
}

impl KeyValue {
    /// Pair a key with a value.
    pub fn new(key: Key, value: Option<String>) -> Self {
        KeyValue { key, value }
    }

    /// Shortcut for the key name.
    pub fn name(&self) -> &str {
        &self.key.name
    }
}

/// Backend families a driver can talk to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// Redis and protocol compatible servers.
    Redis,
    /// Memcached.
    Memcached,
    /// SSDB.
    Ssdb,
    /// LevelDB files.
    LevelDb,
    /// RocksDB files.
    RocksDb,
    /// UnQLite files.
    Unqlite,
    /// LMDB files.
    Lmdb,
    /// sled directories.
    Sled,
}

impl ConnectionType {
    /// Whether the backend lives behind a network connection.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            ConnectionType::Redis | ConnectionType::Memcached | ConnectionType::Ssdb
        )
    }

    /// Whether keys of this backend can carry a ttl.
    pub fn supports_ttl_keys(&self) -> bool {
        matches!(
            self,
            ConnectionType::Redis
                | ConnectionType::Memcached
                | ConnectionType::Ssdb
                | ConnectionType::Sled
        )
    }
}

/// Slash separated location of a connection, e.g. `/local/cache`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPath(pub String);

impl ConnectionPath {
    /// The last path segment.
    pub fn name(&self) -> &str {
        self.0
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
    }
}

/// Opaque server information, grouped in sections.
///
/// The text form follows the INFO output of memcached-like servers:
///
/// ```text
/// # Stats
/// file_name:/tmp/db
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    /// `section -> field -> value`
    pub sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl ServerInfo {
    /// Parse INFO style text. Lines before the first header land in `Common`.
    pub fn parse(text: &str) -> Self {
        let mut info = ServerInfo::default();
        let mut section = String::from("Common");
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix('#') {
                section = header.trim().to_string();
                continue;
            }
            if let Some((field, value)) = line.split_once(':') {
                info.set(&section, field.trim(), value.trim());
            }
        }
        info
    }

    /// Store a field.
    pub fn set(&mut self, section: &str, field: &str, value: impl Into<String>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
    }

    /// Look a field up.
    pub fn field(&self, section: &str, field: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|fields| fields.get(field))
            .map(String::as_str)
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (section, fields) in &self.sections {
            writeln!(f, "# {section}")?;
            for (field, value) in fields {
                writeln!(f, "{field}:{value}")?;
            }
        }
        Ok(())
    }
}

/// A point-in-time server info sample.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerInfoSnapshot {
    /// Milliseconds since the unix epoch.
    pub taken_at_ms: u64,
    /// The sample.
    pub info: ServerInfo,
}

/// A named server property.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Property name.
    pub name: String,
    /// Current value.
    pub value: String,
}

impl Property {
    /// Build a property.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Property {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A publish/subscribe channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Channel name.
    pub name: String,
    /// Number of subscribers.
    pub subscribers: u64,
}

/// Interactive sub-modes of a session.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Plain request/response.
    Interactive,
    /// Subscribed to channels.
    PubSub,
    /// Streaming all commands the server sees.
    Monitor,
}
