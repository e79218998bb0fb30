//! Translation of intents into backend-native command text.

use crate::error::{BridgeError, Result};
use crate::types::{Key, KeyValue, Ttl};

/// Builds backend-native commands for key-level intents.
pub trait Translator: Send + Sync {
    /// Create `key` with its value and ttl.
    fn create_key_command(&self, key: &KeyValue) -> Result<String>;

    /// Read the value of `key`.
    fn load_key_command(&self, key: &Key) -> Result<String>;

    /// Delete `key`.
    fn delete_key_command(&self, key: &Key) -> Result<String>;

    /// Rename `key`.
    fn rename_key_command(&self, key: &Key, new_name: &str) -> Result<String>;

    /// Give `key` a new ttl.
    fn change_ttl_command(&self, key: &Key, ttl: Ttl) -> Result<String>;

    /// Ask for the remaining ttl of `key`.
    fn load_key_ttl_command(&self, key: &Key) -> Result<String>;

    /// Select another database.
    fn select_database_command(&self, name: &str) -> Result<String>;
}

/// Translator for the Redis command dialect.
///
/// Arguments are separated by single spaces, so names containing whitespace
/// can not be expressed.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisTranslator;

impl RedisTranslator {
    fn arg(token: &str) -> Result<&str> {
        if token.is_empty() || token.chars().any(char::is_whitespace) {
            return Err(BridgeError::Translation(format!(
                "invalid argument {token:?}"
            )));
        }
        Ok(token)
    }
}

impl Translator for RedisTranslator {
    fn create_key_command(&self, key: &KeyValue) -> Result<String> {
        let name = Self::arg(key.name())?;
        let value = Self::arg(key.value.as_deref().unwrap_or_default())?;
        match key.key.ttl {
            Ttl::NoExpiry => Ok(format!("SET {name} {value}")),
            Ttl::Remaining(secs) if secs > 0 => Ok(format!("SET {name} {value} EX {secs}")),
            ttl => Err(BridgeError::Translation(format!(
                "can not create key {name} with ttl {ttl}"
            ))),
        }
    }

    fn load_key_command(&self, key: &Key) -> Result<String> {
        Ok(format!("GET {}", Self::arg(&key.name)?))
    }

    fn delete_key_command(&self, key: &Key) -> Result<String> {
        Ok(format!("DEL {}", Self::arg(&key.name)?))
    }

    fn rename_key_command(&self, key: &Key, new_name: &str) -> Result<String> {
        Ok(format!(
            "RENAME {} {}",
            Self::arg(&key.name)?,
            Self::arg(new_name)?
        ))
    }

    fn change_ttl_command(&self, key: &Key, ttl: Ttl) -> Result<String> {
        let name = Self::arg(&key.name)?;
        match ttl {
            Ttl::NoExpiry => Ok(format!("PERSIST {name}")),
            Ttl::Expired => Ok(format!("DEL {name}")),
            Ttl::Remaining(secs) => Ok(format!("EXPIRE {name} {secs}")),
        }
    }

    fn load_key_ttl_command(&self, key: &Key) -> Result<String> {
        Ok(format!("TTL {}", Self::arg(&key.name)?))
    }

    fn select_database_command(&self, name: &str) -> Result<String> {
        Ok(format!("SELECT {}", Self::arg(name)?))
    }
}
