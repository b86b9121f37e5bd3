//! The control message shared by both the A⇄B and C⇄B control planes.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// A command with a flat string-to-string payload.
///
/// `Data` is never null on the wire; a `null` or absent value is always
/// materialized as an empty map before dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(default)]
    pub cmd: String,
    #[serde(default, deserialize_with = "null_default")]
    pub data: HashMap<String, String>,
}

/// Treats a `null` JSON value the same as an absent field.
fn null_default<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

impl Packet {
    /// Build a command packet with no data.
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            data: HashMap::new(),
        }
    }

    /// Build a command packet from an iterator of key/value pairs.
    pub fn with_data<I, K, V>(cmd: impl Into<String>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            cmd: cmd.into(),
            data: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Fetch a `Data` field by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Set a `Data` field.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), value.into());
    }
}
