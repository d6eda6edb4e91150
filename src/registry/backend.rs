//! Backend (droplet) records and routing keys.
//!
//! # Responsibilities
//! - Represent one registered application instance
//! - Normalize routable hostnames
//! - Decode registration messages from the bus

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identity of a backend: its "host:port".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(String);

impl BackendId {
    /// Id of the backend at `host:port`.
    pub fn new(host: &str, port: u16) -> Self {
        Self(format!("{}:{}", host, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Routable hostname, always stored lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    /// Normalized uri. Hosts compare case-insensitively.
    pub fn new(host: &str) -> Self {
        Self(host.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uri {
    fn from(host: &str) -> Self {
        Self::new(host)
    }
}

/// A single registered application instance.
///
/// The record is shared (`Arc<Backend>`) between the registry indexes and any
/// in-flight request that resolved it, so it stays valid after being pruned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub id: BackendId,
    pub application_id: String,
    pub host: String,
    pub port: u16,
    pub tags: HashMap<String, String>,
    pub private_instance_id: String,
}

impl Backend {
    /// Backend described by a registration for `id`.
    pub(crate) fn from_message(id: BackendId, message: &RegistryMessage) -> Self {
        Self {
            id,
            application_id: message.app.clone(),
            host: message.host.clone(),
            port: message.port,
            tags: message.tags.clone(),
            private_instance_id: message.private_instance_id.clone(),
        }
    }

    /// The "host:port" requests are forwarded to.
    pub fn canonical_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The `component` tag, used to bucket varz metrics.
    pub fn component(&self) -> Option<&str> {
        self.tags.get("component").map(String::as_str)
    }
}

impl Serialize for Backend {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical_addr())
    }
}

/// Payload of `router.register` / `router.unregister`.
///
/// Missing and `null` fields both decode to their zero value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RegistryMessage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub host: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub port: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub uris: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub app: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub private_instance_id: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl RegistryMessage {
    /// Identity of the backend this message refers to, if it names one.
    pub fn backend_id(&self) -> Option<BackendId> {
        if self.host.is_empty() || self.port == 0 {
            return None;
        }
        Some(BackendId::new(&self.host, self.port))
    }

    /// Decode a bus payload.
    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
