//! Service registry shared by game servers and the matchmaker
//!
//! Every game server publishes two keys in a shared key/value store:
//! `<name>.endpoint` holding `{"ip": .., "port": ..}` and `<name>.player_count`
//! holding a decimal counter. The matchmaker scans for `*.endpoint` keys and
//! rebuilds its view of live servers from whatever it finds.

use crate::protocol::{from_bytes, Endpoint};
use log::{debug, info, warn};
use redis::Commands;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const ENDPOINT_SUFFIX: &str = ".endpoint";
pub const PLAYER_COUNT_SUFFIX: &str = ".player_count";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Registry store unavailable: {0}")]
    Store(String),

    #[error("Malformed registry entry {key}: {reason}")]
    Malformed { key: String, reason: String },
}

/// Minimal key/value surface the registry needs.
///
/// Calls may block on a network round trip; async callers should run them on
/// a blocking thread.
pub trait KeyValueStore: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<(), DiscoveryError>;
    fn get(&self, key: &str) -> Result<Option<String>, DiscoveryError>;
    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), DiscoveryError>;
    /// Adds `delta` to an integer value, treating a missing key as zero.
    fn increment(&self, key: &str, delta: i64) -> Result<i64, DiscoveryError>;
    /// Keys matching a glob pattern where `*` matches any run of characters.
    fn scan(&self, pattern: &str) -> Result<Vec<String>, DiscoveryError>;
}

/// In-process store for tests and single-host setups.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, DiscoveryError> {
        self.entries
            .lock()
            .map_err(|_| DiscoveryError::Store("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn set(&self, key: &str, value: &str) -> Result<(), DiscoveryError> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, DiscoveryError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), DiscoveryError> {
        self.entries()?.remove(key);
        Ok(())
    }

    fn increment(&self, key: &str, delta: i64) -> Result<i64, DiscoveryError> {
        let mut entries = self.entries()?;
        let current = match entries.get(key) {
            Some(value) => value.parse::<i64>().map_err(|e| DiscoveryError::Malformed {
                key: key.to_string(),
                reason: e.to_string(),
            })?,
            None => 0,
        };
        let updated = current + delta;
        entries.insert(key.to_string(), updated.to_string());
        Ok(updated)
    }

    fn scan(&self, pattern: &str) -> Result<Vec<String>, DiscoveryError> {
        Ok(self
            .entries()?
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }
}

fn glob_match(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or("");
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // No wildcard at all.
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

/// Store backed by a Redis server.
pub struct RedisStore {
    connection: Mutex<redis::Connection>,
}

impl RedisStore {
    pub fn open(url: &str) -> Result<Self, DiscoveryError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection()?;
        info!("Connected to registry at {}", url);
        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    fn connection(&self) -> Result<std::sync::MutexGuard<'_, redis::Connection>, DiscoveryError> {
        self.connection
            .lock()
            .map_err(|_| DiscoveryError::Store("redis connection lock poisoned".to_string()))
    }
}

impl KeyValueStore for RedisStore {
    fn set(&self, key: &str, value: &str) -> Result<(), DiscoveryError> {
        let _: () = self.connection()?.set(key, value)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, DiscoveryError> {
        Ok(self.connection()?.get(key)?)
    }

    fn delete(&self, key: &str) -> Result<(), DiscoveryError> {
        let _: i64 = self.connection()?.del(key)?;
        Ok(())
    }

    fn increment(&self, key: &str, delta: i64) -> Result<i64, DiscoveryError> {
        Ok(self.connection()?.incr(key, delta)?)
    }

    fn scan(&self, pattern: &str) -> Result<Vec<String>, DiscoveryError> {
        let mut connection = self.connection()?;
        let keys: Vec<String> = connection.scan_match::<_, String>(pattern)?.collect();
        Ok(keys)
    }
}

/// A live game server as seen through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub player_count: i64,
}

impl ServerDescriptor {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.ip.clone(), self.port)
    }
}

/// A game server's entry in the registry, removed on [`deregister`](Self::deregister) or drop.
pub struct ServiceRegistration {
    store: Arc<dyn KeyValueStore>,
    name: String,
    registered: AtomicBool,
}

impl ServiceRegistration {
    /// Publishes the endpoint and resets the player counter to zero.
    pub fn register(
        store: Arc<dyn KeyValueStore>,
        name: impl Into<String>,
        endpoint: &Endpoint,
    ) -> Result<Self, DiscoveryError> {
        let name = name.into();
        let json = serde_json::to_string(endpoint).map_err(|e| DiscoveryError::Malformed {
            key: endpoint_key(&name),
            reason: e.to_string(),
        })?;

        store.set(&endpoint_key(&name), &json)?;
        store.set(&player_count_key(&name), "0")?;
        info!("Registered server '{}' at {}", name, endpoint.address());

        Ok(Self {
            store,
            name,
            registered: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn player_joined(&self) -> Result<i64, DiscoveryError> {
        self.store.increment(&player_count_key(&self.name), 1)
    }

    pub fn player_left(&self) -> Result<i64, DiscoveryError> {
        self.store.increment(&player_count_key(&self.name), -1)
    }

    /// Removes both keys. Calling this more than once is a no-op.
    pub fn deregister(&self) -> Result<(), DiscoveryError> {
        if !self.registered.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.store.delete(&endpoint_key(&self.name))?;
        self.store.delete(&player_count_key(&self.name))?;
        info!("Deregistered server '{}'", self.name);
        Ok(())
    }
}

impl Drop for ServiceRegistration {
    fn drop(&mut self) {
        if let Err(e) = self.deregister() {
            warn!("Failed to deregister server '{}': {}", self.name, e);
        }
    }
}

pub fn endpoint_key(name: &str) -> String {
    format!("{}{}", name, ENDPOINT_SUFFIX)
}

pub fn player_count_key(name: &str) -> String {
    format!("{}{}", name, PLAYER_COUNT_SUFFIX)
}

/// Reads every registered server from the store.
///
/// Entries that vanish mid-scan or cannot be parsed are skipped; only a
/// failure of the store itself is an error.
pub fn scan_servers(store: &dyn KeyValueStore) -> Result<Vec<ServerDescriptor>, DiscoveryError> {
    let mut servers = Vec::new();

    for key in store.scan(&format!("*{}", ENDPOINT_SUFFIX))? {
        let Some(name) = key.strip_suffix(ENDPOINT_SUFFIX) else {
            continue;
        };

        let Some(raw_endpoint) = store.get(&key)? else {
            continue;
        };
        let endpoint: Endpoint = match from_bytes(raw_endpoint.as_bytes()) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!("Skipping registry entry {}: {}", key, e);
                continue;
            }
        };

        let Some(raw_count) = store.get(&player_count_key(name))? else {
            debug!("Skipping '{}': no player count yet", name);
            continue;
        };
        let player_count = match raw_count.trim().parse::<i64>() {
            Ok(count) => count,
            Err(e) => {
                warn!("Skipping registry entry {}: {}", player_count_key(name), e);
                continue;
            }
        };

        servers.push(ServerDescriptor {
            name: name.to_string(),
            ip: endpoint.ip,
            port: endpoint.port,
            player_count,
        });
    }

    Ok(servers)
}
