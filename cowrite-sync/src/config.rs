//! Server, session and persistence configuration.
//!
//! Every setting has a default; `ServerConfig::from_env` overrides them from
//! `COWRITE_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Session lifecycle settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Broadcast buffer per room member (frames)
    pub broadcast_capacity: usize,
    /// Maximum members per document room
    pub max_peers_per_room: usize,
    /// How long a memberless session stays in memory
    pub idle_grace: Duration,
    /// How often the reaper looks for idle sessions
    pub sweep_interval: Duration,
    /// Start from empty state when the store cannot be read, instead of
    /// failing the join
    pub skip_failed_hydration: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_peers_per_room: 100,
            idle_grace: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            skip_failed_hydration: false,
        }
    }
}

/// When snapshots are written besides explicit save requests.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Periodic save of dirty documents (None = explicit saves only)
    pub autosave_interval: Option<Duration>,
    /// Final save of a dirty session before it is evicted
    pub save_on_evict: bool,
    /// Save every dirty session on graceful shutdown
    pub save_on_shutdown: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            autosave_interval: None,
            save_on_evict: true,
            save_on_shutdown: false,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory store)
    pub storage_path: Option<PathBuf>,
    pub session: SessionConfig,
    pub persistence: PersistenceConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            session: SessionConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ServerConfig::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let session = SessionConfig {
            broadcast_capacity: parse_or(
                &get,
                "COWRITE_BROADCAST_CAPACITY",
                defaults.session.broadcast_capacity,
            )?,
            max_peers_per_room: parse_or(
                &get,
                "COWRITE_MAX_PEERS_PER_ROOM",
                defaults.session.max_peers_per_room,
            )?,
            idle_grace: Duration::from_secs(parse_or(
                &get,
                "COWRITE_IDLE_GRACE_SECS",
                defaults.session.idle_grace.as_secs(),
            )?),
            sweep_interval: Duration::from_secs(parse_positive(
                &get,
                "COWRITE_SWEEP_INTERVAL_SECS",
                defaults.session.sweep_interval.as_secs(),
            )?),
            skip_failed_hydration: parse_or(
                &get,
                "COWRITE_SKIP_FAILED_HYDRATION",
                defaults.session.skip_failed_hydration,
            )?,
        };

        let autosave_secs: u64 = parse_or(&get, "COWRITE_AUTOSAVE_SECS", 0)?;
        let persistence = PersistenceConfig {
            autosave_interval: (autosave_secs > 0).then(|| Duration::from_secs(autosave_secs)),
            save_on_evict: parse_or(
                &get,
                "COWRITE_SAVE_ON_EVICT",
                defaults.persistence.save_on_evict,
            )?,
            save_on_shutdown: parse_or(
                &get,
                "COWRITE_SAVE_ON_SHUTDOWN",
                defaults.persistence.save_on_shutdown,
            )?,
        };

        Ok(Self {
            bind_addr: get("COWRITE_BIND_ADDR").unwrap_or(defaults.bind_addr),
            storage_path: get("COWRITE_STORAGE_PATH").map(PathBuf::from),
            session,
            persistence,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

/// Like `parse_or`, but zero is rejected too.
fn parse_positive<G>(get: &G, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parse_or(get, key, default)? {
        0 => Err(ConfigError::InvalidValue {
            key,
            value: get(key).unwrap_or_default(),
        }),
        n => Ok(n),
    }
}
