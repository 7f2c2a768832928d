//! Configuration handling for the chat service.
//!
//! Configuration comes from a YAML file with environment-variable
//! overrides (`DUOLINK_*`). Durations in the file and in the environment
//! are humantime strings ("15s", "24h").

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Chat service configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Local participant id
    pub user_id: String,
    /// Remote participant id
    pub peer_id: String,
    /// Conversation id the two participants share
    pub conversation_id: String,
    /// Storage backend: "memory" or "file"
    pub storage_mode: String,
    /// Data directory for the file backend and outbox spill
    pub data_dir: String,
    /// Fsync frequency for the file backend
    pub fsync_every: u32,
    /// Interval between outbound heartbeats
    pub heartbeat_interval: Duration,
    /// Heartbeat intervals missed before a peer is offline
    pub offline_multiplier: u32,
    /// Interval between presence sweeps
    pub sweep_interval: Duration,
    /// Retention of offline presence entries
    pub prune_after: Duration,
    /// Per-tier connect deadline
    pub connect_timeout: Duration,
    /// Retry backoff base
    pub retry_base: Duration,
    /// Retry backoff ceiling
    pub retry_cap: Duration,
    /// Delivery attempts before a message is marked failed
    pub retry_max_attempts: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            user_id: "alice".to_string(),
            peer_id: "bob".to_string(),
            conversation_id: "default".to_string(),
            storage_mode: "memory".to_string(),
            data_dir: "./chatdata".to_string(),
            fsync_every: 1,
            heartbeat_interval: Duration::from_secs(15),
            offline_multiplier: 3,
            sweep_interval: Duration::from_secs(12),
            prune_after: Duration::from_secs(24 * 60 * 60),
            connect_timeout: Duration::from_millis(2500),
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(20),
            retry_max_attempts: 8,
        }
    }
}

/// YAML file structure; every field optional so a partial file works
#[derive(Debug, Deserialize)]
struct FileConfig {
    user_id: Option<String>,
    peer_id: Option<String>,
    conversation_id: Option<String>,
    storage: Option<StorageSection>,
    presence: Option<PresenceSection>,
    transport: Option<TransportSection>,
    retry: Option<RetrySection>,
}

#[derive(Debug, Deserialize)]
struct StorageSection {
    mode: Option<String>,
    data_dir: Option<String>,
    fsync_every: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PresenceSection {
    heartbeat_interval: Option<String>,
    offline_multiplier: Option<u32>,
    sweep_interval: Option<String>,
    prune_after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransportSection {
    connect_timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RetrySection {
    base: Option<String>,
    cap: Option<String>,
    max_attempts: Option<u32>,
}

impl ChatConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<FileConfig>(&content) {
                Ok(file_config) => {
                    config.apply_file_config(file_config)?;
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?}: {}; using defaults",
                        config_path.as_ref(),
                        e
                    );
                }
            }
        } else {
            warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        config.apply_environment_overrides()?;

        info!(
            "Final chat configuration: user={} peer={} conversation={} storage={}",
            config.user_id, config.peer_id, config.conversation_id, config.storage_mode
        );
        Ok(config)
    }

    fn apply_file_config(&mut self, file: FileConfig) -> Result<()> {
        if let Some(user_id) = file.user_id {
            self.user_id = user_id;
        }
        if let Some(peer_id) = file.peer_id {
            self.peer_id = peer_id;
        }
        if let Some(conversation_id) = file.conversation_id {
            self.conversation_id = conversation_id;
        }

        if let Some(storage) = file.storage {
            if let Some(mode) = storage.mode {
                self.storage_mode = mode;
            }
            if let Some(data_dir) = storage.data_dir {
                self.data_dir = data_dir;
            }
            if let Some(fsync_every) = storage.fsync_every {
                self.fsync_every = fsync_every.max(1);
            }
        }

        if let Some(presence) = file.presence {
            if let Some(value) = presence.heartbeat_interval {
                self.heartbeat_interval = parse_duration("presence.heartbeat_interval", &value)?;
            }
            if let Some(multiplier) = presence.offline_multiplier {
                self.offline_multiplier = multiplier.max(1);
            }
            if let Some(value) = presence.sweep_interval {
                self.sweep_interval = parse_duration("presence.sweep_interval", &value)?;
            }
            if let Some(value) = presence.prune_after {
                self.prune_after = parse_duration("presence.prune_after", &value)?;
            }
        }

        if let Some(transport) = file.transport {
            if let Some(value) = transport.connect_timeout {
                self.connect_timeout = parse_duration("transport.connect_timeout", &value)?;
            }
        }

        if let Some(retry) = file.retry {
            if let Some(value) = retry.base {
                self.retry_base = parse_duration("retry.base", &value)?;
            }
            if let Some(value) = retry.cap {
                self.retry_cap = parse_duration("retry.cap", &value)?;
            }
            if let Some(max_attempts) = retry.max_attempts {
                self.retry_max_attempts = max_attempts.max(1);
            }
        }

        Ok(())
    }

    fn apply_environment_overrides(&mut self) -> Result<()> {
        if let Ok(user_id) = std::env::var("DUOLINK_USER_ID") {
            info!("User id overridden by environment: {}", user_id);
            self.user_id = user_id;
        }
        if let Ok(peer_id) = std::env::var("DUOLINK_PEER_ID") {
            info!("Peer id overridden by environment: {}", peer_id);
            self.peer_id = peer_id;
        }
        if let Ok(conversation_id) = std::env::var("DUOLINK_CONVERSATION_ID") {
            self.conversation_id = conversation_id;
        }
        if let Ok(mode) = std::env::var("DUOLINK_STORAGE_MODE") {
            self.storage_mode = mode;
        }
        if let Ok(data_dir) = std::env::var("DUOLINK_DATA_DIR") {
            self.data_dir = data_dir;
        }
        if let Ok(value) = std::env::var("DUOLINK_HEARTBEAT_INTERVAL") {
            self.heartbeat_interval = parse_duration("DUOLINK_HEARTBEAT_INTERVAL", &value)?;
        }
        if let Ok(value) = std::env::var("DUOLINK_CONNECT_TIMEOUT") {
            self.connect_timeout = parse_duration("DUOLINK_CONNECT_TIMEOUT", &value)?;
        }
        if let Ok(value) = std::env::var("DUOLINK_RETRY_MAX_ATTEMPTS") {
            self.retry_max_attempts = value
                .parse::<u32>()
                .with_context(|| format!("invalid DUOLINK_RETRY_MAX_ATTEMPTS: {}", value))?
                .max(1);
        }
        Ok(())
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration for {}: {}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ChatConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.offline_multiplier, 3);
        assert_eq!(config.retry_max_attempts, 8);
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_partial_yaml_applies_over_defaults() {
        let mut config = ChatConfig::default();
        let file: FileConfig = serde_yaml::from_str(
            r#"
user_id: carol
presence:
  heartbeat_interval: 5s
retry:
  max_attempts: 4
"#,
        )
        .unwrap();
        config.apply_file_config(file).unwrap();

        assert_eq!(config.user_id, "carol");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.retry_max_attempts, 4);
        // Untouched fields keep defaults
        assert_eq!(config.peer_id, "bob");
    }

    #[test]
    fn test_bad_duration_rejected() {
        let mut config = ChatConfig::default();
        let file: FileConfig = serde_yaml::from_str(
            r#"
presence:
  heartbeat_interval: not-a-duration
"#,
        )
        .unwrap();
        assert!(config.apply_file_config(file).is_err());
    }
}
