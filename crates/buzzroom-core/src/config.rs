//! Coordination layer configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! environment variables. All durations are stored in milliseconds to match
//! the store's timestamp unit.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordError, Result};

/// Complete coordination configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CoordConfig {
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub rooms: RoomConfig,
    #[serde(default)]
    pub buzzer: BuzzerConfig,
}

/// Heartbeat presence tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceConfig {
    /// Interval between heartbeat writes.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat age past which a participant is no longer `Online`.
    pub stale_threshold_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            stale_threshold_ms: 25_000,
        }
    }
}

/// Room lifecycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomConfig {
    /// How long an absent owner keeps the room alive.
    pub owner_grace_ms: u64,
    /// Room expiry measured from creation.
    pub ttl_ms: u64,
    /// Generated room code length.
    pub code_length: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            owner_grace_ms: 120_000,
            ttl_ms: 12 * 60 * 60 * 1000,
            code_length: 4,
        }
    }
}

/// Arbitration lock and scoring tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuzzerConfig {
    /// Lockout after a wrong answer.
    pub lockout_ms: u64,
    /// Points awarded on a correct answer.
    pub correct_points: i64,
    /// Points deducted on a wrong answer (floored at zero).
    pub wrong_penalty: i64,
}

impl Default for BuzzerConfig {
    fn default() -> Self {
        Self {
            lockout_ms: 8_000,
            correct_points: 100,
            wrong_penalty: 25,
        }
    }
}

impl CoordConfig {
    /// Defaults, then `path` if it exists, then env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path
            && path.exists()
        {
            config = load_config_file(path)?;
        }
        apply_env_overrides(&mut config);
        Ok(config)
    }

    pub fn owner_grace(&self) -> Duration {
        Duration::from_millis(self.rooms.owner_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.presence.heartbeat_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.presence.stale_threshold_ms)
    }
}

fn load_config_file(path: &Path) -> Result<CoordConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CoordError::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&content).map_err(|e| {
        CoordError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut CoordConfig) {
    if let Ok(val) = std::env::var("BUZZROOM_OWNER_GRACE_MS")
        && let Ok(n) = val.parse()
    {
        config.rooms.owner_grace_ms = n;
    }
    if let Ok(val) = std::env::var("BUZZROOM_HEARTBEAT_INTERVAL_MS")
        && let Ok(n) = val.parse()
    {
        config.presence.heartbeat_interval_ms = n;
    }
    if let Ok(val) = std::env::var("BUZZROOM_LOCKOUT_MS")
        && let Ok(n) = val.parse()
    {
        config.buzzer.lockout_ms = n;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_grace_and_heartbeat() {
        let config = CoordConfig::default();
        assert_eq!(config.rooms.owner_grace_ms, 120_000);
        assert_eq!(config.presence.heartbeat_interval_ms, 15_000);
        assert_eq!(config.buzzer.lockout_ms, 8_000);
    }

    #[test]
    fn file_overrides_defaults_per_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[rooms]\nowner_grace_ms = 30000\nttl_ms = 1000\ncode_length = 6\n"
        )
        .unwrap();
        let config = CoordConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.rooms.owner_grace_ms, 30_000);
        assert_eq!(config.rooms.code_length, 6);
        // Sections absent from the file keep defaults.
        assert_eq!(config.presence.heartbeat_interval_ms, 15_000);
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rooms = 3").unwrap();
        let err = CoordConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, CoordError::Config(_)));
    }
}
