//! Configuration
//!
//! Plain serde structs with defaults. Loadable from YAML or from the
//! environment (`.env` honoured via dotenv).

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RankError, RankResult};
use crate::model::Rank;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Where positions start. Selects the sentinel too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankOrigin {
    /// Positions `1..=N`, sentinel `0`.
    #[default]
    One,
    /// Positions `0..=N-1`, sentinel `-1`.
    Zero,
}

impl RankOrigin {
    pub fn first(&self) -> Rank {
        match self {
            RankOrigin::One => 1,
            RankOrigin::Zero => 0,
        }
    }

    /// Reserved "not yet placed / mid-operation" value.
    pub fn sentinel(&self) -> Rank {
        self.first() - 1
    }

    /// Reflection pivot for parking: `rank -> pivot - rank` lands every real
    /// rank strictly below the sentinel.
    pub fn pivot(&self) -> Rank {
        2 * self.sentinel()
    }

    pub fn is_placed(&self, rank: Rank) -> bool {
        rank >= self.first()
    }
}

impl std::str::FromStr for RankOrigin {
    type Err = RankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "one" | "1" => Ok(RankOrigin::One),
            "zero" | "0" => Ok(RankOrigin::Zero),
            other => Err(RankError::Config(format!("unknown rank origin '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub origin: RankOrigin,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    #[default]
    Wal,
    Delete,
}

impl JournalMode {
    pub fn pragma_value(&self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// How long a writer waits for the database lock before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub journal_mode: JournalMode,
}

impl SqliteConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            journal_mode: JournalMode::default(),
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Upper bound on any single row-lock wait.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl MemoryConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
        }
    }
}

fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankedConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sqlite: Option<SqliteConfig>,
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl RankedConfig {
    pub fn from_yaml_str(yaml: &str) -> RankResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: impl AsRef<Path>) -> RankResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RankError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
    }

    /// Defaults overridden by `RANKED_*` environment variables.
    pub fn from_env() -> RankResult<Self> {
        dotenv::dotenv().ok();

        let mut config = Self::default();
        if let Ok(origin) = env::var("RANKED_ORIGIN") {
            config.engine.origin = origin.parse()?;
        }
        if let Ok(path) = env::var("RANKED_DB_PATH") {
            let mut sqlite = SqliteConfig::new(path);
            if let Ok(ms) = env::var("RANKED_BUSY_TIMEOUT_MS") {
                sqlite.busy_timeout_ms = parse_millis("RANKED_BUSY_TIMEOUT_MS", &ms)?;
            }
            config.sqlite = Some(sqlite);
        }
        if let Ok(ms) = env::var("RANKED_LOCK_TIMEOUT_MS") {
            config.memory.lock_timeout_ms = parse_millis("RANKED_LOCK_TIMEOUT_MS", &ms)?;
        }
        Ok(config)
    }
}

fn parse_millis(name: &str, value: &str) -> RankResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| RankError::Config(format!("{} must be a whole number of milliseconds, got '{}'", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_derived_values() {
        assert_eq!(RankOrigin::One.first(), 1);
        assert_eq!(RankOrigin::One.sentinel(), 0);
        assert_eq!(RankOrigin::One.pivot(), 0);
        assert_eq!(RankOrigin::Zero.first(), 0);
        assert_eq!(RankOrigin::Zero.sentinel(), -1);
        assert_eq!(RankOrigin::Zero.pivot(), -2);

        // parked values stay strictly below the sentinel
        for origin in [RankOrigin::One, RankOrigin::Zero] {
            let parked = origin.pivot() - origin.first();
            assert!(parked < origin.sentinel());
        }
    }

    #[test]
    fn test_yaml_with_defaults() {
        let config = RankedConfig::from_yaml_str(
            "engine:\n  origin: zero\nsqlite:\n  path: /tmp/ranked.db\n",
        )
        .unwrap();
        assert_eq!(config.engine.origin, RankOrigin::Zero);
        let sqlite = config.sqlite.unwrap();
        assert_eq!(sqlite.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
        assert_eq!(sqlite.journal_mode, JournalMode::Wal);
        assert_eq!(config.memory.lock_timeout_ms, DEFAULT_LOCK_TIMEOUT_MS);
    }

    #[test]
    fn test_bad_yaml_is_config_error() {
        let err = RankedConfig::from_yaml_str("engine:\n  origin: sideways\n").unwrap_err();
        assert!(matches!(err, RankError::Config(_)));
    }

    #[test]
    fn test_origin_parsing() {
        assert_eq!("Zero".parse::<RankOrigin>().unwrap(), RankOrigin::Zero);
        assert_eq!("1".parse::<RankOrigin>().unwrap(), RankOrigin::One);
        assert!("two".parse::<RankOrigin>().is_err());
    }
}
