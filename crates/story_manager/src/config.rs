use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoryError};

/// Where a recalculation starts replaying from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    /// Always reset to Genesis and replay the whole event range, even when a
    /// usable branch snapshot exists.
    #[default]
    AlwaysGenesis,
    /// Start from the nearest exact branch snapshot when one qualifies.
    NearestSnapshot,
}

impl std::str::FromStr for ReplayPolicy {
    type Err = StoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always_genesis" | "genesis" => Ok(ReplayPolicy::AlwaysGenesis),
            "nearest_snapshot" | "snapshot" => Ok(ReplayPolicy::NearestSnapshot),
            other => Err(StoryError::Config(format!("unknown replay policy '{}'", other))),
        }
    }
}

/// Engine configuration, injected at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Turn period between branch snapshots.
    pub snapshot_interval: usize,
    pub schema_version: u32,
    pub replay_policy: ReplayPolicy,
    /// Tag name of the delimited event block, without angle brackets.
    pub event_block_tag: String,
    /// Field holding the event list inside the block.
    pub events_field: String,
    /// World-state namespaces that are reset from Genesis and rebuilt by replay.
    pub replayed_namespaces: Vec<String>,
    /// Log every dispatched event at info level.
    pub verbose_dispatch: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 20,
            schema_version: 1,
            replay_policy: ReplayPolicy::AlwaysGenesis,
            event_block_tag: "statusbar".to_string(),
            events_field: "events".to_string(),
            replayed_namespaces: vec!["world".to_string(), "characters".to_string()],
            verbose_dispatch: false,
        }
    }
}

fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl EngineConfig {
    /// Load from an optional TOML file, then apply `STORY_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<EngineConfig>(&content).map_err(|e| {
                    StoryError::Config(format!("{}: {}", path.display(), e))
                })?
            }
            Some(path) => {
                tracing::warn!(
                    path = %path.display(),
                    "EngineConfig: Config file not found, using defaults"
                );
                EngineConfig::default()
            }
            None => EngineConfig::default(),
        };

        if let Ok(interval) = std::env::var("STORY_SNAPSHOT_INTERVAL") {
            config.snapshot_interval = interval.trim().parse().map_err(|_| {
                StoryError::Config(format!("STORY_SNAPSHOT_INTERVAL is not a number: {}", interval))
            })?;
        }
        if let Ok(version) = std::env::var("STORY_SCHEMA_VERSION") {
            config.schema_version = version.trim().parse().map_err(|_| {
                StoryError::Config(format!("STORY_SCHEMA_VERSION is not a number: {}", version))
            })?;
        }
        if let Ok(policy) = std::env::var("STORY_REPLAY_POLICY") {
            config.replay_policy = policy.parse()?;
        }
        if let Ok(verbose) = std::env::var("STORY_VERBOSE_DISPATCH") {
            config.verbose_dispatch = parse_bool_env(&verbose);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.snapshot_interval == 0 {
            return Err(StoryError::Config(
                "snapshot_interval must be greater than zero".to_string(),
            ));
        }
        if self.event_block_tag.trim().is_empty() {
            return Err(StoryError::Config("event_block_tag cannot be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_bool_env_true_values() {
        for value in ["1", "true", "TRUE", " yes ", "Y", "on"] {
            assert!(parse_bool_env(value), "value {value:?} should be true");
        }
    }

    #[test]
    fn parse_bool_env_false_values() {
        for value in ["0", "false", "no", "off", "", "  "] {
            assert!(!parse_bool_env(value), "value {value:?} should be false");
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.snapshot_interval, 20);
        assert_eq!(config.replay_policy, ReplayPolicy::AlwaysGenesis);
        assert_eq!(config.replayed_namespaces, vec!["world", "characters"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "snapshot_interval = 5\nreplay_policy = \"nearest_snapshot\"").unwrap();

        let config: EngineConfig =
            toml::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        assert_eq!(config.snapshot_interval, 5);
        assert_eq!(config.replay_policy, ReplayPolicy::NearestSnapshot);
        assert_eq!(config.event_block_tag, "statusbar");
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = EngineConfig {
            snapshot_interval: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StoryError::Config(_))));
    }

    #[test]
    fn replay_policy_parses_aliases() {
        assert_eq!("genesis".parse::<ReplayPolicy>().unwrap(), ReplayPolicy::AlwaysGenesis);
        assert_eq!(
            "Nearest_Snapshot".parse::<ReplayPolicy>().unwrap(),
            ReplayPolicy::NearestSnapshot
        );
        assert!("sometimes".parse::<ReplayPolicy>().is_err());
    }
}
