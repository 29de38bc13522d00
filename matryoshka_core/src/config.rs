//! Instance configuration.
//!
//! Every tunable has a default matching the deployed game, so a config file
//! only needs the keys it changes:
//!
//! ```json
//! { "position_interval_ms": 100, "batch_siblings": true }
//! ```

use std::path::Path;
use std::time::Duration;

use matryoshka_env::Name;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::position::SequenceWindow;
use crate::space::{WorldGeometry, DEFAULT_DEPTH, DEFAULT_WORLD_BITS};

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables of one peer instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Owner prefix of every player name this peer publishes
    pub hub_prefix: String,
    
    /// Prefix of discovery requests
    pub broadcast_prefix: String,
    
    /// Octree levels (leaf = depth)
    pub octree_depth: usize,
    
    /// World extent is `2^world_bits` per axis
    pub world_bits: u32,
    
    /// Discovery subscriptions sit this many levels above the leaf
    pub subscription_levels_up: usize,
    
    /// Period of the discovery sweep
    pub broadcast_interval_ms: u64,
    
    /// Wait per discovery request
    pub broadcast_timeout_ms: u64,
    
    /// Ask for all tracked siblings of a parent in one Part-frame request
    pub batch_siblings: bool,
    
    /// Cache lifetime of discovery answers
    pub digest_freshness_secs: u64,
    
    /// Period of position polling and self-publish
    pub position_interval_ms: u64,
    
    /// Wait per position request
    pub position_timeout_ms: u64,
    
    /// Cache lifetime of position answers
    pub position_freshness_ms: u64,
    
    /// Sequence numbers wrap at this value
    pub sequence_window: u32,
    
    /// Largest "not produced yet" distance
    pub ahead_threshold: u32,
    
    /// Largest lag still served from history
    pub behind_threshold: u32,
    
    /// Times an ahead request is re-checked after one interval
    pub ahead_retries: u32,
    
    /// Consecutive timeouts tolerated before a drop
    pub drop_threshold: u32,
    
    /// Wait for the one-shot render info request
    pub info_timeout_ms: u64,
    
    /// Render descriptor served for the local player
    pub render_tag: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            hub_prefix: "/ndn/edu/ucla/remap/apps/Matryoshka".to_string(),
            broadcast_prefix: "/ndn/broadcast/apps/Matryoshka".to_string(),
            octree_depth: DEFAULT_DEPTH,
            world_bits: DEFAULT_WORLD_BITS,
            subscription_levels_up: 1,
            broadcast_interval_ms: 3000,
            broadcast_timeout_ms: 300,
            batch_siblings: false,
            digest_freshness_secs: 20,
            position_interval_ms: 200,
            position_timeout_ms: 800,
            position_freshness_ms: 1000,
            sequence_window: 1024,
            ahead_threshold: 3,
            behind_threshold: 20,
            ahead_retries: 1,
            drop_threshold: 20,
            info_timeout_ms: 1000,
            render_tag: "default".to_string(),
        }
    }
}

impl InstanceConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
    
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }
    
    /// Rejects combinations the protocols cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        self.geometry()?;
        self.hub_name()?;
        self.broadcast_name()?;
        if self.subscription_levels_up > self.octree_depth {
            return invalid("subscription_levels_up exceeds octree_depth");
        }
        if self.batch_siblings && self.subscription_levels_up == 0 {
            return invalid("batch_siblings needs subscriptions at least one level above the leaf");
        }
        if self.sequence_window < 4 {
            return invalid("sequence_window must be at least 4");
        }
        let thresholds = self.ahead_threshold.checked_add(self.behind_threshold);
        if self.ahead_threshold == 0 || thresholds.map_or(true, |sum| sum >= self.sequence_window) {
            return invalid("ahead/behind thresholds must leave room in the sequence window");
        }
        if self.broadcast_interval_ms == 0 || self.position_interval_ms == 0 {
            return invalid("intervals must be positive");
        }
        if self.broadcast_timeout_ms == 0 || self.position_timeout_ms == 0 {
            return invalid("timeouts must be positive");
        }
        if self.render_tag.chars().any(char::is_whitespace) {
            return invalid("render_tag may not contain whitespace");
        }
        Ok(())
    }
    
    pub fn geometry(&self) -> Result<WorldGeometry, ConfigError> {
        WorldGeometry::new(self.octree_depth, self.world_bits)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
    
    pub fn window(&self) -> SequenceWindow {
        SequenceWindow::new(self.sequence_window, self.ahead_threshold, self.behind_threshold)
    }
    
    pub fn hub_name(&self) -> Result<Name, ConfigError> {
        Name::parse(&self.hub_prefix).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
    
    pub fn broadcast_name(&self) -> Result<Name, ConfigError> {
        Name::parse(&self.broadcast_prefix).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
    
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }
    
    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }
    
    pub fn digest_freshness(&self) -> Duration {
        Duration::from_secs(self.digest_freshness_secs)
    }
    
    pub fn position_interval(&self) -> Duration {
        Duration::from_millis(self.position_interval_ms)
    }
    
    pub fn position_timeout(&self) -> Duration {
        Duration::from_millis(self.position_timeout_ms)
    }
    
    pub fn position_freshness(&self) -> Duration {
        Duration::from_millis(self.position_freshness_ms)
    }
    
    pub fn info_timeout(&self) -> Duration {
        Duration::from_millis(self.info_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_defaults() {
        let config = InstanceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.octree_depth, 7);
        assert_eq!(config.drop_threshold, 20);
        assert_eq!(config.window(), SequenceWindow::new(1024, 3, 20));
        assert_eq!(config.geometry().unwrap().leaf_size(), 512.0);
        assert!(config.broadcast_timeout() < config.broadcast_interval());
    }
    
    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = InstanceConfig::from_json_str(r#"{ "position_interval_ms": 100, "batch_siblings": true }"#).unwrap();
        assert_eq!(config.position_interval(), Duration::from_millis(100));
        assert!(config.batch_siblings);
        assert_eq!(config.sequence_window, 1024);
    }
    
    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            InstanceConfig::from_json_str(r#"{ "octree_depth": 30 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            InstanceConfig::from_json_str(r#"{ "sequence_window": 16, "behind_threshold": 20 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            InstanceConfig::from_json_str(r#"{ "render_tag": "two words" }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            InstanceConfig::from_json_str(r#"{ "batch_siblings": true, "subscription_levels_up": 0 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(InstanceConfig::from_json_str("{ nope"), Err(ConfigError::Parse(_))));
    }
    
    #[test]
    fn test_huge_thresholds_rejected_without_overflow() {
        let text = r#"{ "ahead_threshold": 4294967295, "behind_threshold": 4294967295 }"#;
        assert!(matches!(InstanceConfig::from_json_str(text), Err(ConfigError::Invalid(_))));
    }
    
    #[test]
    fn test_from_missing_file() {
        assert!(matches!(
            InstanceConfig::from_file("/definitely/not/here.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
