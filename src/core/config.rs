use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::errors::{HubError, Result};
use crate::project::Version;

/// Hub runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Highest project required version this environment accepts
    pub supported_version: Version,
    /// Bound on waiting for a child process handle and its handshake
    pub handshake_timeout_secs: u64,
    /// Capacity of the hub state event broadcast channel
    pub event_capacity: usize,
    /// Overrides the JAVA_HOME passed to child processes
    pub java_home: Option<PathBuf>,
    /// Child participants brought up before the hub initializes
    pub participants: Vec<ParticipantConfig>,
    /// Error lines shown in a continuation request
    pub continue_detail_lines: usize,
}

/// A child-process participant launched at hub startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantConfig {
    pub id: String,
    pub executable: PathBuf,
    #[serde(default)]
    pub java_options: Vec<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// When false the launcher passes `--no-autorun`
    #[serde(default = "default_autorun")]
    pub autorun: bool,
}

fn default_autorun() -> bool {
    true
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            supported_version: Version::current(),
            handshake_timeout_secs: 30,
            event_capacity: 64,
            java_home: None,
            participants: Vec::new(),
            continue_detail_lines: crate::core::errors::DETAIL_LINES,
        }
    }
}

impl HubConfig {
    pub fn builder() -> HubConfigBuilder {
        HubConfigBuilder::new()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.handshake_timeout_secs == 0 {
            return Err(HubError::configuration_field(
                "handshake_timeout_secs must be greater than 0",
                "handshake_timeout_secs",
            ));
        }
        if self.event_capacity == 0 {
            return Err(HubError::configuration_field(
                "event_capacity must be greater than 0",
                "event_capacity",
            ));
        }
        if self.continue_detail_lines == 0 {
            return Err(HubError::configuration_field(
                "continue_detail_lines must be greater than 0",
                "continue_detail_lines",
            ));
        }

        let mut seen = HashSet::new();
        for participant in &self.participants {
            if participant.id.trim().is_empty() {
                return Err(HubError::configuration_field(
                    "participant id cannot be empty",
                    "participants",
                ));
            }
            if !seen.insert(participant.id.as_str()) {
                return Err(HubError::configuration_field(
                    format!("duplicate participant id: {}", participant.id),
                    "participants",
                ));
            }
        }

        Ok(())
    }

    /// Parse and validate a YAML configuration document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: HubConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| HubError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&content)
    }

    /// Create a configuration suited to tests: short timeouts, no participants
    pub fn development() -> Self {
        Self {
            handshake_timeout_secs: 5,
            ..Default::default()
        }
    }
}

/// Builder for HubConfig
pub struct HubConfigBuilder {
    config: HubConfig,
}

impl HubConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HubConfig::default(),
        }
    }

    pub fn supported_version(mut self, version: Version) -> Self {
        self.config.supported_version = version;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn java_home(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.java_home = Some(path.into());
        self
    }

    pub fn participant(mut self, participant: ParticipantConfig) -> Self {
        self.config.participants.push(participant);
        self
    }

    pub fn continue_detail_lines(mut self, lines: usize) -> Self {
        self.config.continue_detail_lines = lines;
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<HubConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for HubConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        let config = HubConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.handshake_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
supported_version: "5.2.0"
handshake_timeout_secs: 10
participants:
  - id: slave-1
    executable: /opt/live/bin/live-player
    java_options: ["-Xmx512m"]
    autorun: false
"#;
        let config = HubConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.supported_version, Version::new(5, 2, 0));
        assert_eq!(config.handshake_timeout_secs, 10);
        assert_eq!(config.event_capacity, 64);
        assert_eq!(config.participants.len(), 1);
        assert!(!config.participants[0].autorun);
        assert!(config.participants[0].arguments.is_empty());
    }

    #[test]
    fn test_duplicate_participants_rejected() {
        let participant = ParticipantConfig {
            id: "p".into(),
            executable: "/bin/true".into(),
            java_options: vec![],
            arguments: vec![],
            autorun: true,
        };
        let result = HubConfig::builder()
            .participant(participant.clone())
            .participant(participant)
            .build();
        assert!(matches!(result, Err(HubError::Configuration { .. })));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = HubConfig::builder().event_capacity(0).build();
        assert!(result.is_err());
    }
}
