//! # Configuration
//!
//! One TOML file configures the whole gateway. Every section and field has a default,
//! so a missing file or a partial file still yields a runnable configuration.

use crate::mqtt::config::MqttConfig;
use crate::provisioning::{self, ProvisioningError};
use crate::publisher::PublisherSettings;
use crate::store::MergePolicy;
use crate::topic::{ClassificationError, MessageKind, Scope};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const CONFIG_DIR: &str = "lightpost-sim";
const CONFIG_FILE: &str = "lightpost.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub gateway: GatewayConfig,
    pub mqtt: MqttConfig,
    pub provisioning: ProvisioningConfig,
    pub timed_publishing: TimedPublishingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            gateway: GatewayConfig::default(),
            mqtt: MqttConfig::default(),
            provisioning: ProvisioningConfig::default(),
            timed_publishing: TimedPublishingConfig::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_topic: String,
    /// Reject config keys a record does not have yet instead of inserting them.
    pub strict_schema: bool,
    /// Directory for record files. Without it records live in memory only.
    pub data_dir: Option<PathBuf>,
    /// Publish the core snapshot on `act_value` once the service is up.
    pub announce_on_start: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_topic: "d2mesh/gate2DB48EC0".to_string(),
            strict_schema: false,
            data_dir: None,
            announce_on_start: true,
        }
    }
}

impl GatewayConfig {
    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy::from_strict_schema(self.strict_schema)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Plain text tag list, one tag per line.
    pub tags_file: Option<PathBuf>,
    /// Base identifier for generated tags, used with `start` and `end`.
    pub base_tag: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    /// Optional inclusive lexicographic window applied after loading.
    pub select_from: Option<String>,
    pub select_to: Option<String>,
}

impl ProvisioningConfig {
    /// Known tag universe: the tag file if configured, otherwise the generated range,
    /// otherwise empty. The selection window is applied last.
    pub fn resolve_tags(&self) -> Result<Vec<String>, ProvisioningError> {
        let tags = if let Some(path) = &self.tags_file {
            provisioning::load_tag_file(path)?
        } else if let Some(base) = &self.base_tag {
            let start = self.start.as_deref().unwrap_or("0000");
            let end = self.end.as_deref().unwrap_or(start);
            provisioning::generate_tags(base, start, end)?
        } else {
            Vec::new()
        };

        Ok(match (&self.select_from, &self.select_to) {
            (Some(from), Some(to)) => provisioning::select_range(&tags, from, to),
            _ => tags,
        })
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TimedPublishingConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub kind: MessageKind,
    /// `core` or device tags. Empty means every known tag.
    pub targets: Vec<String>,
}

impl Default for TimedPublishingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 60,
            kind: MessageKind::ActValue,
            targets: Vec::new(),
        }
    }
}

impl TimedPublishingConfig {
    pub fn settings(&self) -> Result<PublisherSettings, ClassificationError> {
        let targets = self
            .targets
            .iter()
            .map(|target| target.parse::<Scope>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PublisherSettings {
            interval: Duration::from_secs(self.interval_secs),
            targets,
            kind: self.kind,
        })
    }
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            warn!("Config file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::parse(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config file: {}", e))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}
