use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use tracing::{info, debug, error};

use crate::crawler::SpiderOptions;
use crate::downloader::names;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct CrawlerConfig {
    pub spider: SpiderOptions,
    pub agent: AgentSettings,
    pub bus: BusSettings,
    pub storage: StorageSettings,
}

/// Agent settings, overridden by `AGENT_ID` / `AGENT_NAME`
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub heartbeat_interval: u64,  // Seconds between heartbeats
    pub downloader: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            agent_id: None,
            agent_name: None,
            heartbeat_interval: 5,
            downloader: names::HTTP_CLIENT.to_string(),
        }
    }
}

/// Message bus settings, used when running distributed
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BusSettings {
    pub redis_url: String,
    pub message_ttl: u64, // Time to live for queued messages in seconds
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            message_ttl: 86400,
        }
    }
}

/// Storage settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StorageSettings {
    pub output_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
        }
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "spider-engine", "spider-engine") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Create the profiles directory if it doesn't exist
        path.push("profiles");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        path.pop();
        path
    }

    /// Reject settings no crawl can start with
    pub fn validate(&self) -> Result<()> {
        self.spider.validate().context("Invalid spider options")?;

        if self.agent.heartbeat_interval == 0 {
            anyhow::bail!("Agent heartbeat interval must be at least one second");
        }
        if self.agent.downloader.trim().is_empty() {
            anyhow::bail!("Agent downloader must be named");
        }
        Ok(())
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_path = Self::config_dir().join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        let profile_path = Self::config_dir().join("profiles").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load a profile when named, the default configuration otherwise
    pub fn load(profile: Option<&str>) -> Result<Self> {
        match profile {
            Some(profile) => Self::load_profile(profile),
            None => Self::load_default(),
        }
    }

    /// Load configuration from a file
    fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        self.save_to_file(&Self::config_dir().join("default.yaml"))
    }

    /// Save the configuration as a profile
    pub async fn save_as_profile(&self, profile: &str) -> Result<()> {
        let profile_path = Self::config_dir().join("profiles").join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub async fn list_profiles() -> Result<Vec<String>> {
        list_yaml_stems(&Self::config_dir().join("profiles"))
    }
}

fn list_yaml_stems(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut profiles = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
            if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                profiles.push(name.to_string());
            }
        }
    }

    profiles.sort();
    Ok(profiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerKind;

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("crawl.yaml");

        let mut config = CrawlerConfig::default();
        config.spider.depth = 2;
        config.spider.scheduler = SchedulerKind::Dfs;
        config.save_to_file(&path).unwrap();

        let loaded = CrawlerConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.yaml");
        fs::write(&path, "spider:\n  speed: 20\n  scheduler: redis_bfs\nbus:\n  redis_url: redis://cache:6379\n").unwrap();

        let config = CrawlerConfig::load_from_file(&path).unwrap();
        assert_eq!(config.spider.speed, 20.0);
        assert_eq!(config.spider.scheduler, SchedulerKind::RedisBfs);
        assert_eq!(config.spider.retried_times, 3);
        assert_eq!(config.bus.redis_url, "redis://cache:6379");
        assert_eq!(config.bus.message_ttl, 86400);
        assert_eq!(config.agent.heartbeat_interval, 5);
    }

    #[test]
    fn test_validate() {
        assert!(CrawlerConfig::default().validate().is_ok());

        let mut config = CrawlerConfig::default();
        config.spider.speed = 600.0;
        assert!(config.validate().is_err());

        let mut config = CrawlerConfig::default();
        config.agent.heartbeat_interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_list_yaml_stems() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("news.yaml"), "").unwrap();
        fs::write(dir.path().join("blog.yaml"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        assert_eq!(list_yaml_stems(dir.path()).unwrap(), vec!["blog", "news"]);
        assert!(list_yaml_stems(&dir.path().join("missing")).unwrap().is_empty());
    }
}
