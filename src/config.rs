//! Configuration management for voice-chatbot-rs.
//!
//! Loads config from YAML files in standard locations. Every field has a
//! default, so a missing or partial file is fine.

use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

const CONFIG_FILE: &str = "config.yaml";
const APP_DIR: &str = "voice-chatbot";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub host: String,
    pub temperature: Option<f32>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".into(),
            temperature: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub enabled: bool,
    pub lang: String,
    pub slow: bool,
    pub tld: String,
    /// Overrides the batchexecute URL derived from `tld` when non-empty.
    pub endpoint: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lang: "en".into(),
            slow: false,
            tld: "com".into(),
            endpoint: String::new(),
        }
    }
}

impl TtsConfig {
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.is_empty() {
            format!(
                "https://translate.google.{}/_/TranslateWebserverUi/data/batchexecute",
                self.tld
            )
        } else {
            self.endpoint.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub command: String,
    pub args: Vec<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            command: "mpg123".into(),
            args: vec!["-q".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextsConfig {
    pub dir: PathBuf,
}

impl Default for ContextsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("contexts"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ollama: OllamaConfig,
    pub tts: TtsConfig,
    pub playback: PlaybackConfig,
    pub contexts: ContextsConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_yml::Error,
    },
}

impl Config {
    /// Load configuration, falling back to defaults when no file is found or
    /// the file cannot be used.
    ///
    /// Without an explicit `path`, the first existing file among
    /// [`Config::search_paths`] is used.
    pub fn load(path: Option<&Path>) -> Self {
        let found = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::search_paths().into_iter().find(|p| p.exists()),
        };
        let Some(found) = found else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        Self::from_file(&found).unwrap_or_else(|e| {
            warn!("{e}, using defaults");
            Self::default()
        })
    }

    /// `./config.yaml`, `<user config dir>/voice-chatbot/config.yaml`,
    /// `/etc/voice-chatbot/config.yaml`, in that order.
    pub fn search_paths() -> Vec<PathBuf> {
        let local = std::env::current_dir().ok().map(|d| d.join(CONFIG_FILE));
        let user = dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE));
        let system = Some(Path::new("/etc").join(APP_DIR).join(CONFIG_FILE));
        [local, user, system].into_iter().flatten().collect()
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn parse(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}
