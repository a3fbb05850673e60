//! Configuration file support

use nexus_api::{Capabilities, ModelOverrides};
use nexus_chat::ChatConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Server used when nothing else names one
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8000";

/// Configuration for nexus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the analytics backend
    pub server_url: Option<String>,
    /// Bearer token for the backend
    pub token: Option<String>,
    /// Model the agent should use
    pub model: Option<String>,
    /// Base URL of the model provider
    pub base_url: Option<String>,
    /// API key for the model provider
    pub api_key: Option<String>,
    /// Upper bound on agent tool rounds per turn
    pub tool_round_budget: u32,
    /// Number of prior messages sent with each turn
    pub history_window: usize,
    pub features: Features,
}

/// Agent capability switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub rag: bool,
    pub memory: bool,
    /// Run generated queries without asking first
    pub auto_execute: bool,
    pub sql_expert: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            rag: false,
            memory: false,
            auto_execute: true,
            sql_expert: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: None,
            token: None,
            model: None,
            base_url: None,
            api_key: None,
            tool_round_budget: 12,
            history_window: 10,
            features: Features::default(),
        }
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nexus")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("NEXUS_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match Self::parse(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {}", path.display(), e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            server_url: Some(DEFAULT_SERVER_URL.to_string()),
            ..Config::default()
        };

        default_config.save()?;
        Ok(path)
    }

    /// Server URL: flag, then file, then `NEXUS_SERVER_URL`
    pub fn server_url(&self, flag: Option<String>) -> String {
        first_set(
            flag,
            self.server_url.clone(),
            std::env::var("NEXUS_SERVER_URL").ok(),
        )
        .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
    }

    /// Bearer token: flag, then file, then `NEXUS_TOKEN`
    pub fn token(&self, flag: Option<String>) -> Option<String> {
        first_set(flag, self.token.clone(), std::env::var("NEXUS_TOKEN").ok())
    }

    /// Resolve the chat configuration, with an optional model override
    pub fn chat_config(&self, model: Option<String>) -> ChatConfig {
        ChatConfig {
            model: ModelOverrides {
                api_key: self.api_key.clone(),
                base_url: self.base_url.clone(),
                model: model.or_else(|| self.model.clone()),
            },
            capabilities: Capabilities {
                retrieval: self.features.rag,
                memory: self.features.memory,
                auto_execute: self.features.auto_execute,
                enhanced_generation: self.features.sql_expert,
            },
            tool_round_budget: self.tool_round_budget,
            history_window: self.history_window,
        }
    }
}

/// First non-empty value in precedence order
fn first_set(
    flag: Option<String>,
    file: Option<String>,
    env: Option<String>,
) -> Option<String> {
    [flag, file, env]
        .into_iter()
        .flatten()
        .find(|v| !v.trim().is_empty())
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# nexus configuration file
# Place at ~/.config/nexus/config.toml (Linux) or set NEXUS_CONFIG_PATH

# Analytics backend (NEXUS_SERVER_URL is used when unset)
server_url = "http://localhost:8000"

# Bearer token (NEXUS_TOKEN is used when unset)
# token = "..."

# Model settings forwarded to the agent (optional)
# model = "deepseek-chat"
# base_url = "https://api.deepseek.com"
# api_key = "sk-..."

# Upper bound on tool rounds per turn
tool_round_budget = 12

# Number of prior messages sent with each question
history_window = 10

[features]
# Retrieval-augmented context from the knowledge base
rag = false
# Long-term user memory
memory = false
# Run generated SQL without asking; set to false to approve each query
auto_execute = true
# Enhanced multi-candidate SQL generation
sql_expert = false
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.tool_round_budget, 12);
        assert_eq!(config.history_window, 10);
        assert!(config.features.auto_execute);
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::parse(example_config()).unwrap();
        assert_eq!(config.server_url.as_deref(), Some(DEFAULT_SERVER_URL));
        assert!(config.token.is_none());
    }

    #[test]
    fn test_features_map_to_capabilities() {
        let config = Config::parse(
            r#"
model = "m1"
history_window = 4

[features]
rag = true
auto_execute = false
"#,
        )
        .unwrap();
        let chat = config.chat_config(None);
        assert!(chat.capabilities.retrieval);
        assert!(!chat.capabilities.memory);
        assert!(!chat.capabilities.auto_execute);
        assert_eq!(chat.history_window, 4);
        assert_eq!(chat.model.model.as_deref(), Some("m1"));

        let overridden = config.chat_config(Some("m2".into()));
        assert_eq!(overridden.model.model.as_deref(), Some("m2"));
    }

    #[test]
    fn test_precedence() {
        let pick = |f: Option<&str>, c: Option<&str>, e: Option<&str>| {
            first_set(f.map(Into::into), c.map(Into::into), e.map(Into::into))
        };
        assert_eq!(pick(Some("flag"), Some("file"), Some("env")).as_deref(), Some("flag"));
        assert_eq!(pick(None, Some("file"), Some("env")).as_deref(), Some("file"));
        assert_eq!(pick(None, Some(" "), Some("env")).as_deref(), Some("env"));
        assert_eq!(pick(None, None, None), None);
    }

    #[test]
    fn test_invalid_type_rejected() {
        assert!(Config::parse("tool_round_budget = \"many\"").is_err());
    }
}
