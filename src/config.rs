use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// One chat-completion back-end: a model name bound to the node that serves it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelBackend {
    pub model: String,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // Remote chat-completion endpoint (OpenAI-style envelope with project/node routing)
    #[serde(default = "default_chat_api_url")]
    pub chat_api_url: String,
    #[serde(default = "default_project")]
    pub project: String,

    /// Back-ends tried in declared order until one returns usable content.
    #[serde(default = "default_model_backends")]
    pub model_backends: Vec<ModelBackend>,

    // Scrape service
    #[serde(default = "default_scraper_api_url")]
    pub scraper_api_url: String,

    /// When true, the analysis stage additionally requires the subject to be unlocked.
    #[serde(default)]
    pub paywall: bool,

    // Staleness thresholds: a started-but-not-completed stage older than this is retryable
    #[serde(default = "default_scrape_stale_secs")]
    pub scrape_stale_secs: i64,
    #[serde(default = "default_analysis_stale_secs")]
    pub analysis_stale_secs: i64,
    #[serde(default = "default_pair_stale_secs")]
    pub pair_stale_secs: i64,
    #[serde(default = "default_route_guard_secs")]
    pub route_guard_secs: i64,

    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_chat_api_url() -> String {
    "https://chat.degpt.ai/api/v0/chat/completion".to_string()
}

fn default_project() -> String {
    "DecentralGPT".to_string()
}

fn default_model_backends() -> Vec<ModelBackend> {
    vec![
        ModelBackend {
            model: "Qwen2-72B".to_string(),
            node_id: "16Uiu2HAmPKuJU5VE2PCnydyUn1VcTN2Lt59UDJFFEiRbb7h1x4CV".to_string(),
        },
        ModelBackend {
            model: "Llama3.3-70B".to_string(),
            node_id: "16Uiu2HAm98Pq6qDxeDdnyzYUfYrZhRpWyZYNXfyyM6nyku7ePoiv".to_string(),
        },
    ]
}

fn default_scraper_api_url() -> String {
    "http://localhost:3100".to_string()
}

fn default_scrape_stale_secs() -> i64 {
    60
}

fn default_analysis_stale_secs() -> i64 {
    60
}

fn default_pair_stale_secs() -> i64 {
    120
}

fn default_route_guard_secs() -> i64 {
    180
}

fn default_database_path() -> String {
    "tweetscope.db".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:8790".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            chat_api_url: default_chat_api_url(),
            project: default_project(),
            model_backends: default_model_backends(),
            scraper_api_url: default_scraper_api_url(),
            paywall: false,
            scrape_stale_secs: default_scrape_stale_secs(),
            analysis_stale_secs: default_analysis_stale_secs(),
            pair_stale_secs: default_pair_stale_secs(),
            route_guard_secs: default_route_guard_secs(),
            database_path: default_database_path(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl AppConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("tweetscope_config.toml")
    }

    /// Load config from tweetscope_config.toml next to the executable
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("TWEETSCOPE_CHAT_API_URL") {
            config.chat_api_url = url;
        }

        if let Ok(project) = env::var("TWEETSCOPE_PROJECT") {
            config.project = project;
        }

        if let Ok(url) = env::var("TWEETSCOPE_SCRAPER_API_URL") {
            config.scraper_api_url = url;
        }

        if let Ok(enabled) = env::var("TWEETSCOPE_PAYWALL") {
            let enabled = enabled.eq_ignore_ascii_case("1")
                || enabled.eq_ignore_ascii_case("true")
                || enabled.eq_ignore_ascii_case("yes");
            config.paywall = enabled;
        }

        if let Ok(path) = env::var("TWEETSCOPE_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(addr) = env::var("TWEETSCOPE_BIND") {
            if !addr.trim().is_empty() {
                config.bind_addr = addr;
            }
        }

        // Comma-separated model=node_id pairs, highest priority first
        if let Ok(raw) = env::var("TWEETSCOPE_MODEL_BACKENDS") {
            let backends = parse_backend_list(&raw);
            if !backends.is_empty() {
                config.model_backends = backends;
            }
        }

        config
    }
}

fn parse_backend_list(raw: &str) -> Vec<ModelBackend> {
    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (model, node_id) = entry.split_once('=')?;
            let model = model.trim();
            let node_id = node_id.trim();
            if model.is_empty() || node_id.is_empty() {
                tracing::warn!("Skipping malformed model backend entry '{}'", entry);
                return None;
            }
            Some(ModelBackend {
                model: model.to_string(),
                node_id: node_id.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_list_parses_in_declared_order() {
        let backends = parse_backend_list("Qwen2-72B=node-a, Llama3.3-70B=node-b");
        assert_eq!(backends.len(), 2);
        assert_eq!(backends[0].model, "Qwen2-72B");
        assert_eq!(backends[0].node_id, "node-a");
        assert_eq!(backends[1].model, "Llama3.3-70B");
    }

    #[test]
    fn backend_list_skips_malformed_entries() {
        let backends = parse_backend_list("no-separator, =empty-model, Qwen2-72B=node-a");
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].model, "Qwen2-72B");
    }

    #[test]
    fn defaults_carry_at_least_one_backend() {
        let config = AppConfig::default();
        assert!(!config.model_backends.is_empty());
        assert_eq!(config.scrape_stale_secs, 60);
        assert_eq!(config.pair_stale_secs, 120);
        assert!(!config.paywall);
    }
}
