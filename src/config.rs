//! Runtime configuration read from the environment (and `.env`).

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-5";
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Upload extensions the converter knows about.
pub const ALLOWED_EXTENSIONS: [&str; 6] = ["pdf", "doc", "docx", "xls", "xlsx", "txt"];

/// Settings for the chat-completions client.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root that scenario file paths are relative to.
    pub base_dir: PathBuf,
    pub data_dir: PathBuf,
    pub scenarios_dir: PathBuf,
    pub results_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub bind_addr: SocketAddr,
    pub max_upload_bytes: usize,
    pub llm: LlmConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let base_dir = PathBuf::from(get("BASE_DIR").unwrap_or_else(|| ".".to_string()));
        let data_dir = get("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("data"));
        let scenarios_dir = get("SCENARIOS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("scenarios"));
        let results_dir = get("RESULTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("storage").join("results"));
        let upload_dir = get("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.join("storage").join("uploads"));

        let bind_addr = get("BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:3000".to_string())
            .parse()
            .context("BIND_ADDR is not a socket address")?;

        let max_upload_bytes = match get("MAX_UPLOAD_BYTES") {
            Some(v) => v.parse().context("MAX_UPLOAD_BYTES must be an integer")?,
            None => DEFAULT_MAX_UPLOAD_BYTES,
        };

        let api_key = get("LLM_API_KEY")
            .or_else(|| get("OPENAI_API_KEY"))
            .or_else(|| get("OPENROUTER_API_KEY"));

        let max_retries = match get("LLM_MAX_RETRIES") {
            Some(v) => v.parse().context("LLM_MAX_RETRIES must be an integer")?,
            None => DEFAULT_MAX_RETRIES,
        };
        let timeout_secs = match get("LLM_TIMEOUT_SECS") {
            Some(v) => v.parse().context("LLM_TIMEOUT_SECS must be an integer")?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Self {
            base_dir,
            data_dir,
            scenarios_dir,
            results_dir,
            upload_dir,
            bind_addr,
            max_upload_bytes,
            llm: LlmConfig {
                api_key,
                base_url: get("LLM_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
                model: get("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                max_retries,
                timeout_secs,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.scenarios_dir, PathBuf::from("./data/scenarios"));
        assert_eq!(config.results_dir, PathBuf::from("./storage/results"));
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(config.llm.model, "gpt-5");
        assert_eq!(config.llm.max_retries, 2);
        assert!(config.llm.api_key.is_none());
    }

    #[test]
    fn test_api_key_fallbacks() {
        let config = load(&[("LLM_API_KEY", " "), ("OPENROUTER_API_KEY", "or-key")]).unwrap();
        assert_eq!(config.llm.api_key.as_deref(), Some("or-key"));

        let config = load(&[("OPENAI_API_KEY", "openai-key"), ("OPENROUTER_API_KEY", "or-key")]).unwrap();
        assert_eq!(config.llm.api_key.as_deref(), Some("openai-key"));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[("DATA_DIR", "/srv/data"), ("LLM_MAX_RETRIES", "0")]).unwrap();
        assert_eq!(config.scenarios_dir, PathBuf::from("/srv/data/scenarios"));
        assert_eq!(config.llm.max_retries, 0);
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[("BIND_ADDR", "nope")]).is_err());
        assert!(load(&[("MAX_UPLOAD_BYTES", "lots")]).is_err());
    }
}
