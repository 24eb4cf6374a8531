use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use dirs::home_dir;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// OpenAI-compatible base URL every request is forwarded to.
    pub base_url: String,
    pub timeout_s: f64,
    pub verify_ssl: bool,
    /// Extra headers sent on every upstream request.
    pub headers: HashMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4000".to_string(),
            timeout_s: 60.0,
            verify_ssl: true,
            headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    /// Basename of the active JSONL log inside `log_dir`.
    pub filename: String,
    /// Rotation threshold for the active log file.
    pub max_file_bytes: u64,
    /// Extracted content larger than this (JSON-encoded) is truncated.
    pub max_prompt_bytes: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            filename: "promptlens.jsonl".to_string(),
            max_file_bytes: 50 * 1024 * 1024,
            max_prompt_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Immutable application configuration. CLI overrides produce a new copy via
/// [`AppConfig::with_overrides`]; nothing mutates a loaded config in place.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub upstream: UpstreamConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
}

/// Optional CLI-provided replacements for individual config fields.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub base_url: Option<String>,
    pub timeout_s: Option<f64>,
    pub log_dir: Option<PathBuf>,
    pub max_file_bytes: Option<u64>,
    pub max_prompt_bytes: Option<u64>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.upstream.base_url).map_err(|_| {
            anyhow::anyhow!(
                "upstream.base_url must be a full http(s) URL, e.g. http://127.0.0.1:4000 (got {:?})",
                self.upstream.base_url
            )
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            bail!(
                "upstream.base_url must be a full http(s) URL, e.g. http://127.0.0.1:4000 (got {:?})",
                self.upstream.base_url
            );
        }
        if !(self.upstream.timeout_s > 0.0) {
            bail!("upstream.timeout_s must be positive");
        }
        if self.logging.max_file_bytes == 0 {
            bail!("logging.max_file_bytes must be positive");
        }
        if self.logging.max_prompt_bytes == 0 {
            bail!("logging.max_prompt_bytes must be positive");
        }
        Ok(())
    }

    /// Return a copy with the given fields replaced and re-validated.
    pub fn with_overrides(&self, overrides: &ConfigOverrides) -> Result<AppConfig> {
        let mut next = self.clone();
        if let Some(base_url) = &overrides.base_url {
            next.upstream.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(timeout_s) = overrides.timeout_s {
            next.upstream.timeout_s = timeout_s;
        }
        if let Some(log_dir) = &overrides.log_dir {
            next.logging.log_dir = log_dir.clone();
        }
        if let Some(max_file_bytes) = overrides.max_file_bytes {
            next.logging.max_file_bytes = max_file_bytes;
        }
        if let Some(max_prompt_bytes) = overrides.max_prompt_bytes {
            next.logging.max_prompt_bytes = max_prompt_bytes;
        }
        next.validate()?;
        Ok(next)
    }
}

pub fn default_log_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".promptlens")
        .join("logs")
}

/// `./promptlens.toml` when present, used as the implicit `--config` value.
pub fn default_config_path() -> Option<PathBuf> {
    let candidate = PathBuf::from("promptlens.toml");
    candidate.exists().then_some(candidate)
}

/// Load the config from `path`, or defaults when no path is given.
/// Only `.toml` files are accepted; validation failures are fatal.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut cfg = match path {
        None => AppConfig::default(),
        Some(path) => {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase())
                .unwrap_or_default();
            if ext != "toml" {
                bail!("Unsupported config type: .{ext} (supported: .toml)");
            }
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {:?}", path))?;
            toml::from_str::<AppConfig>(&text)
                .with_context(|| format!("failed to parse {:?} as TOML", path))?
        }
    };
    cfg.upstream.base_url = cfg.upstream.base_url.trim_end_matches('/').to_string();
    cfg.validate()?;
    Ok(cfg)
}
