//! Application configuration from `localchat.yaml`.
//!
//! Every field has a default, so a missing file is not an error. String values
//! may reference environment variables as `${VAR}` or `${VAR:-default}`; a
//! leading `~` in a default is expanded to the home directory. The
//! `OLLAMA_*` variables override the file last.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::chat_core::types::ContextWindowConfig;
use crate::inference::errors::InferenceError;

/// File name searched for upward from the working directory.
pub const CONFIG_FILE_NAME: &str = "localchat.yaml";

/// Env var naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "LOCALCHAT_CONFIG";

// ─── Types ───────────────────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub context: ContextWindowConfig,
    /// SQLite file; defaults to `<data_dir>/localchat.db`.
    pub database_path: Option<PathBuf>,
}

/// Generation backend connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// API root, e.g. `http://localhost:11434/api`. `/generate` and `/tags`
    /// are appended.
    pub base_url: String,
    /// Model for sessions created without one.
    pub default_model: String,
    /// Bounds the wait for response headers and each gap between chunks.
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/api".to_string(),
            default_model: "deepseek-r1:14b".to_string(),
            timeout_ms: 60_000,
            connect_timeout_ms: 5_000,
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Resolve, load, override, and validate the configuration.
    ///
    /// Lookup order: `$LOCALCHAT_CONFIG`, then `localchat.yaml` found by
    /// walking up from the working directory, then built-in defaults.
    pub fn load() -> Result<Self, InferenceError> {
        let path = match std::env::var(CONFIG_PATH_ENV) {
            Ok(explicit) => Some(PathBuf::from(expand_tilde(&explicit))),
            Err(_) => std::env::current_dir()
                .ok()
                .and_then(|cwd| find_config_path(&cwd)),
        };

        let mut config = match &path {
            Some(path) => load_config_file(path)?,
            None => AppConfig::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;

        tracing::info!(
            path = ?path,
            base_url = %config.backend.base_url,
            default_model = %config.backend.default_model,
            timeout_ms = config.backend.timeout_ms,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Apply `OLLAMA_API_URL`, `OLLAMA_DEFAULT_MODEL`, and `OLLAMA_TIMEOUT_MS`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("OLLAMA_API_URL").filter(|v| !v.is_empty()) {
            self.backend.base_url = url;
        }
        if let Some(model) = lookup("OLLAMA_DEFAULT_MODEL").filter(|v| !v.is_empty()) {
            self.backend.default_model = model;
        }
        if let Some(raw) = lookup("OLLAMA_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.backend.timeout_ms = ms,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid OLLAMA_TIMEOUT_MS"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.backend.base_url.trim().is_empty() {
            return Err(config_error("backend.base_url must not be empty"));
        }
        if self.backend.timeout_ms == 0 {
            return Err(config_error("backend.timeout_ms must be positive"));
        }
        self.context.validate().map_err(|reason| InferenceError::ConfigError {
            reason: format!("context: {reason}"),
        })
    }
}

/// Search upward from `start` for `localchat.yaml`.
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

/// Read and parse a config file, interpolating `${VAR}` references.
pub fn load_config_file(path: &Path) -> Result<AppConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw, |name| std::env::var(name).ok())
}

fn parse_config(
    raw: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<AppConfig, InferenceError> {
    let interpolated = interpolate(raw, &lookup);
    if interpolated.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to parse config: {e}"),
    })
}

fn config_error(reason: &str) -> InferenceError {
    InferenceError::ConfigError {
        reason: reason.to_string(),
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace every `${VAR}` / `${VAR:-default}` in `input`.
///
/// An unterminated `${` is kept literally.
fn interpolate(input: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let expr = &after[..end];
        let value = match expr.split_once(":-") {
            Some((name, default)) => lookup(name).unwrap_or_else(|| expand_tilde(default)),
            None => lookup(expr).unwrap_or_default(),
        };
        out.push_str(&value);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
        _ => path.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
