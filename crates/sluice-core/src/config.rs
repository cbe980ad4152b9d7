use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SluiceError};

/// Top-level sluice configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub runtime: FlowRuntimeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRuntimeConfig {
    /// Flow identifier used to scope window bookkeeping.
    #[serde(default = "default_flow_id")]
    pub flow_id: String,
    /// Demand a worker grants on subscription (0 = wait for an explicit request).
    #[serde(default)]
    pub default_demand: i64,
    /// Capacity of the flow event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for FlowRuntimeConfig {
    fn default() -> Self {
        Self {
            flow_id: default_flow_id(),
            default_demand: 0,
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_flow_id() -> String { "default".to_string() }
fn default_event_capacity() -> usize { 256 }

/// Caller-owned retry budget for failed batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 100 }
fn default_max_backoff() -> u64 { 10_000 }

/// Context store configuration. No path means the in-memory repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub path: Option<String>,
}

impl StoreConfig {
    /// Resolve the store path (expand ~).
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.resolve_under(dirs_home())
    }

    fn resolve_under(&self, home: Option<PathBuf>) -> Option<PathBuf> {
        let path = self.path.as_deref()?;
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = home {
                return Some(home.join(rest));
            }
        }
        Some(PathBuf::from(path))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "sluice=info,warn".to_string() }

impl RuntimeConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SluiceError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        Self::parse(&expanded)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: RuntimeConfig =
            toml::from_str(content).map_err(|e| SluiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.runtime.default_demand < 0 {
            return Err(SluiceError::Config(format!(
                "runtime.default_demand must not be negative [value={}]",
                self.runtime.default_demand
            )));
        }
        if self.runtime.event_capacity == 0 {
            return Err(SluiceError::Config(
                "runtime.event_capacity must be positive".to_string(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(SluiceError::Config(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Leave unset vars as written
                Err(_) => {
                    warn!(var = %var_name, "Config references an unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
