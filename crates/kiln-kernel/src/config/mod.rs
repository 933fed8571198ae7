//! Configuration
//!
//! Hot-reload settings plus the file loading helpers they are read with.
//!
//! ## Features
//!
//! - Format detection from the file extension (YAML, TOML, JSON)
//! - Environment variable substitution (`${VAR}` and `$VAR` syntax)
//! - `KILN_` prefixed environment overrides on top of a file

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config as Cfg, Environment, File, FileFormat};
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "KILN";

/// Configuration error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// ============================================================================
// 热加载配置 (Hot-reload settings)
// ============================================================================

/// 热加载配置
/// Settings for module loading, unload verification and artifact watching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    /// Upper bound on the wait for a retired module to become unreachable
    pub unload_timeout_ms: u64,
    /// Interval between unreachability checks
    pub poll_interval_ms: u64,
    /// Directory for per-generation copies of module binaries. Defaults to a
    /// `kiln-shadow` directory under the system temp dir.
    pub shadow_dir: Option<PathBuf>,
    /// Reject modules whose API version symbol does not match the host
    pub verify_api_version: bool,
    /// Keep unresolved script names for the next reload instead of dropping
    /// them
    pub retain_unresolved: bool,
    /// Debounce window for artifact change events
    pub watch_debounce_ms: u64,
    /// Artifact extensions the watcher reacts to
    pub watch_extensions: Vec<String>,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            unload_timeout_ms: 5_000,
            poll_interval_ms: 10,
            shadow_dir: None,
            verify_api_version: true,
            retain_unresolved: true,
            watch_debounce_ms: 250,
            watch_extensions: vec!["so".into(), "dylib".into(), "dll".into()],
        }
    }
}

impl HotReloadConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unload_timeout(mut self, timeout: Duration) -> Self {
        self.unload_timeout_ms = millis(timeout);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = millis(interval);
        self
    }

    pub fn with_shadow_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shadow_dir = Some(dir.into());
        self
    }

    pub fn with_api_version_check(mut self, enabled: bool) -> Self {
        self.verify_api_version = enabled;
        self
    }

    pub fn with_retain_unresolved(mut self, enabled: bool) -> Self {
        self.retain_unresolved = enabled;
        self
    }

    pub fn with_watch_debounce(mut self, debounce: Duration) -> Self {
        self.watch_debounce_ms = millis(debounce);
        self
    }

    pub fn unload_timeout(&self) -> Duration {
        Duration::from_millis(self.unload_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    pub fn shadow_dir(&self) -> PathBuf {
        self.shadow_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("kiln-shadow"))
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.unload_timeout_ms < self.poll_interval_ms {
            return Err(ConfigError::Invalid {
                field: "unload_timeout_ms",
                reason: format!("must be at least poll_interval_ms ({})", self.poll_interval_ms),
            });
        }
        Ok(())
    }

    /// Load from a file with `KILN_*` environment overrides, then validate.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::from_file_with_env(path, Environment::with_prefix(ENV_PREFIX))
    }

    /// Like [`from_file`](Self::from_file) with an explicit environment source.
    pub fn from_file_with_env(path: impl AsRef<Path>, env: Environment) -> ConfigResult<Self> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy();
        let format = detect_format(&path_str)?;
        let content = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&content)?;

        let config = Cfg::builder()
            .add_source(File::from_str(&substituted, format))
            .add_source(env.try_parsing(true))
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        let settings: Self = config
            .try_deserialize()
            .map_err(|e| ConfigError::Serialization(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }
}

// ============================================================================
// 加载辅助 (Loading helpers)
// ============================================================================

/// Detect configuration format from file extension
///
/// - YAML: `.yaml`, `.yml`
/// - TOML: `.toml`
/// - JSON: `.json`
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Substitute environment variables in a string
///
/// `${VAR}` is replaced first, then bare `$VAR`. Unset variables are left as
/// written.
pub fn substitute_env_vars(content: &str) -> ConfigResult<String> {
    let braced = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let simple = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let lookup = |caps: &Captures| std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string());
    let result = braced.replace_all(content, lookup).into_owned();
    Ok(simple.replace_all(&result, lookup).into_owned())
}

/// Load configuration from a file, detecting the format from its extension.
pub fn load_config<T>(path: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    from_str(&content, format)
}

/// Load configuration from a string with explicit format
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted = substitute_env_vars(content)?;

    let config = Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    config
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests;
