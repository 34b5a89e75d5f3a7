use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Applied to every module unless overridden under `[modules.<name>]`.
    #[serde(default)]
    pub defaults: ModuleConfig,
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleConfig>,
}

/// Per-module knobs as written in the file; unset fields fall through.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModuleConfig {
    pub reincarnate: Option<bool>,
    pub max_reincarnations: Option<u32>,
    pub backoff_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub backoff_max_ms: Option<u64>,
    pub start_timeout_ms: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
    pub autostart: Option<bool>,
    pub start_order: Option<i32>,
}

/// Fully resolved settings for one module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleSettings {
    pub reincarnate: bool,
    pub max_reincarnations: u32,
    pub backoff: Duration,
    pub backoff_factor: f64,
    pub backoff_max: Duration,
    /// `None` runs the callback inline with no deadline.
    pub start_timeout: Option<Duration>,
    pub stop_timeout: Option<Duration>,
    pub autostart: bool,
    pub start_order: i32,
}

fn default_log_level() -> String { "info".to_string() }
fn default_data_dir() -> String { "data".to_string() }

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

fn timeout(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            defaults: ModuleConfig::default(),
            modules: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Resolve `name`'s settings: module override, then `[defaults]`, then built-ins.
    pub fn settings(&self, name: &str) -> ModuleSettings {
        let own = self.modules.get(name);
        let defaults = &self.defaults;
        macro_rules! pick {
            ($field:ident, $fallback:expr) => {
                own.and_then(|m| m.$field)
                    .or(defaults.$field)
                    .unwrap_or($fallback)
            };
        }
        ModuleSettings {
            reincarnate: pick!(reincarnate, false),
            max_reincarnations: pick!(max_reincarnations, 3),
            backoff: Duration::from_millis(pick!(backoff_ms, 0)),
            backoff_factor: pick!(backoff_factor, 2.0),
            backoff_max: Duration::from_millis(pick!(backoff_max_ms, 30_000)),
            start_timeout: timeout(pick!(start_timeout_ms, DEFAULT_TIMEOUT_MS)),
            stop_timeout: timeout(pick!(stop_timeout_ms, DEFAULT_TIMEOUT_MS)),
            autostart: pick!(autostart, true),
            start_order: pick!(start_order, 0),
        }
    }
}

/// Config file path from `HYPERKERNEL_CONFIG`, otherwise `config.toml`.
pub fn config_path() -> PathBuf {
    std::env::var("HYPERKERNEL_CONFIG").unwrap_or_else(|_| "config.toml".into()).into()
}

/// Load configuration from `path`; a missing file yields safe defaults.
pub fn load_config_from(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        Config::from_toml(&content)
    } else {
        Ok(Config::default())
    }
}

pub fn load_config() -> Result<Config> {
    load_config_from(&config_path())
}

/// Live configuration shared between the host and the orchestrator.
///
/// Readers always see the latest reload, so operators can change a module's
/// failure policy without restarting the host.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    path: Option<PathBuf>,
    inner: Arc<RwLock<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self { path: None, inner: Arc::new(RwLock::new(config)) }
    }

    /// Loads from `path` and remembers it for [`SharedConfig::reload`].
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = load_config_from(&path)?;
        Ok(Self { path: Some(path), inner: Arc::new(RwLock::new(config)) })
    }

    pub fn snapshot(&self) -> Config {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn settings(&self, name: &str) -> ModuleSettings {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).settings(name)
    }

    pub fn replace(&self, config: Config) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Re-reads the backing file. A parse error leaves the current config in place.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let config = load_config_from(path)?;
        self.replace(config);
        tracing::info!(path = %path.display(), "configuration reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(tag: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir()
            .join(format!("hyperkernel_cfg_{tag}_{}.toml", std::process::id()));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn defaults_when_missing() {
        unsafe { std::env::set_var("HYPERKERNEL_CONFIG", "___does_not_exist___hyperkernel.toml"); }
        let cfg = load_config().unwrap();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.data_dir, "data");
        let s = cfg.settings("anything");
        assert!(!s.reincarnate);
        assert!(s.autostart);
        assert_eq!(s.start_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn reads_file_with_overrides() {
        let path = temp_file("read", r#"log_level = "debug"
data_dir = "test_data"

[defaults]
reincarnate = true
stop_timeout_ms = 0

[modules.mailer]
reincarnate = false
start_order = -5
backoff_ms = 250
"#);
        let cfg = load_config_from(&path).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.data_dir, "test_data");

        let mailer = cfg.settings("mailer");
        assert!(!mailer.reincarnate);
        assert_eq!(mailer.start_order, -5);
        assert_eq!(mailer.backoff, Duration::from_millis(250));
        assert_eq!(mailer.stop_timeout, None);

        let other = cfg.settings("catalog");
        assert!(other.reincarnate);
        assert_eq!(other.start_order, 0);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn shared_config_reloads_live() {
        let path = temp_file("reload", "[modules.db]\nreincarnate = false\n");
        let shared = SharedConfig::open(&path).unwrap();
        assert!(!shared.settings("db").reincarnate);

        std::fs::write(&path, "[modules.db]\nreincarnate = true\n").unwrap();
        shared.reload().unwrap();
        assert!(shared.settings("db").reincarnate);

        std::fs::write(&path, "[modules.db\n").unwrap();
        assert!(shared.reload().is_err());
        assert!(shared.settings("db").reincarnate);

        let _ = std::fs::remove_file(path);
    }
}
