use std::{env, fmt, fs, io, path};

use pingwatch::EngineConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {}: {source}", path.display())]
    ReadFailed { path: path::PathBuf, source: io::Error },

    #[error("failed to write {}: {source}", path.display())]
    WriteFailed { path: path::PathBuf, source: io::Error },

    #[error("failed to parse {}: {source}", path.display())]
    ParseFailed { path: path::PathBuf, source: toml::de::Error },

    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),

    #[error("neither XDG_CONFIG_HOME nor HOME is set")]
    ConfigPathUnavailable,

    #[error(transparent)]
    Engine(#[from] pingwatch::ConfigError),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub bus: Bus,
    pub inventory: Inventory,
    pub database: Database,
    pub logging: Logging,
    pub service: Service,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Log,
    Zeromq,
    Webhook,
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::Log => write!(f, "log"),
            BusKind::Zeromq => write!(f, "zeromq"),
            BusKind::Webhook => write!(f, "webhook"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bus {
    pub kind: BusKind,
    pub zeromq: ZeroMQ,
    pub webhook: Webhook,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZeroMQ {
    pub bind: String,
    pub port: u16,
}

impl Default for ZeroMQ {
    fn default() -> Self {
        Self { bind: "*".into(), port: 5555 }
    }
}

impl ZeroMQ {
    pub fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Webhook {
    pub url: String,
    pub timeout_ms: u64,
}

impl Default for Webhook {
    fn default() -> Self {
        Self { url: String::new(), timeout_ms: 5000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    /// TOML (`[[device]]` tables) or JSON (array of devices)
    pub path: path::PathBuf,
    pub reload_secs: u64,
}

impl Default for Inventory {
    fn default() -> Self {
        Self { path: "devices.toml".into(), reload_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    pub enabled: bool,
    pub path: path::PathBuf,
    pub max_connections: usize,
    pub persist_secs: u64,
}

impl Default for Database {
    fn default() -> Self {
        Self { enabled: true, path: "pingwatch.db".into(), max_connections: 4, persist_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub format: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self { level: "info".into(), format: "compact".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub metrics_interval_secs: u64,
    pub stale_check_secs: u64,
}

impl Default for Service {
    fn default() -> Self {
        Self { metrics_interval_secs: 30, stale_check_secs: 60 }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/pingwatch/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, Error> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(Error::ConfigPathUnavailable);
    };

    Ok(path.join("pingwatch/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);
        let engine = &self.engine;

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Scheduler")?;
        write_1(f, "Tick (ms)", &engine.scheduler.tick_ms)?;
        write_1(f, "Max Concurrent Probes", &engine.scheduler.max_concurrent_probes)?;
        write_title_1(f, "Probe")?;
        write_1(f, "Timeout (ms)", &engine.probe.timeout_ms)?;
        write_1(f, "Retry Attempts", &engine.probe.retry_attempts)?;
        write_1(f, "Retry Delay (ms)", &engine.probe.retry_delay_ms)?;
        write_title_1(f, "Liveness")?;
        write_1(f, "Failure Threshold", &engine.liveness.failure_threshold)?;
        write_1(f, "Recovery Threshold", &engine.liveness.recovery_threshold)?;
        write_1(f, "Stale After (s)", &engine.liveness.stale_after_secs)?;
        write_title_1(f, "Emitter")?;
        write_1(f, "Topic", &engine.emitter.topic)?;
        write_1(f, "Max Attempts", &engine.emitter.max_attempts)?;
        write_1(f, "Backoff (ms)", &format!("{}..{}", engine.emitter.initial_backoff_ms, engine.emitter.max_backoff_ms))?;
        write_title_1(f, "Circuit Breaker")?;
        write_1(f, "Enabled", &engine.breaker.enabled)?;
        write_1(f, "Failure Threshold", &engine.breaker.failure_threshold)?;
        write_1(f, "Open (s)", &engine.breaker.open_secs)?;
        write_title_1(f, "Event Bus")?;
        write_1(f, "Kind", &self.bus.kind)?;
        match self.bus.kind {
            BusKind::Zeromq => write_1(f, "Endpoint", &self.bus.zeromq.endpoint())?,
            BusKind::Webhook => write_1(f, "URL", &self.bus.webhook.url)?,
            BusKind::Log => {}
        }
        write_title_1(f, "Inventory")?;
        write_1(f, "Path", &self.inventory.path.display())?;
        write_1(f, "Reload (s)", &self.inventory.reload_secs)?;
        write_title_1(f, "Database")?;
        write_1(f, "Enabled", &self.database.enabled)?;
        write_1(f, "Path", &self.database.path.display())?;
        write_1(f, "Persist (s)", &self.database.persist_secs)?;
        write_title_1(f, "Logging")?;
        write_1(f, "Level", &self.logging.level)?;
        write_1(f, "Format", &self.logging.format)?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/pingwatch/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, Error> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| Error::ReadFailed { path: config_path.clone(), source })?;
            toml::from_str(raw_string.as_str())
                .map_err(|source| Error::ParseFailed { path: config_path, source })
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), Error> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| Error::WriteFailed { path: parent.to_path_buf(), source })?;
        }

        fs::write(path, config_str).map_err(|source| Error::WriteFailed { path: path.to_path_buf(), source })
    }

    pub fn validate(&self) -> Result<(), Error> {
        self.engine.validate()?;

        let intervals = [
            ("inventory.reload_secs", self.inventory.reload_secs),
            ("database.persist_secs", self.database.persist_secs),
            ("service.metrics_interval_secs", self.service.metrics_interval_secs),
            ("service.stale_check_secs", self.service.stale_check_secs),
            ("bus.webhook.timeout_ms", self.bus.webhook.timeout_ms),
        ];
        if let Some((field, _)) = intervals.iter().copied().find(|(_, value)| *value == 0) {
            return Err(Error::Invalid { field, reason: "must be greater than zero".into() });
        }

        if self.bus.kind == BusKind::Webhook {
            url::Url::parse(&self.bus.webhook.url)
                .map_err(|e| Error::Invalid { field: "bus.webhook.url", reason: e.to_string() })?;
        }
        if self.database.enabled && self.database.max_connections == 0 {
            return Err(Error::Invalid { field: "database.max_connections", reason: "must be greater than zero".into() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let config = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());

        // Reading it back yields the same values
        assert_eq!(Config::from_config(Some(&path)).unwrap(), config);
    }

    #[test]
    fn extension_is_forced_to_toml() {
        let dir = tempdir().unwrap();
        Config::from_config(Some(dir.path().join("settings"))).unwrap();
        assert!(dir.path().join("settings.toml").exists());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[engine.liveness]
failure_threshold = 5

[bus]
kind = "zeromq"

[bus.zeromq]
port = 6000
"#,
        )
        .unwrap();

        let config = Config::from_config(Some(&path)).unwrap();
        assert_eq!(config.engine.liveness.failure_threshold, 5);
        assert_eq!(config.engine.liveness.recovery_threshold, 2);
        assert_eq!(config.bus.kind, BusKind::Zeromq);
        assert_eq!(config.bus.zeromq.endpoint(), "tcp://*:6000");
        assert_eq!(config.inventory.reload_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn broken_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "engine = [").unwrap();

        let err = Config::from_config(Some(&path)).unwrap_err();
        assert!(matches!(err, Error::ParseFailed { .. }));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn webhook_needs_a_valid_url() {
        let mut config = Config::default();
        config.bus.kind = BusKind::Webhook;
        assert!(matches!(config.validate(), Err(Error::Invalid { field: "bus.webhook.url", .. })));

        config.bus.webhook.url = "https://alerts.example.net/hooks/liveness".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_engine_values_are_rejected() {
        let mut config = Config::default();
        config.engine.scheduler.tick_ms = 0;
        assert!(matches!(config.validate(), Err(Error::Engine(_))));
    }

    #[test]
    fn display_lists_sections() {
        let text = Config::default().to_string();
        for section in ["Scheduler", "Liveness", "Emitter", "Event Bus", "Inventory", "Database"] {
            assert!(text.contains(section), "missing {section}");
        }
        assert!(text.contains("device-alerts"));
    }
}
