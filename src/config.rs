//! Configuration management for the sls-proxy application.
//!
//! This module handles loading, parsing, validating, and hot-reloading
//! of the YAML configuration file. It uses `notify` for file system
//! watching and `Arc<RwLock>` for thread-safe config access.

use crate::directory::{UpstreamTarget, DEFAULT_URL};
use crate::error::{ProxyError, Result};
use crate::overrides::{validate_table, OverrideTable};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Upstream directory service section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Full URL of the directory document.
    pub url: String,

    /// Overrides the host taken from `url`.
    pub hostname: Option<String>,

    /// Overrides the port taken from `url`.
    pub port: Option<u16>,

    /// Overrides the path taken from `url`.
    pub path: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            hostname: None,
            port: None,
            path: None,
        }
    }
}

impl UpstreamConfig {
    /// Builds the upstream target from the URL and any explicit overrides.
    pub fn target(&self) -> Result<UpstreamTarget> {
        let mut target = UpstreamTarget::from_url(&self.url)?;
        if let Some(host) = self.hostname.as_ref().filter(|h| !h.is_empty()) {
            target.host = host.clone();
        }
        if let Some(port) = self.port {
            target.port = port;
        }
        if let Some(path) = self.path.as_ref().filter(|p| !p.is_empty()) {
            target.path = path.clone();
        }
        Ok(target)
    }
}

/// Listener and upstream connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Hostname or address to listen on.
    pub hostname: String,

    /// Port to listen on. Defaults to the upstream port.
    pub port: Option<u16>,

    /// Upstream connect timeout in seconds.
    pub connect_timeout: u64,

    /// Upstream read timeout in seconds.
    pub read_timeout: u64,

    /// Upstream write timeout in seconds.
    pub write_timeout: u64,

    /// Budget for a whole upstream exchange in seconds.
    pub total_timeout: u64,

    /// Largest directory body buffered for rewriting, in bytes.
    pub max_directory_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: None,
            connect_timeout: 10,
            read_timeout: 30,
            write_timeout: 30,
            total_timeout: 60,
            max_directory_size: 8 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout)
    }
}

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Output destination: stdout, stderr, or file path.
    pub output: String,

    /// Log format.
    pub format: LogFormat,

    /// Include target (module path) in logs.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Upstream directory service.
    pub upstream: UpstreamConfig,

    /// Listener configuration.
    pub server: ServerConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Override rules keyed by server id.
    pub servers: OverrideTable,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ProxyError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        let config: AppConfig =
            serde_yaml::from_str(&contents).map_err(|e| ProxyError::config_parse(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        self.upstream.target()?;

        if self.server.hostname.is_empty() {
            return Err(ProxyError::config_validation(
                "Server hostname cannot be empty",
            ));
        }

        let timeouts = [
            ("connect_timeout", self.server.connect_timeout),
            ("read_timeout", self.server.read_timeout),
            ("write_timeout", self.server.write_timeout),
            ("total_timeout", self.server.total_timeout),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ProxyError::config_validation(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.server.max_directory_size == 0 {
            return Err(ProxyError::config_validation(
                "max_directory_size must be greater than zero",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ProxyError::config_validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        validate_table(&self.servers)
    }

    /// The upstream target described by this configuration.
    pub fn upstream_target(&self) -> Result<UpstreamTarget> {
        self.upstream.target()
    }
}

/// Thread-safe configuration holder with hot-reload support.
#[derive(Clone)]
pub struct ConfigManager {
    /// Current configuration.
    config: Arc<RwLock<AppConfig>>,

    /// Path to the configuration file.
    config_path: PathBuf,
}

impl ConfigManager {
    /// Creates a new ConfigManager and loads the initial configuration.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path = path.as_ref().to_path_buf();
        let config = AppConfig::load(&config_path)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Gets a clone of the current configuration.
    pub fn get(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Reloads the configuration from disk. A file that fails to load or
    /// validate leaves the current configuration in place.
    pub fn reload(&self) -> Result<()> {
        info!(path = %self.config_path.display(), "Reloading configuration");

        match AppConfig::load(&self.config_path) {
            Ok(new_config) => {
                let mut config = self.config.write().unwrap();
                *config = new_config;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to reload configuration");
                Err(e)
            }
        }
    }

    /// Starts watching the configuration file for changes.
    ///
    /// Each successful reload sends the new configuration on the returned
    /// channel.
    pub fn start_watcher(&self) -> Result<mpsc::Receiver<AppConfig>> {
        let (tx, rx) = mpsc::channel(1);
        let config_path = self.config_path.clone();
        let file_name = config_path.file_name().map(|n| n.to_os_string());
        let manager = self.clone();

        std::thread::spawn(move || {
            let (notify_tx, notify_rx) = std::sync::mpsc::channel();

            let mut watcher = match RecommendedWatcher::new(
                move |res: std::result::Result<Event, notify::Error>| {
                    if let Ok(event) = res {
                        let touches_config = event
                            .paths
                            .iter()
                            .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                        if touches_config && (event.kind.is_modify() || event.kind.is_create()) {
                            let _ = notify_tx.send(());
                        }
                    }
                },
                NotifyConfig::default(),
            ) {
                Ok(w) => w,
                Err(e) => {
                    error!(error = %e, "Failed to create file watcher");
                    return;
                }
            };

            // Watch the parent directory to catch editors that replace the file.
            let watch_path = match config_path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            if let Err(e) = watcher.watch(&watch_path, RecursiveMode::NonRecursive) {
                error!(error = %e, "Failed to watch config directory");
                return;
            }

            info!(path = %config_path.display(), "Watching configuration file for changes");

            let mut last_reload = std::time::Instant::now();
            let debounce_duration = std::time::Duration::from_millis(500);

            loop {
                match notify_rx.recv() {
                    Ok(()) => {
                        let now = std::time::Instant::now();
                        if now.duration_since(last_reload) < debounce_duration {
                            debug!("Debouncing config reload");
                            continue;
                        }
                        if manager.reload().is_ok() {
                            last_reload = now;
                            if tx.blocking_send(manager.get()).is_err() {
                                debug!("Config reload receiver dropped, stopping watcher");
                                break;
                            }
                        }
                    }
                    Err(_) => {
                        warn!("Config watcher channel closed");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}
