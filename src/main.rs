//! # SLS Proxy
//!
//! Transparent reverse proxy for a game-server directory with per-server
//! override rules.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default config path
//! sls-proxy
//!
//! # Run with custom config
//! sls-proxy -c /path/to/config.yaml
//!
//! # Print the live directory and exit
//! sls-proxy --list
//!
//! # Increase verbosity
//! sls-proxy -vvvv  # trace level, including dependencies
//! ```

use clap::Parser;
use sls_proxy::config::{AppConfig, ConfigManager};
use sls_proxy::logging;
use sls_proxy::proxy::SlsProxy;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{error, info};

/// Transparent reverse proxy for a game-server directory.
#[derive(Parser, Debug)]
#[command(name = "sls-proxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Upstream directory URL (overrides config)
    #[arg(long, env = "SLS_URL")]
    url: Option<String>,

    /// Hostname to listen on (overrides config)
    #[arg(long, env = "LISTEN_HOSTNAME")]
    hostname: Option<String>,

    /// Fetch the directory once, print it and exit
    #[arg(long)]
    list: bool,

    /// Increase verbosity (-v info, -vv debug, -vvv trace, -vvvv trace+deps)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// Converts verbosity count to log level string
    fn log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }
        match self.verbose {
            0 => None,
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// Whether to include verbose dependency logging
    fn trace_deps(&self) -> bool {
        self.verbose >= 4
    }
}

/// Application entry point.
#[tokio::main]
async fn main() {
    let args = Args::parse();

    let (mut config, config_manager) = load_config(&args);
    if let Some(ref url) = args.url {
        config.upstream.url = url.clone();
    }
    if let Some(ref hostname) = args.hostname {
        config.server.hostname = hostname.clone();
    }

    let _log_guard = match logging::init_logging(&config.logging, args.log_level(), args.trace_deps()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    let target = match config.upstream_target() {
        Ok(target) => target,
        Err(e) => {
            error!(error = %e, "Invalid upstream");
            std::process::exit(1);
        }
    };

    let proxy = match SlsProxy::new(target, config.server.clone(), config.servers.clone()) {
        Ok(proxy) => proxy,
        Err(e) => {
            error!(error = %e, "Invalid override table");
            std::process::exit(1);
        }
    };

    if args.list {
        list_directory(&proxy).await;
        return;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        upstream = %config.upstream.url,
        overrides = config.servers.len(),
        "Starting sls-proxy"
    );

    if let Err(e) = proxy.start(&config.server.hostname).await {
        error!(error = %e, "Failed to start proxy");
        std::process::exit(1);
    }

    let mut reloads = config_manager.and_then(|manager| match manager.start_watcher() {
        Ok(rx) => Some(rx),
        Err(e) => {
            error!(error = %e, "Failed to start config watcher");
            None
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(new_config) = recv_reload(&mut reloads) => {
                if let Err(e) = proxy.update_overrides(new_config.servers) {
                    error!(error = %e, "Rejected reloaded override table");
                }
            }
        }
    }

    info!("Shutting down");
    proxy.stop().await;
}

/// Waits for the next reloaded config, or forever without a watcher.
async fn recv_reload(
    reloads: &mut Option<tokio::sync::mpsc::Receiver<AppConfig>>,
) -> Option<AppConfig> {
    match reloads {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn list_directory(proxy: &SlsProxy) {
    match proxy.fetch_directory().await {
        Ok(servers) => {
            let sorted: BTreeMap<_, _> = servers.into_iter().collect();
            match serde_yaml::to_string(&sorted) {
                Ok(yaml) => print!("{}", yaml),
                Err(e) => {
                    error!(error = %e, "Failed to render directory");
                    std::process::exit(1);
                }
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to fetch directory");
            std::process::exit(1);
        }
    }
}

/// Load configuration from file or use defaults
fn load_config(args: &Args) -> (AppConfig, Option<ConfigManager>) {
    let config_path = args.config.clone().or_else(|| {
        let defaults = ["./config.yaml", "./config.yml", "/etc/sls-proxy/config.yaml"];
        defaults.iter().map(PathBuf::from).find(|p| p.exists())
    });

    let Some(path) = config_path else {
        return (AppConfig::default(), None);
    };

    match ConfigManager::new(&path) {
        Ok(manager) => (manager.get(), Some(manager)),
        Err(e) => {
            eprintln!("Warning: Failed to load config from {:?}: {}", path, e);
            eprintln!("Using default configuration");
            (AppConfig::default(), None)
        }
    }
}
