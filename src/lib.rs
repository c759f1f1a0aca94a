//! # SLS Proxy Library
//!
//! A transparent reverse proxy in front of a game-server directory service
//! (SLS). All traffic is forwarded to the upstream unchanged, except the
//! directory document itself, which is rewritten according to per-server
//! override rules before it reaches the client.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, validation, and hot-reload support
//! - [`directory`]: Upstream target, server records and the one-shot fetcher
//! - [`error`]: Error types and handling
//! - [`logging`]: Logging setup and configuration
//! - [`overrides`]: Override rules and the directory rewrite engine
//! - [`proxy`]: The Pingora-based intercepting proxy
//! - [`resolver`]: Resolve-once upstream address cache
//! - [`xml`]: Directory document tree, parser and serializer
//!
//! ## Example
//!
//! ```ignore
//! use sls_proxy::config::ConfigManager;
//! use sls_proxy::proxy::SlsProxy;
//!
//! let manager = ConfigManager::new("config.yaml")?;
//! let config = manager.get();
//!
//! let proxy = SlsProxy::new(config.upstream_target()?, config.server.clone(), config.servers)?;
//! proxy.start("127.0.0.1").await?;
//! ```
//!
//! ## Override Modes
//!
//! 1. **Duplicate** (`overwrite: false`): the genuine entry is kept and a
//!    copy pointing at the override address is added with crowdness sort `0`
//! 2. **Overwrite** (`overwrite: true`): the genuine entry is edited in place

pub mod config;
pub mod directory;
pub mod error;
pub mod logging;
pub mod overrides;
pub mod proxy;
pub mod resolver;
pub mod xml;

pub use config::{AppConfig, ConfigManager};
pub use directory::{DirectoryFetcher, ServerRecord, UpstreamTarget};
pub use error::{ProxyError, ResolveError, Result};
pub use overrides::{apply_overrides, OverrideRule, OverrideStore, OverrideTable};
pub use proxy::SlsProxy;
pub use resolver::AddressResolver;
