//! Error types for the sls-proxy application.
//!
//! Errors that belong to a single request (parse, forward) are handled where
//! they occur; everything else is surfaced through [`ProxyError`].

use thiserror::Error;

/// Main error type for the sls-proxy application.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration file could not be found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}")]
    ConfigValidation { message: String },

    /// An override rule was rejected before it could reach a rewrite pass.
    #[error("Invalid override for server {id}: {message}")]
    InvalidOverride { id: String, message: String },

    /// The upstream hostname could not be resolved.
    #[error(transparent)]
    Resolution(#[from] ResolveError),

    /// The directory document is not well-formed XML.
    #[error("Malformed directory document at byte {position}: {message}")]
    XmlParse { position: u64, message: String },

    /// The one-shot directory fetch failed.
    #[error("Failed to fetch directory: {message}")]
    Fetch { message: String },

    /// The proxy listener could not be started or stopped.
    #[error("Proxy server error: {message}")]
    Server { message: String },

    /// I/O error wrapper.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Creates a new configuration parse error.
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
        }
    }

    /// Creates a new configuration validation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Creates a new override rejection for the given server id.
    pub fn invalid_override(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOverride {
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn xml_parse(position: u64, message: impl Into<String>) -> Self {
        Self::XmlParse {
            position,
            message: message.into(),
        }
    }

    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
        }
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        Self::fetch(e.to_string())
    }
}

/// DNS lookup failure for the upstream host.
///
/// Cloneable so that every caller waiting on the same in-flight lookup
/// receives an identical error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to resolve {host}: {message}")]
pub struct ResolveError {
    /// The hostname that was looked up.
    pub host: String,
    /// Description of the lookup failure.
    pub message: String,
}

impl ResolveError {
    pub fn new(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            message: message.into(),
        }
    }
}

/// Result type alias using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
