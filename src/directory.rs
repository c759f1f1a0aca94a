//! The upstream directory service: where it lives, what its entries look
//! like, and a one-shot fetch for diagnostics.

use crate::error::{ProxyError, Result};
use crate::resolver::AddressResolver;
use crate::xml::{self, Document, Element};
use http::{header, Uri};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default upstream directory URL.
pub const DEFAULT_URL: &str = "http://sls.service.enmasse.com:8080/servers/list.en";

/// The single directory service this proxy fronts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    /// Path of the directory document, e.g. `/servers/list.en`.
    pub path: String,
}

impl UpstreamTarget {
    /// Parses an `http://host[:port]/path` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let uri: Uri = url.parse().map_err(|e| {
            ProxyError::config_validation(format!("Invalid upstream URL {}: {}", url, e))
        })?;

        match uri.scheme_str() {
            Some("http") | None => {}
            Some(other) => {
                return Err(ProxyError::config_validation(format!(
                    "Unsupported upstream scheme: {}",
                    other
                )))
            }
        }

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::config_validation(format!("Upstream URL has no host: {}", url)))?;

        let path = match uri.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };

        Ok(Self {
            host: host.to_string(),
            port: uri.port_u16().unwrap_or(80),
            path,
        })
    }

    /// Value for the `Host` header sent upstream. The default port is omitted.
    pub fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// One `server` entry of the directory.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct ServerRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
}

impl ServerRecord {
    /// Reads the typed fields of a `server` element. Entries without an id
    /// yield `None`.
    pub fn from_element(server: &Element) -> Option<Self> {
        let id = server.child("id").map(Element::text).filter(|id| !id.is_empty())?;
        let name = server.child("name");

        Some(Self {
            id,
            ip: server.child("ip").map(Element::text),
            port: server.child("port").map(Element::text),
            name: name.map(Element::text),
            raw_name: name.and_then(|n| n.attribute("raw_name")).map(str::to_string),
            sort: server
                .child("crowdness")
                .and_then(|c| c.attribute("sort"))
                .map(str::to_string),
        })
    }
}

/// All identifiable server entries in document order.
pub fn server_records(doc: &Document) -> Vec<ServerRecord> {
    doc.elements_named("server")
        .into_iter()
        .filter_map(ServerRecord::from_element)
        .collect()
}

/// Server entries keyed by id. Later entries win when ids repeat.
pub fn server_map(doc: &Document) -> HashMap<String, ServerRecord> {
    server_records(doc)
        .into_iter()
        .map(|record| (record.id.clone(), record))
        .collect()
}

/// One-shot retrieval of the live directory, independent of the proxy path.
pub struct DirectoryFetcher {
    target: UpstreamTarget,
    resolver: Arc<AddressResolver>,
    client: reqwest::Client,
}

impl DirectoryFetcher {
    pub fn new(
        target: UpstreamTarget,
        resolver: Arc<AddressResolver>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            target,
            resolver,
            client,
        })
    }

    fn url(&self, resolved: Option<std::net::IpAddr>) -> String {
        match resolved {
            Some(ip) => format!(
                "http://{}{}",
                SocketAddr::new(ip, self.target.port),
                self.target.path
            ),
            None => format!(
                "http://{}:{}{}",
                self.target.host, self.target.port, self.target.path
            ),
        }
    }

    /// Downloads and parses the directory.
    pub async fn fetch(&self) -> Result<HashMap<String, ServerRecord>> {
        // An unresolved host still gets a chance through the client's own lookup.
        let resolved = match self.resolver.resolve().await {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!(error = %e, "Falling back to unpinned upstream lookup");
                None
            }
        };

        let url = self.url(resolved);
        debug!(url = %url, "Fetching directory");

        let response = self
            .client
            .get(&url)
            .header(header::HOST, self.target.host_header())
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;
        debug!(bytes = body.len(), "Received directory");

        let doc = xml::parse(&body)?;
        let servers = server_map(&doc);
        info!(servers = servers.len(), "Directory fetched");
        Ok(servers)
    }
}
