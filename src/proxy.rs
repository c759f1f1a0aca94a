//! Pingora-based directory proxy.
//!
//! Every request is forwarded to the single upstream directory service.
//! Responses on the directory path are buffered in full, rewritten with the
//! current override table and emitted with chunked framing. All other
//! responses stream through untouched.

use crate::config::ServerConfig;
use crate::directory::{DirectoryFetcher, ServerRecord, UpstreamTarget};
use crate::error::{ProxyError, Result as ProxyResult};
use crate::overrides::{apply_overrides, OverrideStore, OverrideTable};
use crate::resolver::AddressResolver;
use crate::xml;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header;
use pingora_core::prelude::*;
use pingora_core::server::configuration::ServerConf;
use pingora_core::server::{Fds, ListenFds};
use pingora_core::services::Service as _;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{http_proxy_service, FailToProxy, ProxyHttp, Session};
use std::collections::HashMap;
use std::os::fd::IntoRawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// How long `stop` waits for the listener to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Parses, rewrites and re-serializes a directory body.
pub fn rewrite_directory(raw: &[u8], rules: &OverrideTable) -> ProxyResult<Vec<u8>> {
    let mut doc = xml::parse(raw)?;
    apply_overrides(&mut doc, rules);
    Ok(doc.serialize())
}

/// Buffer-then-rewrite state for one intercepted response body.
#[derive(Debug)]
pub struct DirectoryCapture {
    buffer: BytesMut,
    limit: usize,
    overflowed: bool,
}

impl DirectoryCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            limit,
            overflowed: false,
        }
    }

    /// Whether the body outgrew the limit and is now streaming unmodified.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// Takes one upstream chunk. Returns bytes to send downstream now, which
    /// is nothing while the body is still being buffered.
    pub fn push(&mut self, chunk: Bytes) -> Option<Bytes> {
        if self.overflowed {
            return Some(chunk);
        }

        self.buffer.extend_from_slice(&chunk);
        if self.buffer.len() > self.limit {
            warn!(
                limit = self.limit,
                buffered = self.buffer.len(),
                "Directory body exceeds capture limit, passing through unmodified"
            );
            self.overflowed = true;
            return Some(self.buffer.split().freeze());
        }

        None
    }

    /// Ends the body and produces the final downstream bytes.
    ///
    /// A body that cannot be parsed is returned exactly as received.
    pub fn finish(&mut self, rules: &OverrideTable) -> Bytes {
        let raw = self.buffer.split().freeze();
        if self.overflowed {
            return raw;
        }

        match rewrite_directory(&raw, rules) {
            Ok(rewritten) => {
                debug!(
                    original = raw.len(),
                    rewritten = rewritten.len(),
                    "Directory rewritten"
                );
                Bytes::from(rewritten)
            }
            Err(e) => {
                error!(error = %e, "Failed to parse directory, passing it through unmodified");
                raw
            }
        }
    }
}

/// Context maintained across the request lifecycle.
pub struct ProxyContext {
    /// Request path, without query.
    pub path: String,

    /// Set when this response is the directory document.
    pub capture: Option<DirectoryCapture>,

    /// When the request arrived.
    pub started: Instant,
}

impl Default for ProxyContext {
    fn default() -> Self {
        Self {
            path: String::new(),
            capture: None,
            started: Instant::now(),
        }
    }
}

/// The request-handling service plugged into Pingora.
pub struct DirectoryProxyService {
    target: UpstreamTarget,
    resolver: Arc<AddressResolver>,
    overrides: Arc<OverrideStore>,
    settings: ServerConfig,
}

impl DirectoryProxyService {
    pub fn new(
        target: UpstreamTarget,
        resolver: Arc<AddressResolver>,
        overrides: Arc<OverrideStore>,
        settings: ServerConfig,
    ) -> Self {
        Self {
            target,
            resolver,
            overrides,
            settings,
        }
    }

    /// Whether a request path names the directory document. Query strings
    /// are not part of the comparison.
    pub fn is_directory_path(&self, path: &str) -> bool {
        path == self.target.path
    }

    /// Fails the exchange once it has run longer than `total_timeout`.
    fn check_deadline(&self, ctx: &ProxyContext) -> Result<()> {
        let elapsed = ctx.started.elapsed();
        if elapsed > self.settings.total_timeout() {
            return Error::e_explain(
                ErrorType::ReadTimedout,
                format!(
                    "upstream exchange exceeded total timeout of {}s",
                    self.settings.total_timeout
                ),
            );
        }
        Ok(())
    }

    async fn write_response(
        session: &mut Session,
        status: u16,
        body: Bytes,
    ) -> Result<()> {
        let mut resp = ResponseHeader::build(status, Some(2))?;
        resp.insert_header(header::CONTENT_TYPE, "text/plain")?;
        resp.insert_header(header::CONTENT_LENGTH, body.len().to_string())?;
        session.write_response_header(Box::new(resp), body.is_empty()).await?;
        if !body.is_empty() {
            session.write_response_body(Some(body), true).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyHttp for DirectoryProxyService {
    type CTX = ProxyContext;

    fn new_ctx(&self) -> Self::CTX {
        ProxyContext::default()
    }

    /// Classifies the request before anything is forwarded.
    async fn early_request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let uri = &session.req_header().uri;
        ctx.path = uri.path().to_string();

        let is_get = session.req_header().method == http::Method::GET;
        if is_get && self.is_directory_path(&ctx.path) {
            ctx.capture = Some(DirectoryCapture::new(self.settings.max_directory_size));
        }

        trace!(
            method = %session.req_header().method,
            path = %ctx.path,
            intercept = ctx.capture.is_some(),
            "Request received"
        );

        Ok(())
    }

    /// Answers requests whose target is not an origin-form path.
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        let uri = &session.req_header().uri;
        if uri.authority().is_none() && ctx.path.starts_with('/') {
            return Ok(false);
        }

        debug!(uri = %uri, "Ignoring non origin-form request");
        ctx.capture = None;
        let mut resp = ResponseHeader::build(200, Some(1))?;
        resp.insert_header(header::CONTENT_LENGTH, "0")?;
        session.write_response_header(Box::new(resp), true).await?;
        Ok(true)
    }

    /// Always the pinned upstream address.
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let ip = self.resolver.resolve().await.map_err(|e| {
            Error::explain(ErrorType::Custom("DNS resolution failed"), e.to_string())
        })?;

        let mut peer = HttpPeer::new((ip, self.target.port), false, self.target.host.clone());
        peer.options.connection_timeout = Some(self.settings.connect_timeout());
        peer.options.read_timeout = Some(self.settings.read_timeout());
        peer.options.write_timeout = Some(self.settings.write_timeout());
        peer.options.total_connection_timeout = Some(self.settings.total_timeout());

        trace!(ip = %ip, port = self.target.port, "Selected upstream peer");
        Ok(Box::new(peer))
    }

    /// Points the request at the upstream virtual host.
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        upstream_request.insert_header(header::HOST, self.target.host_header())?;

        // The captured body has to be plain XML.
        if ctx.capture.is_some() {
            upstream_request.remove_header(&header::ACCEPT_ENCODING);
        }

        trace!(
            method = %upstream_request.method,
            uri = %upstream_request.uri,
            "Sending upstream request"
        );

        Ok(())
    }

    /// Drops the upstream length for responses that will be rewritten.
    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        self.check_deadline(ctx)?;

        if ctx.capture.is_some() {
            if upstream_response.status == http::StatusCode::OK {
                upstream_response.remove_header(&header::CONTENT_LENGTH);
                upstream_response.insert_header(header::TRANSFER_ENCODING, "chunked")?;
            } else {
                debug!(
                    status = %upstream_response.status,
                    "Directory response is not 200 OK, not rewriting"
                );
                ctx.capture = None;
            }
        }

        trace!(
            status = %upstream_response.status,
            "Received upstream response"
        );

        Ok(())
    }

    /// Holds back the directory body until it is complete, then rewrites it.
    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>>
    where
        Self::CTX: Send + Sync,
    {
        self.check_deadline(ctx)?;

        let Some(capture) = ctx.capture.as_mut() else {
            return Ok(None);
        };

        let mut out = match body.take() {
            Some(chunk) => capture.push(chunk),
            None => None,
        };

        if end_of_stream {
            let snapshot = self.overrides.snapshot();
            let tail = capture.finish(&snapshot.rules);
            trace!(version = snapshot.version, "Rewrote directory with override table");
            out = match out {
                Some(head) if !tail.is_empty() => {
                    let mut joined = BytesMut::from(&head[..]);
                    joined.extend_from_slice(&tail);
                    Some(joined.freeze())
                }
                Some(head) => Some(head),
                None => Some(tail),
            };
        }

        *body = out;
        Ok(None)
    }

    /// Reports a forwarding failure to the affected client only.
    async fn fail_to_proxy(
        &self,
        session: &mut Session,
        e: &Error,
        ctx: &mut Self::CTX,
    ) -> FailToProxy
    where
        Self::CTX: Send + Sync,
    {
        error!(error = %e, path = %ctx.path, "Error proxying request");

        if session.response_written().is_none() {
            let body = Bytes::from(e.to_string());
            if let Err(write_err) = Self::write_response(session, 500, body).await {
                error!(error = %write_err, "Failed to write error response");
            }
        }

        FailToProxy {
            error_code: 500,
            can_reuse_downstream: false,
        }
    }

    /// Logging after request completion.
    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);

        debug!(
            path = %ctx.path,
            status = status,
            rewritten = ctx.capture.as_ref().map(|c| !c.overflowed()).unwrap_or(false),
            elapsed_ms = ctx.started.elapsed().as_millis() as u64,
            "Request completed"
        );
    }
}

struct RunningListener {
    addr: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A directory proxy with start/stop lifecycle and hot-swappable overrides.
pub struct SlsProxy {
    target: UpstreamTarget,
    settings: ServerConfig,
    resolver: Arc<AddressResolver>,
    overrides: Arc<OverrideStore>,
    listener: Mutex<Option<RunningListener>>,
}

impl SlsProxy {
    /// Creates a proxy that resolves the upstream through the system resolver.
    pub fn new(
        target: UpstreamTarget,
        settings: ServerConfig,
        overrides: OverrideTable,
    ) -> ProxyResult<Self> {
        let resolver = Arc::new(AddressResolver::new(target.host.clone()));
        Self::with_resolver(target, settings, overrides, resolver)
    }

    /// Creates a proxy with an explicit resolver.
    pub fn with_resolver(
        target: UpstreamTarget,
        settings: ServerConfig,
        overrides: OverrideTable,
        resolver: Arc<AddressResolver>,
    ) -> ProxyResult<Self> {
        Ok(Self {
            target,
            settings,
            resolver,
            overrides: Arc::new(OverrideStore::new(overrides)?),
            listener: Mutex::new(None),
        })
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Address the listener is bound to, while running.
    pub fn listen_addr(&self) -> Option<String> {
        self.listener.lock().unwrap().as_ref().map(|l| l.addr.clone())
    }

    /// Installs a new override table; takes effect for the next directory
    /// response without touching the listener.
    pub fn update_overrides(&self, table: OverrideTable) -> ProxyResult<u64> {
        self.overrides.update(table)
    }

    /// Currently active override version.
    pub fn overrides_version(&self) -> u64 {
        self.overrides.version()
    }

    /// Fetches the live directory once, outside the proxy path.
    pub async fn fetch_directory(&self) -> ProxyResult<HashMap<String, ServerRecord>> {
        let fetcher = DirectoryFetcher::new(
            self.target.clone(),
            self.resolver.clone(),
            self.settings.total_timeout(),
        )?;
        fetcher.fetch().await
    }

    /// Resolves the upstream and starts listening on `hostname`.
    ///
    /// The port is `server.port` if configured, otherwise the upstream port.
    /// Returns the bound address. Connections are queued from the moment
    /// this returns.
    pub async fn start(&self, hostname: &str) -> ProxyResult<String> {
        if let Some(addr) = self.listen_addr() {
            return Err(ProxyError::server(format!("already listening on {}", addr)));
        }

        let ip = self.resolver.resolve().await?;

        let port = self.settings.port.unwrap_or(self.target.port);
        let addr = if hostname.contains(':') && !hostname.starts_with('[') {
            format!("[{}]:{}", hostname, port)
        } else {
            format!("{}:{}", hostname, port)
        };

        // Bind here so failures reach the caller; Pingora adopts the socket.
        let socket = tokio::net::TcpListener::bind(&addr).await?;
        let addr = socket.local_addr()?.to_string();
        let fd = socket.into_std()?.into_raw_fd();
        let mut fds = Fds::new();
        fds.add(addr.clone(), fd);
        let fds: ListenFds = Arc::new(tokio::sync::Mutex::new(fds));

        let service = DirectoryProxyService::new(
            self.target.clone(),
            self.resolver.clone(),
            self.overrides.clone(),
            self.settings.clone(),
        );
        let conf = Arc::new(ServerConf::default());
        let mut proxy_service = http_proxy_service(&conf, service);
        proxy_service.add_tcp(&addr);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            proxy_service.start_service(Some(fds), shutdown_rx, 1).await;
        });

        info!(
            listen = %addr,
            upstream = %self.target.host_header(),
            upstream_ip = %ip,
            path = %self.target.path,
            "Proxy listening"
        );

        let mut listener = self.listener.lock().unwrap();
        *listener = Some(RunningListener {
            addr: addr.clone(),
            shutdown,
            task,
        });
        Ok(addr)
    }

    /// Stops the listener and releases its socket and upstream connections.
    pub async fn stop(&self) {
        let running = self.listener.lock().unwrap().take();
        let Some(running) = running else {
            return;
        };

        let _ = running.shutdown.send(true);
        match tokio::time::timeout(SHUTDOWN_GRACE, running.task).await {
            Ok(Ok(())) => info!(listen = %running.addr, "Proxy stopped"),
            Ok(Err(e)) => error!(error = %e, "Proxy task ended abnormally"),
            Err(_) => warn!(listen = %running.addr, "Proxy did not stop in time"),
        }
    }
}
