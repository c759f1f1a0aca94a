//! Upstream address resolution.
//!
//! The proxy fronts exactly one upstream host. Its address is looked up once
//! and pinned for the lifetime of the [`AddressResolver`]. Concurrent callers
//! that arrive before the first lookup completes all wait on the same
//! in-flight lookup and observe the same outcome. A failed lookup is not
//! cached, so the next call starts a fresh one.

use crate::error::ResolveError;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Source of address records for a hostname.
#[async_trait]
pub trait HostLookup: Send + Sync {
    /// Returns every address the hostname resolves to, in resolver order.
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Lookup through the operating system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

#[async_trait]
impl HostLookup for SystemLookup {
    async fn lookup(&self, host: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

type PendingLookup = Shared<BoxFuture<'static, Result<IpAddr, ResolveError>>>;

enum Slot {
    Empty,
    Pending { generation: u64, lookup: PendingLookup },
    Resolved(IpAddr),
}

struct State {
    slot: Slot,
    next_generation: u64,
}

/// Resolve-once cache for the upstream host.
pub struct AddressResolver {
    host: String,
    lookup: Arc<dyn HostLookup>,
    state: Mutex<State>,
}

impl AddressResolver {
    /// Creates a resolver that uses the system resolver.
    pub fn new(host: impl Into<String>) -> Self {
        Self::with_lookup(host, Arc::new(SystemLookup))
    }

    /// Creates a resolver backed by a custom lookup.
    pub fn with_lookup(host: impl Into<String>, lookup: Arc<dyn HostLookup>) -> Self {
        Self {
            host: host.into(),
            lookup,
            state: Mutex::new(State {
                slot: Slot::Empty,
                next_generation: 0,
            }),
        }
    }

    /// The hostname this resolver looks up.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the pinned address, if one has been resolved.
    pub fn cached(&self) -> Option<IpAddr> {
        match self.state.lock().unwrap().slot {
            Slot::Resolved(ip) => Some(ip),
            _ => None,
        }
    }

    /// Forgets the pinned address. The next `resolve` performs a new lookup.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.slot = Slot::Empty;
        debug!(host = %self.host, "Upstream address cache cleared");
    }

    /// Resolves the upstream host, reusing the pinned address when present.
    pub async fn resolve(&self) -> Result<IpAddr, ResolveError> {
        let (generation, lookup) = {
            let mut state = self.state.lock().unwrap();
            match &state.slot {
                Slot::Resolved(ip) => return Ok(*ip),
                Slot::Pending { generation, lookup } => (*generation, lookup.clone()),
                Slot::Empty => {
                    let generation = state.next_generation;
                    state.next_generation += 1;
                    let lookup = self.start_lookup();
                    state.slot = Slot::Pending {
                        generation,
                        lookup: lookup.clone(),
                    };
                    (generation, lookup)
                }
            }
        };

        let outcome = lookup.await;

        let mut state = self.state.lock().unwrap();
        // A reset or a newer lookup may have replaced the slot meanwhile.
        if matches!(&state.slot, Slot::Pending { generation: g, .. } if *g == generation) {
            state.slot = match &outcome {
                Ok(ip) => Slot::Resolved(*ip),
                Err(_) => Slot::Empty,
            };
        }

        outcome
    }

    fn start_lookup(&self) -> PendingLookup {
        let host = self.host.clone();
        let lookup = self.lookup.clone();

        async move {
            debug!(host = %host, "Resolving upstream host");
            match lookup.lookup(&host).await {
                Ok(addrs) => match addrs.first() {
                    Some(ip) => {
                        info!(host = %host, ip = %ip, "Upstream host resolved");
                        Ok(*ip)
                    }
                    None => {
                        warn!(host = %host, "Upstream host has no address records");
                        Err(ResolveError::new(host, "no address records"))
                    }
                },
                Err(e) => {
                    warn!(host = %host, error = %e, "Upstream host resolution failed");
                    Err(ResolveError::new(host, e.to_string()))
                }
            }
        }
        .boxed()
        .shared()
    }
}

impl std::fmt::Debug for AddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressResolver")
            .field("host", &self.host)
            .field("cached", &self.cached())
            .finish()
    }
}
