//! Broker Discovery Resolver
//!
//! Queries the local network for an advertised broker and returns the first
//! usable answer. Every call opens its own [`Browse`] and drops it before
//! returning, so nothing of a previous query survives into the next one.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to start discovery daemon: {0}")]
    Daemon(String),

    #[error("Failed to browse for {service}: {reason}")]
    Browse { service: String, reason: String },
}

/// A service announcement as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub instance: String,
    pub host: String,
    pub addresses: Vec<Ipv4Addr>,
    pub port: u16,
}

/// Broker location produced by one discovery call. Never persisted as is,
/// callers store [`DiscoveredBroker::uri`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredBroker {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl DiscoveredBroker {
    pub fn uri(&self) -> String {
        format!("mqtt://{}:{}/", self.address, self.port)
    }
}

impl fmt::Display for DiscoveredBroker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A running query. Dropping it stops the underlying resolver.
pub struct Browse {
    adverts: mpsc::Receiver<Advertisement>,
    shutdown: Option<Box<dyn FnOnce() + Send>>,
}

impl Browse {
    pub fn new(
        adverts: mpsc::Receiver<Advertisement>,
        shutdown: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            adverts,
            shutdown: Some(Box::new(shutdown)),
        }
    }

    pub async fn next(&mut self) -> Option<Advertisement> {
        self.adverts.recv().await
    }
}

impl Drop for Browse {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown();
        }
    }
}

/// Source of service advertisements.
pub trait ServiceBrowser: Send + Sync {
    fn browse(&self, service_type: &str) -> Result<Browse, DiscoveryError>;
}

/// Looks for `service_type` for at most `timeout`.
///
/// The first advertisement that resolves to an IPv4 address wins. `Ok(None)`
/// means nothing usable was seen during the whole window.
pub async fn discover(
    browser: &dyn ServiceBrowser,
    service_type: &str,
    timeout: Duration,
) -> Result<Option<DiscoveredBroker>, DiscoveryError> {
    info!(
        "Looking for {} (timeout {}s)",
        service_type,
        timeout.as_secs_f32()
    );
    let mut browse = browser.browse(service_type)?;

    let search = async {
        loop {
            match browse.next().await {
                Some(advert) => {
                    debug!("Advertisement received: {:?}", advert);
                    if let Some(broker) = resolve(&advert).await {
                        return broker;
                    }
                }
                None => {
                    warn!("Browser for {} stopped early", service_type);
                    std::future::pending::<()>().await;
                }
            }
        }
    };

    let found = tokio::time::timeout(timeout, search).await.ok();
    drop(browse);

    match found {
        Some(broker) => info!("Broker found at {}", broker),
        None => info!("No broker advertised for {}", service_type),
    }
    Ok(found)
}

async fn resolve(advert: &Advertisement) -> Option<DiscoveredBroker> {
    if advert.port == 0 {
        warn!("Ignoring {} advertised on port 0", advert.instance);
        return None;
    }

    if let Some(address) = advert.addresses.first() {
        return Some(DiscoveredBroker {
            address: *address,
            port: advert.port,
        });
    }

    let host = advert.host.trim_end_matches('.');
    match tokio::net::lookup_host((host, advert.port)).await {
        Ok(addrs) => {
            let resolved = addrs.into_iter().find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            });
            if resolved.is_none() {
                warn!("{} has no IPv4 address", host);
            }
            resolved.map(|address| DiscoveredBroker {
                address,
                port: advert.port,
            })
        }
        Err(e) => {
            warn!("Failed to resolve {}: {}", host, e);
            None
        }
    }
}
