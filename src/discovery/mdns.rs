//! mDNS-SD backed [`ServiceBrowser`].

use super::resolver::{Advertisement, Browse, DiscoveryError, ServiceBrowser};
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Starts a fresh daemon for every browse and shuts it down when the
/// [`Browse`] is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct MdnsBrowser;

impl ServiceBrowser for MdnsBrowser {
    fn browse(&self, service_type: &str) -> Result<Browse, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Daemon(e.to_string()))?;
        let receiver = daemon
            .browse(service_type)
            .map_err(|e| DiscoveryError::Browse {
                service: service_type.to_string(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(16);
        tokio::task::spawn_blocking(move || loop {
            if tx.is_closed() {
                break;
            }
            match receiver.recv_timeout(POLL_INTERVAL) {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    let advert = Advertisement {
                        instance: info.get_fullname().to_string(),
                        host: info.get_hostname().to_string(),
                        addresses: info.get_addresses_v4().into_iter().copied().collect(),
                        port: info.get_port(),
                    };
                    if tx.blocking_send(advert).is_err() {
                        break;
                    }
                }
                Ok(other) => debug!("mDNS event: {:?}", other),
                Err(_) if receiver.is_disconnected() => break,
                Err(_) => {}
            }
        });

        let service_type = service_type.to_string();
        Ok(Browse::new(rx, move || {
            if let Err(e) = daemon.stop_browse(&service_type) {
                debug!("Failed to stop browsing {}: {}", service_type, e);
            }
            if let Err(e) = daemon.shutdown() {
                warn!("Failed to shut down mDNS daemon: {}", e);
            }
        }))
    }
}
