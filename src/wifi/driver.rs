//! Boundary between the association manager and the radio.
//!
//! A driver performs the requested operation and reports what the link does
//! afterwards as [`WifiEvent`]s on the sender it was given at `init`. The
//! manager never inspects driver internals, it only reacts to events.

use crate::persistence::NetworkCredentials;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Events delivered asynchronously by the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WifiEvent {
    /// Station interface is up, association may begin.
    StaStart,
    /// Address assignment completed.
    GotIp(Ipv4Addr),
    /// Link lost, or an association attempt failed.
    StaDisconnected,
}

pub type WifiEventSender = mpsc::UnboundedSender<WifiEvent>;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Wifi driver not initialized")]
    NotInitialized,

    #[error("Wifi driver not started")]
    NotStarted,

    #[error("Wifi driver failure: {0}")]
    Failure(String),
}

/// Station mode radio driver.
pub trait WifiDriver: Send + 'static {
    /// Allocates driver resources. Failure here is fatal for the process.
    fn init(&mut self, events: WifiEventSender) -> Result<(), DriverError>;

    fn set_credentials(&mut self, credentials: &NetworkCredentials) -> Result<(), DriverError>;

    /// Brings the station interface up, answered with [`WifiEvent::StaStart`].
    fn start(&mut self) -> Result<(), DriverError>;

    /// Starts one association attempt, answered with `GotIp` or `StaDisconnected`.
    fn connect(&mut self) -> Result<(), DriverError>;

    fn disconnect(&mut self) -> Result<(), DriverError>;

    fn stop(&mut self) -> Result<(), DriverError>;

    fn deinit(&mut self) -> Result<(), DriverError>;
}

/// Driver for hosts where the operating system owns the wireless link.
///
/// Association is reduced to checking that the host has a route towards the
/// local network: `connect` resolves the source address the kernel would use
/// for the mDNS multicast group and reports it as the assigned address.
#[derive(Debug)]
pub struct HostDriver {
    events: Option<WifiEventSender>,
    started: bool,
    ssid: Option<String>,
    route_target: SocketAddr,
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new(SocketAddr::from(([224, 0, 0, 251], 5353)))
    }
}

impl HostDriver {
    pub fn new(route_target: SocketAddr) -> Self {
        Self {
            events: None,
            started: false,
            ssid: None,
            route_target,
        }
    }

    fn events(&self) -> Result<&WifiEventSender, DriverError> {
        self.events.as_ref().ok_or(DriverError::NotInitialized)
    }

    fn emit(&self, event: WifiEvent) -> Result<(), DriverError> {
        self.events()?
            .send(event)
            .map_err(|e| DriverError::Failure(format!("event channel closed: {}", e)))
    }

    fn local_address(&self) -> std::io::Result<Ipv4Addr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(self.route_target)?;
        match socket.local_addr()? {
            SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Ok(*addr.ip()),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("no usable IPv4 source address ({})", other),
            )),
        }
    }
}

impl WifiDriver for HostDriver {
    fn init(&mut self, events: WifiEventSender) -> Result<(), DriverError> {
        self.events = Some(events);
        debug!("Host driver initialized");
        Ok(())
    }

    fn set_credentials(&mut self, credentials: &NetworkCredentials) -> Result<(), DriverError> {
        self.events()?;
        self.ssid = Some(credentials.ssid.clone());
        Ok(())
    }

    fn start(&mut self) -> Result<(), DriverError> {
        self.events()?;
        self.started = true;
        self.emit(WifiEvent::StaStart)
    }

    fn connect(&mut self) -> Result<(), DriverError> {
        if !self.started {
            return Err(DriverError::NotStarted);
        }

        info!(
            "Link for {} is managed by the host, probing route",
            self.ssid.as_deref().unwrap_or("<unset>")
        );
        match self.local_address() {
            Ok(ip) => self.emit(WifiEvent::GotIp(ip)),
            Err(e) => {
                warn!("No route to the local network: {}", e);
                self.emit(WifiEvent::StaDisconnected)
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), DriverError> {
        self.events()?;
        if !self.started {
            return Err(DriverError::NotStarted);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DriverError> {
        self.started = false;
        Ok(())
    }

    fn deinit(&mut self) -> Result<(), DriverError> {
        self.events = None;
        self.ssid = None;
        Ok(())
    }
}
