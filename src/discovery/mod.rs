//! # Broker Discovery
//!
//! Finds a broker advertised on the local network so the device can be
//! provisioned without typing an address. Discovery rides on the link the
//! association manager already brought up.

pub mod mdns;
pub mod resolver;

pub use mdns::MdnsBrowser;
pub use resolver::{
    discover, Advertisement, Browse, DiscoveredBroker, DiscoveryError, ServiceBrowser,
};
