//! # Wireless Association
//!
//! Brings the station interface from idle to an IP-addressed state.
//!
//! ```text
//! wifi/
//! ├── association.rs  - pure state machine (events in, effects out)
//! ├── driver.rs       - radio boundary and the hosted driver
//! ├── indicator.rs    - blink task shown while an attempt is in flight
//! └── manager.rs      - per-attempt event task, associate/disassociate
//! ```
//!
//! Two policies share the same machine: [`AssociationMode::Run`] retries up to
//! the configured bound and then keeps the link up for the life of the
//! process, [`AssociationMode::Test`] makes a single attempt for provisioning
//! checks.

pub mod association;
pub mod driver;
pub mod indicator;
pub mod manager;

pub use association::{AssociationMode, AssociationSnapshot, AssociationStatus, MAX_RETRY};
pub use driver::{DriverError, HostDriver, WifiDriver, WifiEvent, WifiEventSender};
pub use indicator::{shared, Blinker, LogLed, SharedLed, StatusLed};
pub use manager::{AssociationContext, WifiError, WifiManager};
