//! # Broker Session
//!
//! Everything between a broker URI and a light that follows the state pushed
//! to it.
//!
//! ```text
//! mqtt/
//! ├── config.rs       - Broker URI and session parameters
//! ├── topics.rs       - Device identity and derived topics
//! ├── handshake.rs    - Staged subscription machine, no I/O
//! ├── session.rs      - Client lifecycle and the event loop task
//! └── light_state.rs  - Handler turning state messages into a LightState
//! ```
//!
//! The event loop task is the only writer of the session state. Readers get
//! a [`SessionContext`] backed by a watch channel.

pub mod config;
pub mod handshake;
pub mod light_state;
pub mod session;
pub mod topics;

pub use config::{BrokerUri, SessionConfig, SessionMode, UriError, DEFAULT_PORT};
pub use handshake::{ConnectionState, SessionSnapshot};
pub use light_state::{LightState, LightStateHandler};
pub use session::{NoopHandler, SessionContext, SessionController, SessionError, SessionHandler};
pub use topics::DeviceIdentity;
