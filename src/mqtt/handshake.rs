//! Staged subscription handshake.
//!
//! On every (re)connection the device announces itself and subscribes to the
//! switch topic only. The first switch message unlocks the colour topic, the
//! first colour message marks the device ready and unlocks the check topic:
//!
//! ```text
//! ConnAck ──► publish /connected, subscribe switch
//!               │ first switch message
//!               ▼
//!             subscribe color
//!               │ first color message
//!               ▼
//!             state ready, subscribe check
//! ```
//!
//! The acked flags only decide when the next stage starts; every message on a
//! state topic is dispatched regardless.

use super::config::SessionMode;
use super::topics::DeviceIdentity;
use tracing::{debug, info};

/// Tri-state connection flag. `Unset` means the session never connected,
/// `Disconnected` means it connected and dropped afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unset,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub connection_state: ConnectionState,
    pub switch_topic_acked: bool,
    pub color_topic_acked: bool,
    /// Most recent transport error, cleared on connection.
    pub last_error: Option<String>,
}

/// Work the session task has to carry out, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Publish { topic: String, payload: String },
    Subscribe { topic: String },
    Switch(Vec<u8>),
    Color(Vec<u8>),
    StateReady,
}

#[derive(Debug)]
pub struct Handshake {
    identity: DeviceIdentity,
    mode: SessionMode,
    snapshot: SessionSnapshot,
    check_subscribed: bool,
}

impl Handshake {
    pub fn new(identity: DeviceIdentity, mode: SessionMode) -> Self {
        Self {
            identity,
            mode,
            snapshot: SessionSnapshot::default(),
            check_subscribed: false,
        }
    }

    pub fn snapshot(&self) -> &SessionSnapshot {
        &self.snapshot
    }

    pub fn on_connected(&mut self) -> Vec<Command> {
        info!("Connected to broker as {}", self.identity.client_id());
        self.snapshot.connection_state = ConnectionState::Connected;
        self.snapshot.last_error = None;

        if self.mode == SessionMode::Test {
            return Vec::new();
        }

        self.snapshot.switch_topic_acked = false;
        self.snapshot.color_topic_acked = false;
        self.check_subscribed = false;

        info!("Subscribing to switch topic...");
        vec![
            self.announcement(),
            Command::Subscribe {
                topic: self.identity.topics().switch.clone(),
            },
        ]
    }

    pub fn on_disconnected(&mut self) {
        if self.snapshot.connection_state == ConnectionState::Connected {
            info!("Disconnected from broker");
            self.snapshot.connection_state = ConnectionState::Disconnected;
        }
    }

    pub fn on_error(&mut self, error: String) {
        self.on_disconnected();
        self.snapshot.last_error = Some(error);
    }

    pub fn on_message(&mut self, topic: &str, payload: &[u8]) -> Vec<Command> {
        if self.mode == SessionMode::Test {
            return Vec::new();
        }

        let topics = self.identity.topics();
        if topic == topics.check {
            debug!("State check received");
            vec![self.announcement()]
        } else if topic == topics.switch {
            let mut commands = vec![Command::Switch(payload.to_vec())];
            if !self.snapshot.switch_topic_acked {
                self.snapshot.switch_topic_acked = true;
                info!("Switch state initialized, subscribing to color topic...");
                commands.push(Command::Subscribe {
                    topic: topics.color.clone(),
                });
            }
            commands
        } else if topic == topics.color {
            let mut commands = vec![Command::Color(payload.to_vec())];
            if self.snapshot.switch_topic_acked && !self.snapshot.color_topic_acked {
                self.snapshot.color_topic_acked = true;
                info!("Initialization complete!");
                commands.push(Command::StateReady);
                if !self.check_subscribed {
                    self.check_subscribed = true;
                    commands.push(Command::Subscribe {
                        topic: topics.check.clone(),
                    });
                }
            }
            commands
        } else {
            debug!("Ignoring message on unexpected topic {}", topic);
            Vec::new()
        }
    }

    fn announcement(&self) -> Command {
        Command::Publish {
            topic: self.identity.topics().connection.clone(),
            payload: self.identity.token().to_string(),
        }
    }
}
