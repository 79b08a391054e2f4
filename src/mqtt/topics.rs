//! Device identity and the topics derived from it.
//!
//! A [`DeviceIdentity`] is built from the stored id at session start and is
//! immutable; a different id means a new identity with freshly derived topics.

pub const CONNECTION_TOPIC: &str = "/connected";
pub const DISCONNECTION_TOPIC: &str = "/disconnected";
pub const CHECK_TOPIC: &str = "/check";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    id: u32,
    token: String,
    client_id: String,
    topics: Topics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Devices announce themselves here on every (re)connection.
    pub connection: String,
    /// Last-will destination.
    pub disconnection: String,
    /// Polled by controllers; answered with a re-announcement.
    pub check: String,
    pub switch: String,
    pub color: String,
}

impl DeviceIdentity {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            token: id.to_string(),
            client_id: format!("light_{}", id),
            topics: Topics {
                connection: CONNECTION_TOPIC.to_string(),
                disconnection: DISCONNECTION_TOPIC.to_string(),
                check: CHECK_TOPIC.to_string(),
                switch: format!("/buildings/{}/state/switch", id),
                color: format!("/devices/{}/state/color", id),
            },
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Payload of announcements and of the last will: the decimal id.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }
}
