use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1883;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UriError {
    #[error("Broker uri is empty")]
    Empty,

    #[error("Unsupported scheme: {0}")]
    Scheme(String),

    #[error("Broker uri has no host: {0}")]
    MissingHost(String),

    #[error("Invalid port in broker uri: {0}")]
    Port(String),
}

/// Broker address as persisted in the store, `mqtt://host:port/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUri {
    pub host: String,
    pub port: u16,
}

impl BrokerUri {
    /// Accepts `mqtt://`, `tcp://` or no scheme, an optional port and an
    /// optional trailing path.
    pub fn parse(raw: &str) -> Result<Self, UriError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(UriError::Empty);
        }

        let rest = match raw.split_once("://") {
            Some((scheme, rest)) => {
                if !matches!(scheme.to_ascii_lowercase().as_str(), "mqtt" | "tcp") {
                    return Err(UriError::Scheme(scheme.to_string()));
                }
                rest
            }
            None => raw,
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| UriError::Port(raw.to_string()))?;
                (host, port)
            }
            None => (authority, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(UriError::MissingHost(raw.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl FromStr for BrokerUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BrokerUri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "mqtt://{}:{}/", self.host, self.port)
    }
}

/// Which handshake a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Full staged handshake, state dispatch and liveness answers.
    Run,
    /// Connection check only: no publish, no subscription.
    Test,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub broker: BrokerUri,
    pub keepalive: Duration,
    pub mode: SessionMode,
    pub blink_period: Duration,
    /// Pause before the event loop reconnects after a transport error.
    pub reconnect_delay: Duration,
}

impl SessionConfig {
    pub fn new(broker: BrokerUri, keepalive: Duration, mode: SessionMode) -> Self {
        Self {
            broker,
            keepalive,
            mode,
            blink_period: Duration::from_millis(300),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}
