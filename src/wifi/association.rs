//! Association state machine.
//!
//! ```text
//!            StaStart
//! Idle ──► Waiting ─────► (connect)
//!            │  ▲
//!            │  └── StaDisconnected, run mode, retry_count < max_retry
//!            │
//!            ├── GotIp ──────────────────────────► Connected
//!            └── StaDisconnected (test mode,
//!                or retry budget exhausted) ────► Disconnected
//! ```
//!
//! The machine is pure: it consumes [`WifiEvent`]s and returns the
//! [`Effect`]s the manager task has to carry out. Terminal states never revert
//! within one attempt.

use super::driver::WifiEvent;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// Default run-mode retry bound.
pub const MAX_RETRY: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationMode {
    /// Retry on link loss, stay associated once connected.
    Run,
    /// One attempt, the first link loss is final.
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssociationStatus {
    #[default]
    Waiting,
    Connected,
    Disconnected,
}

impl AssociationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AssociationStatus::Waiting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Ask the driver for another association attempt.
    Connect,
    /// Stop the liveness indicator. Emitted at most once per attempt.
    CancelIndicator,
    /// The attempt reached a terminal status.
    Terminal(AssociationStatus),
}

/// Observable state of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AssociationSnapshot {
    pub status: AssociationStatus,
    pub retry_count: u32,
    pub address: Option<Ipv4Addr>,
}

#[derive(Debug)]
pub struct AssociationMachine {
    mode: AssociationMode,
    max_retry: u32,
    snapshot: AssociationSnapshot,
    indicator_armed: bool,
}

impl AssociationMachine {
    pub fn new(mode: AssociationMode, max_retry: u32) -> Self {
        Self {
            mode,
            max_retry,
            snapshot: AssociationSnapshot::default(),
            indicator_armed: true,
        }
    }

    pub fn snapshot(&self) -> AssociationSnapshot {
        self.snapshot
    }

    pub fn handle(&mut self, event: WifiEvent) -> Vec<Effect> {
        match event {
            WifiEvent::StaStart => {
                if self.snapshot.status == AssociationStatus::Waiting {
                    vec![Effect::Connect]
                } else {
                    Vec::new()
                }
            }
            WifiEvent::GotIp(ip) => self.on_got_ip(ip),
            WifiEvent::StaDisconnected => self.on_disconnected(),
        }
    }

    fn on_got_ip(&mut self, ip: Ipv4Addr) -> Vec<Effect> {
        info!("Got ip: {}", ip);
        self.snapshot.address = Some(ip);
        self.snapshot.retry_count = 0;

        if self.snapshot.status != AssociationStatus::Waiting {
            debug!("Link restored after reaching {:?}", self.snapshot.status);
            return Vec::new();
        }

        self.finish(AssociationStatus::Connected)
    }

    fn on_disconnected(&mut self) -> Vec<Effect> {
        match (self.snapshot.status, self.mode) {
            (AssociationStatus::Waiting, AssociationMode::Test) => {
                info!("Connection failed");
                self.finish(AssociationStatus::Disconnected)
            }
            (AssociationStatus::Waiting, AssociationMode::Run) => {
                if self.snapshot.retry_count < self.max_retry {
                    self.snapshot.retry_count += 1;
                    info!(
                        "Retry to connect to the AP ({}/{})",
                        self.snapshot.retry_count, self.max_retry
                    );
                    vec![Effect::Connect]
                } else {
                    warn!("Fail to connect to the AP. Check your connection parameters.");
                    self.finish(AssociationStatus::Disconnected)
                }
            }
            (AssociationStatus::Connected, AssociationMode::Run) => {
                // Keep the radio associated for the rest of the process life.
                self.snapshot.address = None;
                if self.snapshot.retry_count < self.max_retry {
                    self.snapshot.retry_count += 1;
                    info!(
                        "Link lost, reconnecting ({}/{})",
                        self.snapshot.retry_count, self.max_retry
                    );
                    vec![Effect::Connect]
                } else {
                    warn!("Link lost and retry budget exhausted");
                    Vec::new()
                }
            }
            (status, mode) => {
                debug!("Ignoring link loss in {:?} ({:?} mode)", status, mode);
                Vec::new()
            }
        }
    }

    fn finish(&mut self, status: AssociationStatus) -> Vec<Effect> {
        self.snapshot.status = status;
        let mut effects = Vec::with_capacity(2);
        if std::mem::take(&mut self.indicator_armed) {
            effects.push(Effect::CancelIndicator);
        }
        effects.push(Effect::Terminal(status));
        effects
    }
}
