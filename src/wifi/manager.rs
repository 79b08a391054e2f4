//! Wireless Association Manager
//!
//! Owns the driver and runs one event task per association attempt. The task
//! is the only writer of the attempt's state; callers get an
//! [`AssociationContext`] that can observe and await the outcome but never
//! change it.

use super::association::{
    AssociationMachine, AssociationMode, AssociationSnapshot, AssociationStatus, Effect,
};
use super::driver::{DriverError, WifiDriver, WifiEvent};
use super::indicator::{Blinker, SharedLed};
use crate::persistence::settings::WifiSettings;
use crate::persistence::NetworkCredentials;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum WifiError {
    /// The network stack could not be brought up at all.
    #[error("Wifi driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Read-only view on one association attempt.
#[derive(Debug, Clone)]
pub struct AssociationContext {
    mode: AssociationMode,
    state: watch::Receiver<AssociationSnapshot>,
}

impl AssociationContext {
    pub fn mode(&self) -> AssociationMode {
        self.mode
    }

    pub fn snapshot(&self) -> AssociationSnapshot {
        *self.state.borrow()
    }

    pub fn status(&self) -> AssociationStatus {
        self.state.borrow().status
    }

    pub fn retry_count(&self) -> u32 {
        self.state.borrow().retry_count
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.state.borrow().address
    }

    /// Waits until the attempt is `Connected` or `Disconnected`.
    ///
    /// If the attempt is torn down before that, it counts as `Disconnected`.
    pub async fn wait_terminal(&mut self) -> AssociationStatus {
        match self.state.wait_for(|s| s.status.is_terminal()).await {
            Ok(snapshot) => snapshot.status,
            Err(_) => {
                warn!("Association torn down before reaching a terminal state");
                AssociationStatus::Disconnected
            }
        }
    }
}

pub struct WifiManager<D: WifiDriver> {
    driver: Arc<Mutex<D>>,
    led: SharedLed,
    settings: WifiSettings,
    attempt: Option<JoinHandle<()>>,
}

impl<D: WifiDriver> WifiManager<D> {
    pub fn new(driver: D, led: SharedLed, settings: WifiSettings) -> Self {
        Self {
            driver: Arc::new(Mutex::new(driver)),
            led,
            settings,
            attempt: None,
        }
    }

    /// Starts an association attempt and returns immediately.
    ///
    /// Any previous attempt is torn down first. Association failure is not an
    /// error here, it shows up as `Disconnected` in the returned context; only
    /// a driver that cannot be initialised is reported as `Err`.
    pub async fn associate(
        &mut self,
        credentials: &NetworkCredentials,
        mode: AssociationMode,
    ) -> Result<AssociationContext, WifiError> {
        self.disassociate().await;

        let blinker = Blinker::spawn(
            "wifi",
            self.led.clone(),
            Duration::from_millis(self.settings.blink_period_ms),
        );
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(AssociationSnapshot::default());

        if let Err(e) = self.driver.lock().await.init(event_tx) {
            error!("Failed to initialize wifi driver: {}", e);
            return Err(e.into());
        }

        let machine = AssociationMachine::new(mode, self.settings.max_retry);
        self.attempt = Some(tokio::spawn(drive_attempt(
            machine,
            event_rx,
            self.driver.clone(),
            blinker,
            state_tx,
        )));

        let started = {
            let mut driver = self.driver.lock().await;
            driver
                .set_credentials(credentials)
                .and_then(|_| driver.start())
        };
        if let Err(e) = started {
            error!("Failed to start wifi station: {}", e);
            self.disassociate().await;
            return Err(e.into());
        }

        info!(
            "Wifi STA initialized, trying to connect to {} ({:?} mode)",
            credentials.ssid, mode
        );
        Ok(AssociationContext {
            mode,
            state: state_rx,
        })
    }

    /// Tears the interface down to the uninitialised state.
    ///
    /// Safe to call at any point: before any attempt, twice in a row, or while
    /// an attempt is still waiting.
    pub async fn disassociate(&mut self) {
        {
            let mut driver = self.driver.lock().await;
            match driver.disconnect() {
                Err(DriverError::NotInitialized) => {
                    debug!("Wifi not initialized, nothing to tear down");
                }
                Err(DriverError::NotStarted) => {
                    if let Err(e) = driver.deinit() {
                        warn!("Failed to deinit wifi driver: {}", e);
                    }
                }
                result => {
                    if let Err(e) = result {
                        warn!("Wifi disconnect failed: {}", e);
                    }
                    if let Err(e) = driver.stop() {
                        warn!("Failed to stop wifi driver: {}", e);
                    }
                    if let Err(e) = driver.deinit() {
                        warn!("Failed to deinit wifi driver: {}", e);
                    }
                }
            }
        }

        if let Some(task) = self.attempt.take() {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Wifi event task panicked: {}", e);
                }
            }
            debug!("Wifi event task stopped");
        }
    }
}

/// Event loop of one attempt, the single writer of its state.
async fn drive_attempt<D: WifiDriver>(
    mut machine: AssociationMachine,
    mut events: mpsc::UnboundedReceiver<WifiEvent>,
    driver: Arc<Mutex<D>>,
    blinker: Blinker,
    state: watch::Sender<AssociationSnapshot>,
) {
    let mut blinker = Some(blinker);
    let mut pending = VecDeque::new();

    loop {
        let event = match pending.pop_front() {
            Some(event) => event,
            None => match events.recv().await {
                Some(event) => event,
                None => break,
            },
        };
        debug!("Wifi event: {:?}", event);

        for effect in machine.handle(event) {
            match effect {
                Effect::Connect => {
                    if let Err(e) = driver.lock().await.connect() {
                        warn!("Association attempt could not be started: {}", e);
                        pending.push_back(WifiEvent::StaDisconnected);
                    }
                }
                Effect::CancelIndicator => {
                    if let Some(blinker) = blinker.take() {
                        blinker.cancel();
                    }
                }
                Effect::Terminal(status) => {
                    info!("Association finished: {:?}", status);
                }
            }
        }

        state.send_replace(machine.snapshot());
    }

    debug!("Wifi event channel closed");
}
