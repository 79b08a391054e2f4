//! Orchestrator
//!
//! Composes association, discovery and the broker session into the flows the
//! device runs. Provisioning checks bring the link up in test mode, do one
//! thing and tear everything down again. The run flow keeps link and session
//! up until it is told to stop.
//!
//! Every public flow disassociates before it returns, on success, on a
//! missing value and on error alike.

use crate::discovery::{self, DiscoveryError, ServiceBrowser};
use crate::mqtt::{
    BrokerUri, ConnectionState, DeviceIdentity, LightState, LightStateHandler, NoopHandler,
    SessionConfig, SessionController, SessionError, SessionMode, UriError,
};
use crate::persistence::settings::Settings;
use crate::persistence::{self, ConfigStore, StoreError};
use crate::registration::{HttpRegistrar, RegistrationError};
use crate::wifi::{
    AssociationContext, AssociationMode, AssociationStatus, SharedLed, WifiDriver, WifiError,
    WifiManager,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wifi(#[from] WifiError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Stored broker uri is invalid: {0}")]
    BrokerUri(#[from] UriError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// What a provisioning check found out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    MissingWifiConfig,
    MissingBrokerUri,
    WifiFailed,
    WifiConnected { address: Option<Ipv4Addr> },
    BrokerFound { uri: String },
    BrokerNotFound,
    SessionConnected,
    /// Connected and lost the broker again before the check ended.
    SessionDropped,
    SessionNeverConnected { last_error: Option<String> },
    MissingServerUrl,
    Registered { id: u32 },
}

/// Why the run flow returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    MissingWifiConfig,
    MissingDeviceId,
    MissingBrokerUri,
    WifiFailed,
    /// The shutdown token fired.
    Stopped,
    /// The session task ended on its own.
    SessionEnded,
}

enum Link {
    MissingConfig,
    Failed,
    Up(AssociationContext),
    Cancelled,
}

pub struct Orchestrator<D: WifiDriver> {
    store: Arc<dyn ConfigStore>,
    wifi: WifiManager<D>,
    sessions: SessionController,
    browser: Box<dyn ServiceBrowser>,
    registrar: Option<HttpRegistrar>,
    settings: Settings,
}

impl<D: WifiDriver> Orchestrator<D> {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        driver: D,
        browser: Box<dyn ServiceBrowser>,
        led: SharedLed,
        settings: Settings,
    ) -> Self {
        Self {
            store,
            wifi: WifiManager::new(driver, led.clone(), settings.wifi.clone()),
            sessions: SessionController::new(led),
            browser,
            registrar: None,
            settings,
        }
    }

    /// Registers the device with the lighting server before each run.
    pub fn with_registrar(mut self, registrar: HttpRegistrar) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn store(&self) -> &dyn ConfigStore {
        self.store.as_ref()
    }

    /// Joins the stored network once and reports the outcome.
    pub async fn test_wifi(&mut self) -> Result<ProvisionOutcome, OrchestratorError> {
        let outcome = self
            .bring_up_link(AssociationMode::Test, None)
            .await
            .map(Self::link_outcome);
        self.wifi.disassociate().await;
        outcome
    }

    /// Looks for a broker on the local network and stores its uri.
    pub async fn discover_broker(&mut self) -> Result<ProvisionOutcome, OrchestratorError> {
        let outcome = self.discover_broker_inner().await;
        self.wifi.disassociate().await;
        outcome
    }

    async fn discover_broker_inner(&mut self) -> Result<ProvisionOutcome, OrchestratorError> {
        match self.bring_up_link(AssociationMode::Test, None).await? {
            Link::Up(_) => {}
            link => return Ok(Self::link_outcome(link)),
        }

        let discovery = &self.settings.discovery;
        let found = discovery::discover(
            self.browser.as_ref(),
            &discovery.service_type,
            discovery.timeout(),
        )
        .await?;

        match found {
            Some(broker) => {
                let uri = broker.uri();
                info!("Saving broker uri {}", uri);
                persistence::save_broker_uri(self.store.as_ref(), &uri)?;
                Ok(ProvisionOutcome::BrokerFound { uri })
            }
            None => Ok(ProvisionOutcome::BrokerNotFound),
        }
    }

    /// Connects to the stored broker once without subscribing to anything.
    pub async fn test_session(&mut self) -> Result<ProvisionOutcome, OrchestratorError> {
        let outcome = self.test_session_inner().await;
        self.sessions.end_session().await;
        self.wifi.disassociate().await;
        outcome
    }

    async fn test_session_inner(&mut self) -> Result<ProvisionOutcome, OrchestratorError> {
        match self.bring_up_link(AssociationMode::Test, None).await? {
            Link::Up(_) => {}
            link => return Ok(Self::link_outcome(link)),
        }

        let Some(broker) = self.stored_broker()? else {
            return Ok(ProvisionOutcome::MissingBrokerUri);
        };
        let id = persistence::load_device_id(self.store.as_ref())?.unwrap_or_default();

        let mut context = self
            .sessions
            .start_session(
                DeviceIdentity::new(id),
                self.session_config(broker, SessionMode::Test),
                Box::new(NoopHandler),
            )
            .await?;
        let state = context
            .wait_for_connection(self.settings.mqtt.connect_timeout())
            .await;
        self.sessions.end_session().await;

        Ok(match state {
            ConnectionState::Connected => {
                info!("MQTT connection test succeeded");
                ProvisionOutcome::SessionConnected
            }
            ConnectionState::Disconnected => {
                warn!("MQTT connection dropped during the test");
                ProvisionOutcome::SessionDropped
            }
            ConnectionState::Unset => {
                let last_error = context.snapshot().last_error;
                error!(
                    "Never connected to the broker: {}",
                    last_error.as_deref().unwrap_or("timeout")
                );
                ProvisionOutcome::SessionNeverConnected { last_error }
            }
        })
    }

    /// Registers with the lighting server, or verifies the stored id.
    pub async fn register_device(&mut self) -> Result<ProvisionOutcome, OrchestratorError> {
        let outcome = self.register_device_inner().await;
        self.wifi.disassociate().await;
        outcome
    }

    async fn register_device_inner(&mut self) -> Result<ProvisionOutcome, OrchestratorError> {
        match self.bring_up_link(AssociationMode::Test, None).await? {
            Link::Up(_) => {}
            link => return Ok(Self::link_outcome(link)),
        }

        let Some(registrar) = &self.registrar else {
            return Ok(ProvisionOutcome::MissingServerUrl);
        };
        Ok(match registrar.ensure_registered(self.store.as_ref()).await? {
            Some(id) => ProvisionOutcome::Registered { id },
            None => ProvisionOutcome::MissingServerUrl,
        })
    }

    /// Brings the device online and follows the broker until `shutdown`
    /// fires or the session ends.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<RunOutcome, OrchestratorError> {
        let outcome = self.run_inner(&shutdown).await;
        self.sessions.end_session().await;
        self.wifi.disassociate().await;
        outcome
    }

    async fn run_inner(&mut self, shutdown: &CancellationToken) -> Result<RunOutcome, OrchestratorError> {
        match self.bring_up_link(AssociationMode::Run, Some(shutdown)).await? {
            Link::Up(context) => {
                info!("Wifi up at {:?} after {} retries", context.address(), context.retry_count());
            }
            Link::MissingConfig => return Ok(RunOutcome::MissingWifiConfig),
            Link::Failed => return Ok(RunOutcome::WifiFailed),
            Link::Cancelled => return Ok(RunOutcome::Stopped),
        }

        if let Some(registrar) = &self.registrar {
            if let Err(e) = registrar.ensure_registered(self.store.as_ref()).await {
                warn!("Registration failed, continuing with the stored id: {}", e);
            }
        }

        let Some(id) = persistence::load_device_id(self.store.as_ref())? else {
            info!("Missing device id.");
            return Ok(RunOutcome::MissingDeviceId);
        };
        let Some(broker) = self.stored_broker()? else {
            return Ok(RunOutcome::MissingBrokerUri);
        };

        let (handler, mut light) = LightStateHandler::new();
        let mut context = self
            .sessions
            .start_session(
                DeviceIdentity::new(id),
                self.session_config(broker, SessionMode::Run),
                Box::new(handler),
            )
            .await?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(RunOutcome::Stopped);
                }
                _ = context.closed() => {
                    warn!("Session ended");
                    return Ok(RunOutcome::SessionEnded);
                }
                changed = light.changed() => {
                    if changed.is_err() {
                        return Ok(RunOutcome::SessionEnded);
                    }
                    log_light_state(&light);
                }
            }
        }
    }

    async fn bring_up_link(
        &mut self,
        mode: AssociationMode,
        shutdown: Option<&CancellationToken>,
    ) -> Result<Link, OrchestratorError> {
        let Some(credentials) = persistence::load_wifi_credentials(self.store.as_ref())? else {
            info!("Missing wifi parameters.");
            return Ok(Link::MissingConfig);
        };

        let mut context = self.wifi.associate(&credentials, mode).await?;
        let status = match shutdown {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Ok(Link::Cancelled),
                status = context.wait_terminal() => status,
            },
            None => context.wait_terminal().await,
        };

        match status {
            AssociationStatus::Connected => Ok(Link::Up(context)),
            _ => {
                info!("WiFi connection failed.");
                Ok(Link::Failed)
            }
        }
    }

    fn stored_broker(&self) -> Result<Option<BrokerUri>, OrchestratorError> {
        match persistence::load_broker_uri(self.store.as_ref())? {
            Some(raw) => Ok(Some(BrokerUri::parse(&raw)?)),
            None => {
                info!("Missing broker uri.");
                Ok(None)
            }
        }
    }

    fn session_config(&self, broker: BrokerUri, mode: SessionMode) -> SessionConfig {
        let mqtt = &self.settings.mqtt;
        let mut config = SessionConfig::new(broker, mqtt.keepalive(), mode);
        config.blink_period = Duration::from_millis(mqtt.blink_period_ms);
        config
    }

    fn link_outcome(link: Link) -> ProvisionOutcome {
        match link {
            Link::MissingConfig => ProvisionOutcome::MissingWifiConfig,
            Link::Failed | Link::Cancelled => ProvisionOutcome::WifiFailed,
            Link::Up(context) => ProvisionOutcome::WifiConnected {
                address: context.address(),
            },
        }
    }
}

fn log_light_state(light: &watch::Receiver<LightState>) {
    let state = light.borrow();
    debug!("Light state updated at {:?}", state.updated_at);
    info!(
        "Light switched {} with color {}",
        match state.switched_on {
            Some(true) => "on",
            Some(false) => "off",
            None => "unknown",
        },
        state.color.as_deref().unwrap_or("unknown"),
    );
}
