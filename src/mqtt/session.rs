//! Session Controller
//!
//! Owns the broker client for one session. The lifecycle is a statum machine:
//!
//! ```text
//! Configured ──start──► Running ──end──► Closed
//! ```
//!
//! While `Running`, a single event loop task polls the client, feeds the
//! [`Handshake`] and executes the commands it returns. That task is the only
//! writer of the session state; callers observe it through a
//! [`SessionContext`].

use super::config::SessionConfig;
use super::handshake::{Command, ConnectionState, Handshake, SessionSnapshot};
use super::topics::DeviceIdentity;
use crate::wifi::indicator::{Blinker, SharedLed};
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS, Request,
};
use statum::{machine, state};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const REQUEST_CAPACITY: usize = 10;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Keepalive must be at least one second, got {0:?}")]
    InvalidKeepalive(Duration),
}

/// Receiver of the device state carried by the session.
pub trait SessionHandler: Send + 'static {
    /// A new connection was acknowledged. State from earlier connections no
    /// longer counts as ready.
    fn on_connected(&mut self);

    fn on_switch(&mut self, payload: &[u8]);

    fn on_color(&mut self, payload: &[u8]);

    /// Both initial states arrived on the current connection.
    fn on_state_ready(&mut self);
}

/// Handler for sessions that only check connectivity.
#[derive(Debug, Default)]
pub struct NoopHandler;

impl SessionHandler for NoopHandler {
    fn on_connected(&mut self) {}

    fn on_switch(&mut self, _: &[u8]) {}

    fn on_color(&mut self, _: &[u8]) {}

    fn on_state_ready(&mut self) {}
}

/// Read-only view on a running session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    state: watch::Receiver<SessionSnapshot>,
}

impl SessionContext {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().connection_state
    }

    pub fn is_ready(&self) -> bool {
        let snapshot = self.state.borrow();
        snapshot.switch_topic_acked && snapshot.color_topic_acked
    }

    /// Waits up to `timeout` for the first connection outcome and returns the
    /// state at that point. `Unset` means the broker was never reached.
    pub async fn wait_for_connection(&mut self, timeout: Duration) -> ConnectionState {
        let state = &mut self.state;
        let waited = tokio::time::timeout(timeout, async {
            state
                .wait_for(|s| s.connection_state != ConnectionState::Unset)
                .await
                .map(|s| s.connection_state)
        })
        .await;

        match waited {
            Ok(Ok(connection_state)) => connection_state,
            Ok(Err(_)) => {
                debug!("Session ended while waiting for a connection");
                self.connection_state()
            }
            Err(_) => {
                debug!("No connection within {:?}", timeout);
                self.connection_state()
            }
        }
    }

    /// Waits until the session reports ready on its current connection.
    pub async fn wait_ready(&mut self) -> bool {
        self.state
            .wait_for(|s| s.switch_topic_acked && s.color_topic_acked)
            .await
            .is_ok()
    }

    /// Resolves once the session task has stopped.
    pub async fn closed(&mut self) {
        while self.state.changed().await.is_ok() {}
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionLifecycle {
    Configured,
    Running,
    Closed,
}

#[machine]
pub struct MqttSession<S: SessionLifecycle> {
    config: SessionConfig,
    identity: DeviceIdentity,
    client: Option<AsyncClient>,
    task: Option<JoinHandle<()>>,
    snapshot: Option<watch::Receiver<SessionSnapshot>>,
    shutdown: CancellationToken,
}

impl MqttSession<Configured> {
    pub fn create(config: SessionConfig, identity: DeviceIdentity) -> Self {
        debug!(
            "Configuring session for {} at {}",
            identity.client_id(),
            config.broker
        );
        Self::new(config, identity, None, None, None, CancellationToken::new())
    }

    fn options(&self) -> Result<MqttOptions, SessionError> {
        let keepalive = self.config.keepalive;
        if keepalive < Duration::from_secs(1) {
            return Err(SessionError::InvalidKeepalive(keepalive));
        }

        let topics = self.identity.topics();
        let mut options = MqttOptions::new(
            self.identity.client_id(),
            self.config.broker.host.clone(),
            self.config.broker.port,
        );
        options
            .set_keep_alive(keepalive)
            .set_last_will(LastWill::new(
                topics.disconnection.clone(),
                self.identity.token().to_string(),
                QoS::AtLeastOnce,
                false,
            ));
        Ok(options)
    }

    /// Creates the client and spawns the event loop task.
    pub fn start(
        mut self,
        handler: Box<dyn SessionHandler>,
        led: SharedLed,
    ) -> Result<(MqttSession<Running>, SessionContext), SessionError> {
        let options = self.options()?;
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SessionSnapshot::default());

        let blinker = Blinker::spawn("mqtt", led, self.config.blink_period);
        let worker = SessionWorker {
            eventloop,
            client: client.clone(),
            handshake: Handshake::new(self.identity.clone(), self.config.mode),
            handler,
            state: state_tx,
            shutdown: self.shutdown.clone(),
            blinker: Some(blinker),
            reconnect_delay: self.config.reconnect_delay,
        };

        info!(
            "Try to connect to {} as {}",
            self.config.broker,
            self.identity.client_id()
        );
        self.task = Some(tokio::spawn(worker.run()));
        self.client = Some(client);
        self.snapshot = Some(state_rx.clone());

        Ok((self.transition(), SessionContext { state: state_rx }))
    }
}

impl MqttSession<Running> {
    /// Disconnects from the broker and stops the event loop task.
    pub async fn end(mut self) -> MqttSession<Closed> {
        info!("Ending session {}", self.identity.client_id());

        let connected = self
            .snapshot
            .as_ref()
            .is_some_and(|s| s.borrow().connection_state == ConnectionState::Connected);

        match self.client.take() {
            Some(client) if connected => {
                if let Err(e) = client.try_disconnect() {
                    debug!("Disconnect request not delivered: {}", e);
                    self.shutdown.cancel();
                }
            }
            _ => self.shutdown.cancel(),
        }

        // A connected event loop stops by itself once the disconnect is out.
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("Session task did not stop in time, aborting");
                self.shutdown.cancel();
                task.abort();
                let _ = task.await;
            }
        }
        self.shutdown.cancel();

        self.transition()
    }
}

struct SessionWorker {
    eventloop: EventLoop,
    client: AsyncClient,
    handshake: Handshake,
    handler: Box<dyn SessionHandler>,
    state: watch::Sender<SessionSnapshot>,
    shutdown: CancellationToken,
    blinker: Option<Blinker>,
    reconnect_delay: Duration,
}

impl SessionWorker {
    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            let commands = match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if let Some(blinker) = self.blinker.take() {
                        blinker.cancel();
                    }
                    let dropped = drop_stale_subscriptions(&mut self.eventloop.pending);
                    if dropped > 0 {
                        debug!("Dropped {} subscriptions from the previous connection", dropped);
                    }
                    self.handler.on_connected();
                    self.handshake.on_connected()
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!("Message on {}: {} bytes", publish.topic, publish.payload.len());
                    self.handshake
                        .on_message(&publish.topic, publish.payload.as_ref())
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!("Subscribed, pkid={}", ack.pkid);
                    Vec::new()
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.handshake.on_disconnected();
                    Vec::new()
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    self.handshake.on_disconnected();
                    self.publish_state();
                    debug!("Disconnect sent, stopping event loop");
                    break;
                }
                Ok(other) => {
                    trace!("Broker event: {:?}", other);
                    Vec::new()
                }
                Err(e) => {
                    warn!("Broker connection error: {}", e);
                    self.handshake.on_error(e.to_string());
                    self.publish_state();

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                    continue;
                }
            };

            for command in commands {
                self.execute(command);
            }
            self.publish_state();
        }

        debug!("Session event loop stopped");
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::Publish { topic, payload } => {
                if let Err(e) = self
                    .client
                    .try_publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
                {
                    error!("Failed to publish to {}: {}", topic, e);
                }
            }
            Command::Subscribe { topic } => {
                if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                    error!("Failed to subscribe to {}: {}", topic, e);
                }
            }
            Command::Switch(payload) => self.handler.on_switch(&payload),
            Command::Color(payload) => self.handler.on_color(&payload),
            Command::StateReady => self.handler.on_state_ready(),
        }
    }

    fn publish_state(&self) {
        self.state.send_replace(self.handshake.snapshot().clone());
    }
}

/// Removes subscribe requests queued for an earlier connection. The event loop
/// moves unsent requests to `pending` when a link drops and replays them after
/// the next ConnAck, which would put a stale stage ahead of the fresh handshake.
fn drop_stale_subscriptions(pending: &mut VecDeque<Request>) -> usize {
    let before = pending.len();
    pending.retain(|request| !matches!(request, Request::Subscribe(_)));
    before - pending.len()
}

/// Owns at most one running session.
pub struct SessionController {
    led: SharedLed,
    session: Option<MqttSession<Running>>,
}

impl SessionController {
    pub fn new(led: SharedLed) -> Self {
        Self { led, session: None }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Starts a session, ending any previous one first.
    pub async fn start_session(
        &mut self,
        identity: DeviceIdentity,
        config: SessionConfig,
        handler: Box<dyn SessionHandler>,
    ) -> Result<SessionContext, SessionError> {
        self.end_session().await;

        let (session, context) =
            MqttSession::create(config, identity).start(handler, self.led.clone())?;
        self.session = Some(session);
        Ok(context)
    }

    /// Tears the client down. Does nothing when no session is active.
    pub async fn end_session(&mut self) {
        match self.session.take() {
            Some(session) => {
                let _closed = session.end().await;
            }
            None => debug!("No active session to end"),
        }
    }
}
