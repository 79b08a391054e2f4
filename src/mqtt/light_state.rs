use super::session::SessionHandler;
use chrono::{DateTime, Local};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Last known state of the light as pushed by the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LightState {
    pub switched_on: Option<bool>,
    pub color: Option<String>,
    /// Set once both initial states arrived.
    pub ready: bool,
    pub updated_at: Option<DateTime<Local>>,
}

pub fn parse_switch(payload: &[u8]) -> Option<bool> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    match text.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Session handler that keeps a [`LightState`] up to date.
pub struct LightStateHandler {
    state: watch::Sender<LightState>,
}

impl LightStateHandler {
    pub fn new() -> (Self, watch::Receiver<LightState>) {
        let (state, rx) = watch::channel(LightState::default());
        (Self { state }, rx)
    }
}

impl SessionHandler for LightStateHandler {
    fn on_connected(&mut self) {
        // Last known values stay, but they must be confirmed again.
        self.state.send_if_modified(|s| std::mem::replace(&mut s.ready, false));
    }

    fn on_switch(&mut self, payload: &[u8]) {
        let Some(on) = parse_switch(payload) else {
            warn!(
                "Ignoring switch payload {:?}",
                String::from_utf8_lossy(payload)
            );
            return;
        };
        debug!("Switch state: {}", if on { "on" } else { "off" });
        self.state.send_modify(|s| {
            s.switched_on = Some(on);
            s.updated_at = Some(Local::now());
        });
    }

    fn on_color(&mut self, payload: &[u8]) {
        let color = String::from_utf8_lossy(payload).trim().to_string();
        debug!("Color state: {}", color);
        self.state.send_modify(|s| {
            s.color = Some(color);
            s.updated_at = Some(Local::now());
        });
    }

    fn on_state_ready(&mut self) {
        info!("Light state initialized");
        self.state.send_modify(|s| s.ready = true);
    }
}
