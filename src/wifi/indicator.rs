//! Liveness indicator
//!
//! A blink task toggles the status LED while a connection attempt is in
//! flight. It is purely cosmetic; nothing in the state machines depends on it.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Output the blink task drives.
pub trait StatusLed: Send + 'static {
    fn set_level(&mut self, on: bool);
}

pub type SharedLed = Arc<Mutex<dyn StatusLed>>;

pub fn shared<L: StatusLed>(led: L) -> SharedLed {
    Arc::new(Mutex::new(led))
}

/// LED stand-in for hosts without a GPIO line, levels go to the trace log.
#[derive(Debug, Default)]
pub struct LogLed;

impl StatusLed for LogLed {
    fn set_level(&mut self, on: bool) {
        trace!("status led {}", if on { "on" } else { "off" });
    }
}

#[cfg(feature = "gpio")]
pub use gpio::GpioLed;

#[cfg(feature = "gpio")]
mod gpio {
    use super::StatusLed;
    use rppal::gpio::{Gpio, OutputPin};

    /// Status LED on a Raspberry Pi GPIO line.
    pub struct GpioLed {
        pin: OutputPin,
    }

    impl GpioLed {
        pub fn new(bcm_pin: u8) -> Result<Self, rppal::gpio::Error> {
            let pin = Gpio::new()?.get(bcm_pin)?.into_output_low();
            Ok(Self { pin })
        }
    }

    impl StatusLed for GpioLed {
        fn set_level(&mut self, on: bool) {
            if on {
                self.pin.set_high();
            } else {
                self.pin.set_low();
            }
        }
    }
}

/// Handle to a running blink task.
///
/// `cancel` consumes the handle, so a blinker can only be stopped once.
/// Dropping an uncancelled blinker stops it as well.
#[derive(Debug)]
pub struct Blinker {
    name: &'static str,
    token: CancellationToken,
}

impl Blinker {
    pub fn spawn(name: &'static str, led: SharedLed, period: Duration) -> Self {
        debug!("Starting {} blink with {}ms period", name, period.as_millis());
        let token = CancellationToken::new();
        let child = token.clone();

        tokio::spawn(async move {
            let mut level = false;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        level = !level;
                        if let Ok(mut led) = led.lock() {
                            led.set_level(level);
                        }
                    }
                }
            }

            if let Ok(mut led) = led.lock() {
                led.set_level(false);
            }
        });

        Self { name, token }
    }

    /// Stops the task; the LED is left off.
    pub fn cancel(self) {
        debug!("Stopping {} blink", self.name);
        self.token.cancel();
    }
}

impl Drop for Blinker {
    fn drop(&mut self) {
        if !self.token.is_cancelled() {
            self.token.cancel();
        }
    }
}
