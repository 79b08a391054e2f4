mod cli;

use clap::Parser;
use cli::Cli;
use color_eyre::Result;
use lightlink::discovery::MdnsBrowser;
use lightlink::persistence::settings::{self, Settings};
use lightlink::persistence::FileConfigStore;
use lightlink::registration::HttpRegistrar;
use lightlink::wifi::{self, HostDriver, SharedLed};
use lightlink::Orchestrator;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const DEFAULT_LOG_FILTER: &str = "info";

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let config_dir = cli
        .config_dir
        .clone()
        .unwrap_or_else(settings::default_config_dir);
    info!("Using configuration in {}", config_dir.display());

    Settings::ensure_default(&config_dir)?;
    let settings = Settings::load(&config_dir)?;
    let store = Arc::new(FileConfigStore::open(&config_dir)?);

    let registrar = HttpRegistrar::new(settings.device.led_count, settings.mqtt.connect_timeout())?;
    let mut orchestrator = Orchestrator::new(
        store,
        HostDriver::default(),
        Box::new(MdnsBrowser),
        status_led(),
        settings,
    )
    .with_registrar(registrar);

    cli::execute(cli.command, &mut orchestrator).await
}

#[cfg(feature = "gpio")]
fn status_led() -> SharedLed {
    const STATUS_LED_PIN: u8 = 2;
    match wifi::indicator::GpioLed::new(STATUS_LED_PIN) {
        Ok(led) => wifi::shared(led),
        Err(e) => {
            tracing::warn!("Status led unavailable, logging instead: {}", e);
            wifi::shared(wifi::LogLed)
        }
    }
}

#[cfg(not(feature = "gpio"))]
fn status_led() -> SharedLed {
    wifi::shared(wifi::LogLed)
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(log_filter())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

fn log_filter() -> EnvFilter {
    log_filter_from(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
}

/// Directives from `RUST_LOG`, or `info` when unset or unparsable.
fn log_filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}
