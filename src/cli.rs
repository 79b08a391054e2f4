use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use lightlink::mqtt::BrokerUri;
use lightlink::persistence::{self, ConfigStore, NetworkCredentials};
use lightlink::wifi::WifiDriver;
use lightlink::{Orchestrator, ProvisionOutcome, RunOutcome};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lightlink")]
#[command(about = "Brings a light strip online and keeps it in sync with its broker")]
pub struct Cli {
    /// Directory holding settings.toml and the persisted store
    #[arg(long, env = "LIGHTLINK_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join the network, connect to the broker and follow the light state
    Run,
    /// Set up wifi connection info
    Wifi(WifiArgs),
    /// Set up MQTT connection info
    Mqtt(MqttArgs),
    /// Set up the lighting server
    Server(ServerArgs),
}

#[derive(Args, Debug)]
pub struct WifiArgs {
    /// SSID of the network to join
    #[arg(short, long, requires = "password")]
    pub ssid: Option<String>,

    /// Password of the network to join
    #[arg(short, long, requires = "ssid")]
    pub password: Option<String>,

    /// Show the stored configuration
    #[arg(short, long)]
    pub check: bool,

    /// Join the stored network once
    #[arg(short, long)]
    pub test: bool,
}

#[derive(Args, Debug)]
pub struct MqttArgs {
    /// URI (using IP or name) of the broker
    #[arg(short, long)]
    pub uri: Option<String>,

    /// Show the stored configuration
    #[arg(short, long)]
    pub check: bool,

    /// Connect once to the stored broker
    #[arg(short, long)]
    pub test: bool,

    /// Look for a broker using mDNS (ignored if --uri is given)
    #[arg(short, long)]
    pub mdns: bool,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Base url of the lighting server
    #[arg(short, long)]
    pub url: Option<String>,

    /// Show the stored configuration
    #[arg(short, long)]
    pub check: bool,

    /// Register with the server, or verify the stored registration
    #[arg(short, long)]
    pub register: bool,
}

pub async fn execute<D: WifiDriver>(
    command: Command,
    orchestrator: &mut Orchestrator<D>,
) -> Result<()> {
    match command {
        Command::Run => run(orchestrator).await,
        Command::Wifi(args) => wifi(args, orchestrator).await,
        Command::Mqtt(args) => mqtt(args, orchestrator).await,
        Command::Server(args) => server(args, orchestrator).await,
    }
}

async fn run<D: WifiDriver>(orchestrator: &mut Orchestrator<D>) -> Result<()> {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
        }
        trigger.cancel();
    });

    match orchestrator.run(shutdown).await? {
        RunOutcome::Stopped => info!("Stopped"),
        outcome => warn!("Run ended: {:?}", outcome),
    }
    Ok(())
}

async fn wifi<D: WifiDriver>(args: WifiArgs, orchestrator: &mut Orchestrator<D>) -> Result<()> {
    let store = orchestrator.store();
    if let (Some(ssid), Some(password)) = (args.ssid, args.password) {
        info!("Saving wifi configuration for {}", ssid);
        persistence::save_wifi_credentials(store, &NetworkCredentials { ssid, password })?;
    }

    if args.check {
        match persistence::load_wifi_credentials(store)? {
            Some(credentials) => info!("Currently stored SSID: {}", credentials.ssid),
            None => info!("No wifi configuration stored yet."),
        }
    }

    if args.test {
        report(orchestrator.test_wifi().await?);
    }
    Ok(())
}

async fn mqtt<D: WifiDriver>(args: MqttArgs, orchestrator: &mut Orchestrator<D>) -> Result<()> {
    if let Some(uri) = args.uri {
        let uri = BrokerUri::parse(&uri)?;
        info!("Saving MQTT URI: {}", uri);
        persistence::save_broker_uri(orchestrator.store(), &uri.to_string())?;
    } else if args.mdns {
        report(orchestrator.discover_broker().await?);
    }

    if args.check {
        check(orchestrator.store(), "mqtt uri", persistence::load_broker_uri)?;
    }

    if args.test {
        report(orchestrator.test_session().await?);
    }
    Ok(())
}

async fn server<D: WifiDriver>(args: ServerArgs, orchestrator: &mut Orchestrator<D>) -> Result<()> {
    if let Some(url) = args.url {
        info!("Saving server url: {}", url);
        persistence::save_server_url(orchestrator.store(), &url)?;
    }

    if args.check {
        check(orchestrator.store(), "server url", persistence::load_server_url)?;
        match persistence::load_device_id(orchestrator.store())? {
            Some(id) => info!("Currently stored device id: {}", id),
            None => info!("No device id stored yet."),
        }
    }

    if args.register {
        report(orchestrator.register_device().await?);
    }
    Ok(())
}

fn check(
    store: &dyn ConfigStore,
    what: &str,
    load: fn(&dyn ConfigStore) -> Result<Option<String>, persistence::StoreError>,
) -> Result<()> {
    match load(store)? {
        Some(value) => info!("Currently stored {}: {}", what, value),
        None => info!("No {} stored yet.", what),
    }
    Ok(())
}

fn report(outcome: ProvisionOutcome) {
    match outcome {
        ProvisionOutcome::WifiConnected { address } => {
            info!("WiFi connection succeeded ({:?})", address)
        }
        ProvisionOutcome::BrokerFound { uri } => info!("Broker saved: {}", uri),
        ProvisionOutcome::SessionConnected => info!("MQTT connection succeeded"),
        ProvisionOutcome::Registered { id } => info!("Registered as device {}", id),
        other => warn!("{:?}", other),
    }
}
