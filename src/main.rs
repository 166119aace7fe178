use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ztalk_net::{
    Config, DhcpEngine, PresenceAnnouncer, Result, StaticInterfaceProvider, UdpBroadcastTransport,
};

#[derive(Parser)]
#[command(name = "ztalk-net")]
#[command(author, version, about = "LAN bootstrap and peer presence for ZTalk", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "ztalk-net.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Address to announce; overrides `presence.address` in the config.
    #[arg(short, long)]
    address: Option<Ipv4Addr>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut config = Config::load_or_create(&cli.config)?;
    if let Some(address) = cli.address {
        config.presence.address = Some(address);
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let engine = if config.enable_dhcp {
        let engine = DhcpEngine::new(config.dhcp.clone())?;
        engine.start().await?;
        Some(engine)
    } else {
        info!("DHCP disabled, running presence only");
        None
    };

    let addresses = match config.presence.address {
        Some(address) => vec![address],
        None if config.enable_dhcp => vec![config.dhcp.server_ip],
        None => {
            warn!("No address configured, presence waits for one");
            Vec::new()
        }
    };

    let transport = Arc::new(UdpBroadcastTransport::bind(config.transport.clone()).await?);
    let interfaces = Arc::new(StaticInterfaceProvider::new(addresses));
    let presence = PresenceAnnouncer::new(config.presence.clone(), transport, interfaces);

    let mut events = presence.subscribe();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("{}", event);
        }
    });

    presence.start().await?;
    info!("Running as {} ({})", config.presence.display_name, presence.instance_id());

    if let Err(error) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", error);
    }
    info!("Received shutdown signal, stopping...");

    presence.stop().await;
    if let Some(engine) = engine {
        engine.stop().await;
    }
    event_log.abort();
    Ok(())
}
