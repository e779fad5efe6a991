//! chanmux - Bounce demo over the reference TCP transport
//!
//! Runs one side of a ping that travels between server and client on a single
//! channel, using two discriminators for the same message type.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chanmux::bounce::{self, Ping};
use chanmux::channel::{ChannelRegistry, TaskQueue};
use chanmux::config::{self, Config};
use chanmux::network::{Client, ClientEvent, Server, ServerEvent};
use chanmux::protocol::{self, Side};
use chanmux::transport::{MemoryTransport, PeerTable};

/// chanmux - Typed message multiplexing over named channels
#[derive(Parser)]
#[command(name = "chanmux")]
#[command(author = "ChanMux Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Bounce a ping between server and client over one channel", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as server (processes the originating side)
    Server {
        /// Port to listen on (defaults to the configured port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run as client (processes the receiving side) and start a bounce
    Client {
        /// Server address to connect to (host or host:port)
        #[arg(short, long)]
        server: String,

        /// Server port (defaults to the configured port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Stop once a ping carries this many ticks
        #[arg(short, long)]
        rounds: Option<i64>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information and the demo channel layout
    Info {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, config_error) = match &cli.config {
        Some(config_path) => (Config::load(config_path)?, None),
        None => match Config::load_default() {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        },
    };

    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    if let Some(e) = config_error {
        tracing::warn!("Ignoring default config file, using built-in defaults: {}", e);
    }

    match cli.command {
        Commands::Server { port } => {
            run_server(config, port).await?;
        }
        Commands::Client {
            server,
            port,
            rounds,
        } => {
            run_client(config, server, port, rounds).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info { json } => {
            print_info(&config, json)?;
        }
    }

    Ok(())
}

/// Run the server (originating side)
async fn run_server(config: Config, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or(config.network.port);
    let mut server = Server::new(config.network.to_runtime(port));
    let mut event_rx = server
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("server event receiver already taken"))?;

    let registry = Arc::new(server.registry());
    let channel = registry.new_channel(&config.channel.name)?;
    let tracker = bounce::register(&channel, None)?;

    let mut queue = TaskQueue::new();
    channel.set_scheduler(Side::Originating, Arc::new(queue.scheduler()));

    let bind_addr = server.start(registry.clone()).await?;

    println!("\n========================================");
    println!("  chanmux Server Running");
    println!("========================================");
    println!("  Name:    {}", config.general.name);
    println!("  Address: {}", bind_addr);
    println!("  Channel: {}", channel.name());
    println!("========================================");
    println!("\nWaiting for clients to connect...");
    println!("Press Ctrl+C to stop.\n");

    let mut tick = tokio::time::interval(Duration::from_millis(config.channel.tick_interval_ms));

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::ClientConnected { connection, addr, name, .. } => {
                        println!("+ Client connected: {} ({}) as {}", name, addr, connection);
                    }
                    ServerEvent::ClientDisconnected { connection, reason } => {
                        println!("- Client disconnected: {} ({})", connection, reason);
                    }
                    ServerEvent::Started { bind_addr } => {
                        tracing::debug!("Listening on {}", bind_addr);
                    }
                    ServerEvent::Stopped => break,
                }
            }
            _ = tick.tick() => {
                queue.run_pending();
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    server.stop().await?;
    tracing::info!(
        "Server stopped after {} pings ({} deferred), stats: {:?}",
        tracker.handled(),
        tracker.deferred(),
        channel.stats(Side::Originating)
    );

    Ok(())
}

/// Run the client (receiving side) and start the bounce
async fn run_client(
    config: Config,
    server: String,
    port: Option<u16>,
    rounds: Option<i64>,
) -> anyhow::Result<()> {
    let port = port.unwrap_or(config.network.port);
    let mut client = Client::new(config.network.to_runtime(port), config.general.name.clone());
    let mut event_rx = client
        .take_event_receiver()
        .ok_or_else(|| anyhow::anyhow!("client event receiver already taken"))?;

    let registry = Arc::new(client.registry());
    let channel = registry.new_channel(&config.channel.name)?;
    let tracker = bounce::register(&channel, rounds)?;

    let mut queue = TaskQueue::new();
    channel.set_scheduler(Side::Receiving, Arc::new(queue.scheduler()));

    let assigned = if server.contains(':') {
        let addr: SocketAddr = server.parse()?;
        client.connect(addr, registry.clone()).await?
    } else {
        client.connect_hostname(&server, registry.clone()).await?
    };

    println!("Connected to {} as {}", server, assigned.endpoint);

    channel.send_to_server(&Ping { ticks: 1 })?;

    let mut tick = tokio::time::interval(Duration::from_millis(config.channel.tick_interval_ms));

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ClientEvent::Connected { server_addr, connection, .. } => {
                        tracing::debug!("Connected to {} on {}", server_addr, connection);
                    }
                    ClientEvent::Disconnected { reason } => {
                        println!("Disconnected: {}", reason);
                        break;
                    }
                    ClientEvent::Error { message } => {
                        tracing::error!("Client error: {}", message);
                    }
                }
            }
            _ = tick.tick() => {
                queue.run_pending();
                if rounds.is_some_and(|rounds| tracker.highest() >= rounds) {
                    println!("Reached {} ticks", tracker.highest());
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nDisconnecting...");
                break;
            }
        }
    }

    if client.is_connected().await {
        client.disconnect().await?;
    }
    tracing::info!(
        "Client done after {} pings ({} deferred), stats: {:?}",
        tracker.handled(),
        tracker.deferred(),
        channel.stats(Side::Receiving)
    );

    Ok(())
}

/// Print protocol information
fn print_info(config: &Config, json: bool) -> anyhow::Result<()> {
    let registry = ChannelRegistry::new(Arc::new(MemoryTransport::new()), Arc::new(PeerTable::new()));
    let channel = registry.new_channel(&config.channel.name)?;
    bounce::register(&channel, None)?;

    if json {
        let info = serde_json::json!({
            "protocol_version": protocol::PROTOCOL_VERSION,
            "default_port": protocol::DEFAULT_PORT,
            "max_channel_name_len": protocol::MAX_CHANNEL_NAME_LEN,
            "channels": registry.registrations(),
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("chanmux Information");
    println!("===================\n");

    println!("Protocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Max Channel Name: {} bytes", protocol::MAX_CHANNEL_NAME_LEN);

    for (name, registrations) in registry.registrations() {
        println!("\nChannel '{}':", name);
        for registration in registrations {
            println!(
                "  {} discriminator {} -> {} ({} side)",
                registration.stage,
                registration.discriminator,
                registration.message_type,
                registration.side
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["chanmux", "info", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Info { json: true }));

        let cli =
            Cli::try_parse_from(["chanmux", "client", "--server", "10.0.0.2:24810", "--rounds", "60"])
                .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Client { rounds: Some(60), port: None, .. }
        ));

        assert!(Cli::try_parse_from(["chanmux", "client"]).is_err());
    }

    #[test]
    fn test_info_renders() {
        print_info(&Config::default(), true).unwrap();
        print_info(&Config::default(), false).unwrap();
    }
}
