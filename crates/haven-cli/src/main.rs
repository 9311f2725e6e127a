//! HAVEN command line interface
//!
//! Host-Adaptive Virtual Ethernet Network

use anyhow::Context;
use clap::{Parser, Subcommand};
use haven_core::{ChannelInterface, ConnectionEvent, ConnectionManager, HostDirectory, ManagerConfig};
use haven_discovery::{DISCOVERY_PORT, DiscoveryConfig, DiscoveryEvent, DiscoveryService, PresenceMessage};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// HAVEN - encrypted, quality-managed virtual LAN tunnels
#[derive(Parser)]
#[command(name = "haven")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Host directory file
    #[arg(long, default_value = "~/.config/haven/hosts.json")]
    hosts_file: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a network and accept peers
    Host {
        /// Name announced to the subnet
        #[arg(short, long, default_value = "haven-host")]
        name: String,

        /// Tunnel listen port (0 = OS-chosen)
        #[arg(short, long, default_value_t = 12345)]
        port: u16,

        /// Shared passphrase peers must prove
        #[arg(short = 'k', long)]
        passphrase: String,
    },

    /// Connect to a host
    Connect {
        /// Host address
        host: IpAddr,

        /// Host tunnel port
        port: u16,

        /// Shared passphrase
        #[arg(short = 'k', long)]
        passphrase: String,

        /// Save this host into the directory
        #[arg(long)]
        save: bool,
    },

    /// Watch peer discovery on the local subnet
    Peers {
        /// Name to announce while watching
        #[arg(short, long, default_value = "haven-observer")]
        name: String,
    },

    /// List saved hosts
    Hosts,
}

fn hosts_path(raw: &str) -> PathBuf {
    match raw.strip_prefix("~/") {
        Some(rest) => std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(raw),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    let directory = HostDirectory::load(hosts_path(&cli.hosts_file));

    match cli.command {
        Commands::Host {
            name,
            port,
            passphrase,
        } => host(name, port, &passphrase).await?,
        Commands::Connect {
            host,
            port,
            passphrase,
            save,
        } => {
            if save {
                directory.add(host, port, passphrase.clone());
            }
            connect(host, port, &passphrase).await?;
        }
        Commands::Peers { name } => watch_peers(name).await?,
        Commands::Hosts => {
            for saved in directory.hosts() {
                println!("{}:{}", saved.ip, saved.port);
            }
        }
    }

    Ok(())
}

async fn host(name: String, port: u16, passphrase: &str) -> anyhow::Result<()> {
    let manager = ConnectionManager::new(ManagerConfig::default(), Arc::new(ChannelInterface::new()));
    let mut events = manager.events();

    let local_addr = manager
        .start_hosting(port, passphrase)
        .await
        .context("failed to start hosting")?;
    println!("hosting on {local_addr} (virtual address {})", manager.host_ip());

    let announcement = PresenceMessage::new(name, local_ip(), local_addr.port());
    let (discovery, discovery_events) =
        DiscoveryService::start(DiscoveryConfig::default(), announcement)
            .await
            .context("failed to start discovery")?;
    manager.attach_discovery(discovery_events);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                match event {
                    Ok(ConnectionEvent::Established { peer, virtual_ip }) => {
                        println!("{peer} joined as {virtual_ip}");
                    }
                    Ok(ConnectionEvent::Closed { peer }) => println!("{peer} left"),
                    Ok(ConnectionEvent::Failed { peer, reason }) => {
                        println!("{peer} could not join: {reason}");
                    }
                    Ok(ConnectionEvent::RecoveryFailed { peer }) => {
                        println!("{peer} lost for good (recovery exhausted)");
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    discovery.stop().await;
    manager.shutdown().await;
    println!("stopped hosting");
    Ok(())
}

async fn connect(host: IpAddr, port: u16, passphrase: &str) -> anyhow::Result<()> {
    let manager = ConnectionManager::new(ManagerConfig::default(), Arc::new(ChannelInterface::new()));
    let mut events = manager.events();

    let virtual_ip = manager
        .connect_to_host(host, port, passphrase)
        .await
        .context("connect failed")?;
    println!("connected to {host}:{port}, virtual address {virtual_ip}");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                match event {
                    Ok(ConnectionEvent::Degraded { peer }) => println!("{peer} degraded, recovering"),
                    Ok(ConnectionEvent::Recovered { peer }) => println!("{peer} recovered"),
                    Ok(ConnectionEvent::RecoveryFailed { peer }) => {
                        println!("{peer} unrecoverable, giving up");
                        break;
                    }
                    Ok(ConnectionEvent::Closed { peer }) => {
                        println!("{peer} closed");
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

async fn watch_peers(name: String) -> anyhow::Result<()> {
    let announcement = PresenceMessage::new(name, local_ip(), DISCOVERY_PORT);
    let (discovery, mut events) = DiscoveryService::start(DiscoveryConfig::default(), announcement)
        .await
        .context("failed to start discovery")?;
    println!("watching for peers (ctrl-c to stop)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                match event {
                    Some(DiscoveryEvent::Discovered(record)) => {
                        println!("+ {} at {}", record.name, record.endpoint());
                    }
                    Some(DiscoveryEvent::Lost(peer)) => println!("- {peer}"),
                    None => break,
                }
            }
        }
    }

    discovery.stop().await;
    Ok(())
}

/// Best-effort local address for presence announcements
fn local_ip() -> IpAddr {
    // A UDP "connect" selects the outbound interface without sending.
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), |addr| addr.ip())
}
