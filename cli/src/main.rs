// lanpair: host, discover and chat over a LAN relay
//
// Cross-platform (macOS, Linux, Windows) command-line interface for lanpair.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use lanpair_core::relay::{
    ClientNotice, HostConfig, Identity, PairingState, RelayClient, RelayEvent, RelayHost,
};
use lanpair_core::transport::discovery::{DiscoveryProber, DiscoveryRecord, ProbeConfig};
use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tracing::info;

#[derive(Parser)]
#[command(name = "lanpair")]
#[command(about = "lanpair: pair up and chat on the local network", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a room: run a relay and answer discovery probes
    Host {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long)]
        discovery_port: Option<u16>,
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Look for hosted rooms on the local network
    Discover {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long)]
        window_ms: Option<u64>,
    },
    /// Join a relay and chat
    Chat {
        #[arg(short, long)]
        id: Option<String>,
        /// Relay URL, e.g. ws://192.168.1.20:5000
        #[arg(short, long, conflicts_with_all = ["lan", "host"])]
        relay: Option<String>,
        /// Join the first room found by discovery
        #[arg(long, conflicts_with = "host")]
        lan: bool,
        /// Host a room and join it
        #[arg(long)]
        host: bool,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lanpair_core=info,lanpair=info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Host {
            port,
            discovery_port,
            name,
        } => cmd_host(config, port, discovery_port, name).await,
        Commands::Discover { port, window_ms } => cmd_discover(config, port, window_ms).await,
        Commands::Chat {
            id,
            relay,
            lan,
            host,
        } => cmd_chat(config, id, relay, lan, host).await,
        Commands::Config { action } => cmd_config(config, action),
    }
}

fn host_config(
    config: &config::Config,
    port: Option<u16>,
    discovery_port: Option<u16>,
    name: Option<String>,
) -> HostConfig {
    let mut relay = config.relay_server_config();
    if let Some(port) = port {
        relay.listen_addr.set_port(port);
    }
    HostConfig {
        relay,
        router: config.router_config(),
        discovery_addr: SocketAddr::from((
            [0, 0, 0, 0],
            discovery_port.unwrap_or(config.discovery.port),
        )),
        name: name.unwrap_or_else(|| config.discovery.host_name.clone()),
        advertise_ip: None,
    }
}

async fn cmd_host(
    config: config::Config,
    port: Option<u16>,
    discovery_port: Option<u16>,
    name: Option<String>,
) -> Result<()> {
    let host = RelayHost::start(host_config(&config, port, discovery_port, name))
        .await
        .context("Failed to start host")?;

    println!("{}", "lanpair: hosting".bold());
    println!();
    println!("{} Relay on     {}", "✓".green(), host.relay_addr());
    println!("{} Discovery on {}", "✓".green(), host.discovery_addr());
    println!();
    println!("Press {} to stop.", "Ctrl-C".bright_yellow());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    let stats = host.router().stats();
    info!(
        "Stopping with {} registered, {} delivered, {} dropped",
        stats.identities_registered, stats.events_delivered, stats.events_dropped
    );
    host.shutdown().await;
    println!("Stopped.");
    Ok(())
}

async fn discover(
    config: &config::Config,
    port: Option<u16>,
    window_ms: Option<u64>,
) -> Vec<DiscoveryRecord> {
    let window = window_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.probe_window());
    let probe = ProbeConfig::broadcast(port.unwrap_or(config.discovery.port)).with_window(window);
    DiscoveryProber::new(probe).probe().await
}

async fn cmd_discover(
    config: config::Config,
    port: Option<u16>,
    window_ms: Option<u64>,
) -> Result<()> {
    println!("{}", "Looking for rooms...".dimmed());
    let found = discover(&config, port, window_ms).await;

    if found.is_empty() {
        println!("{}", "No rooms found.".dimmed());
        return Ok(());
    }

    println!("{} ({} found)", "Rooms".bold(), found.len());
    for record in found {
        println!("  • {} {}", record.name.bright_cyan(), record.relay_url().dimmed());
    }
    Ok(())
}

async fn cmd_chat(
    config: config::Config,
    id: Option<String>,
    relay: Option<String>,
    lan: bool,
    host: bool,
) -> Result<()> {
    let identity = Identity::from(
        id.or_else(|| config.identity.clone())
            .context("No identity: pass --id or run `lanpair config set identity <ID>`")?,
    );

    let mut hosted = None;
    let url = if host {
        let room = RelayHost::start(host_config(&config, None, None, None))
            .await
            .context("Failed to start host")?;
        let url = format!("ws://127.0.0.1:{}", room.relay_addr().port());
        println!("{} Hosting on {}", "✓".green(), room.relay_addr());
        hosted = Some(room);
        url
    } else if lan {
        let found = discover(&config, None, None).await;
        let Some(room) = found.first() else {
            bail!("No rooms found on the local network");
        };
        println!("{} Found {} at {}", "✓".green(), room.name.bright_cyan(), room.relay_url());
        room.relay_url()
    } else {
        match relay.or_else(|| config.relay_url.clone()) {
            Some(url) => url,
            None => bail!("No relay: pass --relay <url>, --lan or --host"),
        }
    };

    let (client, mut notices) = RelayClient::connect(&url, identity.clone())
        .await
        .with_context(|| format!("Failed to join {}", url))?;

    println!("{} Joined as {}", "✓".green(), identity.as_str().bright_cyan());
    println!();
    println!("{}", "Commands:".bold());
    println!("  {} <id>", "pair".bright_green());
    println!("  {}", "accept".bright_green());
    println!("  {}", "reject".bright_green());
    println!("  {}", "leave".bright_green());
    println!("  {}", "status".bright_green());
    println!("  {}", "quit".bright_green());
    println!("  anything else is sent to your partner");
    println!();

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    prompt();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let command = ChatCommand::parse(&line);
                if command == ChatCommand::Quit {
                    break;
                }
                if let Err(e) = run_chat_command(&client, command).await {
                    println!("{} {}", "✗".red(), e);
                }
                prompt();
            }
            notice = notices.recv() => {
                match notice {
                    Some(ClientNotice::Relay(event)) => {
                        println!("\n{}", describe(&event));
                        prompt();
                    }
                    Some(ClientNotice::Disconnected) | None => {
                        println!("\n{}", "Relay connection closed.".bright_red());
                        break;
                    }
                }
            }
        }
    }

    println!("Shutting down...");
    drop(client);
    if let Some(room) = hosted {
        room.shutdown().await;
    }
    Ok(())
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// One line typed at the chat prompt
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChatCommand {
    Pair(String),
    Accept,
    Reject,
    Leave,
    Status,
    Quit,
    Say(String),
    Nothing,
    Usage(&'static str),
}

impl ChatCommand {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        match line {
            "" => ChatCommand::Nothing,
            "accept" => ChatCommand::Accept,
            "reject" => ChatCommand::Reject,
            "leave" => ChatCommand::Leave,
            "status" => ChatCommand::Status,
            "quit" | "exit" => ChatCommand::Quit,
            "pair" => ChatCommand::Usage("pair <id>"),
            _ => match line.strip_prefix("pair ") {
                Some(target) => ChatCommand::Pair(target.trim().to_string()),
                None => ChatCommand::Say(line.to_string()),
            },
        }
    }
}

async fn run_chat_command(client: &RelayClient, command: ChatCommand) -> Result<()> {
    match command {
        ChatCommand::Pair(target) => {
            client.request_pairing(Identity::from(target.as_str())).await?;
            println!("{} Asked {} to pair", "…".dimmed(), target.bright_cyan());
        }
        ChatCommand::Accept => {
            let peer = client.accept().await?;
            println!("{} Paired with {}", "✓".green(), peer.as_str().bright_cyan());
        }
        ChatCommand::Reject => {
            let peer = client.reject().await?;
            println!("{} Declined {}", "✓".green(), peer.as_str().bright_cyan());
        }
        ChatCommand::Leave => match client.leave() {
            Some(peer) => println!("{} Left {}", "✓".green(), peer.as_str().bright_cyan()),
            None => println!("Not paired."),
        },
        ChatCommand::Status => {
            println!("Identity: {}", client.identity().as_str().bright_cyan());
            println!("State:    {}", describe_state(&client.state()));
            if let Ok(from) = client.pending_request() {
                println!("Asking:   {} (accept / reject)", from.as_str().bright_cyan());
            }
        }
        ChatCommand::Say(text) => {
            client.send_text(text).await?;
        }
        ChatCommand::Usage(usage) => println!("Usage: {}", usage),
        ChatCommand::Nothing | ChatCommand::Quit => {}
    }
    Ok(())
}

fn describe(event: &RelayEvent) -> String {
    match event {
        RelayEvent::IncomingRequest { from } => format!(
            "{} {} wants to pair (accept / reject)",
            "?".bright_yellow(),
            from.as_str().bright_cyan()
        ),
        RelayEvent::RequestAccepted { from } => format!(
            "{} Paired with {}",
            "✓".green(),
            from.as_str().bright_cyan()
        ),
        RelayEvent::RequestRejected { from, reason } => {
            let who = from
                .as_ref()
                .map(|f| f.as_str().to_string())
                .unwrap_or_else(|| "relay".to_string());
            match reason {
                Some(reason) => format!("{} Declined by {}: {}", "✗".red(), who, reason),
                None => format!("{} Declined by {}", "✗".red(), who),
            }
        }
        RelayEvent::Message { from, text } => {
            format!("{} {}: {}", "←".bright_blue(), from.as_str().bright_cyan(), text)
        }
        RelayEvent::RequestExpired { to } => format!(
            "{} {} did not answer",
            "✗".red(),
            to.as_str().bright_cyan()
        ),
        RelayEvent::PairingEnded { peer } => format!(
            "{} No longer paired with {}",
            "✗".red(),
            peer.as_str().bright_cyan()
        ),
    }
}

fn describe_state(state: &PairingState) -> String {
    match state {
        PairingState::Idle => "idle".to_string(),
        PairingState::Requesting { to } => format!("waiting for {}", to),
        PairingState::Notified { from } => format!("{} is asking to pair", from),
        PairingState::Paired { with } => format!("paired with {}", with),
    }
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => println!("{}", "(unset)".dimmed()),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!("  {}", config::Config::config_file()?.display().to_string().dimmed());
            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }
        }
    }
    Ok(())
}
