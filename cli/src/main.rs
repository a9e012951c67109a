// hushlink — terminal front-end for the messaging core

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::sync::Arc;

use config::Config;
use hushlink_core::chat::ChatStats;
use hushlink_core::{
    ChatEvents, ChatMessage, ChatService, CoreConfig, CredentialStore, Identity, MessageId,
};

#[derive(Parser)]
#[command(name = "hushlink")]
#[command(about = "hushlink — decentralized encrypted messaging", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new identity, or restore one from a mnemonic
    Init {
        /// Passphrase protecting the credential file (min 8 characters)
        #[arg(short, long)]
        passphrase: String,
        /// Restore from an existing 24-word mnemonic instead of generating
        #[arg(short, long)]
        mnemonic: Option<String>,
    },
    /// Show the local identity
    Id {
        #[arg(short, long)]
        passphrase: String,
    },
    /// Run a node and chat interactively
    Start {
        #[arg(short, long)]
        passphrase: String,
        /// Username to publish; falls back to the config file
        #[arg(short, long)]
        username: Option<String>,
        /// Listening port; 0 picks an ephemeral port
        #[arg(long)]
        port: Option<u16>,
        /// Additional bootstrap nodes (host:port), merged with the config
        #[arg(short, long)]
        bootstrap: Vec<String>,
    },
    /// Send a single message and wait for the acknowledgement
    Send {
        #[arg(short, long)]
        passphrase: String,
        recipient: String,
        message: String,
        #[arg(short, long)]
        bootstrap: Vec<String>,
    },
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();
}

fn load_identity(passphrase: &str) -> Result<Arc<Identity>> {
    let store = CredentialStore::new(Config::credential_path()?);
    if !store.exists() {
        bail!("no identity found; run `hushlink init` first");
    }
    let seed = store
        .load(passphrase)
        .context("failed to unlock identity")?;
    Ok(Arc::new(Identity::from_seed(&seed)))
}

fn parse_seeds(config: &Config, extra: &[String]) -> Result<Vec<SocketAddr>> {
    config
        .bootstrap_nodes
        .iter()
        .chain(extra.iter())
        .map(|raw| {
            raw.parse::<SocketAddr>()
                .with_context(|| format!("invalid bootstrap address: {raw}"))
        })
        .collect()
}

fn core_config(config: &Config) -> Result<CoreConfig> {
    let mut core = CoreConfig::default();
    if let Some(raw) = &config.advertised_ip {
        core.advertised_ip = Some(
            raw.parse()
                .with_context(|| format!("invalid advertised ip: {raw}"))?,
        );
    }
    Ok(core)
}

struct TerminalEvents;

impl ChatEvents for TerminalEvents {
    fn on_message(&self, message: ChatMessage) {
        println!(
            "\r{} {}: {}",
            "<<".green().bold(),
            message.sender_username.cyan(),
            message.content
        );
    }

    fn on_ack(&self, message_id: MessageId) {
        println!("\r{} message {} delivered", "ok".green(), message_id);
    }
}

fn print_stats(stats: &ChatStats) {
    println!("  peers in routing table: {}", stats.dht.routing_nodes);
    println!(
        "  stored values: {} ({} bytes)",
        stats.dht.storage.values, stats.dht.storage.value_bytes
    );
    println!(
        "  mailboxes held: {} ({} messages)",
        stats.dht.storage.offline_recipients, stats.dht.storage.offline_messages
    );
    println!("  active relay circuits: {}", stats.relay.active_circuits);
    println!("  cached connections: {}", stats.connections.cached);
    println!("  pending outbound: {}", stats.pending_messages);
}

async fn cmd_init(passphrase: String, mnemonic: Option<String>) -> Result<()> {
    let store = CredentialStore::new(Config::credential_path()?);
    if store.exists() {
        bail!(
            "an identity already exists at {}; remove it first to replace it",
            store.path().display()
        );
    }

    let (identity, phrase) = match mnemonic {
        Some(phrase) => (Identity::from_mnemonic(&phrase)?, phrase),
        None => {
            let (identity, phrase) = Identity::generate();
            (identity, phrase)
        }
    };
    store.save(identity.seed(), &passphrase)?;

    Config::load().unwrap_or_default().save()?;

    println!("{}", "identity created".green().bold());
    println!("node id: {}", identity.node_id());
    println!();
    println!("{}", "recovery mnemonic (write it down, it is shown once):".yellow());
    println!("  {phrase}");
    Ok(())
}

async fn cmd_id(passphrase: String) -> Result<()> {
    let identity = load_identity(&passphrase)?;
    println!("node id:        {}", identity.node_id());
    println!(
        "encryption key: {}",
        hex::encode(identity.encryption_public_key())
    );
    println!(
        "signing key:    {}",
        hex::encode(identity.signing_public_key())
    );
    Ok(())
}

async fn cmd_start(
    passphrase: String,
    username: Option<String>,
    port: Option<u16>,
    bootstrap: Vec<String>,
) -> Result<()> {
    let config = Config::load()?;
    let identity = load_identity(&passphrase)?;
    let username = username
        .or_else(|| config.username.clone())
        .context("no username given; pass --username or set it in the config")?;
    let seeds = parse_seeds(&config, &bootstrap)?;
    let port = port.unwrap_or(config.listen_port);

    let service = ChatService::new(identity, core_config(&config)?);
    service.set_events(Arc::new(TerminalEvents));

    let addr = service
        .start(port, &username, &seeds)
        .await
        .context("failed to start node")?;
    println!(
        "{} listening on {} as {}",
        "hushlink".bold(),
        addr.to_string().cyan(),
        username.cyan()
    );
    println!("commands: /send <user> <message>, /status, /quit");

    let stdin = std::io::stdin();
    loop {
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "/quit" {
            break;
        } else if line == "/status" {
            print_stats(&service.stats());
        } else if let Some(rest) = line.strip_prefix("/send ") {
            let mut parts = rest.splitn(2, ' ');
            let (Some(recipient), Some(text)) = (parts.next(), parts.next()) else {
                println!("usage: /send <user> <message>");
                continue;
            };
            match service.send_message(recipient, text).await {
                Ok(id) => println!("{} {} (id {})", ">>".blue().bold(), recipient.cyan(), id),
                Err(err) => println!("{} {err}", "error:".red()),
            }
        } else {
            println!("unknown command; try /send, /status or /quit");
        }
    }

    service.stop();
    Ok(())
}

async fn cmd_send(
    passphrase: String,
    recipient: String,
    message: String,
    bootstrap: Vec<String>,
) -> Result<()> {
    let config = Config::load()?;
    let identity = load_identity(&passphrase)?;
    let username = config
        .username
        .clone()
        .context("no username in config; run `hushlink start` once with --username")?;
    let seeds = parse_seeds(&config, &bootstrap)?;
    if seeds.is_empty() {
        bail!("no bootstrap nodes configured");
    }

    let service = ChatService::new(identity, core_config(&config)?);
    service.set_events(Arc::new(TerminalEvents));
    service.start(0, &username, &seeds).await?;

    let id = service.send_message(&recipient, &message).await?;
    println!("sent {id}, waiting for acknowledgement...");

    // Give the acknowledgement a moment to retrace the path.
    for _ in 0..30 {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        if let Some(entry) = service.message_status(&id) {
            if entry.status == hushlink_core::MessageStatus::Acknowledged {
                println!("{}", "delivered".green().bold());
                service.stop();
                return Ok(());
            }
        }
    }

    println!("{}", "no acknowledgement yet; the recipient may be offline".yellow());
    service.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            passphrase,
            mnemonic,
        } => cmd_init(passphrase, mnemonic).await,
        Commands::Id { passphrase } => cmd_id(passphrase).await,
        Commands::Start {
            passphrase,
            username,
            port,
            bootstrap,
        } => cmd_start(passphrase, username, port, bootstrap).await,
        Commands::Send {
            passphrase,
            recipient,
            message,
            bootstrap,
        } => cmd_send(passphrase, recipient, message, bootstrap).await,
    }
}
