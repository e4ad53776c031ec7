use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mchat::auth::Identity;
use mchat::chat::client::ChatConnectionStatus;
use mchat::chat::session::{ChatEvent, ChatSession};
use mchat::config::{self, ClientConfig};
use mchat::credentials::Credentials;
use mchat::crypto::RsaKey;
use mchat::morse::{from_morse, to_morse};
use mchat::registration::{RegistrationClient, RegistrationOptions, RegistrationOutcome};

const HELP: &str = "\
commands:
  /to <user> <text>  send a direct message
  /key <user>        look up a user's public key
  /morse             toggle Morse encoding of outgoing text
  /history           show recent messages
  /help              show this help
  /quit              leave the chat";

#[derive(Parser, Debug)]
#[clap(name = "mchat", about = "Websocket chat client")]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Chat websocket endpoint.
    #[clap(long)]
    pub endpoint: Option<String>,

    /// Registration websocket endpoint. Defaults to the chat endpoint.
    #[clap(long)]
    pub registration_endpoint: Option<String>,

    #[clap(short, long)]
    pub username: Option<String>,

    /// Directory holding credentials.toml.
    #[clap(long)]
    pub credentials_dir: Option<PathBuf>,

    /// Modulus size for newly generated keys.
    #[clap(long)]
    pub key_bits: Option<usize>,

    /// Register the stored key with the server even if it already exists.
    #[clap(long)]
    pub register: bool,

    /// Delete stored credentials and generate a new key pair.
    #[clap(long)]
    pub reset_credentials: bool,
}

impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            endpoint: args.endpoint.clone(),
            registration_endpoint: args.registration_endpoint.clone(),
            username: args.username.clone(),
            credentials_dir: args.credentials_dir.clone(),
            key_bits: args.key_bits,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("failed to install tracing subscriber")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config: config::CliConfig = (&cli_args).into();
    let client_config = ClientConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  endpoint: {}", client_config.endpoint);
    info!("  registration_endpoint: {}", client_config.registration_endpoint);
    info!("  username: {}", client_config.username);
    info!("  credentials_dir: {:?}", client_config.credentials_dir);

    let identity = prepare_identity(&client_config, &cli_args).await?;
    run_chat(&client_config, identity).await
}

/// Loads or creates the local key pair, registering it when needed.
async fn prepare_identity(config: &ClientConfig, args: &CliArgs) -> Result<Identity> {
    let store = config.credentials_store();
    if args.reset_credentials && store.delete()? {
        info!("Removed stored credentials at {:?}", store.path());
    }

    let (credentials, fresh) = match store.load()? {
        Some(credentials) => {
            if credentials.username != config.username {
                bail!(
                    "stored credentials belong to {:?}, not {:?}; use --reset-credentials to replace them",
                    credentials.username,
                    config.username
                );
            }
            (credentials, false)
        }
        None => {
            info!("Generating {}-bit key pair", config.key_bits);
            let bits = config.key_bits;
            let key = tokio::task::spawn_blocking(move || RsaKey::generate(bits))
                .await
                .context("key generation task failed")??;
            (Credentials::new(config.username.clone(), key), true)
        }
    };

    if fresh || args.register {
        register(config, &credentials, fresh).await?;
    }
    if fresh {
        store.save(&credentials)?;
    }
    Ok(credentials.into_identity())
}

async fn register(config: &ClientConfig, credentials: &Credentials, check_name: bool) -> Result<()> {
    let mut client = RegistrationClient::connect(
        config.registration_endpoint.clone(),
        RegistrationOptions::default(),
    )
    .await
    .with_context(|| {
        format!(
            "failed to reach registration server at {}",
            config.registration_endpoint
        )
    })?;

    if check_name && client.check_username_exists(&credentials.username).await? {
        client.disconnect().await;
        bail!("username {:?} is already taken", credentials.username);
    }

    let outcome = client
        .register_user(&credentials.username, credentials.key.public_key())
        .await?;
    client.disconnect().await;
    match outcome {
        RegistrationOutcome::Registered { .. } => {
            info!("Registered {:?}", credentials.username);
            Ok(())
        }
        RegistrationOutcome::Rejected { reason } => bail!("registration rejected: {reason}"),
    }
}

async fn run_chat(config: &ClientConfig, identity: Identity) -> Result<()> {
    let client = config.chat_client();
    let mut session = ChatSession::connect(&client, identity, config.session_options())
        .await
        .with_context(|| format!("failed to connect to {}", config.endpoint))?;
    println!(
        "connected to {} as {}; type /help for commands",
        config.endpoint,
        session.identity().username
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut morse = false;

    loop {
        tokio::select! {
            event = session.recv() => match event {
                Some(event) => print_event(&event, morse),
                None => {
                    println!("connection closed");
                    break;
                }
            },
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if !handle_line(&mut session, line.trim(), &mut morse)? {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Returns `false` when the user asked to quit.
fn handle_line(session: &mut ChatSession, line: &str, morse: &mut bool) -> Result<bool> {
    if line.is_empty() {
        return Ok(true);
    }
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match command {
        "/quit" => return Ok(false),
        "/help" => println!("{HELP}"),
        "/morse" => {
            *morse = !*morse;
            println!("morse mode {}", if *morse { "on" } else { "off" });
        }
        "/history" => {
            for message in session.history().messages() {
                println!("{}: {}", message.sender, message.content);
            }
        }
        "/key" if !rest.is_empty() => lookup_key(session, rest.to_string()),
        "/to" => match rest.split_once(' ') {
            Some((recipient, text)) if !text.trim().is_empty() => {
                session.send_direct(outgoing(text.trim(), *morse), recipient)?;
            }
            _ => println!("usage: /to <user> <text>"),
        },
        "/key" => println!("usage: /key <user>"),
        _ if command.starts_with('/') => println!("unknown command {command}; type /help"),
        _ => session.send(outgoing(line, *morse))?,
    }
    Ok(true)
}

fn outgoing(text: &str, morse: bool) -> String {
    if morse {
        to_morse(text)
    } else {
        text.to_string()
    }
}

fn lookup_key(session: &ChatSession, username: String) {
    let keys = session.keys().clone();
    tokio::spawn(async move {
        match keys.get_public_key(&username).await {
            Ok(Some(key)) => println!("{username}: n={} e={}", key.n_hex(), key.e_hex()),
            Ok(None) => println!("{username}: no public key registered"),
            Err(err) => warn!("key lookup for {username} failed: {err}"),
        }
    });
}

fn print_event(event: &ChatEvent, morse: bool) {
    match event {
        ChatEvent::Message(message) => {
            let decoded = if morse {
                from_morse(&message.content)
                    .ok()
                    .filter(|text| !text.is_empty())
            } else {
                None
            };
            match decoded {
                Some(text) => println!("{}: {} [{}]", message.sender, message.content, text),
                None => println!("{}: {}", message.sender, message.content),
            }
        }
        ChatEvent::PublicKey { username, .. } => info!("Cached public key for {username}"),
        ChatEvent::PublicKeyNotFound { username } => info!("No public key for {username}"),
        ChatEvent::ChallengeAnswered { .. } => println!("authenticated"),
        ChatEvent::ChallengeRejected { reason, .. } => {
            println!("could not answer login challenge: {reason}")
        }
        ChatEvent::Connection(ChatConnectionStatus::Connected) => info!("Connected"),
        ChatEvent::Connection(ChatConnectionStatus::Disconnected) => {
            warn!("Disconnected, reconnecting")
        }
    }
}
