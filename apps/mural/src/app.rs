//! Subcommand dispatch behind the CLI.

use std::sync::Arc;

use thiserror::Error;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use crate::cli::{AuthCommand, Cli, Command};
use crate::config::{ConfigError, RelayConfig, RelayEnv};
use crate::identity::secrets::{
    DeviceToken, KeyringSecretStore, SecretError, SecretStore, TokenError,
};
use crate::identity::{IdentityError, PcIdentity};
use crate::relay::bridge::PcBridge;
use crate::relay::http::RelayHttpClient;
use crate::relay::probe::{probe_relay, RELAY_PROTOCOL_VERSION};
use crate::relay::RelayError;
use crate::telemetry::logging::{self, InitError};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("logging initialization failed: {0}")]
    Logging(#[from] InitError),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Identity(#[from] IdentityError),
    #[error("{0}")]
    Secrets(#[from] SecretError),
    #[error("{0}")]
    Token(#[from] TokenError),
    #[error("{0}")]
    Relay(#[from] RelayError),
    #[error("no event id configured; pass --event-id or set MURAL_EVENT_ID")]
    EventIdRequired,
    #[error("secret must not be empty")]
    EmptySecret,
}

pub async fn run(cli: Cli) -> Result<(), CliError> {
    logging::init(&cli.logging.to_config())?;
    let config = RelayConfig::load(&cli.overrides())?;
    tracing::debug!(
        target: "mural::config",
        base_url = %config.base_url,
        env = %config.env,
        mode = %config.mode,
        "configuration resolved"
    );

    match cli.command {
        Command::Doctor => doctor(&config).await,
        Command::Bridge => bridge(&config).await,
        Command::Auth { command } => auth(&config, command),
    }
}

async fn doctor(config: &RelayConfig) -> Result<(), CliError> {
    let secrets: Arc<dyn SecretStore> = Arc::new(KeyringSecretStore::new());

    println!("Relay URL     : {}", config.base_url);
    println!("Relay env     : {}", config.env);
    println!("Mode          : {}", config.mode);
    match PcIdentity::resolve(config)? {
        Some(identity) => {
            println!("Event id      : {}", identity.event_id);
            println!("PC id         : {}", identity.pc_id);
        }
        None => println!("Event id      : (not provisioned; sessions stay local)"),
    }

    let client = RelayHttpClient::new(config.base_url.clone(), config.env, Arc::clone(&secrets))?;
    let report = probe_relay(&client).await;
    if report.reachable {
        println!("Relay health  : ok ({} ms)", report.latency.as_millis());
    } else {
        println!("Relay health  : unreachable");
    }
    match report.version.as_deref() {
        Some(version) if report.version_ok => println!("Protocol      : {version}"),
        Some(version) => println!(
            "Protocol      : {version} (this client speaks {RELAY_PROTOCOL_VERSION})"
        ),
        None => println!("Protocol      : unknown"),
    }

    print_credentials(secrets.as_ref(), config.env)?;

    if report.usable() {
        println!("Verdict       : relay path available");
    } else {
        println!("Verdict       : relay path unavailable; auto mode falls back to local");
    }
    Ok(())
}

fn print_credentials(secrets: &dyn SecretStore, env: RelayEnv) -> Result<(), CliError> {
    match secrets.event_secret(env)? {
        Some(_) => println!("Event secret  : stored ({env})"),
        None => println!("Event secret  : missing ({env})"),
    }
    match secrets.device_token()? {
        Some(raw) => match DeviceToken::parse(&raw) {
            Ok(token) if token.is_expired() => println!("Device token  : stored, expired"),
            Ok(token) => match token.expires_at() {
                Some(at) => println!("Device token  : stored, expires {at}"),
                None => println!("Device token  : stored, no expiry claim"),
            },
            Err(err) => println!("Device token  : stored but unreadable ({err})"),
        },
        None => println!("Device token  : missing"),
    }
    Ok(())
}

async fn bridge(config: &RelayConfig) -> Result<(), CliError> {
    let identity = PcIdentity::resolve(config)?.ok_or(CliError::EventIdRequired)?;
    let secrets: Arc<dyn SecretStore> = Arc::new(KeyringSecretStore::new());
    let http = Arc::new(RelayHttpClient::new(
        config.base_url.clone(),
        config.env,
        Arc::clone(&secrets),
    )?);
    let ws_url = config.ws_url(&identity.event_id)?;

    println!("Event id      : {}", identity.event_id);
    println!("PC id         : {}", identity.pc_id);
    println!("Bridge URL    : {ws_url}");

    let bridge = PcBridge::new(http, secrets, identity, ws_url);
    let mut status_rx = bridge.subscribe_status();
    bridge.start();
    println!("Bridge running; press Ctrl-C to stop.");

    let printer = tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(status) => println!("Bridge status : {status}"),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    shutdown_signal().await;
    bridge.stop();
    printer.abort();
    println!("Bridge stopped.");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

fn auth(config: &RelayConfig, command: AuthCommand) -> Result<(), CliError> {
    let secrets = KeyringSecretStore::new();
    match command {
        AuthCommand::SetSecret { secret } => {
            let secret = secret.trim();
            if secret.is_empty() {
                return Err(CliError::EmptySecret);
            }
            secrets.set_event_secret(config.env, secret)?;
            println!("Event secret stored for {}.", config.env);
        }
        AuthCommand::ClearSecret => {
            secrets.clear_event_secret(config.env)?;
            println!("Event secret cleared for {}.", config.env);
        }
        AuthCommand::SetToken { token } => {
            let parsed = DeviceToken::parse(&token)?;
            secrets.set_device_token(parsed.as_str())?;
            match parsed.expires_at() {
                Some(at) if parsed.is_expired() => {
                    println!("Device token stored, but it already expired at {at}.")
                }
                Some(at) => println!("Device token stored; expires {at}."),
                None => println!("Device token stored; no expiry claim."),
            }
        }
        AuthCommand::ClearToken => {
            secrets.clear_device_token()?;
            println!("Device token cleared.");
        }
        AuthCommand::Status => {
            println!("Relay env     : {}", config.env);
            print_credentials(&secrets, config.env)?;
        }
    }
    Ok(())
}
