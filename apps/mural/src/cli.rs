use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ConfigOverrides, OperationMode, RelayEnv};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "mural",
    about = "Mural protocol core: relay auth, QR sessions and the PC bridge",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP")),
    arg_required_else_help = true
)]
pub struct Cli {
    #[arg(
        long = "relay-url",
        global = true,
        env = "MURAL_RELAY_BASE_URL",
        help = "Relay base URL (defaults to the environment preset)"
    )]
    pub relay_url: Option<String>,

    #[arg(
        long = "event-id",
        global = true,
        env = "MURAL_EVENT_ID",
        help = "Event namespace this PC belongs to"
    )]
    pub event_id: Option<String>,

    #[arg(
        long,
        global = true,
        env = "MURAL_PCID",
        help = "Stable PC identifier (generated and persisted when omitted)"
    )]
    pub pcid: Option<String>,

    #[arg(
        long,
        global = true,
        value_enum,
        env = "MURAL_OPERATION_MODE",
        help = "Connectivity mode: auto, relay or local"
    )]
    pub mode: Option<OperationMode>,

    #[arg(
        long = "relay-env",
        global = true,
        value_enum,
        env = "MURAL_RELAY_ENV",
        help = "Relay deployment to talk to"
    )]
    pub relay_env: Option<RelayEnv>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            base_url: self.relay_url.clone(),
            event_id: self.event_id.clone(),
            pc_id: self.pcid.clone(),
            mode: self.mode,
            env: self.relay_env,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "MURAL_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "MURAL_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check relay reachability, protocol version and stored credentials.
    Doctor,
    /// Run the persistent PC bridge until interrupted.
    Bridge,
    /// Manage the credentials stored in the OS keychain.
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    /// Store the event signing secret for the selected relay environment.
    SetSecret { secret: String },
    /// Remove the stored event signing secret.
    ClearSecret,
    /// Store the device token issued with the license.
    SetToken { token: String },
    /// Remove the stored device token.
    ClearToken,
    /// Report which credentials are present without printing them.
    Status,
}
