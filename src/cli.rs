//! Command-line interface definitions for tankbot.
//!
//! Uses clap's derive API for type-safe argument parsing.

use crate::proxy::AddonKind;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Game-traffic interception proxy and per-channel browser automation.
///
/// tankbot runs an intercepting proxy that decodes the game's WebSocket
/// protocol, and drives headless browser sessions through WebDriver, one
/// session per channel.
#[derive(Parser, Debug)]
#[command(name = "tankbot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for environment variables
    /// and CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for tankbot.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the intercepting proxy until Ctrl-C.
    Proxy(ProxyArgs),

    /// Run one automation command on a channel's browser session.
    Run(RunArgs),

    /// Print the interception CA certificate path, generating the CA if needed.
    Ca,

    /// Print the merged configuration.
    Config,
}

/// Flags for `tankbot proxy`.
#[derive(Args, Debug, Default, Clone)]
pub struct ProxyArgs {
    /// Preferred listen port (the next port is tried if it is busy).
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Directory holding the interception CA.
    #[arg(long = "cert-dir", value_name = "DIR")]
    pub cert_dir: Option<PathBuf>,

    /// Protocol addon to decode with (repeatable, applied in order).
    #[arg(long = "addon", value_name = "ADDON", value_enum)]
    pub addons: Vec<AddonKind>,
}

/// Arguments for `tankbot run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Channel whose session runs the command.
    #[arg(long = "channel", value_name = "ID")]
    pub channel: String,

    /// Operation name (navigate, click, fill, upload, wait_for, screenshot,
    /// health_check).
    #[arg(value_name = "OP")]
    pub operation: String,

    /// Operation arguments.
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl Cli {
    /// Proxy flags, if the `proxy` subcommand was given.
    pub fn proxy_args(&self) -> Option<&ProxyArgs> {
        match &self.command {
            Commands::Proxy(args) => Some(args),
            _ => None,
        }
    }
}
