//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap (`relay`, `send`, `receive` subcommands)
//! - TOML configuration file (`peerdrop.toml`, or `--config FILE`)
//! - Merging CLI with file config (CLI takes precedence)

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::config::{DEFAULT_CHANNEL_COUNT, DEFAULT_RELAY_BIND, DEFAULT_RELAY_URL};

/// Config file looked up in the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "peerdrop.toml";

/// Peerdrop - relay-assisted peer-to-peer file transfer.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// TOML configuration file.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Append plain-text logs to this file.
    #[clap(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// STUN/TURN servers; only settable from the config file.
    #[clap(skip)]
    pub ice_servers: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Run the relay service.
    Relay(RelayArgs),
    /// Send one file to a connected peer.
    Send(SendArgs),
    /// Wait for incoming files.
    Receive(ReceiveArgs),
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct RelayArgs {
    /// Listen address.
    #[clap(long)]
    pub bind: Option<String>,
}

/// Options shared by the client subcommands.
#[derive(clap::Args, Clone, Debug, Default)]
pub struct ClientArgs {
    /// Relay WebSocket URL.
    #[clap(long)]
    pub relay: Option<String>,

    /// Display name announced after connecting.
    #[clap(long)]
    pub nickname: Option<String>,
}

#[derive(clap::Args, Clone, Debug)]
pub struct SendArgs {
    /// Recipient, by nickname or identity.
    #[clap(long)]
    pub to: String,

    pub file: PathBuf,

    /// Data channels per peer.
    #[clap(long)]
    pub channels: Option<usize>,

    #[clap(flatten)]
    pub client: ClientArgs,
}

#[derive(clap::Args, Clone, Debug, Default)]
pub struct ReceiveArgs {
    /// Directory for received files.
    #[clap(long)]
    pub out: Option<PathBuf>,

    /// Accept every transfer without asking.
    #[clap(short = 'y', long)]
    pub yes: bool,

    #[clap(flatten)]
    pub client: ClientArgs,
}

/// Everything `peerdrop.toml` may set. All keys are optional.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub verbose: Option<u8>,
    pub log_file: Option<PathBuf>,
    pub bind: Option<String>,
    pub relay: Option<String>,
    pub nickname: Option<String>,
    pub channels: Option<usize>,
    pub out: Option<PathBuf>,
    pub yes: Option<bool>,
    pub ice_servers: Vec<String>,
}

impl Args {
    /// Load Args from CLI + TOML file (if one exists).
    /// CLI values override those from the file.
    pub fn load() -> Result<Self> {
        let mut cli = Args::parse();
        cli.log_file = cli.log_file.map(Self::resolve_path);

        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let explicit = cli.config.is_some();
        match Self::from_file(&path)? {
            Some(file) => Ok(Self::merge(file, cli)),
            None if explicit => anyhow::bail!("config file {} not found", path.display()),
            None => Ok(cli),
        }
    }

    /// Resolve a potentially relative path to an absolute one.
    fn resolve_path(p: PathBuf) -> PathBuf {
        if p.is_absolute() {
            p
        } else {
            std::env::current_dir().unwrap_or_default().join(p)
        }
    }

    fn from_file(path: &Path) -> Result<Option<FileConfig>> {
        if !path.exists() {
            return Ok(None);
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config = toml::from_str::<FileConfig>(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(config))
    }

    /// Merge file config with CLI args (CLI takes precedence).
    fn merge(file: FileConfig, mut cli: Args) -> Args {
        if cli.verbose == 0 {
            cli.verbose = file.verbose.unwrap_or(0);
        }
        if cli.log_file.is_none() {
            cli.log_file = file.log_file;
        }
        cli.ice_servers = file.ice_servers;

        match &mut cli.command {
            Command::Relay(relay) => {
                relay.bind = relay.bind.take().or(file.bind);
            }
            Command::Send(send) => {
                send.channels = send.channels.or(file.channels);
                merge_client(&mut send.client, file.relay, file.nickname);
            }
            Command::Receive(receive) => {
                receive.out = receive.out.take().or(file.out);
                receive.yes = receive.yes || file.yes.unwrap_or(false);
                merge_client(&mut receive.client, file.relay, file.nickname);
            }
        }
        cli
    }
}

fn merge_client(client: &mut ClientArgs, relay: Option<String>, nickname: Option<String>) {
    client.relay = client.relay.take().or(relay);
    client.nickname = client.nickname.take().or(nickname);
}

impl RelayArgs {
    pub fn bind(&self) -> &str {
        self.bind.as_deref().unwrap_or(DEFAULT_RELAY_BIND)
    }
}

impl ClientArgs {
    pub fn relay_url(&self) -> &str {
        self.relay.as_deref().unwrap_or(DEFAULT_RELAY_URL)
    }
}

impl SendArgs {
    pub fn channels(&self) -> usize {
        self.channels.unwrap_or(DEFAULT_CHANNEL_COUNT).max(1)
    }
}

impl ReceiveArgs {
    pub fn out_dir(&self) -> PathBuf {
        self.out.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}
