//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use livefeed_core::Topic;

#[derive(Parser)]
#[command(name = "livefeed", about = "Live account telemetry and quote streams")]
pub struct Cli {
    /// TOML config file (defaults apply when omitted)
    #[arg(long, short = 'c', global = true, env = "LIVEFEED_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Stream a topic and print each snapshot as a JSON line
    Watch(WatchOpts),
    /// Feed a JSONL file of frames through the dispatcher and print the final snapshot
    Replay(ReplayOpts),
    /// Count down a verification-code window
    Countdown(CountdownOpts),
}

/// Credentials for the stream handshake.
#[derive(Args, Clone)]
pub struct IdentityArgs {
    /// Bearer token
    #[arg(long, env = "LIVEFEED_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Account id
    #[arg(long, env = "LIVEFEED_ACCOUNT")]
    pub account: String,
}

#[derive(Args)]
pub struct WatchOpts {
    /// `account` or `quotes:SYM1,SYM2`
    #[arg(default_value = "account")]
    pub topic: Topic,

    #[command(flatten)]
    pub identity: IdentityArgs,

    /// WebSocket endpoint, overrides the config file
    #[arg(long, env = "LIVEFEED_URL")]
    pub url: Option<String>,

    /// Exit after this many snapshots
    #[arg(long)]
    pub max_updates: Option<usize>,
}

#[derive(Args)]
pub struct ReplayOpts {
    /// File with one raw frame per line; `-` reads stdin
    pub file: PathBuf,

    #[arg(default_value = "account")]
    pub topic: Topic,

    /// Account id the frames belong to
    #[arg(long, env = "LIVEFEED_ACCOUNT", default_value = "replay")]
    pub account: String,

    /// Print every dispatch outcome, not only the final snapshot
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Args)]
pub struct CountdownOpts {
    /// Window start, epoch milliseconds (default: now)
    #[arg(long)]
    pub created_at: Option<i64>,

    /// Window end, epoch milliseconds
    #[arg(long, conflicts_with = "ttl_secs", required_unless_present = "ttl_secs")]
    pub expires_at: Option<i64>,

    /// Window length in seconds from now, instead of --expires-at
    #[arg(long)]
    pub ttl_secs: Option<u64>,
}
