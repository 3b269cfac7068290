//! # CLI Interface
//!
//! Command-line structure for `toss-node` using `clap` derive. Every
//! subcommand that touches a device shares [`NodeArgs`] (data directory,
//! config file, log format), each overridable from the environment.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// TOSS offline device node.
///
/// Holds one device identity and its intent store, keeps the engine's
/// housekeeping running, and serves a small status API with Prometheus
/// metrics.
#[derive(Parser, Debug)]
#[command(
    name = "toss-node",
    about = "TOSS offline intent device node",
    version,
    propagate_version = true
)]
pub struct TossNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the data directory, a device key and a default config file.
    Init(InitArgs),
    /// Run the device engine and the status API until interrupted.
    Run(RunArgs),
    /// Sign a new intent with this device's key and store it.
    CreateIntent(CreateIntentArgs),
    /// Verify a stored intent, or one read from a JSON file.
    VerifyIntent(VerifyIntentArgs),
    /// List stored intents.
    ListIntents(ListIntentsArgs),
    /// Print version information and exit.
    Version,
}

/// Options shared by every device subcommand.
#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Device data directory (key, config, intent store).
    #[arg(long, short = 'd', env = "TOSS_DATA_DIR", default_value = ".toss")]
    pub data_dir: PathBuf,

    /// Engine configuration file (JSON). Defaults to `config.json` in the
    /// data directory when that file exists.
    #[arg(long, short = 'c', env = "TOSS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "TOSS_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    #[command(flatten)]
    pub node: NodeArgs,

    /// Overwrite an existing device key.
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub node: NodeArgs,

    /// Port for the status API and `/metrics`.
    #[arg(long, env = "TOSS_API_PORT", default_value_t = 9850)]
    pub api_port: u16,

    /// Address the API binds to.
    #[arg(long, env = "TOSS_API_HOST", default_value = "127.0.0.1")]
    pub api_host: String,

    /// Seconds between reconciliation attempts.
    #[arg(long, env = "TOSS_RECONCILE_INTERVAL", default_value_t = 60)]
    pub reconcile_interval: u64,
}

#[derive(Args, Debug)]
pub struct CreateIntentArgs {
    #[command(flatten)]
    pub node: NodeArgs,

    /// Recipient public key (base58).
    #[arg(long)]
    pub recipient: String,

    /// Amount in the smallest unit.
    #[arg(long)]
    pub amount: u64,

    /// Seconds until the intent expires.
    #[arg(long, default_value_t = 3600)]
    pub expires_in: u64,

    /// Durable nonce account backing this intent (base58).
    #[arg(long)]
    pub nonce_account: Option<String>,
}

#[derive(Args, Debug)]
pub struct VerifyIntentArgs {
    #[command(flatten)]
    pub node: NodeArgs,

    /// Id of a stored intent.
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    pub id: Option<String>,

    /// JSON file holding an intent.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ListIntentsArgs {
    #[command(flatten)]
    pub node: NodeArgs,

    /// Only show intents in this status (pending, settled, failed,
    /// rejected, expired).
    #[arg(long)]
    pub status: Option<String>,

    /// Print JSON instead of a table.
    #[arg(long)]
    pub json: bool,
}
