use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

/// Covault — prototype Bitcoin vault built on pre-signed transaction
/// trees with ephemeral keys and trusted key deletion.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// Bitcoin Core RPC URL (regtest).
    #[arg(long, default_value = "http://127.0.0.1:18443", env = "COVAULT_RPC_URL")]
    pub rpc_url: String,

    /// RPC username.
    #[arg(long, env = "COVAULT_RPC_USER")]
    pub rpc_user: Option<String>,

    /// RPC password.
    #[arg(long, env = "COVAULT_RPC_PASS")]
    pub rpc_pass: Option<String>,

    /// Path to a bitcoind cookie file (`username:password`).
    #[arg(long, env = "COVAULT_RPC_COOKIE")]
    pub rpc_cookie: Option<PathBuf>,

    /// Vault directory. Defaults to the current working directory.
    #[arg(long)]
    pub vault_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a new vault in the vault directory.
    Init {
        /// WIF private key used for every vault role. A production
        /// deployment would source each key from its own device.
        #[arg(long)]
        private_key: Option<String>,

        /// Number of stipend shards.
        #[arg(long, default_value = "5")]
        num_shards: u32,
    },

    /// Display vault state information and the possible next transactions.
    #[command(alias = "info")]
    Status,

    /// Broadcast a specific transaction, but only if it is one of the
    /// next possible transactions.
    Broadcast { internal_id: Uuid },

    /// Copy another vault's parameters (hot wallet keys etc).
    Clone,

    /// Initialize the vault and fund it with on-chain UTXOs.
    Lock,

    /// Synchronize against the blockchain and update local vault state.
    Sync,

    /// Commands dealing with regular, pre-scheduled withdrawals.
    #[command(subcommand)]
    Unlock(UnlockCommand),

    /// Push all remaining UTXOs in the vault to the cold storage layer.
    Rotate,

    /// Burn (or donate) the UTXOs.
    Burn,
}

#[derive(Subcommand)]
pub enum UnlockCommand {
    /// Withdraw a single sharded UTXO from the vault.
    Single,
    /// Withdraw multiple sharded UTXOs from the vault.
    Many,
}
