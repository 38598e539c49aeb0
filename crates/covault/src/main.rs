mod cli;
mod commands;

use clap::Parser;
use eyre::{bail, WrapErr};

use covault_core::rpc::{HttpRpcClient, RpcAuth, VaultRpc};
use covault_core::VaultError;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_level(true)
        .init();

    let vault_dir = match args.vault_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolve current directory")?,
    };

    // Connect to Bitcoin Core RPC and verify the connection before
    // touching vault state. The prototype only ever runs against regtest.
    let auth = RpcAuth::from_options(
        args.rpc_user.as_deref(),
        args.rpc_pass.as_deref(),
        args.rpc_cookie.as_deref(),
    )?;
    let rpc = HttpRpcClient::new(&args.rpc_url, auth)?;
    let chain_info = rpc.get_blockchain_info().await.map_err(|err| {
        eyre::eyre!("{err}").wrap_err(format!(
            "while attempting to connect to Bitcoin Core RPC at `{}`",
            args.rpc_url
        ))
    })?;
    if chain_info.chain != "regtest" {
        return Err(VaultError::WrongChain(chain_info.chain).into());
    }
    tracing::info!(
        chain = %chain_info.chain,
        blocks = chain_info.blocks,
        "connected to Bitcoin Core"
    );

    match args.command {
        cli::Command::Init {
            private_key,
            num_shards,
        } => commands::initialize(&rpc, &vault_dir, private_key.as_deref(), num_shards).await,
        cli::Command::Status => {
            let text = commands::get_status(&rpc, &vault_dir).await?;
            println!("{text}");
            Ok(())
        }
        cli::Command::Broadcast { internal_id } => {
            commands::broadcast_next(&rpc, &vault_dir, &internal_id).await
        }
        cli::Command::Clone
        | cli::Command::Lock
        | cli::Command::Sync
        | cli::Command::Unlock(_)
        | cli::Command::Rotate
        | cli::Command::Burn => bail!("this command is reserved and not implemented yet"),
    }
}
