//! Broadcast one of the valid next transactions to the network.

use std::path::Path;

use tracing::info;
use uuid::Uuid;

use covault_core::persist::{self, TRANSACTION_STORE_FILENAME};
use covault_core::rpc::VaultRpc;
use covault_core::state::broadcast_next_transaction;

pub async fn broadcast_next(
    rpc: &dyn VaultRpc,
    dir: &Path,
    internal_id: &Uuid,
) -> eyre::Result<()> {
    let plan = persist::load(&dir.join(TRANSACTION_STORE_FILENAME))?;
    let txid = broadcast_next_transaction(&plan, rpc, internal_id).await?;
    info!(%txid, "broadcasted");
    println!("Broadcasted, txid: {txid}");
    Ok(())
}
