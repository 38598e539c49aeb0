//! On-chain state tracking.
//!
//! Given the persisted tree and a node RPC, find the deepest confirmed
//! transaction — the vault's current frontier — and the set of pre-signed
//! transactions that may legally be broadcast next.

use bitcoin::{consensus, Txid};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::VaultError;
use crate::plan::{TxHandle, VaultPlan};
use crate::rpc::VaultRpc;

/// The walker's verdict: the deepest confirmed transaction and the legal
/// next broadcasts.
#[derive(Debug, Clone)]
pub struct VaultState {
    pub current: TxHandle,
    pub next: Vec<TxHandle>,
}

/// Whether the blockchain contains `txid` with at least one confirmation.
/// A transaction the node has never heard of counts as unconfirmed.
pub async fn blockchain_has(rpc: &dyn VaultRpc, txid: &Txid) -> Result<bool, VaultError> {
    Ok(rpc
        .get_raw_transaction(txid)
        .await?
        .is_some_and(|info| info.confirmations > 0))
}

/// Walk the tree from the funding transaction, descending through
/// confirmed children. The walk intentionally assumes at most one
/// on-chain child per node; sibling transactions spending disjoint
/// outputs of one parent are not modeled.
pub async fn current_confirmed_transaction(
    plan: &VaultPlan,
    rpc: &dyn VaultRpc,
) -> Result<VaultState, VaultError> {
    let mut current = plan.funding_tx()?;
    let funding_txid = plan.txid(current).ok_or_else(|| {
        VaultError::StateCorruption("funding transaction has no txid".to_string())
    })?;

    if !blockchain_has(rpc, &funding_txid).await? {
        // The vault has not even been funded yet; nothing can follow.
        return Ok(VaultState {
            current,
            next: Vec::new(),
        });
    }

    loop {
        let children = plan.child_transactions(current);
        let mut confirmed_child = None;
        for child in &children {
            let txid = plan.txid(*child).ok_or_else(|| {
                VaultError::StateCorruption(format!(
                    "planned transaction {} has no txid; was the tree signed?",
                    plan.tx(*child).internal_id
                ))
            })?;
            if blockchain_has(rpc, &txid).await? {
                confirmed_child = Some(*child);
                break;
            }
        }

        let Some(child) = confirmed_child else {
            // None of the children are on-chain: they are all possible.
            for child in &children {
                let mut parents = plan.parent_transactions(*child);
                parents.dedup();
                if parents.len() != 1 || parents[0] != current {
                    return Err(VaultError::StateCorruption(format!(
                        "next transaction {} does not descend solely from the current transaction",
                        plan.tx(*child).internal_id
                    )));
                }
            }
            debug!(
                current = %plan.tx(current).name,
                next_count = children.len(),
                "resolved vault frontier"
            );
            return Ok(VaultState {
                current,
                next: children,
            });
        };
        current = child;
    }
}

/// Broadcast one of the legal next transactions, identified by its uuid.
/// Anything outside the current next set is refused; the serialized
/// transaction bytes are what goes over the wire.
pub async fn broadcast_next_transaction(
    plan: &VaultPlan,
    rpc: &dyn VaultRpc,
    internal_id: &Uuid,
) -> Result<Txid, VaultError> {
    let state = current_confirmed_transaction(plan, rpc).await?;
    let handle = state
        .next
        .iter()
        .copied()
        .find(|candidate| plan.tx(*candidate).internal_id == *internal_id)
        .ok_or(VaultError::InvalidNextStep(*internal_id))?;

    let transaction = plan.tx(handle).bitcoin_transaction.as_ref().ok_or_else(|| {
        VaultError::StateCorruption(format!(
            "transaction {internal_id} has no finalized serialization"
        ))
    })?;
    let txid = rpc
        .send_raw_transaction(&consensus::serialize(transaction))
        .await?;
    info!(%txid, name = %plan.tx(handle).name, "broadcast transaction");
    Ok(txid)
}
