//! Persistence: save and load the planned transaction tree.
//!
//! The on-disk document is a JSON array of transaction records ordered by
//! id, the funding node (id -1) first. Outputs and inputs store the uuids
//! of their references, never nested objects; loading therefore runs in
//! two phases — rebuild every node standalone, then resolve each stored
//! uuid into a live handle. A version-stamped `vaultfile` marker guards a
//! directory against accidental re-initialization.

use std::collections::HashMap;
use std::path::Path;

use bitcoin::consensus;
use bitcoin::hex::FromHex;
use bitcoin::{Amount, Transaction, Txid};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::VaultError;
use crate::plan::{
    InputHandle, OutputHandle, PlannedInput, PlannedOutput, PlannedTx, TxHandle, TxKind, VaultPlan,
};
use crate::templates::{TemplateKind, WitnessSelector};

pub const TRANSACTION_STORE_FILENAME: &str = "transaction-store.json";
pub const CTV_TRANSACTION_STORE_FILENAME: &str = "transaction-store.ctv.json";
pub const TEXT_RENDERING_FILENAME: &str = "text-rendering.txt";
pub const VAULTFILE_FILENAME: &str = "vaultfile";
pub const VAULT_FILE_FORMAT_VERSION: &str = "0.0.1";

const FUNDING_TX_NAME: &str = "initial transaction (from user)";
const FUNDING_OUTPUT_NAME: &str = "segwit input coin";

// ==============================================================================
// Records
// ==============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct TxRecord {
    id: i64,
    internal_id: Uuid,
    name: String,
    /// Big-endian hex, as displayed by every bitcoin tool.
    txid: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    inputs: Vec<InputRecord>,
    outputs: Vec<OutputRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bitcoin_transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ctv_bitcoin_transaction: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ctv_bitcoin_transaction_txid: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InputRecord {
    internal_id: Uuid,
    transaction_internal_id: Uuid,
    utxo_internal_id: Uuid,
    utxo_name: String,
    witness_template_selection: WitnessSelector,
}

#[derive(Debug, Serialize, Deserialize)]
struct OutputRecord {
    id: i64,
    internal_id: Uuid,
    name: String,
    script_template: TemplateKind,
    amount: u64,
    timelock_multiplier: u32,
    transaction_internal_id: Uuid,
    child_transaction_internal_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    vout_override: Option<u32>,
}

// ==============================================================================
// Serialization
// ==============================================================================

fn to_records(plan: &VaultPlan) -> Result<Vec<TxRecord>, VaultError> {
    let mut records = Vec::with_capacity(plan.transaction_count());

    for (handle, tx) in plan.transactions() {
        let txid = plan.txid(handle).ok_or_else(|| {
            VaultError::InvalidPlan(format!(
                "transaction {} has no txid; sign the tree before saving",
                tx.internal_id
            ))
        })?;

        let inputs = tx
            .inputs
            .iter()
            .map(|input_handle| {
                let input = plan.input(*input_handle);
                let utxo = plan.output(input.utxo);
                InputRecord {
                    internal_id: input.internal_id,
                    transaction_internal_id: tx.internal_id,
                    utxo_internal_id: utxo.internal_id,
                    utxo_name: utxo.name.clone(),
                    witness_template_selection: input.witness_template_selection,
                }
            })
            .collect();

        let outputs = tx
            .outputs
            .iter()
            .map(|output_handle| {
                let output = plan.output(*output_handle);
                OutputRecord {
                    id: output.id,
                    internal_id: output.internal_id,
                    name: output.name.clone(),
                    script_template: output.template,
                    amount: output.amount.to_sat(),
                    timelock_multiplier: output.timelock_multiplier,
                    transaction_internal_id: tx.internal_id,
                    child_transaction_internal_ids: output
                        .child_transactions
                        .iter()
                        .map(|child| plan.tx(*child).internal_id)
                        .collect(),
                    vout_override: output.vout_override,
                }
            })
            .collect();

        records.push(TxRecord {
            id: tx.id,
            internal_id: tx.internal_id,
            name: tx.name.clone(),
            txid: txid.to_string(),
            inputs,
            outputs,
            bitcoin_transaction: tx
                .bitcoin_transaction
                .as_ref()
                .map(consensus::encode::serialize_hex),
            ctv_bitcoin_transaction: tx
                .ctv_transaction
                .as_ref()
                .map(consensus::encode::serialize_hex),
            ctv_bitcoin_transaction_txid: tx
                .ctv_transaction
                .as_ref()
                .map(|ctv| ctv.compute_txid().to_string()),
        });
    }

    // Low ids first; the funding node leads.
    records.sort_by_key(|record| record.id);
    Ok(records)
}

// ==============================================================================
// Deserialization
// ==============================================================================

fn decode_transaction(hex: &str, context: &str) -> Result<Transaction, VaultError> {
    let bytes = Vec::<u8>::from_hex(hex)
        .map_err(|e| VaultError::StateCorruption(format!("{context}: invalid hex: {e}")))?;
    consensus::deserialize(&bytes)
        .map_err(|e| VaultError::StateCorruption(format!("{context}: undecodable transaction: {e}")))
}

fn from_records(records: Vec<TxRecord>) -> Result<VaultPlan, VaultError> {
    let first = records.first().ok_or_else(|| {
        VaultError::StateCorruption("transaction store is empty".to_string())
    })?;
    if first.id != -1 || first.name != FUNDING_TX_NAME {
        return Err(VaultError::StateCorruption(
            "transaction store does not begin with the funding transaction".to_string(),
        ));
    }

    let mut plan = VaultPlan::new();
    let mut tx_by_uuid: HashMap<Uuid, TxHandle> = HashMap::new();
    let mut output_by_uuid: HashMap<Uuid, OutputHandle> = HashMap::new();
    // Cross-references to resolve once every node exists.
    let mut pending_children: Vec<(OutputHandle, Vec<Uuid>)> = Vec::new();
    let mut pending_utxos: Vec<(InputHandle, Uuid)> = Vec::new();

    // Phase 1: rebuild every node standalone.
    for record in &records {
        let txid = record.txid.parse::<Txid>().map_err(|e| {
            VaultError::StateCorruption(format!("transaction {}: bad txid: {e}", record.internal_id))
        })?;
        let kind = if record.id == -1 {
            TxKind::Funding { txid }
        } else {
            TxKind::Planned
        };
        let bitcoin_transaction = record
            .bitcoin_transaction
            .as_deref()
            .map(|hex| decode_transaction(hex, "bitcoin_transaction"))
            .transpose()?;
        if let Some(tx) = &bitcoin_transaction {
            if tx.compute_txid() != txid {
                return Err(VaultError::StateCorruption(format!(
                    "transaction {}: stored txid does not match its serialization",
                    record.internal_id
                )));
            }
        }
        let ctv_transaction = record
            .ctv_bitcoin_transaction
            .as_deref()
            .map(|hex| decode_transaction(hex, "ctv_bitcoin_transaction"))
            .transpose()?;
        let ctv_baked = ctv_transaction.is_some();

        let tx_handle = plan.push_transaction(PlannedTx {
            id: record.id,
            internal_id: record.internal_id,
            name: record.name.clone(),
            kind,
            inputs: Vec::new(),
            outputs: Vec::new(),
            bitcoin_transaction,
            is_finalized: true,
            ctv_transaction,
            ctv_baked,
        });
        tx_by_uuid.insert(record.internal_id, tx_handle);

        for output_record in &record.outputs {
            if output_record.transaction_internal_id != record.internal_id {
                return Err(VaultError::StateCorruption(format!(
                    "output {} claims a different owning transaction",
                    output_record.internal_id
                )));
            }
            let output_handle = plan.push_output(PlannedOutput {
                id: output_record.id,
                internal_id: output_record.internal_id,
                name: output_record.name.clone(),
                transaction: tx_handle,
                template: output_record.script_template,
                amount: Amount::from_sat(output_record.amount),
                timelock_multiplier: output_record.timelock_multiplier,
                child_transactions: Vec::new(),
                vout_override: output_record.vout_override,
                script_pubkey: None,
                redeem_script: None,
                address: None,
                is_finalized: true,
                ctv_redeem_script: None,
                ctv_script_pubkey: None,
            });
            plan.tx_mut(tx_handle).outputs.push(output_handle);
            output_by_uuid.insert(output_record.internal_id, output_handle);
            pending_children.push((
                output_handle,
                output_record.child_transaction_internal_ids.clone(),
            ));
        }

        for input_record in &record.inputs {
            if input_record.transaction_internal_id != record.internal_id {
                return Err(VaultError::StateCorruption(format!(
                    "input {} claims a different owning transaction",
                    input_record.internal_id
                )));
            }
            let input_handle = plan.push_input(PlannedInput {
                internal_id: input_record.internal_id,
                transaction: tx_handle,
                // Resolved in phase 2; points at a placeholder until then.
                utxo: OutputHandle(usize::MAX),
                witness_template_selection: input_record.witness_template_selection,
                relative_timelock: None,
                is_finalized: true,
                ctv_witness: None,
            });
            plan.tx_mut(tx_handle).inputs.push(input_handle);
            pending_utxos.push((input_handle, input_record.utxo_internal_id));
        }
    }

    // Phase 2: resolve uuids into handles.
    for (output_handle, child_uuids) in pending_children {
        for child_uuid in child_uuids {
            let child = *tx_by_uuid.get(&child_uuid).ok_or_else(|| {
                VaultError::StateCorruption(format!(
                    "output references unknown child transaction {child_uuid}"
                ))
            })?;
            plan.output_mut(output_handle).child_transactions.push(child);
        }
    }
    for (input_handle, utxo_uuid) in pending_utxos {
        let utxo = *output_by_uuid.get(&utxo_uuid).ok_or_else(|| {
            VaultError::StateCorruption(format!("input references unknown output {utxo_uuid}"))
        })?;
        plan.input_mut(input_handle).utxo = utxo;

        // Re-derive the relative timelock now that the output is known.
        let output = plan.output(utxo);
        let relative_timelock = output
            .template
            .template()
            .relative_timelocks
            .as_ref()
            .and_then(|t| t.base_for(plan.input(input_handle).witness_template_selection))
            .map(|base| (base * u64::from(output.timelock_multiplier)) as u16);
        plan.input_mut(input_handle).relative_timelock = relative_timelock;
    }

    let funding_output = plan.funding_output()?;
    if plan.output(funding_output).name != FUNDING_OUTPUT_NAME {
        return Err(VaultError::StateCorruption(format!(
            "funding transaction's coin is `{}`, expected `{FUNDING_OUTPUT_NAME}`",
            plan.output(funding_output).name
        )));
    }

    Ok(plan)
}

// ==============================================================================
// Files
// ==============================================================================

/// Serialize the tree and write it to `path` as pretty-printed JSON.
pub fn save(plan: &VaultPlan, path: &Path) -> Result<(), VaultError> {
    let records = to_records(plan)?;
    let json = serde_json::to_string_pretty(&records)?;
    std::fs::write(path, json)?;
    info!(path = %path.display(), transactions = records.len(), "wrote transaction store");
    Ok(())
}

/// Read and rehydrate a saved tree from `path`.
pub fn load(path: &Path) -> Result<VaultPlan, VaultError> {
    let content = std::fs::read_to_string(path)?;
    let records: Vec<TxRecord> = serde_json::from_str(&content)?;
    from_records(records)
}

/// Whether `dir` already hosts an initialized vault.
pub fn vaultfile_exists(dir: &Path) -> bool {
    dir.join(VAULTFILE_FILENAME).exists()
}

/// Stamp `dir` as an initialized vault. The marker carries a format
/// version for later inspection and migrations.
pub fn write_vaultfile(dir: &Path) -> Result<(), VaultError> {
    let payload = serde_json::json!({ "version": VAULT_FILE_FORMAT_VERSION });
    let mut content = serde_json::to_string(&payload)?;
    content.push('\n');
    std::fs::write(dir.join(VAULTFILE_FILENAME), content)?;
    Ok(())
}
