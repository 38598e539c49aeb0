//! The BIP-119 `OP_CHECKTEMPLATEVERIFY` back-end.
//!
//! Emits the same logical tree as the pre-sign engine, but instead of
//! signatures each output's redeem script commits to the standard template
//! hashes of its possible child transactions. The standard template hash
//! deliberately excludes input prevouts, which is what breaks the
//! recursive dependency between a parent committing to a child and the
//! child referencing the parent's txid: outputs are baked bottom-up first,
//! then parent txids are attached to inputs in a second pass.

use bitcoin::consensus::Encodable;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::opcodes::all as opcodes;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::transaction::Version;
use bitcoin::{absolute, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use tracing::debug;

use crate::error::VaultError;
use crate::params::VaultParameters;
use crate::plan::{OutputHandle, TxHandle, TxKind, VaultPlan};
use crate::script::scriptnum_encode;
use crate::sign::parameterize_outputs;
use crate::templates::TemplateKind;

/// nSequence attached to CTV inputs that spend timelocked outputs.
const CTV_INPUT_TIMELOCK: u16 = 144;
/// CSV operand of the key-spend branch in CTV redeem scripts.
const CTV_BRANCH_CSV_DELAY: i64 = 288;

// ==============================================================================
// Standard Template Hash
// ==============================================================================

/// BIP-119 StandardTemplateHash of a transaction, as committed to by
/// `OP_CHECKTEMPLATEVERIFY`: version, locktime, the scriptSig hash when
/// any scriptSig is non-empty, input count, sequence hash, output count,
/// output hash, and the spending input index. Prevouts are excluded.
pub fn standard_template_hash(tx: &Transaction, input_index: u32) -> [u8; 32] {
    let mut buffer = Vec::new();
    tx.version
        .consensus_encode(&mut buffer)
        .expect("writing to memory cannot fail");
    tx.lock_time
        .consensus_encode(&mut buffer)
        .expect("writing to memory cannot fail");

    if tx.input.iter().any(|input| !input.script_sig.is_empty()) {
        let mut script_sigs = Vec::new();
        for input in &tx.input {
            input
                .script_sig
                .consensus_encode(&mut script_sigs)
                .expect("writing to memory cannot fail");
        }
        buffer.extend_from_slice(sha256::Hash::hash(&script_sigs).as_byte_array());
    }

    (tx.input.len() as u32)
        .consensus_encode(&mut buffer)
        .expect("writing to memory cannot fail");

    let mut sequences = Vec::new();
    for input in &tx.input {
        input
            .sequence
            .consensus_encode(&mut sequences)
            .expect("writing to memory cannot fail");
    }
    buffer.extend_from_slice(sha256::Hash::hash(&sequences).as_byte_array());

    (tx.output.len() as u32)
        .consensus_encode(&mut buffer)
        .expect("writing to memory cannot fail");

    let mut outputs = Vec::new();
    for output in &tx.output {
        output
            .consensus_encode(&mut outputs)
            .expect("writing to memory cannot fail");
    }
    buffer.extend_from_slice(sha256::Hash::hash(&outputs).as_byte_array());

    input_index
        .consensus_encode(&mut buffer)
        .expect("writing to memory cannot fail");

    sha256::Hash::hash(&buffer).to_byte_array()
}

// ==============================================================================
// CTV Script Fragment
// ==============================================================================

/// `<h_0> … <h_{k-1}> <k> OP_ROLL OP_ROLL OP_CTV` followed by exactly the
/// drops that leave one element on the stack (segwit cleanstack). The
/// witness supplies the child index underneath the pushed hashes; the two
/// rolls bring the selected hash to the top for the CTV check.
pub(crate) fn ctv_fragment(hashes: &[[u8; 32]]) -> ScriptBuf {
    let mut builder = Builder::new();
    for hash in hashes {
        builder = builder.push_slice(hash);
    }

    let count = if hashes.is_empty() {
        vec![0x00]
    } else {
        scriptnum_encode(hashes.len() as i64)
    };
    builder = builder.push_slice(
        PushBytesBuf::try_from(count).expect("child count encoding is a few bytes"),
    );
    builder = builder
        .push_opcode(opcodes::OP_ROLL)
        .push_opcode(opcodes::OP_ROLL)
        .push_opcode(opcodes::OP_NOP4);

    let k = hashes.len() as isize;
    let (num_2drops, num_1drops) = if k % 2 == 0 {
        ((k / 2 - 1).max(0), 1)
    } else {
        (k / 2, 0)
    };
    for _ in 0..num_2drops {
        builder = builder.push_opcode(opcodes::OP_2DROP);
    }
    for _ in 0..num_1drops {
        builder = builder.push_opcode(opcodes::OP_DROP);
    }
    builder.into_script()
}

/// Witness push selecting child `index`.
fn child_index_push(index: usize) -> Vec<u8> {
    if index == 0 {
        vec![0x00]
    } else {
        scriptnum_encode(index as i64)
    }
}

/// Wrap a CTV fragment behind an OP_ELSE so the key-spend branch stays
/// available. The spending witness pushes a literal zero byte to select
/// the fragment.
fn wrap_with_branch(branch: ScriptBuf, fragment: &Script) -> ScriptBuf {
    let mut bytes = Builder::new().push_opcode(opcodes::OP_IF).into_script().into_bytes();
    bytes.extend_from_slice(branch.as_bytes());
    bytes.extend_from_slice(
        Builder::new()
            .push_opcode(opcodes::OP_ELSE)
            .into_script()
            .as_bytes(),
    );
    bytes.extend_from_slice(fragment.as_bytes());
    bytes.extend_from_slice(
        Builder::new()
            .push_opcode(opcodes::OP_ENDIF)
            .into_script()
            .as_bytes(),
    );
    ScriptBuf::from_bytes(bytes)
}

fn csv_delay_push() -> PushBytesBuf {
    PushBytesBuf::try_from(scriptnum_encode(CTV_BRANCH_CSV_DELAY))
        .expect("csv delay encoding is two bytes")
}

// ==============================================================================
// Baking
// ==============================================================================

/// Bake the whole tree: parameterize outputs (the bypass outputs keep
/// their ordinary scripts), then walk transactions in ascending id order
/// attaching fully-resolved CTV transactions.
///
/// The signing pass must have run first: the funding-commit input carries
/// the user's signature witness, which only that pass produces.
pub fn bake_tree(plan: &mut VaultPlan, params: &VaultParameters) -> Result<(), VaultError> {
    parameterize_outputs(plan, params)?;

    let handles: Vec<_> = plan.transactions().map(|(handle, _)| handle).collect();
    for handle in handles {
        bake_transaction(plan, handle, false, params)?;
    }
    Ok(())
}

/// Compute the CTV redeem script and scriptPubKey for one output, plus the
/// spending witness of every child input. Recurses through the subtree
/// because a commitment requires the standard template hashes of all
/// children, which require theirs, and so on down to the leaves.
fn bake_output(
    plan: &mut VaultPlan,
    handle: OutputHandle,
    params: &VaultParameters,
) -> Result<(), VaultError> {
    let kind = plan.output(handle).template;
    let has_extra_branch = matches!(kind, TemplateKind::ColdStorage | TemplateKind::Shard);
    if !matches!(
        kind,
        TemplateKind::ColdStorage | TemplateKind::Shard | TemplateKind::BasicPresigned
    ) {
        // CPFP hooks, burn outputs, and the user's coin keep their
        // ordinary scripts.
        return Ok(());
    }
    if plan.output(handle).ctv_script_pubkey.is_some() {
        // Baking is deterministic, so the first result stands.
        return Ok(());
    }

    // Deterministic child ordering: sort by uuid string.
    let mut children = plan.output(handle).child_transactions.clone();
    children.sort_by_key(|child| plan.tx(*child).internal_id.to_string());

    let mut hashes = Vec::with_capacity(children.len());
    for child in &children {
        bake_transaction(plan, *child, true, params)?;
        let child_tx = plan.tx(*child).ctv_transaction.as_ref().ok_or_else(|| {
            VaultError::StateCorruption(format!(
                "child transaction {} is not baked",
                plan.tx(*child).internal_id
            ))
        })?;
        hashes.push(standard_template_hash(child_tx, 0));
    }

    let fragment = ctv_fragment(&hashes);
    let redeem_script = match kind {
        TemplateKind::ColdStorage => {
            let branch = Builder::new()
                .push_slice(params.cold_key_1.public_key.to_bytes())
                .push_opcode(opcodes::OP_CHECKSIGVERIFY)
                .push_slice(params.cold_key_2.public_key.to_bytes())
                .push_opcode(opcodes::OP_CHECKSIGVERIFY)
                .push_slice(csv_delay_push())
                .push_opcode(opcodes::OP_CSV)
                .into_script();
            wrap_with_branch(branch, &fragment)
        }
        TemplateKind::Shard => {
            let branch = Builder::new()
                .push_slice(params.hot_wallet_key.public_key.to_bytes())
                .push_opcode(opcodes::OP_CHECKSIGVERIFY)
                .push_slice(csv_delay_push())
                .push_opcode(opcodes::OP_CSV)
                .into_script();
            wrap_with_branch(branch, &fragment)
        }
        _ => fragment,
    };
    let script_pubkey = ScriptBuf::new_p2wsh(&redeem_script.wscript_hash());

    {
        let output = plan.output_mut(handle);
        output.ctv_redeem_script = Some(redeem_script.clone());
        output.ctv_script_pubkey = Some(script_pubkey);
    }

    // Hand each child input its spending witness:
    // [child index, branch selector when present, redeem script].
    for (index, child) in children.iter().enumerate() {
        let mut witness = Witness::new();
        witness.push(child_index_push(index));
        if has_extra_branch {
            witness.push([0x00]);
        }
        witness.push(redeem_script.as_bytes());

        let input_handle = plan
            .tx(*child)
            .inputs
            .iter()
            .copied()
            .find(|candidate| plan.input(*candidate).utxo == handle)
            .ok_or_else(|| {
                VaultError::StateCorruption(format!(
                    "transaction {} is listed as a child but spends no such output",
                    plan.tx(*child).internal_id
                ))
            })?;
        plan.input_mut(input_handle).ctv_witness = Some(witness);
    }
    Ok(())
}

/// Build the CTV version of one transaction. A partial bake
/// (`skip_inputs`) carries null prevouts and empty witnesses — enough for
/// the standard template hash, which covers input counts and sequences
/// but never prevouts. The full pass attaches the now-known parent txids
/// and the spending witnesses, then memoizes via `ctv_baked`.
fn bake_transaction(
    plan: &mut VaultPlan,
    handle: TxHandle,
    skip_inputs: bool,
    params: &VaultParameters,
) -> Result<(), VaultError> {
    if plan.tx(handle).ctv_baked {
        return Ok(());
    }
    if matches!(plan.tx(handle).kind, TxKind::Funding { .. }) {
        return Ok(());
    }

    let output_handles = plan.tx(handle).outputs.clone();
    for output in &output_handles {
        bake_output(plan, *output, params)?;
    }

    if skip_inputs && plan.tx(handle).ctv_transaction.is_some() {
        // Already partially baked; outputs cannot have changed.
        return Ok(());
    }

    let mut txouts = Vec::with_capacity(output_handles.len());
    for output_handle in &output_handles {
        let output = plan.output(*output_handle);
        let script_pubkey = output
            .ctv_script_pubkey
            .clone()
            .or_else(|| output.script_pubkey.clone())
            .ok_or_else(|| {
                VaultError::StateCorruption(format!(
                    "output {} not parameterized",
                    output.internal_id
                ))
            })?;
        txouts.push(TxOut {
            value: output.amount,
            script_pubkey,
        });
    }

    let input_handles = plan.tx(handle).inputs.clone();
    let mut txins = Vec::with_capacity(input_handles.len());
    for (index, input_handle) in input_handles.iter().enumerate() {
        let input = plan.input(*input_handle);
        let utxo = plan.output(input.utxo);
        let parent = utxo.transaction;

        let sequence = if matches!(
            utxo.template,
            TemplateKind::ColdStorage | TemplateKind::Shard
        ) {
            Sequence::from_height(CTV_INPUT_TIMELOCK)
        } else {
            Sequence::MAX
        };

        let (previous_output, witness) = if skip_inputs {
            (OutPoint::null(), Witness::new())
        } else {
            let txid = match &plan.tx(parent).kind {
                TxKind::Funding { txid } => *txid,
                TxKind::Planned => plan
                    .tx(parent)
                    .ctv_transaction
                    .as_ref()
                    .ok_or_else(|| {
                        VaultError::StateCorruption(format!(
                            "parent transaction {} not baked before its child",
                            plan.tx(parent).internal_id
                        ))
                    })?
                    .compute_txid(),
            };
            let witness = if matches!(plan.tx(parent).kind, TxKind::Funding { .. }) {
                // The funding-commit input is the user's coin; its witness
                // is the signature produced by the pre-sign pass, which
                // must have run first.
                plan.tx(handle)
                    .bitcoin_transaction
                    .as_ref()
                    .and_then(|btx| btx.input.get(index))
                    .map(|txin| txin.witness.clone())
                    .ok_or_else(|| {
                        VaultError::StateCorruption(format!(
                            "transaction {} has no signed funding witness; sign the tree before baking",
                            plan.tx(handle).internal_id
                        ))
                    })?
            } else {
                plan.input(*input_handle).ctv_witness.clone().ok_or_else(|| {
                    VaultError::StateCorruption(format!(
                        "input {} has no CTV witness",
                        plan.input(*input_handle).internal_id
                    ))
                })?
            };
            (
                OutPoint {
                    txid,
                    vout: plan.vout(input.utxo),
                },
                witness,
            )
        };

        txins.push(TxIn {
            previous_output,
            script_sig: ScriptBuf::new(),
            sequence,
            witness,
        });
    }

    let transaction = Transaction {
        version: Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: txins,
        output: txouts,
    };

    if !skip_inputs {
        debug!(
            name = %plan.tx(handle).name,
            ctv_txid = %transaction.compute_txid(),
            "baked CTV transaction"
        );
    }

    let tx = plan.tx_mut(handle);
    tx.ctv_transaction = Some(transaction);
    if !skip_inputs {
        tx.ctv_baked = true;
    }
    Ok(())
}
