//! The pre-sign engine.
//!
//! Two passes over the tree. Pass A parameterizes every output's script
//! (any order). Pass B walks transactions in ascending id order — parents
//! strictly before children, by construction — building each concrete
//! bitcoin transaction and producing a BIP-143 `SIGHASH_ALL` signature per
//! input from the output's witness template. Both passes are idempotent:
//! finalized nodes are skipped.

use bitcoin::hashes::Hash;
use bitcoin::hex::FromHex;
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{All, Message};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    absolute, EcdsaSighashType, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use tracing::debug;

use crate::error::VaultError;
use crate::params::VaultParameters;
use crate::plan::{InputHandle, TxHandle, TxKind, VaultPlan};
use crate::script::finalize_output_scripts;
use crate::templates::TemplateKind;

// ==============================================================================
// Pass A: Output Parameterization
// ==============================================================================

/// Parameterize every output's script template, writing the concrete
/// scriptPubKey, redeem script, and address. Already-finalized outputs are
/// left untouched.
pub fn parameterize_outputs(
    plan: &mut VaultPlan,
    params: &VaultParameters,
) -> Result<(), VaultError> {
    let handles: Vec<_> = plan.outputs().map(|(handle, _)| handle).collect();
    for handle in handles {
        if plan.output(handle).is_finalized {
            continue;
        }
        let (kind, multiplier) = {
            let output = plan.output(handle);
            (output.template, output.timelock_multiplier)
        };
        let scripts = finalize_output_scripts(kind, params, multiplier)?;

        let output = plan.output_mut(handle);
        output.script_pubkey = Some(scripts.script_pubkey);
        output.redeem_script = scripts.redeem_script;
        output.address = Some(scripts.address);
        output.is_finalized = true;
    }
    Ok(())
}

// ==============================================================================
// Pass B: Transaction Signing
// ==============================================================================

/// Finalize the whole tree: parameterize outputs, then build and sign
/// every planned transaction in ascending id order.
pub fn sign_tree(plan: &mut VaultPlan, params: &VaultParameters) -> Result<(), VaultError> {
    parameterize_outputs(plan, params)?;

    let secp = Secp256k1::new();
    let handles: Vec<_> = plan.transactions().map(|(handle, _)| handle).collect();
    for handle in handles {
        sign_transaction(plan, handle, params, &secp)?;
    }
    Ok(())
}

fn sign_transaction(
    plan: &mut VaultPlan,
    handle: TxHandle,
    params: &VaultParameters,
    secp: &Secp256k1<All>,
) -> Result<(), VaultError> {
    {
        let tx = plan.tx(handle);
        // The funding transaction already exists on-chain; re-signing a
        // finalized transaction would be a no-op by definition (the txid is
        // a function of the serialization), so skip both.
        if matches!(tx.kind, TxKind::Funding { .. }) || tx.is_finalized {
            return Ok(());
        }
        if tx.inputs.is_empty() {
            return Err(VaultError::InvalidPlan(format!(
                "transaction {} has no inputs",
                tx.internal_id
            )));
        }
    }

    let input_handles = plan.tx(handle).inputs.clone();
    let mut txins = Vec::with_capacity(input_handles.len());
    for input_handle in &input_handles {
        let input = plan.input(*input_handle);
        let parent = plan.output(input.utxo).transaction;
        // Ascending id order guarantees the parent txid exists by now.
        let txid = plan.txid(parent).ok_or_else(|| {
            VaultError::StateCorruption(format!(
                "parent transaction {} not finalized before its child",
                plan.tx(parent).internal_id
            ))
        })?;
        // The relative timelock must be set on the input itself, not just
        // inside the script, for OP_CSV to pass.
        let sequence = match input.relative_timelock {
            Some(blocks) => Sequence::from_height(blocks),
            None => Sequence::MAX,
        };
        txins.push(TxIn {
            previous_output: OutPoint {
                txid,
                vout: plan.vout(input.utxo),
            },
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        });
    }

    let mut txouts = Vec::new();
    for output_handle in &plan.tx(handle).outputs {
        let output = plan.output(*output_handle);
        let script_pubkey = output.script_pubkey.clone().ok_or_else(|| {
            VaultError::StateCorruption(format!("output {} not parameterized", output.internal_id))
        })?;
        txouts.push(TxOut {
            value: output.amount,
            script_pubkey,
        });
    }

    let mut transaction = Transaction {
        version: Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: txins,
        output: txouts,
    };

    // All inputs are final now, so each one can be signed.
    let mut witnesses = Vec::with_capacity(input_handles.len());
    for (input_index, input_handle) in input_handles.iter().enumerate() {
        witnesses.push(build_witness(
            plan,
            *input_handle,
            &transaction,
            input_index,
            params,
            secp,
        )?);
    }
    for (txin, witness) in transaction.input.iter_mut().zip(witnesses) {
        txin.witness = witness;
    }

    debug!(
        name = %plan.tx(handle).name,
        txid = %transaction.compute_txid(),
        "finalized planned transaction"
    );

    let tx = plan.tx_mut(handle);
    tx.bitcoin_transaction = Some(transaction);
    tx.is_finalized = true;
    for input_handle in input_handles {
        plan.input_mut(input_handle).is_finalized = true;
    }
    Ok(())
}

/// Expand one input's witness template into a concrete witness stack:
/// `<user_key>` pushes the raw public key, other placeholders become
/// BIP-143 signatures from the mapped key, literal tokens pass through,
/// and P2WSH inputs get the redeem script appended.
fn build_witness(
    plan: &VaultPlan,
    input_handle: InputHandle,
    unsigned_tx: &Transaction,
    input_index: usize,
    params: &VaultParameters,
    secp: &Secp256k1<All>,
) -> Result<Witness, VaultError> {
    let input = plan.input(input_handle);
    let utxo = plan.output(input.utxo);
    let template = utxo.template.template();
    let selector = input.witness_template_selection;
    let witness_template = template.witness_template(selector).ok_or_else(|| {
        VaultError::InvalidWitnessSelection {
            utxo: utxo.internal_id,
            selector: selector.label().to_string(),
        }
    })?;

    let mut witness = Witness::new();
    for token in witness_template.split_whitespace() {
        let Some(placeholder) = token
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
        else {
            let bytes = Vec::<u8>::from_hex(token).map_err(|_| {
                VaultError::InvalidPlan(format!("unknown witness token `{token}`"))
            })?;
            witness.push(bytes);
            continue;
        };

        if placeholder == "user_key" {
            witness.push(params.user_key.public_key.to_bytes());
            continue;
        }

        let key_name = template.signing_key_for(placeholder).ok_or_else(|| {
            VaultError::InvalidPlan(format!("missing key mapping for `{placeholder}`"))
        })?;
        let key = params
            .key_for_placeholder(key_name)
            .ok_or_else(|| VaultError::MissingParameter(key_name.to_string()))?;
        let secret = key
            .secret()
            .ok_or_else(|| VaultError::MissingParameter(key_name.to_string()))?;

        let sighash = segwit_sighash(unsigned_tx, input_index, plan, input_handle)?;
        let message = Message::from_digest(sighash);
        let signature = secp.sign_ecdsa(&message, &secret.inner);
        let mut sig_bytes = signature.serialize_der().to_vec();
        sig_bytes.push(EcdsaSighashType::All.to_u32() as u8);
        witness.push(sig_bytes);
    }

    if utxo.template != TemplateKind::User {
        let redeem_script = utxo.redeem_script.as_ref().ok_or_else(|| {
            VaultError::StateCorruption(format!("output {} has no redeem script", utxo.internal_id))
        })?;
        witness.push(redeem_script.as_bytes());
    }
    Ok(witness)
}

/// BIP-143 digest for one input: P2WPKH for the user's funding coin,
/// P2WSH with the output's redeem script everywhere else.
fn segwit_sighash(
    unsigned_tx: &Transaction,
    input_index: usize,
    plan: &VaultPlan,
    input_handle: InputHandle,
) -> Result<[u8; 32], VaultError> {
    let utxo = plan.output(plan.input(input_handle).utxo);
    let amount = utxo.amount;
    let mut cache = SighashCache::new(unsigned_tx);
    let sighash = if utxo.template == TemplateKind::User {
        let script_pubkey = utxo.script_pubkey.as_ref().ok_or_else(|| {
            VaultError::StateCorruption(format!("output {} not parameterized", utxo.internal_id))
        })?;
        cache
            .p2wpkh_signature_hash(input_index, script_pubkey, amount, EcdsaSighashType::All)
            .map_err(|e| VaultError::InvalidPlan(e.to_string()))?
            .to_byte_array()
    } else {
        let redeem_script = utxo.redeem_script.as_ref().ok_or_else(|| {
            VaultError::StateCorruption(format!("output {} has no redeem script", utxo.internal_id))
        })?;
        cache
            .p2wsh_signature_hash(input_index, redeem_script, amount, EcdsaSighashType::All)
            .map_err(|e| VaultError::InvalidPlan(e.to_string()))?
            .to_byte_array()
    };
    Ok(sighash)
}
