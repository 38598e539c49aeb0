//! Transaction tree planning.
//!
//! The planner grows a [`VaultPlan`] from the funding coin by composing a
//! small set of transaction factories. Every planner-built transaction
//! spends exactly what it creates (the safety checker enforces this), and
//! every vault output exposes the same three escapes: push the whole coin
//! to cold storage, shard it into a timelocked stipend, or peel off a
//! single shard and re-vault the rest.

use bitcoin::Amount;
use tracing::debug;

use crate::error::VaultError;
use crate::params::VaultParameters;
use crate::plan::{OutputHandle, TxHandle, VaultPlan, MAX_RELATIVE_TIMELOCK};
use crate::templates::{TemplateKind, WitnessSelector};

/// Base relative delay of the shard hot-wallet branch, which grows with
/// the shard index.
fn shard_timelock_base() -> u64 {
    TemplateKind::Shard
        .template()
        .relative_timelocks
        .as_ref()
        .and_then(|t| t.replacements.first())
        .map(|(_, base)| *base)
        .unwrap_or(144)
}

/// Split an amount into `num_shards` pieces: every shard gets the floored
/// share and the first shard absorbs the remainder, so the pieces sum to
/// the input exactly.
pub fn shard_amounts(amount: Amount, num_shards: u32) -> (Amount, Amount) {
    let per_shard = amount.to_sat() / u64::from(num_shards);
    let first_shard_extra = amount.to_sat() - per_shard * u64::from(num_shards);
    (
        Amount::from_sat(per_shard),
        Amount::from_sat(first_shard_extra),
    )
}

// ==============================================================================
// Transaction Factories
// ==============================================================================

/// Extend the tree with a transaction that spends `incoming` into an
/// equal-amount provably-unspendable output. Returns `None` when burn
/// transactions are disabled.
fn make_burn_transaction(
    plan: &mut VaultPlan,
    incoming: OutputHandle,
    params: &VaultParameters,
) -> Result<Option<TxHandle>, VaultError> {
    if !params.enable_burn_transactions {
        return Ok(None);
    }

    let burn_tx = plan.add_transaction("Burn some UTXO", true);
    plan.add_input(burn_tx, incoming, WitnessSelector::Presigned)?;

    // The amount stays on the unspendable output rather than being donated
    // to miner fee, which would incent miner-thief attacks.
    let amount = plan.output(incoming).amount;
    plan.add_output(
        burn_tx,
        "burned UTXO",
        TemplateKind::BurnUnspendable,
        amount,
        1,
    );
    plan.add_child(incoming, burn_tx);
    Ok(Some(burn_tx))
}

/// Extend the tree with a transaction pushing `incoming` into the cold
/// storage layer, and give the cold coin its burn escape.
fn make_push_to_cold_storage_transaction(
    plan: &mut VaultPlan,
    incoming: OutputHandle,
    params: &VaultParameters,
) -> Result<TxHandle, VaultError> {
    let push_tx = plan.add_transaction("push-to-cold-storage", true);
    plan.add_input(push_tx, incoming, WitnessSelector::Presigned)?;

    let amount = plan.output(incoming).amount;
    let cold_output = plan.add_output(
        push_tx,
        "cold storage UTXO",
        TemplateKind::ColdStorage,
        amount,
        1,
    );

    // The relative timelock in front of the cold keys means cold coins
    // can't all be swept at once; watching the chain during that window is
    // what makes the burn escape useful.
    make_burn_transaction(plan, cold_output, params)?;

    plan.add_child(incoming, push_tx);
    Ok(push_tx)
}

/// One transaction sweeping several sharded coins into cold storage at
/// once, sparing the user a broadcast per shard.
fn make_sweep_to_cold_storage_transaction(
    plan: &mut VaultPlan,
    incoming: &[OutputHandle],
    params: &VaultParameters,
) -> Result<TxHandle, VaultError> {
    let sweep_tx = plan.add_transaction("Sharded UTXO sweep transaction", true);

    for utxo in incoming {
        plan.add_input(sweep_tx, *utxo, WitnessSelector::Presigned)?;
        let amount = plan.output(*utxo).amount;
        let cold_output = plan.add_output(
            sweep_tx,
            "cold storage UTXO",
            TemplateKind::ColdStorage,
            amount,
            1,
        );
        make_burn_transaction(plan, cold_output, params)?;
    }

    Ok(sweep_tx)
}

/// Suffix subsets `set[i..]` for `i` in `0..len-1`. Shards unlock in
/// order, so these are the only sweep combinations that can arise.
fn telescoping_subsets(set: &[OutputHandle]) -> Vec<Vec<OutputHandle>> {
    (0..set.len().saturating_sub(1))
        .map(|i| set[i..].to_vec())
        .collect()
}

/// Split `incoming` into `num_shards` shard outputs with monotonically
/// increasing hot-wallet timelocks, each with its own push-to-cold escape.
#[allow(clippy::too_many_arguments)]
fn make_sharding_transaction(
    plan: &mut VaultPlan,
    per_shard_amount: Amount,
    num_shards: u32,
    first_shard_extra_amount: Amount,
    incoming: OutputHandle,
    original_num_shards: u32,
    params: &VaultParameters,
) -> Result<TxHandle, VaultError> {
    let partial = if num_shards < original_num_shards {
        "(partial) "
    } else {
        ""
    };
    let sharding_tx =
        plan.add_transaction(&format!("Vault {partial}stipend start transaction."), true);
    plan.add_child(incoming, sharding_tx);
    plan.add_input(sharding_tx, incoming, WitnessSelector::Presigned)?;

    let mut shard_outputs = Vec::with_capacity(num_shards as usize);
    for shard_id in 0..num_shards {
        let mut amount = per_shard_amount;
        if shard_id == 0 {
            amount += first_shard_extra_amount;
        }

        // Shards can't re-vault; the coin has to pass through the cold or
        // hot wallet before it can come back.
        let shard_output = plan.add_output(
            sharding_tx,
            &format!(
                "shard fragment UTXO {}/{}",
                shard_id + 1,
                num_shards
            ),
            TemplateKind::Shard,
            amount,
            shard_id,
        );
        shard_outputs.push(shard_output);

        make_push_to_cold_storage_transaction(plan, shard_output, params)?;
    }

    // Sweeps aggregate the per-shard escapes but multiply the tree size,
    // which is why they are off by default.
    if params.enable_sweep_transactions {
        for subset in telescoping_subsets(&shard_outputs) {
            let sweep_tx = make_sweep_to_cold_storage_transaction(plan, &subset, params)?;
            for utxo in subset {
                plan.add_child(utxo, sweep_tx);
            }
        }
    }

    Ok(sharding_tx)
}

/// Spend one shard out of the vault and re-vault the remainder. The
/// re-vaulted coin recursively exposes push-to-cold, sharding with one
/// fewer shard, and this same one-shard spend; recursion stops when a
/// single shard remains.
fn make_one_shard_possible_spend(
    plan: &mut VaultPlan,
    incoming: OutputHandle,
    per_shard_amount: Amount,
    num_shards: u32,
    original_num_shards: u32,
    first_shard_extra_amount: Option<Amount>,
    params: &VaultParameters,
) -> Result<(), VaultError> {
    let spend_tx = plan.add_transaction(
        "Vault transaction: spend one shard, re-vault the remaining shards",
        true,
    );
    plan.add_child(incoming, spend_tx);
    plan.add_input(spend_tx, incoming, WitnessSelector::Presigned)?;

    let mut exit_amount = per_shard_amount;
    if let Some(extra) = first_shard_extra_amount {
        exit_amount += extra;
    }

    let exit_output = plan.add_output(
        spend_tx,
        "shard fragment UTXO",
        TemplateKind::Shard,
        exit_amount,
        1,
    );
    // The exit coin can still be diverted to cold storage instead of being
    // left to the hot wallet. The hot-wallet spend itself is not a
    // pre-signed transaction; the hot wallet creates it at spend time.
    make_push_to_cold_storage_transaction(plan, exit_output, params)?;

    if num_shards == 1 {
        return Ok(());
    }

    let remaining_amount = per_shard_amount * u64::from(num_shards - 1);
    let revault_output = plan.add_output(
        spend_tx,
        "vault UTXO",
        TemplateKind::BasicPresigned,
        remaining_amount,
        1,
    );

    make_push_to_cold_storage_transaction(plan, revault_output, params)?;
    make_sharding_transaction(
        plan,
        per_shard_amount,
        num_shards - 1,
        Amount::ZERO,
        revault_output,
        original_num_shards,
        params,
    )?;
    make_one_shard_possible_spend(
        plan,
        revault_output,
        per_shard_amount,
        num_shards - 1,
        original_num_shards,
        None,
        params,
    )
}

// ==============================================================================
// Entrypoint
// ==============================================================================

/// Build the whole pre-planned transaction tree on top of the funding
/// coin. Nothing is signed here; the sign-off on the tree (and the secure
/// deletion of the ephemeral keys afterwards) happens separately.
///
/// Returns the initial vault output created by the funding-commit
/// transaction.
pub fn setup_vault(
    plan: &mut VaultPlan,
    funding_output: OutputHandle,
    params: &VaultParameters,
) -> Result<OutputHandle, VaultError> {
    if params.num_shards == 0 {
        return Err(VaultError::InvalidPlan(
            "num_shards must be at least 1".to_string(),
        ));
    }
    // The last shard's hot-wallet delay is the largest timelock the tree
    // will ever ask for; refuse shard counts that push it past the ceiling.
    let max_timelock = shard_timelock_base() * u64::from(params.num_shards - 1);
    if max_timelock > MAX_RELATIVE_TIMELOCK {
        return Err(VaultError::TimelockOverflow {
            value: max_timelock,
            max: MAX_RELATIVE_TIMELOCK,
        });
    }

    let commit_tx = plan.add_transaction("Funding commitment transaction", true);
    plan.add_child(funding_output, commit_tx);
    plan.add_input(commit_tx, funding_output, WitnessSelector::User)?;

    let amount = plan.output(funding_output).amount;
    let vault_initial_output = plan.add_output(
        commit_tx,
        "vault initial UTXO",
        TemplateKind::BasicPresigned,
        amount,
        1,
    );

    // Escape hatch: push the whole amount to cold storage.
    make_push_to_cold_storage_transaction(plan, vault_initial_output, params)?;

    let (per_shard_amount, first_shard_extra_amount) = shard_amounts(amount, params.num_shards);
    debug_assert_eq!(
        per_shard_amount * u64::from(params.num_shards) + first_shard_extra_amount,
        amount
    );

    make_sharding_transaction(
        plan,
        per_shard_amount,
        params.num_shards,
        first_shard_extra_amount,
        vault_initial_output,
        params.num_shards,
        params,
    )?;

    make_one_shard_possible_spend(
        plan,
        vault_initial_output,
        per_shard_amount,
        params.num_shards,
        params.num_shards,
        Some(first_shard_extra_amount),
        params,
    )?;

    debug!(
        transactions = plan.transaction_count(),
        outputs = plan.output_count(),
        num_shards = params.num_shards,
        "planned transaction tree built"
    );

    Ok(vault_initial_output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{funding_plan, test_parameters};

    #[test]
    fn shard_amounts_absorb_the_remainder_into_the_first_shard() {
        let (per_shard, extra) = shard_amounts(Amount::from_sat(7_084_449_357), 100);
        assert_eq!(per_shard, Amount::from_sat(70_844_493));
        assert_eq!(extra, Amount::from_sat(57));
        assert_eq!(
            per_shard * 100 + extra,
            Amount::from_sat(7_084_449_357),
            "shards must sum to the input exactly"
        );
    }

    #[test]
    fn shard_amounts_divide_evenly_without_remainder() {
        let (per_shard, extra) = shard_amounts(Amount::from_sat(200_000_000), 5);
        assert_eq!(per_shard, Amount::from_sat(40_000_000));
        assert_eq!(extra, Amount::ZERO);
    }

    #[test]
    fn sharding_produces_indexed_timelock_multipliers() {
        let params = test_parameters(5);
        let (mut plan, funding_output) = funding_plan(Amount::from_sat(200_000_000));
        setup_vault(&mut plan, funding_output, &params).expect("vault builds");

        let commit = plan.output(funding_output).child_transactions[0];
        let vault_initial = plan.tx(commit).outputs[1];
        let sharding = plan.output(vault_initial).child_transactions[1];

        let shards: Vec<_> = plan
            .tx(sharding)
            .outputs
            .iter()
            .map(|o| plan.output(*o))
            .filter(|o| o.name.starts_with("shard fragment"))
            .collect();
        assert_eq!(shards.len(), 5);
        for (i, shard) in shards.iter().enumerate() {
            assert_eq!(shard.timelock_multiplier, i as u32);
        }
        assert_eq!(shards[0].name, "shard fragment UTXO 1/5");
        assert_eq!(shards[4].name, "shard fragment UTXO 5/5");
    }

    #[test]
    fn vault_outputs_expose_three_spending_paths() {
        let params = test_parameters(3);
        let (mut plan, funding_output) = funding_plan(Amount::from_sat(300_000));
        let vault_initial =
            setup_vault(&mut plan, funding_output, &params).expect("vault builds");

        let children = &plan.output(vault_initial).child_transactions;
        assert_eq!(children.len(), 3);
        let names: Vec<_> = children.iter().map(|c| plan.tx(*c).name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "push-to-cold-storage",
                "Vault stipend start transaction.",
                "Vault transaction: spend one shard, re-vault the remaining shards",
            ]
        );
    }

    #[test]
    fn one_shard_spend_does_not_recurse_at_a_single_shard() {
        let params = test_parameters(1);
        let (mut plan, funding_output) = funding_plan(Amount::from_sat(100_000));
        let vault_initial =
            setup_vault(&mut plan, funding_output, &params).expect("vault builds");

        let spend_tx = *plan
            .output(vault_initial)
            .child_transactions
            .last()
            .expect("one-shard spend exists");
        // CPFP hook plus the exit shard; no re-vault output, no recursion.
        assert_eq!(plan.tx(spend_tx).outputs.len(), 2);
        let names: Vec<_> = plan
            .tx(spend_tx)
            .outputs
            .iter()
            .map(|o| plan.output(*o).name.as_str())
            .collect();
        assert_eq!(names, vec!["CPFP hook", "shard fragment UTXO"]);
    }

    #[test]
    fn excessive_shard_count_is_a_timelock_overflow() {
        // 144 × (30 − 1) = 4176 > 0xFFF.
        let params = test_parameters(30);
        let (mut plan, funding_output) = funding_plan(Amount::from_sat(1_000_000));
        let err = setup_vault(&mut plan, funding_output, &params)
            .expect_err("shard count exceeds the timelock ceiling");
        assert!(matches!(err, VaultError::TimelockOverflow { value: 4176, .. }));
    }

    #[test]
    fn sweeps_build_telescoping_subsets_when_enabled() {
        let mut params = test_parameters(4);
        params.enable_sweep_transactions = true;
        let (mut plan, funding_output) = funding_plan(Amount::from_sat(400_000));
        setup_vault(&mut plan, funding_output, &params).expect("vault builds");

        let sweep_count = plan
            .transactions()
            .filter(|(_, tx)| tx.name == "Sharded UTXO sweep transaction")
            .count();
        // Top-level sharding (4 shards → 3 sweeps), then recursive levels
        // with 3 shards (2) and 2 shards (1).
        assert_eq!(sweep_count, 6);
    }

    #[test]
    fn burn_transactions_can_be_disabled() {
        let mut params = test_parameters(2);
        params.enable_burn_transactions = false;
        let (mut plan, funding_output) = funding_plan(Amount::from_sat(100_000));
        setup_vault(&mut plan, funding_output, &params).expect("vault builds");
        assert!(!plan
            .transactions()
            .any(|(_, tx)| tx.name == "Burn some UTXO"));
    }
}
