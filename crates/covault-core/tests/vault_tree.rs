//! End-to-end scenarios over the full engine: build, check, sign, save,
//! reload, walk, broadcast, and the CTV back-end.

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Amount, Network, NetworkKind, PrivateKey, Txid};
use uuid::Uuid;

use covault_core::check::safety_check;
use covault_core::ctv::{bake_tree, standard_template_hash};
use covault_core::persist;
use covault_core::plan::{OutputHandle, VaultPlan};
use covault_core::planner::setup_vault;
use covault_core::rpc::mock::MockRpc;
use covault_core::sign::sign_tree;
use covault_core::state::{broadcast_next_transaction, current_confirmed_transaction};
use covault_core::templates::{TemplateKind, WitnessSelector};
use covault_core::{VaultError, VaultKey, VaultParameters};

// ==============================================================================
// Fixtures
// ==============================================================================

fn key_from_byte(b: u8) -> VaultKey {
    let secret = SecretKey::from_slice(&[b; 32]).expect("constant bytes form a valid secret key");
    VaultKey::from_private_key(PrivateKey::new(secret, NetworkKind::Test))
        .expect("generated keys are compressed")
}

fn test_parameters(num_shards: u32) -> VaultParameters {
    VaultParameters {
        network: Network::Regtest,
        num_shards,
        amount: Amount::from_sat(200_000_000),
        user_key: key_from_byte(1),
        ephemeral_key_1: key_from_byte(2),
        ephemeral_key_2: key_from_byte(3),
        cold_key_1: key_from_byte(4),
        cold_key_2: key_from_byte(5),
        hot_wallet_key: key_from_byte(6),
        unspendable_key_1: key_from_byte(7).public_key,
        enable_burn_transactions: true,
        enable_sweep_transactions: false,
    }
}

fn funding_txid() -> Txid {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xfd;
    Txid::from_byte_array(bytes)
}

fn funding_plan(amount: Amount) -> (VaultPlan, OutputHandle) {
    let mut plan = VaultPlan::new();
    let funding = plan.add_funding_transaction(funding_txid());
    let coin = plan.add_output(funding, "segwit input coin", TemplateKind::User, amount, 1);
    plan.set_vout_override(coin, 0);
    (plan, coin)
}

fn built_and_signed(num_shards: u32, sats: u64) -> VaultPlan {
    let params = test_parameters(num_shards);
    let (mut plan, funding_output) = funding_plan(Amount::from_sat(sats));
    setup_vault(&mut plan, funding_output, &params).expect("vault builds");
    safety_check(&plan).expect("tree is well formed");
    sign_tree(&mut plan, &params).expect("tree signs");
    plan
}

fn temp_store() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("covault-itest-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("temp dir creates");
    dir.join(persist::TRANSACTION_STORE_FILENAME)
}

fn shard_outputs_of_top_sharding(plan: &VaultPlan) -> Vec<OutputHandle> {
    let funding = plan.funding_tx().expect("funding exists");
    let commit = plan.child_transactions(funding)[0];
    let vault_initial = plan.tx(commit).outputs[1];
    let sharding = plan
        .output(vault_initial)
        .child_transactions
        .iter()
        .copied()
        .find(|tx| plan.tx(*tx).name.contains("stipend start"))
        .expect("sharding transaction exists");
    plan.tx(sharding)
        .outputs
        .iter()
        .copied()
        .filter(|o| plan.output(*o).name.starts_with("shard fragment"))
        .collect()
}

// ==============================================================================
// Build and Save
// ==============================================================================

#[test]
fn build_and_save_five_shards() {
    let plan = built_and_signed(5, 200_000_000);

    let shards = shard_outputs_of_top_sharding(&plan);
    assert_eq!(shards.len(), 5);
    assert_eq!(plan.output(shards[0]).amount, Amount::from_sat(40_000_000));
    for shard in &shards[1..] {
        assert_eq!(plan.output(*shard).amount, Amount::from_sat(40_000_000));
    }

    let path = temp_store();
    persist::save(&plan, &path).expect("tree saves");

    let raw = std::fs::read_to_string(&path).expect("store reads");
    let records: serde_json::Value = serde_json::from_str(&raw).expect("store is JSON");
    let first = &records.as_array().expect("store is an array")[0];
    assert_eq!(first["id"], -1);
    assert_eq!(first["name"], "initial transaction (from user)");

    let _ = std::fs::remove_dir_all(path.parent().expect("store has a parent"));
}

#[test]
fn shard_remainder_is_absorbed_exactly() {
    // 100_000_001 / 3 leaves a remainder of 2 for the first shard.
    let plan = built_and_signed(3, 100_000_001);
    let shards = shard_outputs_of_top_sharding(&plan);
    assert_eq!(plan.output(shards[0]).amount, Amount::from_sat(33_333_335));
    assert_eq!(plan.output(shards[1]).amount, Amount::from_sat(33_333_333));
    assert_eq!(plan.output(shards[2]).amount, Amount::from_sat(33_333_333));
    let total: Amount = shards.iter().map(|s| plan.output(*s).amount).sum();
    assert_eq!(total, Amount::from_sat(100_000_001));
}

#[test]
fn round_trip_preserves_txids_and_topology() {
    let plan = built_and_signed(5, 200_000_000);
    let path = temp_store();
    persist::save(&plan, &path).expect("tree saves");
    let reloaded = persist::load(&path).expect("tree reloads");

    assert_eq!(reloaded.transaction_count(), plan.transaction_count());
    for ((handle_a, tx_a), (handle_b, tx_b)) in plan.transactions().zip(reloaded.transactions()) {
        assert_eq!(tx_a.internal_id, tx_b.internal_id);
        assert_eq!(tx_a.id, tx_b.id);
        assert_eq!(tx_a.name, tx_b.name);
        assert_eq!(plan.txid(handle_a), reloaded.txid(handle_b));
    }

    let _ = std::fs::remove_dir_all(path.parent().expect("store has a parent"));
}

// ==============================================================================
// Walker and Broadcast
// ==============================================================================

#[tokio::test]
async fn walker_after_commit_confirmation_offers_three_children() {
    let plan = built_and_signed(5, 200_000_000);
    let funding = plan.funding_tx().expect("funding exists");
    let commit = plan.child_transactions(funding)[0];

    let rpc = MockRpc::builder()
        .with_confirmed(plan.txid(funding).expect("funding txid"))
        .with_confirmed(plan.txid(commit).expect("commit txid"))
        .build();

    let state = current_confirmed_transaction(&plan, &rpc)
        .await
        .expect("walk succeeds");
    assert_eq!(state.current, commit);

    let names: Vec<_> = state
        .next
        .iter()
        .map(|tx| plan.tx(*tx).name.as_str())
        .collect();
    assert_eq!(
        names,
        vec![
            "push-to-cold-storage",
            "Vault stipend start transaction.",
            "Vault transaction: spend one shard, re-vault the remaining shards",
        ]
    );
}

#[tokio::test]
async fn broadcasting_outside_the_next_set_is_refused() {
    let plan = built_and_signed(5, 200_000_000);
    let funding = plan.funding_tx().expect("funding exists");
    let commit = plan.child_transactions(funding)[0];

    let rpc = MockRpc::builder()
        .with_confirmed(plan.txid(funding).expect("funding txid"))
        .with_confirmed(plan.txid(commit).expect("commit txid"))
        .build();

    // A burn transaction is deep in the tree, never a legal next step here.
    let burn_uuid = plan
        .transactions()
        .find(|(_, tx)| tx.name == "Burn some UTXO")
        .map(|(_, tx)| tx.internal_id)
        .expect("tree has burn transactions");

    let err = broadcast_next_transaction(&plan, &rpc, &burn_uuid)
        .await
        .expect_err("burn is not in the next set");
    assert!(matches!(err, VaultError::InvalidNextStep(id) if id == burn_uuid));
    assert!(rpc.broadcasts().is_empty(), "nothing may reach the network");
}

#[tokio::test]
async fn broadcasting_a_legal_next_step_sends_the_serialized_bytes() {
    let plan = built_and_signed(2, 100_000);
    let funding = plan.funding_tx().expect("funding exists");
    let commit = plan.child_transactions(funding)[0];

    let rpc = MockRpc::builder()
        .with_confirmed(plan.txid(funding).expect("funding txid"))
        .build();

    let commit_uuid = plan.tx(commit).internal_id;
    let txid = broadcast_next_transaction(&plan, &rpc, &commit_uuid)
        .await
        .expect("commit is the next step");
    assert_eq!(Some(txid), plan.txid(commit));

    let broadcasts = rpc.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    let expected = bitcoin::consensus::serialize(
        plan.tx(commit)
            .bitcoin_transaction
            .as_ref()
            .expect("commit is finalized"),
    );
    assert_eq!(broadcasts[0], expected);
}

// ==============================================================================
// CTV Back-end
// ==============================================================================

#[test]
fn ctv_round_trip_three_shards() {
    let params = test_parameters(3);
    let (mut plan, funding_output) = funding_plan(Amount::from_sat(300_000));
    setup_vault(&mut plan, funding_output, &params).expect("vault builds");
    sign_tree(&mut plan, &params).expect("tree signs");
    bake_tree(&mut plan, &params).expect("tree bakes");

    for (_, output) in plan.outputs() {
        let Some(redeem) = &output.ctv_redeem_script else {
            continue;
        };

        // scriptPubKey = OP_0 || sha256(redeem).
        let spk = output
            .ctv_script_pubkey
            .as_ref()
            .expect("baked output has a scriptPubKey");
        assert_eq!(*spk, bitcoin::ScriptBuf::new_p2wsh(&redeem.wscript_hash()));

        let has_extra_branch = matches!(
            output.template,
            TemplateKind::ColdStorage | TemplateKind::Shard
        );

        for child in &output.child_transactions {
            // Each child's standard template hash appears as a 32-byte
            // push inside the parent's redeem script.
            let child_tx = plan
                .tx(*child)
                .ctv_transaction
                .as_ref()
                .expect("children are baked");
            let hash = standard_template_hash(child_tx, 0);
            let pushed = redeem.instructions().filter_map(|i| i.ok()).any(|i| {
                matches!(
                    i,
                    bitcoin::script::Instruction::PushBytes(p) if p.as_bytes() == hash
                )
            });
            assert!(pushed, "child template hash must be committed to");

            // The CTV witness is [index, branch selector when present,
            // redeem script].
            let input_handle = plan
                .tx(*child)
                .inputs
                .iter()
                .copied()
                .find(|candidate| {
                    plan.output(plan.input(*candidate).utxo).internal_id == output.internal_id
                })
                .expect("child spends the output");
            let witness = plan
                .input(input_handle)
                .ctv_witness
                .as_ref()
                .expect("child input carries a CTV witness");
            let expected_len = if has_extra_branch { 3 } else { 2 };
            assert_eq!(witness.len(), expected_len);
            assert_eq!(
                witness.last().expect("witness is non-empty"),
                redeem.as_bytes()
            );
            if has_extra_branch {
                assert_eq!(witness.nth(1).expect("selector element"), &[0x00]);
            }
        }
    }

    // The CTV transactions land in the store next to the pre-signed ones.
    let path = temp_store();
    persist::save(&plan, &path).expect("tree saves");
    let raw = std::fs::read_to_string(&path).expect("store reads");
    assert!(raw.contains("ctv_bitcoin_transaction"));
    let _ = std::fs::remove_dir_all(path.parent().expect("store has a parent"));
}

// ==============================================================================
// Timelock Enforcement
// ==============================================================================

#[test]
fn shard_timelock_rides_in_nsequence_and_script() {
    let params = test_parameters(2);
    let mut plan = VaultPlan::new();
    let source = plan.add_transaction("source", false);
    let shard = plan.add_output(
        source,
        "shard fragment UTXO",
        TemplateKind::Shard,
        Amount::from_sat(50_000),
        28,
    );

    let spender = plan.add_transaction("hot wallet spend", false);
    let input = plan
        .add_input(spender, shard, WitnessSelector::HotWallet)
        .expect("144 × 28 = 4032 is inside the ceiling");
    assert_eq!(plan.input(input).relative_timelock, Some(4032));

    // The script's CSV operand decodes back to the same value.
    let text = covault_core::script::expand_template(TemplateKind::Shard, &params, 28)
        .expect("template expands");
    let redeem = covault_core::script::assemble(&text).expect("script assembles");
    let mut previous_push: Option<Vec<u8>> = None;
    let mut csv_operand = None;
    for instruction in redeem.instructions() {
        match instruction.expect("script parses") {
            bitcoin::script::Instruction::PushBytes(bytes) => {
                previous_push = Some(bytes.as_bytes().to_vec())
            }
            bitcoin::script::Instruction::Op(op)
                if op == bitcoin::opcodes::all::OP_CSV =>
            {
                csv_operand = previous_push.clone();
            }
            bitcoin::script::Instruction::Op(_) => {}
        }
    }
    let operand = csv_operand.expect("script contains OP_CSV");
    assert_eq!(covault_core::script::scriptnum_decode(&operand), 4032);
}

#[test]
fn timelock_past_the_ceiling_is_rejected() {
    let mut plan = VaultPlan::new();
    let source = plan.add_transaction("source", false);
    // 144 × 29 = 4176 > 0xFFF.
    let shard = plan.add_output(
        source,
        "shard fragment UTXO",
        TemplateKind::Shard,
        Amount::from_sat(50_000),
        29,
    );
    let spender = plan.add_transaction("hot wallet spend", false);
    let err = plan
        .add_input(spender, shard, WitnessSelector::HotWallet)
        .expect_err("timelock exceeds the ceiling");
    assert!(matches!(err, VaultError::TimelockOverflow { .. }));
}
