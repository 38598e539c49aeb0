//! Vault initialization: the primary entrypoint of the prototype.
//!
//! Builds the parameter bag from one WIF key, finds a funding coin on the
//! regtest wallet (funding it first if the chain is fresh), plans the
//! whole transaction tree, checks it, signs it, saves it, deletes the
//! ephemeral keys, and finally bakes and saves the CTV variant.

use std::path::Path;

use bitcoin::{Address, Amount, Network};
use eyre::{bail, eyre};
use tracing::info;

use covault_core::check::safety_check;
use covault_core::ctv::bake_tree;
use covault_core::persist::{
    self, CTV_TRANSACTION_STORE_FILENAME, TEXT_RENDERING_FILENAME, TRANSACTION_STORE_FILENAME,
};
use covault_core::planner::setup_vault;
use covault_core::rpc::VaultRpc;
use covault_core::sign::sign_tree;
use covault_core::templates::TemplateKind;
use covault_core::{VaultParameters, VaultPlan};

/// Floor for the funding coin the vault looks for.
const DEFAULT_AMOUNT: Amount = Amount::from_sat(200_000_000);
/// Minimum chain height before coins are mature enough to use.
const SETUP_BLOCKS: u64 = 110;

pub async fn initialize(
    rpc: &dyn VaultRpc,
    dir: &Path,
    private_key: Option<&str>,
    num_shards: u32,
) -> eyre::Result<()> {
    if persist::vaultfile_exists(dir) {
        bail!("vaultfile already exists. Is this an active vault? Don't re-initialize.");
    }
    let wif = private_key.ok_or_else(|| eyre!("missing required parameter: --private-key"))?;

    let mut params =
        VaultParameters::from_single_wif(wif, Network::Regtest, num_shards, DEFAULT_AMOUNT)?;
    params.check_required()?;

    // Make the user key known to the node wallet so it tracks the coin.
    rpc.import_private_key(wif, "user").await?;
    let user_address = Address::p2wpkh(&params.user_key.public_key, params.network);

    // On a fresh regtest chain, fund the user address and mine the coins
    // to maturity.
    let chain_info = rpc.get_blockchain_info().await?;
    if chain_info.blocks < SETUP_BLOCKS {
        let _ = rpc
            .send_to_address(&user_address, Amount::from_sat(5_000_000_000))
            .await;
        rpc.generate_to_address(SETUP_BLOCKS, &user_address).await?;
    }

    let unspent = rpc
        .list_unspent(6, 9999, &user_address, true, params.amount)
        .await?;
    let coin = unspent
        .first()
        .ok_or_else(|| eyre!("can't find a good UTXO for amount {}", params.amount))?;

    // The whole coin gets consumed; the plan has no change output.
    params.amount = coin.amount;

    let mut plan = VaultPlan::new();
    let funding = plan.add_funding_transaction(coin.txid);
    let funding_output = plan.add_output(
        funding,
        "segwit input coin",
        TemplateKind::User,
        coin.amount,
        1,
    );
    plan.set_vout_override(funding_output, coin.vout);

    setup_vault(&mut plan, funding_output, &params)?;
    safety_check(&plan)?;

    // Render the tree of possible transactions for human inspection.
    std::fs::write(dir.join(TEXT_RENDERING_FILENAME), plan.render_text()?)?;
    info!(
        transactions = plan.transaction_count(),
        outputs = plan.output_count(),
        "planned transaction tree verified"
    );

    sign_tree(&mut plan, &params)?;
    persist::save(&plan, &dir.join(TRANSACTION_STORE_FILENAME))?;

    // Trusted key deletion: the ephemeral secrets leave memory here.
    // Secure erasure of other copies is the host's responsibility.
    params.discard_ephemeral_keys();

    // The CTV tree needs no signatures, so it can be produced after key
    // deletion.
    bake_tree(&mut plan, &params)?;
    persist::save(&plan, &dir.join(CTV_TRANSACTION_STORE_FILENAME))?;

    persist::write_vaultfile(dir)?;
    info!(path = %dir.display(), "vault established");
    Ok(())
}
