//! The status command: where is the vault, and what can happen next.

use std::path::Path;

use covault_core::persist::{self, TRANSACTION_STORE_FILENAME};
use covault_core::rpc::VaultRpc;
use covault_core::state::current_confirmed_transaction;
use covault_core::{TxHandle, VaultPlan};

pub async fn get_status(rpc: &dyn VaultRpc, dir: &Path) -> eyre::Result<String> {
    let plan = persist::load(&dir.join(TRANSACTION_STORE_FILENAME))?;
    let state = current_confirmed_transaction(&plan, rpc).await?;

    let mut output = String::from("\nLatest transaction:\n");
    output.push_str(&render_transaction(&plan, state.current, 1));

    output.push_str("\nPossible transactions:\n\n");
    for next in &state.next {
        output.push_str(&render_transaction(&plan, *next, 1));
        output.push('\n');
    }

    output.push_str("\nTo broadcast the next transaction, run:\n\tcovault broadcast <internal_id>\n");
    Ok(output)
}

fn render_transaction(plan: &VaultPlan, handle: TxHandle, depth: usize) -> String {
    let prefix = "\t".repeat(depth);
    let tx = plan.tx(handle);

    let mut text = format!("{prefix}Transaction:\n");
    text.push_str(&format!("{prefix}\tname: {}\n", tx.name));
    text.push_str(&format!("{prefix}\tinternal id: {}\n", tx.internal_id));
    if let Some(txid) = plan.txid(handle) {
        text.push_str(&format!("{prefix}\ttxid: {txid}\n"));
    }
    text.push_str(&format!("{prefix}\tnum inputs: {}\n", tx.inputs.len()));
    text.push_str(&format!("{prefix}\tnum outputs: {}\n", tx.outputs.len()));

    text.push_str(&format!("\n{prefix}\tOutputs:\n"));
    for output_handle in &tx.outputs {
        let output = plan.output(*output_handle);
        text.push_str(&format!("{prefix}\t\tOutput:\n"));
        text.push_str(&format!("{prefix}\t\t\tname: {}\n", output.name));
        text.push_str(&format!(
            "{prefix}\t\t\tinternal id: {}\n",
            output.internal_id
        ));
    }
    text
}
