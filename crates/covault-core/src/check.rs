//! Safety checks over a planned transaction tree.
//!
//! Run after planning and before any signing pass: a violation here means
//! the planner produced a tree that could strand or destroy funds.

use crate::error::VaultError;
use crate::plan::VaultPlan;

/// Output names that legitimately have no spending transaction planned.
const TERMINAL_OUTPUT_NAMES: [&str; 2] = ["CPFP hook", "burned UTXO"];

/// Verify the tree invariants: every transaction has outputs, every
/// non-funding transaction conserves its input amount exactly, and every
/// output that isn't terminal has at least one planned spender.
pub fn safety_check(plan: &VaultPlan) -> Result<(), VaultError> {
    let mut checked = 0usize;

    for (handle, tx) in plan.transactions() {
        checked += 1;

        if tx.outputs.is_empty() {
            return Err(VaultError::InvalidPlan(format!(
                "transaction {} has no outputs",
                tx.internal_id
            )));
        }

        // The funding node is exempt: its input side belongs to the user's
        // wallet and is invisible to the plan.
        let input_total = plan.input_amount_sum(handle);
        let output_total = plan.output_amount_sum(handle);
        if tx.id != -1 && input_total != output_total {
            return Err(VaultError::InvalidPlan(format!(
                "transaction {} takes {} and spends {}, not equal",
                tx.internal_id,
                input_total.to_sat(),
                output_total.to_sat()
            )));
        }

        for output_handle in &tx.outputs {
            let output = plan.output(*output_handle);
            if TERMINAL_OUTPUT_NAMES.contains(&output.name.as_str()) {
                continue;
            }
            if output.child_transactions.is_empty() {
                return Err(VaultError::InvalidPlan(format!(
                    "output {} has no child transactions",
                    output.internal_id
                )));
            }
        }
    }

    if checked == 0 {
        return Err(VaultError::InvalidPlan(
            "plan contains no transactions".to_string(),
        ));
    }

    Ok(())
}
