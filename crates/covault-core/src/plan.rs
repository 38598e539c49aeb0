//! The planned-transaction-tree model.
//!
//! A vault is a tree of transactions that exist before they are ever
//! broadcast. Outputs link forward to the transactions that could spend
//! them, inputs link back to the outputs they consume, and transactions own
//! both — which in a naive representation is a web of cyclic references.
//! Instead, a [`VaultPlan`] arena owns every node and all cross-links are
//! index handles. Serialization walks by handle; deserialization rebuilds
//! nodes first and resolves stored uuids in a second pass.

use std::collections::HashSet;

use bitcoin::{Address, Amount, ScriptBuf, Transaction, Txid, Witness};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::VaultError;
use crate::templates::{TemplateKind, WitnessSelector};

/// Relative timelocks ride in the 16-bit field of nSequence, but the
/// planner caps them well below that: a delay past this ceiling means a
/// misconfigured shard count, not a real spending policy.
pub const MAX_RELATIVE_TIMELOCK: u64 = 0xFFF;

// ==============================================================================
// Handles
// ==============================================================================

/// Index of a transaction node in its [`VaultPlan`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxHandle(pub(crate) usize);

/// Index of an output node in its [`VaultPlan`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputHandle(pub(crate) usize);

/// Index of an input node in its [`VaultPlan`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputHandle(pub(crate) usize);

// ==============================================================================
// Nodes
// ==============================================================================

/// Distinguishes the synthetic funding node from planner-built nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxKind {
    /// Stand-in for the on-chain transaction the user's wallet produced.
    /// Only its txid and one output matter; the planner never builds it.
    Funding { txid: Txid },
    Planned,
}

/// A planned transaction: an ordered list of inputs and outputs, plus the
/// concrete bitcoin transaction once a signing pass has run.
#[derive(Debug, Clone)]
pub struct PlannedTx {
    pub id: i64,
    pub internal_id: Uuid,
    pub name: String,
    pub kind: TxKind,
    pub inputs: Vec<InputHandle>,
    pub outputs: Vec<OutputHandle>,
    /// Populated by the pre-sign engine; the txid is stable from then on.
    pub bitcoin_transaction: Option<Transaction>,
    pub is_finalized: bool,
    /// Populated by the CTV engine.
    pub ctv_transaction: Option<Transaction>,
    pub ctv_baked: bool,
}

/// A planned output and its place in the tree: the transaction that creates
/// it and the set of pre-planned transactions that could spend it.
#[derive(Debug, Clone)]
pub struct PlannedOutput {
    pub id: i64,
    pub internal_id: Uuid,
    pub name: String,
    pub transaction: TxHandle,
    pub template: TemplateKind,
    pub amount: Amount,
    pub timelock_multiplier: u32,
    pub child_transactions: Vec<TxHandle>,
    /// Only the funding coin carries this: its vout was decided by the
    /// user's wallet, not by position in a planned output list.
    pub vout_override: Option<u32>,
    // Derived during finalization.
    pub script_pubkey: Option<ScriptBuf>,
    pub redeem_script: Option<ScriptBuf>,
    pub address: Option<Address>,
    pub is_finalized: bool,
    // Derived by the CTV engine.
    pub ctv_redeem_script: Option<ScriptBuf>,
    pub ctv_script_pubkey: Option<ScriptBuf>,
}

/// A planned input: which output it consumes and which of that output's
/// witness templates it will satisfy.
#[derive(Debug, Clone)]
pub struct PlannedInput {
    pub internal_id: Uuid,
    pub transaction: TxHandle,
    pub utxo: OutputHandle,
    pub witness_template_selection: WitnessSelector,
    /// `base × timelock_multiplier` when the selector activates a timelock;
    /// absent otherwise. Mirrored into the input's nSequence at sign time.
    pub relative_timelock: Option<u16>,
    pub is_finalized: bool,
    /// Witness stack computed by the CTV engine for this input.
    pub ctv_witness: Option<Witness>,
}

// ==============================================================================
// Arena
// ==============================================================================

/// Arena owning every node of one planned transaction tree.
///
/// Transaction and output ids are handed out by per-plan counters, so
/// within one vault insertion order equals id order; the signing pass
/// relies on this to process parents before children.
#[derive(Debug, Clone, Default)]
pub struct VaultPlan {
    transactions: Vec<PlannedTx>,
    outputs: Vec<PlannedOutput>,
    inputs: Vec<PlannedInput>,
    next_tx_id: i64,
    next_output_id: i64,
    funding_tx: Option<TxHandle>,
}

impl VaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    // --------------------------------------------------------------------------
    // Construction
    // --------------------------------------------------------------------------

    /// Register the synthetic funding transaction (id -1). It is already
    /// finalized: the user's wallet produced it and we only know its txid.
    pub fn add_funding_transaction(&mut self, txid: Txid) -> TxHandle {
        let handle = TxHandle(self.transactions.len());
        self.transactions.push(PlannedTx {
            id: -1,
            internal_id: Uuid::new_v4(),
            name: "initial transaction (from user)".to_string(),
            kind: TxKind::Funding { txid },
            inputs: Vec::new(),
            outputs: Vec::new(),
            bitcoin_transaction: None,
            is_finalized: true,
            ctv_transaction: None,
            ctv_baked: false,
        });
        self.funding_tx = Some(handle);
        handle
    }

    /// Create a planned transaction. Unless disabled, a zero-value
    /// anyone-can-spend CPFP hook output is prepended so fees can be bumped
    /// by a child after the fact.
    pub fn add_transaction(&mut self, name: &str, enable_cpfp_hook: bool) -> TxHandle {
        let handle = TxHandle(self.transactions.len());
        let id = self.next_tx_id;
        self.next_tx_id += 1;
        self.transactions.push(PlannedTx {
            id,
            internal_id: Uuid::new_v4(),
            name: name.to_string(),
            kind: TxKind::Planned,
            inputs: Vec::new(),
            outputs: Vec::new(),
            bitcoin_transaction: None,
            is_finalized: false,
            ctv_transaction: None,
            ctv_baked: false,
        });
        if enable_cpfp_hook {
            self.add_output(handle, "CPFP hook", TemplateKind::CpfpHook, Amount::ZERO, 1);
        }
        handle
    }

    /// Append an output to `transaction`.
    pub fn add_output(
        &mut self,
        transaction: TxHandle,
        name: &str,
        template: TemplateKind,
        amount: Amount,
        timelock_multiplier: u32,
    ) -> OutputHandle {
        let handle = OutputHandle(self.outputs.len());
        let id = self.next_output_id;
        self.next_output_id += 1;
        self.outputs.push(PlannedOutput {
            id,
            internal_id: Uuid::new_v4(),
            name: name.to_string(),
            transaction,
            template,
            amount,
            timelock_multiplier,
            child_transactions: Vec::new(),
            vout_override: None,
            script_pubkey: None,
            redeem_script: None,
            address: None,
            is_finalized: false,
            ctv_redeem_script: None,
            ctv_script_pubkey: None,
        });
        self.transactions[transaction.0].outputs.push(handle);
        handle
    }

    /// Append an input to `transaction`, consuming `utxo` via `selector`.
    ///
    /// Rejects selectors the output's template has no witness template for,
    /// and derives the relative timelock (base × multiplier) when the
    /// selector activates one, enforcing the timelock ceiling.
    pub fn add_input(
        &mut self,
        transaction: TxHandle,
        utxo: OutputHandle,
        selector: WitnessSelector,
    ) -> Result<InputHandle, VaultError> {
        let output = &self.outputs[utxo.0];
        let template = output.template.template();
        if template.witness_template(selector).is_none() {
            return Err(VaultError::InvalidWitnessSelection {
                utxo: output.internal_id,
                selector: selector.label().to_string(),
            });
        }

        let relative_timelock = match template
            .relative_timelocks
            .as_ref()
            .and_then(|t| t.base_for(selector))
        {
            None => None,
            Some(base) => {
                let value = base * u64::from(output.timelock_multiplier);
                if value > MAX_RELATIVE_TIMELOCK {
                    return Err(VaultError::TimelockOverflow {
                        value,
                        max: MAX_RELATIVE_TIMELOCK,
                    });
                }
                Some(value as u16)
            }
        };

        let handle = InputHandle(self.inputs.len());
        self.inputs.push(PlannedInput {
            internal_id: Uuid::new_v4(),
            transaction,
            utxo,
            witness_template_selection: selector,
            relative_timelock,
            is_finalized: false,
            ctv_witness: None,
        });
        self.transactions[transaction.0].inputs.push(handle);
        Ok(handle)
    }

    /// Record that `child` is one of the transactions able to spend `output`.
    pub fn add_child(&mut self, output: OutputHandle, child: TxHandle) {
        self.outputs[output.0].child_transactions.push(child);
    }

    pub fn set_vout_override(&mut self, output: OutputHandle, vout: u32) {
        self.outputs[output.0].vout_override = Some(vout);
    }

    // Raw insertion for the persistence layer's two-phase reconnect.

    pub(crate) fn push_transaction(&mut self, tx: PlannedTx) -> TxHandle {
        let handle = TxHandle(self.transactions.len());
        if tx.id == -1 {
            self.funding_tx = Some(handle);
        }
        self.next_tx_id = self.next_tx_id.max(tx.id + 1);
        self.transactions.push(tx);
        handle
    }

    pub(crate) fn push_output(&mut self, output: PlannedOutput) -> OutputHandle {
        let handle = OutputHandle(self.outputs.len());
        self.next_output_id = self.next_output_id.max(output.id + 1);
        self.outputs.push(output);
        handle
    }

    pub(crate) fn push_input(&mut self, input: PlannedInput) -> InputHandle {
        let handle = InputHandle(self.inputs.len());
        self.inputs.push(input);
        handle
    }

    // --------------------------------------------------------------------------
    // Access
    // --------------------------------------------------------------------------

    pub fn tx(&self, handle: TxHandle) -> &PlannedTx {
        &self.transactions[handle.0]
    }

    pub fn tx_mut(&mut self, handle: TxHandle) -> &mut PlannedTx {
        &mut self.transactions[handle.0]
    }

    pub fn output(&self, handle: OutputHandle) -> &PlannedOutput {
        &self.outputs[handle.0]
    }

    pub fn output_mut(&mut self, handle: OutputHandle) -> &mut PlannedOutput {
        &mut self.outputs[handle.0]
    }

    pub fn input(&self, handle: InputHandle) -> &PlannedInput {
        &self.inputs[handle.0]
    }

    pub fn input_mut(&mut self, handle: InputHandle) -> &mut PlannedInput {
        &mut self.inputs[handle.0]
    }

    /// The synthetic funding transaction (id -1).
    pub fn funding_tx(&self) -> Result<TxHandle, VaultError> {
        self.funding_tx.ok_or_else(|| {
            VaultError::StateCorruption("plan has no funding transaction".to_string())
        })
    }

    /// The funding coin: the single output of the funding transaction.
    pub fn funding_output(&self) -> Result<OutputHandle, VaultError> {
        let funding = self.funding_tx()?;
        self.tx(funding).outputs.first().copied().ok_or_else(|| {
            VaultError::StateCorruption("funding transaction has no output".to_string())
        })
    }

    /// Transactions in insertion order, which equals ascending id order.
    pub fn transactions(&self) -> impl Iterator<Item = (TxHandle, &PlannedTx)> {
        self.transactions
            .iter()
            .enumerate()
            .map(|(i, tx)| (TxHandle(i), tx))
    }

    pub fn outputs(&self) -> impl Iterator<Item = (OutputHandle, &PlannedOutput)> {
        self.outputs
            .iter()
            .enumerate()
            .map(|(i, out)| (OutputHandle(i), out))
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    // --------------------------------------------------------------------------
    // Derived views
    // --------------------------------------------------------------------------

    /// The output's index in its transaction's output list, unless the
    /// funding wallet chose it for us.
    pub fn vout(&self, handle: OutputHandle) -> u32 {
        let output = &self.outputs[handle.0];
        if let Some(vout) = output.vout_override {
            return vout;
        }
        let tx = &self.transactions[output.transaction.0];
        tx.outputs
            .iter()
            .position(|o| *o == handle)
            .expect("output is listed by its owning transaction") as u32
    }

    /// The txid of a transaction: known up front for the funding node,
    /// derived from the finalized serialization otherwise.
    pub fn txid(&self, handle: TxHandle) -> Option<Txid> {
        let tx = &self.transactions[handle.0];
        match &tx.kind {
            TxKind::Funding { txid } => Some(*txid),
            TxKind::Planned => tx
                .bitcoin_transaction
                .as_ref()
                .map(|btx| btx.compute_txid()),
        }
    }

    /// Transactions that produced the outputs this transaction consumes.
    pub fn parent_transactions(&self, handle: TxHandle) -> Vec<TxHandle> {
        self.transactions[handle.0]
            .inputs
            .iter()
            .map(|input| self.outputs[self.inputs[input.0].utxo.0].transaction)
            .collect()
    }

    /// Union of the child lists across this transaction's outputs.
    pub fn child_transactions(&self, handle: TxHandle) -> Vec<TxHandle> {
        let mut seen = HashSet::new();
        let mut children = Vec::new();
        for output in &self.transactions[handle.0].outputs {
            for child in &self.outputs[output.0].child_transactions {
                if seen.insert(*child) {
                    children.push(*child);
                }
            }
        }
        children
    }

    pub fn input_amount_sum(&self, handle: TxHandle) -> Amount {
        self.transactions[handle.0]
            .inputs
            .iter()
            .map(|input| self.outputs[self.inputs[input.0].utxo.0].amount)
            .sum()
    }

    pub fn output_amount_sum(&self, handle: TxHandle) -> Amount {
        self.transactions[handle.0]
            .outputs
            .iter()
            .map(|output| self.outputs[output.0].amount)
            .sum()
    }

    pub fn find_tx_by_uuid(&self, internal_id: &Uuid) -> Option<TxHandle> {
        self.transactions
            .iter()
            .position(|tx| tx.internal_id == *internal_id)
            .map(TxHandle)
    }

    // --------------------------------------------------------------------------
    // Rendering
    // --------------------------------------------------------------------------

    /// Human-readable rendering of the whole tree, for debugging and the
    /// status command. Transactions reachable through more than one input
    /// are rendered once.
    pub fn render_text(&self) -> Result<String, VaultError> {
        let root = self.funding_output()?;
        let mut rendered = HashSet::new();
        Ok(self.render_output(root, 0, &mut rendered))
    }

    fn render_output(
        &self,
        handle: OutputHandle,
        depth: usize,
        rendered: &mut HashSet<Uuid>,
    ) -> String {
        let output = &self.outputs[handle.0];
        let prefix = "-".repeat(depth);
        let mut text = format!(
            "{prefix} UTXO {} amount = {}\n",
            output.name,
            output.amount.to_sat()
        );

        if output.child_transactions.is_empty() {
            text.push_str(&format!("{prefix} UTXO {} has no children.\n", output.name));
            return text;
        }

        text.push_str(&format!(
            "{prefix} UTXO {} has {} possible child transactions. They are:\n\n",
            output.name,
            output.child_transactions.len()
        ));
        for child in output.child_transactions.clone() {
            let child_tx = &self.transactions[child.0];
            text.push_str(&format!(
                "{prefix} UTXO {} -> {} (start)\n",
                output.name, child_tx.name
            ));
            text.push_str(&self.render_tx(child, depth + 1, rendered));
            text.push_str(&format!(
                "{prefix} UTXO {} -> {} (end)\n",
                output.name, child_tx.name
            ));
        }
        text.push_str(&format!("{prefix} UTXO {} (end)\n\n", output.name));
        text
    }

    fn render_tx(&self, handle: TxHandle, depth: usize, rendered: &mut HashSet<Uuid>) -> String {
        let tx = &self.transactions[handle.0];
        let prefix = "-".repeat(depth);

        if !rendered.insert(tx.internal_id) {
            return format!(
                "{prefix} Transaction {} ({}) previously rendered. (Another input)\n",
                tx.internal_id, tx.name
            );
        }

        let mut text = format!(
            "{prefix} Transaction {} ({}) has {} UTXOs. They are:\n\n",
            tx.internal_id,
            tx.name,
            tx.outputs.len()
        );
        for output in tx.outputs.clone() {
            let name = self.outputs[output.0].name.clone();
            text.push_str(&format!(
                "{prefix} Transaction ({}) - UTXO {} (start)\n",
                tx.name, name
            ));
            text.push_str(&self.render_output(output, depth + 1, rendered));
            text.push_str(&format!(
                "{prefix} Transaction ({}) - UTXO {} (end)\n",
                tx.name, name
            ));
        }
        text.push_str(&format!(
            "{prefix} Transaction {} ({}) end\n\n",
            tx.internal_id, tx.name
        ));
        text
    }
}
