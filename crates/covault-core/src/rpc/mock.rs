//! Mock [`VaultRpc`] implementation for tests.
//!
//! Uses a builder pattern (`MockRpc::builder()`) to register confirmed
//! txids, wallet coins, and chain info before the mock is consumed. The
//! mock records every broadcast so tests can assert on what went out.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{Address, Amount, BlockHash, Transaction, Txid};

use crate::error::{RpcError, VaultError};

use super::{ChainInfo, RawTransactionInfo, UnspentOutput, VaultRpc};

/// A canned-data Bitcoin RPC backend for testing.
pub struct MockRpc {
    confirmed: HashSet<Txid>,
    unspent: Vec<UnspentOutput>,
    chain_info: ChainInfo,
    broadcasts: Mutex<Vec<Vec<u8>>>,
}

impl MockRpc {
    pub fn builder() -> MockRpcBuilder {
        MockRpcBuilder {
            confirmed: HashSet::new(),
            unspent: Vec::new(),
            chain_info: ChainInfo {
                chain: "regtest".into(),
                blocks: 110,
                best_block_hash: BlockHash::all_zeros(),
                pruned: false,
            },
        }
    }

    /// Serialized transactions passed to `send_raw_transaction`, in order.
    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.broadcasts
            .lock()
            .expect("broadcast log mutex is never poisoned")
            .clone()
    }
}

/// Builder for configuring a [`MockRpc`] with canned data.
pub struct MockRpcBuilder {
    confirmed: HashSet<Txid>,
    unspent: Vec<UnspentOutput>,
    chain_info: ChainInfo,
}

impl MockRpcBuilder {
    /// Mark a txid as confirmed on the mock chain.
    pub fn with_confirmed(mut self, txid: Txid) -> Self {
        self.confirmed.insert(txid);
        self
    }

    /// Register a wallet coin returned by `list_unspent`.
    pub fn with_unspent(mut self, unspent: UnspentOutput) -> Self {
        self.unspent.push(unspent);
        self
    }

    /// Override the default chain info (regtest, 110 blocks).
    pub fn with_chain_info(mut self, info: ChainInfo) -> Self {
        self.chain_info = info;
        self
    }

    /// Consume the builder and produce a [`MockRpc`].
    pub fn build(self) -> MockRpc {
        MockRpc {
            confirmed: self.confirmed,
            unspent: self.unspent,
            chain_info: self.chain_info,
            broadcasts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl VaultRpc for MockRpc {
    async fn get_blockchain_info(&self) -> Result<ChainInfo, VaultError> {
        Ok(self.chain_info.clone())
    }

    async fn import_private_key(&self, _wif: &str, _label: &str) -> Result<(), VaultError> {
        Ok(())
    }

    async fn send_to_address(
        &self,
        _address: &Address,
        _amount: Amount,
    ) -> Result<Txid, VaultError> {
        Ok(Txid::all_zeros())
    }

    async fn generate_to_address(
        &self,
        _block_count: u64,
        _address: &Address,
    ) -> Result<(), VaultError> {
        Ok(())
    }

    async fn list_unspent(
        &self,
        _min_conf: u32,
        _max_conf: u32,
        _address: &Address,
        _include_unsafe: bool,
        minimum_amount: Amount,
    ) -> Result<Vec<UnspentOutput>, VaultError> {
        Ok(self
            .unspent
            .iter()
            .filter(|coin| coin.amount >= minimum_amount)
            .cloned()
            .collect())
    }

    async fn get_raw_transaction(
        &self,
        txid: &Txid,
    ) -> Result<Option<RawTransactionInfo>, VaultError> {
        if !self.confirmed.contains(txid) {
            return Ok(None);
        }
        Ok(Some(RawTransactionInfo {
            txid: *txid,
            confirmations: 1,
            hex: String::new(),
        }))
    }

    async fn send_raw_transaction(&self, raw_tx: &[u8]) -> Result<Txid, VaultError> {
        let transaction: Transaction = bitcoin::consensus::deserialize(raw_tx).map_err(|e| {
            VaultError::Rpc(RpcError::InvalidResponse(format!(
                "broadcast of undecodable transaction: {e}"
            )))
        })?;
        self.broadcasts
            .lock()
            .expect("broadcast log mutex is never poisoned")
            .push(raw_tx.to_vec());
        Ok(transaction.compute_txid())
    }
}
