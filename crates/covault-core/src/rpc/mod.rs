//! Bitcoin Core RPC abstraction layer.
//!
//! Defines the [`VaultRpc`] trait covering the handful of node calls the
//! vault needs, and provides an HTTP JSON-RPC implementation
//! ([`HttpRpcClient`]) plus a canned-data mock ([`mock::MockRpc`]).

mod http_adapter;
pub mod mock;

pub use http_adapter::{HttpRpcClient, RpcAuth};

use async_trait::async_trait;
use bitcoin::{Address, Amount, BlockHash, Txid};
use serde::Deserialize;

use crate::error::VaultError;

// ==============================================================================
// RPC Types
// ==============================================================================

/// Basic chain information from `getblockchaininfo`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainInfo {
    pub chain: String,
    pub blocks: u64,
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: BlockHash,
    pub pruned: bool,
}

/// One coin from `listunspent`.
#[derive(Debug, Clone)]
pub struct UnspentOutput {
    pub txid: Txid,
    pub vout: u32,
    pub amount: Amount,
    pub confirmations: u64,
}

/// The slice of a verbose `getrawtransaction` result the vault cares
/// about: whether the transaction is confirmed, and its raw bytes.
#[derive(Debug, Clone)]
pub struct RawTransactionInfo {
    pub txid: Txid,
    pub confirmations: u64,
    pub hex: String,
}

// ==============================================================================
// Trait
// ==============================================================================

/// Minimal trait covering the Bitcoin Core RPC methods the vault consumes.
///
/// Implementations are expected to handle authentication, connection
/// management, and response deserialization internally. All operations are
/// idempotent on the node side; broadcast idempotence in particular is the
/// node's concern.
#[async_trait]
pub trait VaultRpc: Send + Sync {
    /// Fetch basic chain info (network, block count, pruning status).
    async fn get_blockchain_info(&self) -> Result<ChainInfo, VaultError>;

    /// Import a WIF private key into the node wallet.
    async fn import_private_key(&self, wif: &str, label: &str) -> Result<(), VaultError>;

    /// Send coins from the node wallet to an address.
    async fn send_to_address(&self, address: &Address, amount: Amount)
        -> Result<Txid, VaultError>;

    /// Mine `block_count` blocks paying out to `address` (regtest only).
    async fn generate_to_address(
        &self,
        block_count: u64,
        address: &Address,
    ) -> Result<(), VaultError>;

    /// List wallet coins on `address` with at least `minimum_amount`.
    async fn list_unspent(
        &self,
        min_conf: u32,
        max_conf: u32,
        address: &Address,
        include_unsafe: bool,
        minimum_amount: Amount,
    ) -> Result<Vec<UnspentOutput>, VaultError>;

    /// Fetch a transaction with its confirmation count. Returns `None`
    /// when the node does not know the transaction; the state walker
    /// treats that as "not confirmed".
    async fn get_raw_transaction(
        &self,
        txid: &Txid,
    ) -> Result<Option<RawTransactionInfo>, VaultError>;

    /// Broadcast serialized transaction bytes; returns the txid.
    async fn send_raw_transaction(&self, raw_tx: &[u8]) -> Result<Txid, VaultError>;
}
