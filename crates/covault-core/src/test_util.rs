//! Shared test helpers for `covault-core` unit tests.
//!
//! Consolidates deterministic key and parameter construction plus the
//! funding-plan scaffold, so tests across modules share a single source
//! of truth for dummy data.

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Address, Amount, Network, NetworkKind, PrivateKey, Txid};

use crate::params::{VaultKey, VaultParameters};
use crate::plan::{OutputHandle, VaultPlan};
use crate::templates::TemplateKind;

/// Create a deterministic `Txid` from a single distinguishing byte.
pub fn dummy_txid(b: u8) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    Txid::from_byte_array(bytes)
}

/// Deterministic keypair derived from a single byte, so repeated test
/// runs (and repeated calls within one test) agree on key material.
pub fn key_from_byte(b: u8) -> VaultKey {
    let secret = SecretKey::from_slice(&[b; 32]).expect("constant bytes form a valid secret key");
    let private_key = PrivateKey::new(secret, NetworkKind::Test);
    VaultKey::from_private_key(private_key).expect("generated keys are compressed")
}

/// A full parameter record with distinct deterministic keys per role.
pub fn test_parameters(num_shards: u32) -> VaultParameters {
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

/// A fresh plan holding just the funding transaction and its coin.
pub fn funding_plan(amount: Amount) -> (VaultPlan, OutputHandle) {
    let mut plan = VaultPlan::new();
    let funding = plan.add_funding_transaction(dummy_txid(0xfd));
    let coin = plan.add_output(funding, "segwit input coin", TemplateKind::User, amount, 1);
    plan.set_vout_override(coin, 0);
    (plan, coin)
}

/// An arbitrary regtest address for RPC calls that need one.
pub fn dummy_address() -> Address {
    Address::p2wpkh(&key_from_byte(9).public_key, Network::Regtest)
}
