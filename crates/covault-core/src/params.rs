//! The typed parameter bag.
//!
//! Everything the planner, parameterizer, and signing passes need: the user
//! key, the two ephemeral keys slated for deletion, the cold and hot wallet
//! keys, the provably-unknowable burn key, the shard count, and feature
//! flags. The string-keyed lookup (`placeholder_value`) is what the script
//! parameterizer consumes; the struct itself keeps the fields typed.

use std::str::FromStr;

use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::rand;
use bitcoin::{Amount, CompressedPublicKey, Network, NetworkKind, PrivateKey, WPubkeyHash};

use crate::error::VaultError;
use crate::templates::required_parameters;

/// Public key with the prefix byte of the secp256k1 generator point; nobody
/// can produce a signature for it, which is what makes burn outputs final.
const UNSPENDABLE_PUBKEY: &str =
    "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

// ==============================================================================
// Keys
// ==============================================================================

/// A keypair held by the vault. The secret half is optional so that
/// ephemeral keys can be discarded after the signing pass while the public
/// half stays available for script reconstruction.
#[derive(Debug, Clone)]
pub struct VaultKey {
    pub public_key: CompressedPublicKey,
    secret: Option<PrivateKey>,
}

impl VaultKey {
    /// Parse a WIF-encoded private key.
    pub fn from_wif(wif: &str) -> Result<Self, VaultError> {
        let secp = Secp256k1::new();
        let private_key = PrivateKey::from_wif(wif)
            .map_err(|e| VaultError::InvalidPrivateKey(e.to_string()))?;
        let public_key = CompressedPublicKey::from_private_key(&secp, &private_key)
            .map_err(|e| VaultError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self {
            public_key,
            secret: Some(private_key),
        })
    }

    /// Wrap an existing private key.
    pub fn from_private_key(private_key: PrivateKey) -> Result<Self, VaultError> {
        let secp = Secp256k1::new();
        let public_key = CompressedPublicKey::from_private_key(&secp, &private_key)
            .map_err(|e| VaultError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self {
            public_key,
            secret: Some(private_key),
        })
    }

    /// Generate a fresh random keypair.
    pub fn random(network: NetworkKind) -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut rand::thread_rng());
        Self {
            public_key: CompressedPublicKey(public_key),
            secret: Some(PrivateKey::new(secret_key, network)),
        }
    }

    /// A key the vault can build scripts for but never sign with.
    pub fn watch_only(public_key: CompressedPublicKey) -> Self {
        Self {
            public_key,
            secret: None,
        }
    }

    pub fn secret(&self) -> Option<&PrivateKey> {
        self.secret.as_ref()
    }

    /// Drop the secret half. Secure erasure of any other copies is the
    /// host's responsibility.
    pub fn discard_secret(&mut self) {
        self.secret = None;
    }
}

// ==============================================================================
// Parameter Bag
// ==============================================================================

/// What a placeholder in a script template resolves to.
#[derive(Debug, Clone, Copy)]
pub enum PlaceholderValue {
    /// A compressed public key, substituted as 33 hex-encoded bytes.
    Key(CompressedPublicKey),
    /// A hash160, substituted as 20 hex-encoded bytes.
    Hash(WPubkeyHash),
}

/// The full parameter record for one vault.
#[derive(Debug, Clone)]
pub struct VaultParameters {
    pub network: Network,
    pub num_shards: u32,
    pub amount: Amount,
    pub user_key: VaultKey,
    pub ephemeral_key_1: VaultKey,
    pub ephemeral_key_2: VaultKey,
    pub cold_key_1: VaultKey,
    pub cold_key_2: VaultKey,
    pub hot_wallet_key: VaultKey,
    pub unspendable_key_1: CompressedPublicKey,
    pub enable_burn_transactions: bool,
    pub enable_sweep_transactions: bool,
}

impl VaultParameters {
    /// Build the parameter record the way the prototype does: one WIF key
    /// reused for every role. A production deployment would source each key
    /// from its own device.
    pub fn from_single_wif(
        wif: &str,
        network: Network,
        num_shards: u32,
        amount: Amount,
    ) -> Result<Self, VaultError> {
        let key = VaultKey::from_wif(wif)?;
        let unspendable_key_1 = CompressedPublicKey::from_str(UNSPENDABLE_PUBKEY)
            .map_err(|e| VaultError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self {
            network,
            num_shards,
            amount,
            user_key: key.clone(),
            ephemeral_key_1: key.clone(),
            ephemeral_key_2: key.clone(),
            cold_key_1: key.clone(),
            cold_key_2: key.clone(),
            hot_wallet_key: key,
            unspendable_key_1,
            enable_burn_transactions: true,
            enable_sweep_transactions: false,
        })
    }

    /// hash160 of the user public key, as used in the P2WPKH funding coin.
    pub fn user_key_hash(&self) -> WPubkeyHash {
        self.user_key.public_key.wpubkey_hash()
    }

    /// Resolve a key placeholder name (as used in witness template maps)
    /// to the key that signs for it.
    pub fn key_for_placeholder(&self, name: &str) -> Option<&VaultKey> {
        match name {
            "user_key" => Some(&self.user_key),
            "ephemeral_key_1" => Some(&self.ephemeral_key_1),
            "ephemeral_key_2" => Some(&self.ephemeral_key_2),
            "cold_key1" => Some(&self.cold_key_1),
            "cold_key2" => Some(&self.cold_key_2),
            "hot_wallet_key" => Some(&self.hot_wallet_key),
            _ => None,
        }
    }

    /// Resolve a script placeholder name to its substitution value.
    pub fn placeholder_value(&self, name: &str) -> Option<PlaceholderValue> {
        match name {
            "user_key_hash160" => Some(PlaceholderValue::Hash(self.user_key_hash())),
            "unspendable_key_1" => Some(PlaceholderValue::Key(self.unspendable_key_1)),
            other => self
                .key_for_placeholder(other)
                .map(|key| PlaceholderValue::Key(key.public_key)),
        }
    }

    /// Consistency check against the template catalogue: every placeholder
    /// any template can ask for must resolve here.
    pub fn check_required(&self) -> Result<(), VaultError> {
        for name in required_parameters() {
            if self.placeholder_value(name).is_none() {
                return Err(VaultError::MissingParameter(name.to_string()));
            }
        }
        Ok(())
    }

    /// The trusted-key-deletion hook: drop both ephemeral secrets once the
    /// signing pass is done. After this, no further transactions can be
    /// signed on the pre-signed branches.
    pub fn discard_ephemeral_keys(&mut self) {
        self.ephemeral_key_1.discard_secret();
        self.ephemeral_key_2.discard_secret();
    }
}
