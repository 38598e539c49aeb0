//! Error types for covault-core.

use uuid::Uuid;

// ==============================================================================
// RPC Errors
// ==============================================================================

/// Structured errors from the Bitcoin Core JSON-RPC layer.
///
/// Each variant captures a specific failure mode rather than collapsing
/// everything into a single `String`, which makes programmatic error
/// handling (e.g. retries on transport errors vs. logic errors) possible.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("HTTP transport: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("JSON-RPC error: code={code}, message={message}")]
    ServerError { code: i64, message: String },

    #[error("invalid JSON-RPC response: {0}")]
    InvalidResponse(String),

    #[error("rpc configuration: {0}")]
    Config(String),
}

// ==============================================================================
// Vault Errors
// ==============================================================================

/// Top-level error type for the covault-core crate.
///
/// One variant per failure class the engine surfaces distinctly: parameter
/// problems at build time, plan-shape violations from the safety checker,
/// script and witness finalization faults, and navigation errors when the
/// on-chain state disagrees with the stored plan.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("output {utxo} has no witness template `{selector}`")]
    InvalidWitnessSelection { utxo: Uuid, selector: String },

    #[error("script not fully parameterized: {0}")]
    UnresolvedPlaceholder(String),

    #[error("relative timelock {value} exceeds maximum {max}")]
    TimelockOverflow { value: u64, max: u64 },

    #[error("connected node is on chain `{0}`, expected `regtest`")]
    WrongChain(String),

    #[error("transaction {0} is not a valid next step")]
    InvalidNextStep(Uuid),

    #[error("state corruption: {0}")]
    StateCorruption(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("persistence encoding: {0}")]
    Json(#[from] serde_json::Error),
}
