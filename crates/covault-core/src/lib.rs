//! Core library for **Covault** — a Bitcoin vault construction engine.
//!
//! Given a funding coin, this crate plans, parameterizes, signs, and later
//! navigates a tree of pre-signed transactions that enforce spending
//! policies without on-chain covenant opcodes; a secondary back-end emits
//! the same tree using BIP-119 `OP_CHECKTEMPLATEVERIFY` commitments. It is
//! intentionally transport-agnostic: the [`rpc::VaultRpc`] trait can be
//! backed by HTTP JSON-RPC, a mock, or any future transport.

pub mod check;
pub mod ctv;
pub mod error;
pub mod params;
pub mod persist;
pub mod plan;
pub mod planner;
pub mod rpc;
pub mod script;
pub mod sign;
pub mod state;
pub mod templates;

#[cfg(test)]
pub(crate) mod test_util;

pub use error::{RpcError, VaultError};
pub use params::{VaultKey, VaultParameters};
pub use plan::{InputHandle, OutputHandle, TxHandle, VaultPlan};
pub use state::VaultState;
