//! HTTP JSON-RPC adapter for Bitcoin Core.

mod auth;
mod client;

pub use auth::RpcAuth;
pub use client::HttpRpcClient;
