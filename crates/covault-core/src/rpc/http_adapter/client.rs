use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bitcoin::hex::DisplayHex;
use bitcoin::{Address, Amount, Txid};
use reqwest::Url;
use tracing::{debug, trace};

use crate::error::{RpcError, VaultError};
use crate::rpc::{ChainInfo, RawTransactionInfo, UnspentOutput, VaultRpc};

use super::auth::RpcAuth;

/// Bitcoin Core error code for "transaction not found".
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

/// Bitcoin Core JSON-RPC client over HTTP(S).
///
/// Stateless beyond a monotonically increasing request id; every vault
/// operation is a single RPC round trip, so there is no batching, caching,
/// or connection pooling beyond what reqwest provides.
#[derive(Debug)]
pub struct HttpRpcClient {
    client: reqwest::Client,
    url: Url,
    auth: RpcAuth,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    /// Create a client for the node at `url` (http or https).
    pub fn new(url: &str, auth: RpcAuth) -> Result<Self, VaultError> {
        let url = Url::parse(url).map_err(|e| {
            RpcError::Config(format!("node url `{url}` is not a valid URL: {e}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RpcError::Config(format!(
                "node url `{url}` must use http or https"
            ))
            .into());
        }

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .expect("reqwest client builder uses valid static config");

        Ok(Self {
            client,
            url,
            auth,
            next_id: AtomicU64::new(initial_request_id()),
        })
    }

    async fn rpc_call(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, VaultError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            rpc.id = id,
            rpc.method = method,
            rpc.params = params.len(),
            "rpc call"
        );
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut builder = self.client.post(self.url.clone()).json(&request);
        if let Some((user, password)) = self.auth.credentials()? {
            builder = builder.basic_auth(user, Some(password));
        }

        let response = builder.send().await.map_err(RpcError::Transport)?;
        let status = response.status();

        let body = response.text().await.map_err(RpcError::Transport)?;
        debug!(rpc.id = id, rpc.method = method, %status, body_len = body.len(), "rpc response");
        trace!(rpc.id = id, rpc.method = method, body = %body, "rpc response body");

        decode_envelope(method, &body)
    }
}

/// The JSON-RPC response envelope, with the error decoded straight into
/// the node's `{code, message}` shape. bitcoind always produces that
/// shape; anything else fails the envelope decode and surfaces as an
/// invalid response with the body attached.
#[derive(serde::Deserialize)]
struct RpcEnvelope {
    result: Option<serde_json::Value>,
    error: Option<RpcFault>,
}

#[derive(serde::Deserialize)]
struct RpcFault {
    code: i64,
    message: String,
}

fn decode_envelope(method: &str, body: &str) -> Result<serde_json::Value, VaultError> {
    let envelope: RpcEnvelope = serde_json::from_str(body).map_err(|e| {
        RpcError::InvalidResponse(format!(
            "{method} response is not a JSON-RPC envelope: {e}; body={body}"
        ))
    })?;
    if let Some(fault) = envelope.error {
        return Err(RpcError::ServerError {
            code: fault.code,
            message: fault.message,
        }
        .into());
    }
    Ok(envelope.result.unwrap_or(serde_json::Value::Null))
}

#[async_trait]
impl VaultRpc for HttpRpcClient {
    async fn get_blockchain_info(&self) -> Result<ChainInfo, VaultError> {
        let raw = self.rpc_call("getblockchaininfo", Vec::new()).await?;
        let info: ChainInfo = serde_json::from_value(raw).map_err(|e| {
            RpcError::InvalidResponse(format!("invalid getblockchaininfo result: {e}"))
        })?;
        Ok(info)
    }

    async fn import_private_key(&self, wif: &str, label: &str) -> Result<(), VaultError> {
        self.rpc_call(
            "importprivkey",
            vec![serde_json::json!(wif), serde_json::json!(label)],
        )
        .await?;
        Ok(())
    }

    async fn send_to_address(
        &self,
        address: &Address,
        amount: Amount,
    ) -> Result<Txid, VaultError> {
        let raw = self
            .rpc_call(
                "sendtoaddress",
                vec![
                    serde_json::json!(address.to_string()),
                    serde_json::json!(amount.to_btc()),
                ],
            )
            .await?;
        parse_txid_result(&raw, "sendtoaddress")
    }

    async fn generate_to_address(
        &self,
        block_count: u64,
        address: &Address,
    ) -> Result<(), VaultError> {
        self.rpc_call(
            "generatetoaddress",
            vec![
                serde_json::json!(block_count),
                serde_json::json!(address.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn list_unspent(
        &self,
        min_conf: u32,
        max_conf: u32,
        address: &Address,
        include_unsafe: bool,
        minimum_amount: Amount,
    ) -> Result<Vec<UnspentOutput>, VaultError> {
        let raw = self
            .rpc_call(
                "listunspent",
                vec![
                    serde_json::json!(min_conf),
                    serde_json::json!(max_conf),
                    serde_json::json!([address.to_string()]),
                    serde_json::json!(include_unsafe),
                    serde_json::json!({ "minimumAmount": minimum_amount.to_btc() }),
                ],
            )
            .await?;

        let entries = raw.as_array().ok_or_else(|| {
            RpcError::InvalidResponse("listunspent result is not an array".to_owned())
        })?;
        entries.iter().map(parse_unspent_entry).collect()
    }

    async fn get_raw_transaction(
        &self,
        txid: &Txid,
    ) -> Result<Option<RawTransactionInfo>, VaultError> {
        let raw = match self
            .rpc_call(
                "getrawtransaction",
                vec![serde_json::json!(txid.to_string()), serde_json::json!(true)],
            )
            .await
        {
            Ok(raw) => raw,
            // "No such mempool or blockchain transaction" — the walker
            // treats missing transactions as simply unconfirmed.
            Err(VaultError::Rpc(RpcError::ServerError { code, .. }))
                if code == RPC_INVALID_ADDRESS_OR_KEY =>
            {
                return Ok(None);
            }
            Err(other) => return Err(other),
        };

        let confirmations = raw
            .get("confirmations")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let hex = raw
            .get("hex")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned();
        Ok(Some(RawTransactionInfo {
            txid: *txid,
            confirmations,
            hex,
        }))
    }

    async fn send_raw_transaction(&self, raw_tx: &[u8]) -> Result<Txid, VaultError> {
        let raw = self
            .rpc_call(
                "sendrawtransaction",
                vec![serde_json::json!(raw_tx.to_lower_hex_string())],
            )
            .await?;
        parse_txid_result(&raw, "sendrawtransaction")
    }
}

fn parse_txid_result(raw: &serde_json::Value, method: &str) -> Result<Txid, VaultError> {
    let text = raw.as_str().ok_or_else(|| {
        RpcError::InvalidResponse(format!("{method} result is not a string: {raw}"))
    })?;
    Txid::from_str(text)
        .map_err(|e| RpcError::InvalidResponse(format!("{method} returned invalid txid: {e}")).into())
}

fn parse_unspent_entry(entry: &serde_json::Value) -> Result<UnspentOutput, VaultError> {
    let txid_str = entry
        .get("txid")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| RpcError::InvalidResponse("listunspent entry missing txid".to_owned()))?;
    let txid = Txid::from_str(txid_str).map_err(|e| {
        RpcError::InvalidResponse(format!("listunspent entry has invalid txid: {e}"))
    })?;
    let vout = entry
        .get("vout")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| RpcError::InvalidResponse("listunspent entry missing vout".to_owned()))?
        as u32;
    let btc = entry
        .get("amount")
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| RpcError::InvalidResponse("listunspent entry missing amount".to_owned()))?;
    let amount = Amount::from_btc(btc).map_err(|e| {
        RpcError::InvalidResponse(format!("listunspent entry has invalid amount: {e}"))
    })?;
    let confirmations = entry
        .get("confirmations")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0);
    Ok(UnspentOutput {
        txid,
        vout,
        amount,
        confirmations,
    })
}

fn initial_request_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}
