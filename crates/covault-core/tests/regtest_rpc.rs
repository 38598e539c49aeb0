//! Integration tests against a live regtest bitcoind.
//!
//! These are ignored by default; point them at a node with:
//! `COVAULT_TEST_RPC_URL`, `COVAULT_TEST_RPC_USER`, `COVAULT_TEST_RPC_PASS`.

use std::env;
use std::str::FromStr;
use std::sync::Once;

use bitcoin::Txid;

use covault_core::rpc::{HttpRpcClient, RpcAuth, VaultRpc};

static TRACING_INIT: Once = Once::new();

fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("covault_core=debug")),
            )
            .with_target(true)
            .try_init();
    });
}

fn client_from_env() -> HttpRpcClient {
    let rpc_url = env::var("COVAULT_TEST_RPC_URL").expect("COVAULT_TEST_RPC_URL must be set");
    let rpc_user = env::var("COVAULT_TEST_RPC_USER").expect("COVAULT_TEST_RPC_USER must be set");
    let rpc_pass = env::var("COVAULT_TEST_RPC_PASS").expect("COVAULT_TEST_RPC_PASS must be set");
    let auth = RpcAuth::UserPass {
        user: rpc_user,
        password: rpc_pass,
    };
    HttpRpcClient::new(&rpc_url, auth).expect("rpc client must construct")
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires local regtest bitcoind"]
async fn regtest_chain_info_reports_regtest() {
    init_tracing();
    let rpc = client_from_env();

    let info = rpc
        .get_blockchain_info()
        .await
        .expect("regtest getblockchaininfo must succeed");
    assert_eq!(info.chain, "regtest");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires local regtest bitcoind"]
async fn regtest_unknown_transaction_reads_as_unconfirmed() {
    init_tracing();
    let rpc = client_from_env();

    let unknown =
        Txid::from_str("0000000000000000000000000000000000000000000000000000000000000001")
            .expect("static txid parses");
    let found = rpc
        .get_raw_transaction(&unknown)
        .await
        .expect("lookup must not error");
    assert!(found.is_none(), "unknown txids must read as not found");
}
