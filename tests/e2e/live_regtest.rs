//! Live regtest tests
//!
//! These tests talk to a REAL bitcoind. No mocks.
//! Run with: cargo test -p regfix-e2e --test live_regtest -- --ignored --nocapture
//!
//! Node: `bitcoind -regtest -rpcuser=user -rpcpassword=pass -fallbackfee=0.0002`
//! (override with REGFIX_RPC_HOST / REGFIX_RPC_PORT / REGFIX_RPC_USER / REGFIX_RPC_PASSWORD)

use regfix_core::funding::{fund_wallet, FundingPlan};
use regfix_core::wallet::ensure_wallet;
use regfix_core::{FixtureDocument, KeyFidelity, ProvisionConfig, Provisioner, Scenario};
use regfix_rpc::{BitcoindRpc, NodeRpc, NodeRpcExt, RpcAuth, REGTEST_RPC_PORT};
use serde_json::Value;
use std::sync::Arc;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn connect() -> (Arc<dyn NodeRpc>, String, String, String) {
    let host = env_or("REGFIX_RPC_HOST", "127.0.0.1");
    let port = env_or("REGFIX_RPC_PORT", &REGTEST_RPC_PORT.to_string())
        .parse()
        .unwrap();
    let user = env_or("REGFIX_RPC_USER", "user");
    let password = env_or("REGFIX_RPC_PASSWORD", "pass");
    let rpc = BitcoindRpc::new(host, port, RpcAuth::new(user.clone(), password.clone()));
    let url = rpc.url();
    (Arc::new(rpc), url, user, password)
}

// ============================================================================
// TEST 1: Node reachable and on regtest
// ============================================================================

#[test]
#[ignore = "requires a regtest node"]
fn test_node_is_regtest() {
    let (rpc, url, _, _) = connect();
    let info: Value = rpc.call_as(None, "getblockchaininfo", &[]).unwrap();
    println!("  ✓ {} at height {}", url, info["blocks"]);
    assert_eq!(info["chain"], "regtest");
}

// ============================================================================
// TEST 2: Wallet lifecycle against a real node
// ============================================================================

#[test]
#[ignore = "requires a regtest node"]
fn test_ensure_wallet_twice() {
    let (rpc, _, _, _) = connect();
    let first = ensure_wallet(&rpc, "regfix_live_lifecycle", false).unwrap();
    let second = ensure_wallet(&rpc, "regfix_live_lifecycle", false).unwrap();
    assert_eq!(first.name(), second.name());
}

// ============================================================================
// TEST 3: Funding converges past coinbase maturity
// ============================================================================

#[tokio::test]
#[ignore = "requires a regtest node"]
async fn test_fund_fresh_wallet() {
    let (rpc, _, _, _) = connect();
    let wallet = ensure_wallet(&rpc, "regfix_live_funding", false).unwrap();
    let threshold = bitcoin::Amount::from_int_btc(5);

    let outcome = fund_wallet(&wallet, threshold, &FundingPlan::default()).await;
    println!("  Funding outcome: {:?}", outcome);
    assert!(outcome.is_funded());
}

// ============================================================================
// TEST 4: Full scenario with real keys
// ============================================================================

#[tokio::test]
#[ignore = "requires a regtest node"]
async fn test_bad_privacy_live() {
    let (rpc, url, user, password) = connect();
    let dir = tempfile::tempdir().unwrap();
    let config = ProvisionConfig {
        output_dir: dir.path().to_path_buf(),
        node_url: url,
        rpc_username: user,
        rpc_password: password,
        seed: Some(1),
        force: true,
        ..ProvisionConfig::default()
    };

    let run = Provisioner::new(rpc, config)
        .run_scenario(Scenario::BadPrivacy)
        .await
        .unwrap();

    let doc = FixtureDocument::load(&run.path).unwrap();
    println!("  ✓ Wrote {}", run.path.display());
    assert_eq!(doc.key_fidelity, KeyFidelity::Node);
    assert!(doc
        .extended_public_keys
        .iter()
        .all(|k| k.xpub.starts_with("tpub")));
    assert!(run.report.max_address_reuse() > 1);
}
