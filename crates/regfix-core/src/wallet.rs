//! Wallet lifecycle: create, load, reuse.
//!
//! A [`WalletContext`] is a handle bound to one named wallet on the node.
//! Obtaining one through [`ensure_wallet`] guarantees the wallet is loaded.

use crate::FixtureError;
use bitcoin::Amount;
use regfix_rpc::{Error as RpcError, NodeRpc, NodeRpcExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A loaded wallet on the node
#[derive(Clone)]
pub struct WalletContext {
    rpc: Arc<dyn NodeRpc>,
    name: String,
    watch_only: bool,
}

impl fmt::Debug for WalletContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletContext")
            .field("name", &self.name)
            .field("watch_only", &self.watch_only)
            .finish()
    }
}

impl WalletContext {
    /// Bind to `name` without touching the node.
    ///
    /// Callers that need the wallet to exist should go through [`ensure_wallet`].
    pub fn bind(rpc: Arc<dyn NodeRpc>, name: impl Into<String>, watch_only: bool) -> Self {
        Self {
            rpc,
            name: name.into(),
            watch_only,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_watch_only(&self) -> bool {
        self.watch_only
    }

    /// The gateway this wallet was bound through.
    pub fn rpc(&self) -> &Arc<dyn NodeRpc> {
        &self.rpc
    }

    /// Raw wallet-scoped call.
    pub fn call(&self, method: &str, args: &[Value]) -> Result<Value, RpcError> {
        self.rpc.call(Some(self.name.as_str()), method, args)
    }

    /// Confirmed + trusted balance as reported by `getbalance`.
    pub fn balance(&self) -> Result<Amount, RpcError> {
        let btc: f64 = self.rpc.call_as(Some(self.name.as_str()), "getbalance", &[])?;
        btc_to_amount("getbalance", btc)
    }

    /// A fresh bech32 receiving address.
    pub fn new_address(&self) -> Result<String, RpcError> {
        self.rpc
            .call_as(Some(self.name.as_str()), "getnewaddress", &[json!(""), json!("bech32")])
    }

    /// Compressed public key (hex) behind one of this wallet's addresses.
    pub fn address_pubkey(&self, address: &str) -> Result<String, RpcError> {
        let info: Value = self
            .rpc
            .call_as(Some(self.name.as_str()), "getaddressinfo", &[json!(address)])?;
        info.get("pubkey")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RpcError::Response {
                method: "getaddressinfo".into(),
                reason: format!("no pubkey for {}", address),
            })
    }

    /// Pay `amount` to `address`. Returns the txid.
    pub fn send_to_address(&self, address: &str, amount: Amount) -> Result<String, RpcError> {
        self.rpc.call_as(
            Some(self.name.as_str()),
            "sendtoaddress",
            &[json!(address), json!(amount.to_btc())],
        )
    }

    /// Pay `amount` to `address` at an explicit fee rate (sat/vB).
    pub fn send_with_fee_rate(
        &self,
        address: &str,
        amount: Amount,
        sat_per_vb: u64,
    ) -> Result<String, RpcError> {
        // sendtoaddress positional args up to fee_rate
        let args = [
            json!(address),
            json!(amount.to_btc()),
            json!(""),
            json!(""),
            json!(false),
            json!(true),
            Value::Null,
            json!("unset"),
            Value::Null,
            json!(sat_per_vb),
        ];
        self.rpc.call_as(Some(self.name.as_str()), "sendtoaddress", &args)
    }

    /// One transaction paying every `(address, amount)` pair.
    pub fn send_many(&self, outputs: &BTreeMap<String, Amount>) -> Result<String, RpcError> {
        let amounts: serde_json::Map<String, Value> = outputs
            .iter()
            .map(|(addr, amount)| (addr.clone(), json!(amount.to_btc())))
            .collect();
        self.rpc
            .call_as(Some(self.name.as_str()), "sendmany", &[json!(""), Value::Object(amounts)])
    }
}

/// Make sure wallet `name` is loaded, creating it if the node has never seen it.
///
/// Calling this repeatedly is cheap: once the wallet shows up in
/// `listwallets` no further lifecycle RPCs are issued.
pub fn ensure_wallet(
    rpc: &Arc<dyn NodeRpc>,
    name: &str,
    watch_only: bool,
) -> Result<WalletContext, FixtureError> {
    let wrap = |source: RpcError| FixtureError::Wallet {
        wallet: name.to_string(),
        source,
    };

    let loaded: Vec<String> = rpc.call_as(None, "listwallets", &[]).map_err(wrap)?;
    if loaded.iter().any(|w| w == name) {
        log::debug!("Wallet '{}' already loaded", name);
        return Ok(WalletContext::bind(rpc.clone(), name, watch_only));
    }

    match rpc.call(None, "loadwallet", &[json!(name)]) {
        Ok(_) => log::info!("Loaded wallet '{}'", name),
        Err(e) if e.is_already_loaded() => log::debug!("Wallet '{}' loaded concurrently", name),
        Err(e) if e.is_wallet_not_found() => {
            create_wallet(rpc.as_ref(), name, watch_only).map_err(wrap)?;
            log::info!(
                "Created {}wallet '{}'",
                if watch_only { "watch-only " } else { "" },
                name
            );
        }
        Err(e) => return Err(wrap(e)),
    }

    Ok(WalletContext::bind(rpc.clone(), name, watch_only))
}

fn create_wallet(rpc: &dyn NodeRpc, name: &str, watch_only: bool) -> Result<(), RpcError> {
    let args = [
        json!(name),
        json!(watch_only), // disable_private_keys
        json!(false),      // blank
        Value::Null,       // passphrase
        json!(false),      // avoid_reuse
        json!(true),       // descriptors
    ];
    match rpc.call(None, "createwallet", &args) {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_exists() => {
            // On disk but not loadable under this name a moment ago; one more load.
            rpc.call(None, "loadwallet", &[json!(name)]).map(|_| ())
        }
        Err(e) => Err(e),
    }
}

/// Mine `blocks` blocks paying the coinbase to `address`.
pub fn mine_to(rpc: &dyn NodeRpc, blocks: u64, address: &str) -> Result<(), RpcError> {
    let hashes: Vec<String> =
        rpc.call_as(None, "generatetoaddress", &[json!(blocks), json!(address)])?;
    log::debug!("Mined {} block(s) to {}", hashes.len(), address);
    Ok(())
}

pub(crate) fn btc_to_amount(method: &str, btc: f64) -> Result<Amount, RpcError> {
    Amount::from_btc(btc.max(0.0)).map_err(|e| RpcError::Response {
        method: method.to_string(),
        reason: e.to_string(),
    })
}
