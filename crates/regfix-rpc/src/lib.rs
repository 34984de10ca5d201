//! regfix RPC Gateway
//!
//! Issues named JSON-RPC commands against a bitcoind node, either against the
//! node itself or scoped to one of its loaded wallets.
//!
//! The rest of the workspace only sees the [`NodeRpc`] trait, so the node can
//! be swapped for an in-memory fake in tests.
//!
//! # Example
//!
//! ```ignore
//! use regfix_rpc::{BitcoindRpc, NodeRpc, NodeRpcExt, RpcAuth};
//!
//! let rpc = BitcoindRpc::new("127.0.0.1", 18443, RpcAuth::new("user", "pass"));
//! let wallets: Vec<String> = rpc.call_as(None, "listwallets", &[])?;
//! let balance: f64 = rpc.call_as(Some("miner"), "getbalance", &[])?;
//! ```

use bitcoincore_rpc::jsonrpc::error::Error as JsonRpcError;
use bitcoincore_rpc::{Auth, Client, RpcApi};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// bitcoind `RPC_WALLET_NOT_FOUND`
pub const WALLET_NOT_FOUND: i32 = -18;
/// bitcoind `RPC_WALLET_ALREADY_LOADED`
pub const WALLET_ALREADY_LOADED: i32 = -35;
/// bitcoind `RPC_WALLET_ERROR`, returned by `createwallet` when the database exists
pub const WALLET_ERROR: i32 = -4;
/// bitcoind `RPC_WALLET_INSUFFICIENT_FUNDS`
pub const INSUFFICIENT_FUNDS: i32 = -6;

/// Errors from RPC operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("Unexpected response to {method}: {reason}")]
    Response { method: String, reason: String },

    #[error("Client error: {0}")]
    Client(String),
}

impl Error {
    /// Build an RPC-level error from a code and message.
    pub fn rpc(code: i32, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
        }
    }

    /// The bitcoind error code, if the node answered with one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// `loadwallet`/wallet-scoped calls on a wallet the node has never seen.
    pub fn is_wallet_not_found(&self) -> bool {
        self.code() == Some(WALLET_NOT_FOUND)
    }

    pub fn is_already_loaded(&self) -> bool {
        self.code() == Some(WALLET_ALREADY_LOADED)
    }

    /// `createwallet` racing against an existing wallet directory.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Rpc { code, message } => {
                *code == WALLET_ERROR && message.to_lowercase().contains("already exists")
            }
            _ => false,
        }
    }

    pub fn is_insufficient_funds(&self) -> bool {
        self.code() == Some(INSUFFICIENT_FUNDS)
    }
}

impl From<bitcoincore_rpc::Error> for Error {
    fn from(e: bitcoincore_rpc::Error) -> Self {
        match e {
            bitcoincore_rpc::Error::JsonRpc(JsonRpcError::Rpc(rpc)) => Error::Rpc {
                code: rpc.code,
                message: rpc.message,
            },
            bitcoincore_rpc::Error::JsonRpc(JsonRpcError::Transport(t)) => {
                Error::Unreachable(t.to_string())
            }
            other => Error::Client(other.to_string()),
        }
    }
}

/// Command dispatch against a node.
///
/// `wallet = None` addresses the node itself (mining, descriptor utilities);
/// `Some(name)` addresses that wallet's context.
pub trait NodeRpc: Send + Sync {
    fn call(&self, wallet: Option<&str>, method: &str, args: &[Value]) -> Result<Value, Error>;
}

/// Typed convenience over [`NodeRpc::call`].
pub trait NodeRpcExt: NodeRpc {
    fn call_as<T: DeserializeOwned>(
        &self,
        wallet: Option<&str>,
        method: &str,
        args: &[Value],
    ) -> Result<T, Error> {
        let value = self.call(wallet, method, args)?;
        serde_json::from_value(value).map_err(|e| Error::Response {
            method: method.to_string(),
            reason: e.to_string(),
        })
    }
}

impl<T: NodeRpc + ?Sized> NodeRpcExt for T {}

/// Username/password pair for bitcoind's RPC server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcAuth {
    pub username: String,
    pub password: String,
}

impl RpcAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// [`NodeRpc`] backed by bitcoind over HTTP.
///
/// bitcoind scopes wallet calls by URL path, so one client is kept per
/// wallet context and created on first use.
pub struct BitcoindRpc {
    host: String,
    port: u16,
    auth: RpcAuth,
    clients: Mutex<HashMap<String, Client>>,
}

impl BitcoindRpc {
    /// Create a gateway. No connection is made until the first call.
    pub fn new(host: impl Into<String>, port: u16, auth: RpcAuth) -> Self {
        Self {
            host: host.into(),
            port,
            auth,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Base URL of the node, without a wallet path.
    pub fn url(&self) -> String {
        node_url(&self.host, self.port)
    }

    pub fn auth(&self) -> &RpcAuth {
        &self.auth
    }

    fn endpoint(&self, wallet: Option<&str>) -> String {
        match wallet {
            Some(name) => format!("{}/wallet/{}", self.url(), name),
            None => self.url(),
        }
    }
}

impl NodeRpc for BitcoindRpc {
    fn call(&self, wallet: Option<&str>, method: &str, args: &[Value]) -> Result<Value, Error> {
        let endpoint = self.endpoint(wallet);
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| Error::Client("client cache poisoned".into()))?;

        if !clients.contains_key(&endpoint) {
            let auth = Auth::UserPass(self.auth.username.clone(), self.auth.password.clone());
            let client = Client::new(&endpoint, auth)?;
            clients.insert(endpoint.clone(), client);
        }
        let client = clients
            .get(&endpoint)
            .ok_or_else(|| Error::Client(format!("no client for {}", endpoint)))?;

        log::debug!("rpc {} [{}]", method, wallet.unwrap_or("-"));
        Ok(client.call::<Value>(method, args)?)
    }
}

/// `http://host:port` for a node.
pub fn node_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// Default regtest RPC port
pub const REGTEST_RPC_PORT: u16 = 18443;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_endpoint() {
        let rpc = BitcoindRpc::new("127.0.0.1", REGTEST_RPC_PORT, RpcAuth::new("u", "p"));
        assert_eq!(rpc.endpoint(None), "http://127.0.0.1:18443");
        assert_eq!(
            rpc.endpoint(Some("bad_privacy_signer_1")),
            "http://127.0.0.1:18443/wallet/bad_privacy_signer_1"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::rpc(-18, "Wallet file not found").is_wallet_not_found());
        assert!(Error::rpc(-35, "already loaded").is_already_loaded());
        assert!(Error::rpc(-4, "Wallet file verification failed. Database already exists.")
            .is_already_exists());
        assert!(!Error::rpc(-4, "Wallet is locked").is_already_exists());
        assert!(Error::rpc(-6, "Insufficient funds").is_insufficient_funds());
        assert!(!Error::Unreachable("refused".into()).is_wallet_not_found());
    }

    #[test]
    fn test_rpc_error_conversion() {
        let inner = bitcoincore_rpc::jsonrpc::error::RpcError {
            code: -18,
            message: "Requested wallet does not exist or is not loaded".into(),
            data: None,
        };
        let err: Error = bitcoincore_rpc::Error::JsonRpc(JsonRpcError::Rpc(inner)).into();
        assert!(err.is_wallet_not_found());
    }

    struct Echo;

    impl NodeRpc for Echo {
        fn call(&self, _: Option<&str>, method: &str, _: &[Value]) -> Result<Value, Error> {
            match method {
                "getblockcount" => Ok(Value::from(101)),
                _ => Ok(Value::String("not a number".into())),
            }
        }
    }

    #[test]
    fn test_call_as_typed() {
        let count: u64 = Echo.call_as(None, "getblockcount", &[]).unwrap();
        assert_eq!(count, 101);

        let err = Echo.call_as::<u64>(None, "getbalance", &[]).unwrap_err();
        assert!(matches!(err, Error::Response { .. }));
    }

    // Requires a running regtest node with matching credentials.
    // Run with: cargo test --package regfix-rpc -- --ignored

    #[test]
    #[ignore = "requires a regtest node"]
    fn test_connect_regtest() {
        let rpc = BitcoindRpc::new("127.0.0.1", REGTEST_RPC_PORT, RpcAuth::new("user", "pass"));
        let info: Value = rpc.call_as(None, "getblockchaininfo", &[]).unwrap();
        assert_eq!(info["chain"], "regtest");
    }
}
