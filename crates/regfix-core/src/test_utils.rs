//! In-memory regtest node for tests.
//!
//! [`MockNode`] implements [`NodeRpc`] over a small ledger: wallets with a
//! balance, addresses owned by wallets, and a block height. Coinbase rewards
//! are credited immediately (no maturity) unless withheld for a wallet.
//! Sends carry no fee. Every call is recorded so tests can count them.

use bitcoin::Amount;
use regfix_rpc::{
    Error as RpcError, NodeRpc, INSUFFICIENT_FUNDS, WALLET_ALREADY_LOADED, WALLET_ERROR,
    WALLET_NOT_FOUND,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// BIP32 test vector 1 master xpub
pub const TEST_XPUB_1: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

/// BIP32 test vector 2 master xpub
pub const TEST_XPUB_2: &str = "xpub661MyMwAqRbcFW31YEwpkMuc5THy2PSt5bDMsktWQcFF8syAmRUapSCGu8ED9W6oDMSgv6Zz8idoc4a6mr8BDzTJY47LJhkJ8UB7WEGuduB";

/// Block subsidy credited per mined block
pub const BLOCK_REWARD: Amount = Amount::from_int_btc(50);

/// Methods that change node or wallet state
pub const MUTATING_METHODS: &[&str] = &[
    "createwallet",
    "loadwallet",
    "getnewaddress",
    "generatetoaddress",
    "sendtoaddress",
    "sendmany",
    "importdescriptors",
];

/// One recorded RPC call
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub wallet: Option<String>,
    pub method: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone)]
struct Failure {
    code: i32,
    message: String,
    once: bool,
}

#[derive(Debug, Default)]
struct MockWallet {
    watch_only: bool,
    balance: Amount,
}

#[derive(Debug, Default)]
struct MockState {
    /// Wallets on "disk"
    wallets: BTreeMap<String, MockWallet>,
    loaded: BTreeSet<String>,
    /// address -> (owning wallet, sequence number)
    addresses: HashMap<String, (String, u64)>,
    failures: HashMap<String, Failure>,
    withheld: HashSet<String>,
    balance_reads: HashMap<String, Vec<Amount>>,
    imported: HashMap<String, Vec<String>>,
    calls: Vec<RecordedCall>,
    sequence: u64,
    height: u64,
}

impl MockState {
    fn next(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn wallet_mut(&mut self, name: &str) -> Result<&mut MockWallet, RpcError> {
        if !self.loaded.contains(name) {
            return Err(not_found(name));
        }
        self.wallets.get_mut(name).ok_or_else(|| not_found(name))
    }

    fn credit(&mut self, address: &str, amount: Amount) {
        if let Some((owner, _)) = self.addresses.get(address).cloned() {
            if let Some(w) = self.wallets.get_mut(&owner) {
                w.balance += amount;
            }
        }
    }

    fn debit(&mut self, wallet: &str, amount: Amount) -> Result<(), RpcError> {
        let w = self.wallet_mut(wallet)?;
        if w.balance < amount {
            return Err(RpcError::rpc(INSUFFICIENT_FUNDS, "Insufficient funds"));
        }
        w.balance -= amount;
        Ok(())
    }

    fn txid(&mut self) -> String {
        format!("{:064x}", self.next())
    }
}

fn not_found(name: &str) -> RpcError {
    RpcError::rpc(
        WALLET_NOT_FOUND,
        format!("Requested wallet does not exist or is not loaded: {}", name),
    )
}

fn bad_args(method: &str) -> RpcError {
    RpcError::rpc(-8, format!("Invalid parameters for {}", method))
}

fn arg_str<'a>(args: &'a [Value], i: usize, method: &str) -> Result<&'a str, RpcError> {
    args.get(i).and_then(Value::as_str).ok_or_else(|| bad_args(method))
}

fn arg_amount(value: Option<&Value>, method: &str) -> Result<Amount, RpcError> {
    value
        .and_then(Value::as_f64)
        .and_then(|btc| Amount::from_btc(btc).ok())
        .ok_or_else(|| bad_args(method))
}

fn scoped<'a>(wallet: Option<&'a str>, method: &str) -> Result<&'a str, RpcError> {
    wallet.ok_or_else(|| {
        RpcError::rpc(
            WALLET_NOT_FOUND,
            format!("{} requires a wallet endpoint", method),
        )
    })
}

/// Fake bitcoind implementing [`NodeRpc`]
#[derive(Debug, Default)]
pub struct MockNode {
    state: Mutex<MockState>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a wallet on disk without loading it.
    pub fn add_unloaded_wallet(&self, name: &str) {
        self.state()
            .wallets
            .insert(name.to_string(), MockWallet::default());
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.state().loaded.contains(name)
    }

    pub fn wallet_exists(&self, name: &str) -> bool {
        self.state().wallets.contains_key(name)
    }

    pub fn is_watch_only(&self, name: &str) -> bool {
        self.state()
            .wallets
            .get(name)
            .map(|w| w.watch_only)
            .unwrap_or(false)
    }

    pub fn set_balance(&self, name: &str, balance: Amount) {
        self.state()
            .wallets
            .entry(name.to_string())
            .or_default()
            .balance = balance;
    }

    pub fn balance(&self, name: &str) -> Amount {
        self.state()
            .wallets
            .get(name)
            .map(|w| w.balance)
            .unwrap_or(Amount::ZERO)
    }

    /// Every `getbalance` result returned for `name`, in order.
    pub fn balance_reads(&self, name: &str) -> Vec<Amount> {
        self.state()
            .balance_reads
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Descriptors imported into `name`, checksums included.
    pub fn imported_descriptors(&self, name: &str) -> Vec<String> {
        self.state().imported.get(name).cloned().unwrap_or_default()
    }

    /// Make every call to `method` fail with the given RPC error.
    pub fn fail_method(&self, method: &str, code: i32, message: &str) {
        self.inject(method, code, message, false);
    }

    /// Fail only the next call to `method`.
    pub fn fail_once(&self, method: &str, code: i32, message: &str) {
        self.inject(method, code, message, true);
    }

    fn inject(&self, method: &str, code: i32, message: &str, once: bool) {
        self.state().failures.insert(
            method.to_string(),
            Failure {
                code,
                message: message.to_string(),
                once,
            },
        );
    }

    /// Stop crediting coinbase rewards to `name` (simulates immature coins).
    pub fn withhold_coinbase(&self, name: &str) {
        self.state().withheld.insert(name.to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn count_calls(&self, method: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    /// Recorded calls that would change node state.
    pub fn mutating_calls(&self) -> Vec<RecordedCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| MUTATING_METHODS.contains(&c.method.as_str()))
            .cloned()
            .collect()
    }

    pub fn height(&self) -> u64 {
        self.state().height
    }

    fn dispatch(
        st: &mut MockState,
        wallet: Option<&str>,
        method: &str,
        args: &[Value],
    ) -> Result<Value, RpcError> {
        match method {
            "getblockchaininfo" => Ok(json!({ "chain": "regtest", "blocks": st.height })),

            "listwallets" => Ok(json!(st.loaded.iter().collect::<Vec<_>>())),

            "loadwallet" => {
                let name = arg_str(args, 0, method)?;
                if st.loaded.contains(name) {
                    return Err(RpcError::rpc(
                        WALLET_ALREADY_LOADED,
                        format!("Wallet \"{}\" is already loaded.", name),
                    ));
                }
                if !st.wallets.contains_key(name) {
                    return Err(RpcError::rpc(
                        WALLET_NOT_FOUND,
                        format!("Wallet file not found: {}", name),
                    ));
                }
                st.loaded.insert(name.to_string());
                Ok(json!({ "name": name, "warning": "" }))
            }

            "createwallet" => {
                let name = arg_str(args, 0, method)?;
                if st.wallets.contains_key(name) {
                    return Err(RpcError::rpc(
                        WALLET_ERROR,
                        format!("Wallet file verification failed. Failed to create database path '{}'. Database already exists.", name),
                    ));
                }
                let watch_only = args.get(1).and_then(Value::as_bool).unwrap_or(false);
                st.wallets.insert(
                    name.to_string(),
                    MockWallet {
                        watch_only,
                        balance: Amount::ZERO,
                    },
                );
                st.loaded.insert(name.to_string());
                Ok(json!({ "name": name, "warning": "" }))
            }

            "getbalance" => {
                let name = scoped(wallet, method)?;
                let balance = st.wallet_mut(name)?.balance;
                st.balance_reads
                    .entry(name.to_string())
                    .or_default()
                    .push(balance);
                Ok(json!(balance.to_btc()))
            }

            "getnewaddress" => {
                let name = scoped(wallet, method)?;
                st.wallet_mut(name)?;
                let seq = st.next();
                let address = format!("bcrt1qmock{:030x}", seq);
                st.addresses
                    .insert(address.clone(), (name.to_string(), seq));
                Ok(json!(address))
            }

            "getaddressinfo" => {
                let name = scoped(wallet, method)?;
                let address = arg_str(args, 0, method)?;
                match st.addresses.get(address) {
                    Some((owner, seq)) if owner == name => Ok(json!({
                        "address": address,
                        "ismine": true,
                        "pubkey": format!("02{:064x}", seq),
                    })),
                    _ => Ok(json!({ "address": address, "ismine": false })),
                }
            }

            "listdescriptors" => {
                let name = scoped(wallet, method)?;
                st.wallet_mut(name)?;
                let (fingerprint, xpub) = if name.ends_with("_signer_2") {
                    ("a1b2c3d4", TEST_XPUB_2)
                } else {
                    ("d34db33f", TEST_XPUB_1)
                };
                let origin = format!("[{}/84h/1h/0h]{}", fingerprint, xpub);
                Ok(json!({
                    "wallet_name": name,
                    "descriptors": [
                        { "desc": format!("pkh({}/0/*)#aaaaaaaa", origin), "active": true, "internal": false },
                        { "desc": format!("wpkh({}/1/*)#bbbbbbbb", origin), "active": true, "internal": true },
                        { "desc": format!("wpkh({}/0/*)#cccccccc", origin), "active": true, "internal": false },
                    ]
                }))
            }

            "generatetoaddress" => {
                let blocks = args
                    .first()
                    .and_then(Value::as_u64)
                    .ok_or_else(|| bad_args(method))?;
                let address = arg_str(args, 1, method)?.to_string();
                let owner = st.addresses.get(&address).map(|(o, _)| o.clone());
                let withheld = owner.as_ref().is_some_and(|o| st.withheld.contains(o));
                if !withheld {
                    let reward = BLOCK_REWARD
                        .checked_mul(blocks)
                        .ok_or_else(|| bad_args(method))?;
                    st.credit(&address, reward);
                }
                let hashes: Vec<String> = (0..blocks)
                    .map(|_| {
                        st.height += 1;
                        format!("{:064x}", st.height)
                    })
                    .collect();
                Ok(json!(hashes))
            }

            "sendtoaddress" => {
                let name = scoped(wallet, method)?;
                let address = arg_str(args, 0, method)?.to_string();
                let amount = arg_amount(args.get(1), method)?;
                st.debit(name, amount)?;
                st.credit(&address, amount);
                Ok(json!(st.txid()))
            }

            "sendmany" => {
                let name = scoped(wallet, method)?;
                let outputs = args
                    .get(1)
                    .and_then(Value::as_object)
                    .ok_or_else(|| bad_args(method))?;
                let mut parsed = Vec::with_capacity(outputs.len());
                for (address, amount) in outputs {
                    parsed.push((address.clone(), arg_amount(Some(amount), method)?));
                }
                let total: Amount = parsed.iter().map(|(_, a)| *a).sum();
                st.debit(name, total)?;
                for (address, amount) in &parsed {
                    st.credit(address, *amount);
                }
                Ok(json!(st.txid()))
            }

            "createmultisig" => {
                let keys = args
                    .get(1)
                    .and_then(Value::as_array)
                    .ok_or_else(|| bad_args(method))?;
                let seq = st.next();
                Ok(json!({
                    "address": format!("bcrt1qmultisig{:026x}", seq),
                    "redeemScript": "",
                    "descriptor": format!("wsh(multi(..{} keys))", keys.len()),
                }))
            }

            "getdescriptorinfo" => {
                let desc = arg_str(args, 0, method)?;
                Ok(json!({
                    "descriptor": desc,
                    "checksum": format!("{:08x}", desc.len()),
                    "isrange": desc.contains('*'),
                    "issolvable": true,
                    "hasprivatekeys": false,
                }))
            }

            "importdescriptors" => {
                let name = scoped(wallet, method)?;
                st.wallet_mut(name)?;
                let requests = args
                    .first()
                    .and_then(Value::as_array)
                    .ok_or_else(|| bad_args(method))?;
                let mut results = Vec::new();
                for request in requests {
                    let desc = request
                        .get("desc")
                        .and_then(Value::as_str)
                        .ok_or_else(|| bad_args(method))?;
                    st.imported
                        .entry(name.to_string())
                        .or_default()
                        .push(desc.to_string());
                    results.push(json!({ "success": true }));
                }
                Ok(json!(results))
            }

            "deriveaddresses" => {
                let desc = arg_str(args, 0, method)?;
                let range = args
                    .get(1)
                    .and_then(Value::as_array)
                    .ok_or_else(|| bad_args(method))?;
                let start = range.first().and_then(Value::as_u64).unwrap_or(0);
                let end = range.get(1).and_then(Value::as_u64).unwrap_or(start);
                let tag = desc.len();
                Ok(json!((start..=end)
                    .map(|i| format!("bcrt1qderived{:08x}{:020x}", tag, i))
                    .collect::<Vec<_>>()))
            }

            other => Err(RpcError::rpc(-32601, format!("Method not found: {}", other))),
        }
    }
}

impl NodeRpc for MockNode {
    fn call(&self, wallet: Option<&str>, method: &str, args: &[Value]) -> Result<Value, RpcError> {
        let mut st = self.state();
        st.calls.push(RecordedCall {
            wallet: wallet.map(str::to_string),
            method: method.to_string(),
            args: args.to_vec(),
        });

        if let Some(failure) = st.failures.get(method).cloned() {
            if failure.once {
                st.failures.remove(method);
            }
            return Err(RpcError::rpc(failure.code, failure.message));
        }

        Self::dispatch(&mut st, wallet, method, args)
    }
}
