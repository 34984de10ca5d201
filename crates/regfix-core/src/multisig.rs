//! Multisig assembly
//!
//! Builds M-of-N P2WSH addresses from fresh signer pubkeys and a watch-only
//! "watcher" wallet that tracks the quorum through an imported descriptor:
//!
//! ```text
//! wsh(sortedmulti(M,[xfp/path]xpubA/0/*,[xfp/path]xpubB/0/*))
//! ```
//!
//! Keys in the watcher descriptor are ordered lexicographically by xpub, so
//! the descriptor is identical on every run whatever order the signers were
//! extracted in.
//!
//! The two halves are independent. `createmultisig` builds plain `multi`
//! scripts from one-off address pubkeys in signer order, while the watcher
//! imports `sortedmulti` over the account xpubs. The watcher does not track
//! the funded `createmultisig` addresses; it only sees payments sent to
//! addresses derived from its own descriptor.

use crate::keys::Signer;
use crate::wallet::{ensure_wallet, mine_to, WalletContext};
use crate::FixtureError;
use bitcoin::Amount;
use regfix_rpc::{Error as RpcError, NodeRpc, NodeRpcExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Last receive index imported into the watcher
pub const WATCHER_RANGE_END: u32 = 999;

/// A threshold address built by the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigAddress {
    pub address: String,
    /// Constituent pubkeys in the order they were passed to `createmultisig`
    pub pubkeys: Vec<String>,
    pub threshold: usize,
    pub total: usize,
    /// Amount the coordinator sent to this address
    pub funded: Amount,
}

/// Watch-only wallet tracking the quorum
#[derive(Debug, Clone)]
pub struct WatcherWallet {
    pub wallet: WalletContext,
    /// Descriptor without checksum
    pub descriptor: String,
    /// Descriptor as imported (with checksum), when the import succeeded
    pub imported: Option<String>,
}

impl WatcherWallet {
    pub fn is_tracking(&self) -> bool {
        self.imported.is_some()
    }
}

/// Everything the assembler produced for one scenario
#[derive(Debug, Clone)]
pub struct MultisigSet {
    pub addresses: Vec<MultisigAddress>,
    pub watcher: WatcherWallet,
}

/// How the coordinator funds the generated addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultisigFundingPolicy {
    /// Sent to each address when the balance covers all of them
    pub per_address: Amount,
    /// Kept back in the coordinator for fees and later patterns
    pub reserve: Amount,
    /// Below this per-address amount, funding is skipped
    pub min_per_address: Amount,
    /// Blocks mined to confirm the funding
    pub confirm_blocks: u64,
}

impl Default for MultisigFundingPolicy {
    fn default() -> Self {
        Self {
            per_address: Amount::from_int_btc(1),
            reserve: Amount::from_sat(50_000_000),
            min_per_address: Amount::from_sat(1_000_000),
            confirm_blocks: 6,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateMultisig {
    address: String,
}

#[derive(Debug, Deserialize)]
struct DescriptorInfo {
    checksum: String,
}

#[derive(Debug, Deserialize)]
struct ImportResult {
    success: bool,
    #[serde(default)]
    error: Option<Value>,
}

/// Watcher descriptor for `signers`, keys sorted by xpub.
pub fn threshold_descriptor(threshold: usize, signers: &[Signer]) -> String {
    let mut sorted: Vec<&Signer> = signers.iter().collect();
    sorted.sort_by(|a, b| a.xpub.cmp(&b.xpub));

    let keys: Vec<String> = sorted.iter().map(|s| descriptor_key(s)).collect();
    format!("wsh(sortedmulti({},{}))", threshold, keys.join(","))
}

fn descriptor_key(signer: &Signer) -> String {
    if signer.is_placeholder() {
        return format!("{}/0/*", signer.xpub);
    }
    let path = signer
        .bip32_path
        .strip_prefix("m/")
        .unwrap_or(signer.bip32_path.trim_start_matches('m'));
    if path.is_empty() {
        format!("[{}]{}/0/*", signer.xfp, signer.xpub)
    } else {
        format!("[{}/{}]{}/0/*", signer.xfp, path, signer.xpub)
    }
}

/// Build `count` threshold addresses and the watcher wallet.
///
/// `wallets[i]` must hold the keys of `signers[i]`. Each iteration asks every
/// signer for a fresh address, so no pubkey is reused across addresses.
pub fn build_multisig_addresses(
    rpc: &Arc<dyn NodeRpc>,
    wallets: &[WalletContext],
    signers: &[Signer],
    threshold: usize,
    count: usize,
    watcher_name: &str,
) -> Result<MultisigSet, FixtureError> {
    let total = signers.len();
    if wallets.len() != total {
        return Err(FixtureError::InvalidSigners(format!(
            "{} wallets for {} signers",
            wallets.len(),
            total
        )));
    }
    if threshold == 0 || threshold > total {
        return Err(FixtureError::InvalidSigners(format!(
            "threshold {} of {} signers",
            threshold, total
        )));
    }

    let mut addresses = Vec::with_capacity(count);
    for iteration in 0..count {
        let mut pubkeys = Vec::with_capacity(total);
        for wallet in wallets {
            let fresh = wallet.new_address()?;
            match wallet.address_pubkey(&fresh) {
                Ok(pk) => pubkeys.push(pk),
                Err(e) => log::warn!("[{}] No pubkey for {}: {}", wallet.name(), fresh, e),
            }
        }

        if pubkeys.len() < total {
            log::warn!(
                "Skipping multisig address {}: {} of {} pubkeys",
                iteration,
                pubkeys.len(),
                total
            );
            continue;
        }

        let created: CreateMultisig = rpc.call_as(
            None,
            "createmultisig",
            &[json!(threshold), json!(pubkeys), json!("bech32")],
        )?;
        log::info!(
            "Multisig {}-of-{} address {}: {}",
            threshold,
            total,
            iteration,
            created.address
        );
        addresses.push(MultisigAddress {
            address: created.address,
            pubkeys,
            threshold,
            total,
            funded: Amount::ZERO,
        });
    }

    let watcher_wallet = ensure_wallet(rpc, watcher_name, true)?;
    let descriptor = threshold_descriptor(threshold, signers);
    let imported = match import_descriptor(&watcher_wallet, &descriptor) {
        Ok(with_checksum) => {
            log::info!("[{}] Imported {}", watcher_name, with_checksum);
            Some(with_checksum)
        }
        Err(e) => {
            log::warn!(
                "[{}] Descriptor import failed, watcher will not track funds: {}",
                watcher_name,
                e
            );
            None
        }
    };

    Ok(MultisigSet {
        addresses,
        watcher: WatcherWallet {
            wallet: watcher_wallet,
            descriptor,
            imported,
        },
    })
}

/// Checksum `descriptor` on the node and import it into `watcher`.
fn import_descriptor(watcher: &WalletContext, descriptor: &str) -> Result<String, RpcError> {
    let info: DescriptorInfo =
        watcher
            .rpc()
            .call_as(None, "getdescriptorinfo", &[json!(descriptor)])?;
    let with_checksum = format!("{}#{}", descriptor, info.checksum);

    let request = json!([{
        "desc": with_checksum,
        "timestamp": "now",
        "range": [0, WATCHER_RANGE_END],
        "watchonly": true,
        "active": false,
    }]);
    let results: Vec<ImportResult> = watcher
        .rpc()
        .call_as(Some(watcher.name()), "importdescriptors", &[request])?;

    match results.first() {
        Some(r) if r.success => Ok(with_checksum),
        Some(r) => Err(RpcError::Response {
            method: "importdescriptors".into(),
            reason: r
                .error
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_else(|| "unsuccessful".into()),
        }),
        None => Err(RpcError::Response {
            method: "importdescriptors".into(),
            reason: "empty result".into(),
        }),
    }
}

/// Per-address amount the coordinator can afford, or `None` to skip funding.
pub fn plan_multisig_funding(
    balance: Amount,
    count: usize,
    policy: &MultisigFundingPolicy,
) -> Option<Amount> {
    if count == 0 {
        return None;
    }
    let count = count as u64;
    let full = policy.per_address.checked_mul(count)? + policy.reserve;
    if balance >= full {
        return Some(policy.per_address);
    }
    if balance <= policy.reserve {
        return None;
    }
    let reduced = (balance - policy.reserve) / count;
    (reduced >= policy.min_per_address).then_some(reduced)
}

/// Pay each address from `coordinator`, tiered by its balance.
///
/// Returns the total sent. Addresses left unfunded keep `funded == 0`.
pub fn fund_multisig_addresses(
    coordinator: &WalletContext,
    addresses: &mut [MultisigAddress],
    policy: &MultisigFundingPolicy,
) -> Amount {
    let balance = coordinator.balance().unwrap_or(Amount::ZERO);
    let Some(amount) = plan_multisig_funding(balance, addresses.len(), policy) else {
        log::warn!(
            "[{}] Balance {} too low to fund {} multisig addresses, leaving them empty",
            coordinator.name(),
            balance,
            addresses.len()
        );
        return Amount::ZERO;
    };

    let mut sent = Amount::ZERO;
    for addr in addresses.iter_mut() {
        match coordinator.send_to_address(&addr.address, amount) {
            Ok(txid) => {
                log::debug!("Funded {} with {} ({})", addr.address, amount, txid);
                addr.funded = amount;
                sent += amount;
            }
            Err(e) => log::warn!("Funding {} failed: {}", addr.address, e),
        }
    }

    if sent > Amount::ZERO {
        let confirmed = coordinator
            .new_address()
            .and_then(|a| mine_to(coordinator.rpc().as_ref(), policy.confirm_blocks, &a));
        if let Err(e) = confirmed {
            log::warn!("Confirming multisig funding failed: {}", e);
        }
    }

    log::info!(
        "[{}] Funded {} multisig addresses with {} each",
        coordinator.name(),
        addresses.iter().filter(|a| a.funded > Amount::ZERO).count(),
        amount
    );
    sent
}
