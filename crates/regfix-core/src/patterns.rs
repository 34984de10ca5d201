//! Transaction pattern generators
//!
//! Each scenario pays out of the coordinator wallet in a characteristic
//! shape that wallet-health tooling should recognise:
//!
//! | Pattern      | Shape                                                         |
//! |--------------|---------------------------------------------------------------|
//! | bad privacy  | one address paid 8 times, round amounts (1, 2, 5 BTC)         |
//! | bad waste    | 20 dust outputs in one batch, fee-heavy and tiny payments     |
//! | good privacy | fresh address per payment, odd amounts, jittered timing       |
//! | good waste   | few well-sized payments, one batch, cheap consolidations      |
//!
//! Generators check the coordinator balance first. When it is below what the
//! pattern needs they fall back to a few minimal payments instead of failing.
//! A single rejected send is logged and skipped.
//!
//! Bad privacy pays out more than its entry threshold, so once the threshold
//! is met the coordinator is topped up through [`fund_wallet`] to the full
//! pattern cost before the first send.

use crate::funding::{fund_wallet, FundingPlan};
use crate::multisig::WatcherWallet;
use crate::wallet::{mine_to, WalletContext};
use crate::FixtureError;
use bitcoin::Amount;
use rand::rngs::StdRng;
use rand::Rng;
use regfix_rpc::{Error as RpcError, NodeRpc, NodeRpcExt};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Dust output value (the classic 546 sat relay threshold)
pub const DUST_OUTPUT: Amount = Amount::from_sat(546);

/// Amounts used by the bad-privacy round-number payments
const ROUND_AMOUNTS_BTC: [u64; 3] = [1, 2, 5];

/// Reused-address payment of the bad-privacy pattern, sent 8 times
const REUSED_PAYMENT: Amount = Amount::from_sat(50_000_000);

/// 8 x 0.5 BTC plus 1, 2 and 5 BTC
pub const BAD_PRIVACY_COST: Amount = Amount::from_sat(1_200_000_000);

/// Fee allowance on top of a pattern's payments
pub const FEE_HEADROOM: Amount = Amount::from_sat(1_000_000);

/// Knobs shared by all generators
#[derive(Debug, Clone)]
pub struct PatternConfig {
    /// Blocks mined after the pattern
    pub confirm_blocks: u64,
    /// Value of each payment in degraded mode
    pub minimal_payment: Amount,
    /// Number of payments in degraded mode
    pub degraded_payments: usize,
    /// Pause after each send
    pub pacing: Duration,
    /// Upper bound of the random pause used by good privacy
    pub max_jitter: Duration,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            confirm_blocks: 6,
            minimal_payment: Amount::from_sat(10_000),
            degraded_payments: 3,
            pacing: Duration::from_millis(200),
            max_jitter: Duration::from_secs(3),
        }
    }
}

/// One output paid by a generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub address: String,
    pub amount: Amount,
    /// `None` if the node rejected the send
    pub txid: Option<String>,
    /// Part of a multi-output `sendmany`
    pub batched: bool,
}

/// What a generator did
#[derive(Debug, Clone, Default)]
pub struct PatternReport {
    pub payments: Vec<Payment>,
    /// Fell back to minimal payments
    pub degraded: bool,
}

impl PatternReport {
    /// Payments the node accepted
    pub fn confirmed(&self) -> impl Iterator<Item = &Payment> {
        self.payments.iter().filter(|p| p.txid.is_some())
    }

    pub fn distinct_addresses(&self) -> usize {
        self.payments
            .iter()
            .map(|p| p.address.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Highest number of payments any single address received
    pub fn max_address_reuse(&self) -> usize {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for p in &self.payments {
            *counts.entry(p.address.as_str()).or_default() += 1;
        }
        counts.into_values().max().unwrap_or(0)
    }

    pub fn total(&self) -> Amount {
        self.confirmed().map(|p| p.amount).sum()
    }
}

/// Receiving addresses for pattern payments.
///
/// Addresses are derived from the watcher's imported descriptor at increasing
/// indexes, so payments land on the quorum being exported. If the watcher has
/// no descriptor, or derivation fails, the fallback wallet hands out fresh
/// addresses instead.
pub struct Destinations {
    rpc: Arc<dyn NodeRpc>,
    descriptor: Option<String>,
    next_index: u32,
    fallback: WalletContext,
}

impl Destinations {
    pub fn new(watcher: &WatcherWallet, fallback: WalletContext) -> Self {
        Self {
            rpc: fallback.rpc().clone(),
            descriptor: watcher.imported.clone(),
            next_index: 0,
            fallback,
        }
    }

    /// Fresh addresses from `wallet` only.
    pub fn from_wallet(wallet: WalletContext) -> Self {
        Self {
            rpc: wallet.rpc().clone(),
            descriptor: None,
            next_index: 0,
            fallback: wallet,
        }
    }

    pub fn next_address(&mut self) -> Result<String, RpcError> {
        if let Some(descriptor) = &self.descriptor {
            let index = self.next_index;
            let derived: Result<Vec<String>, RpcError> = self.rpc.call_as(
                None,
                "deriveaddresses",
                &[json!(descriptor), json!([index, index])],
            );
            match derived.map(|addrs| addrs.into_iter().next()) {
                Ok(Some(address)) => {
                    self.next_index += 1;
                    return Ok(address);
                }
                Ok(None) => log::warn!("deriveaddresses returned nothing at index {}", index),
                Err(e) => log::warn!("Deriving watcher address {} failed: {}", index, e),
            }
            self.descriptor = None;
        }
        self.fallback.new_address()
    }
}

/// Sends payments and records them in a report.
struct Emitter<'a> {
    wallet: &'a WalletContext,
    config: &'a PatternConfig,
    report: PatternReport,
}

impl<'a> Emitter<'a> {
    fn new(wallet: &'a WalletContext, config: &'a PatternConfig) -> Self {
        Self {
            wallet,
            config,
            report: PatternReport::default(),
        }
    }

    async fn pay(&mut self, address: String, amount: Amount) {
        let result = self.wallet.send_to_address(&address, amount);
        self.record(address, amount, result);
        self.pause(self.config.pacing).await;
    }

    async fn pay_at_fee_rate(&mut self, address: String, amount: Amount, sat_per_vb: u64) {
        let result = self.wallet.send_with_fee_rate(&address, amount, sat_per_vb);
        self.record(address, amount, result);
        self.pause(self.config.pacing).await;
    }

    async fn pay_batch(&mut self, outputs: BTreeMap<String, Amount>) {
        let result = self.wallet.send_many(&outputs);
        let txid = match result {
            Ok(txid) => Some(txid),
            Err(e) => {
                log::warn!(
                    "[{}] Batch of {} outputs rejected: {}",
                    self.wallet.name(),
                    outputs.len(),
                    e
                );
                None
            }
        };
        for (address, amount) in outputs {
            self.report.payments.push(Payment {
                address,
                amount,
                txid: txid.clone(),
                batched: true,
            });
        }
        self.pause(self.config.pacing).await;
    }

    fn record(&mut self, address: String, amount: Amount, result: Result<String, RpcError>) {
        let txid = match result {
            Ok(txid) => Some(txid),
            Err(e) => {
                log::warn!(
                    "[{}] Payment of {} to {} rejected: {}",
                    self.wallet.name(),
                    amount,
                    address,
                    e
                );
                None
            }
        };
        self.report.payments.push(Payment {
            address,
            amount,
            txid,
            batched: false,
        });
    }

    async fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Minimal-value fallback. `reuse` keeps paying the same address.
    async fn degrade(&mut self, dest: &mut Destinations, reuse: bool) -> Result<(), RpcError> {
        self.report.degraded = true;
        log::warn!(
            "[{}] Insufficient balance, sending {} minimal payments",
            self.wallet.name(),
            self.config.degraded_payments
        );
        let mut fixed = None;
        for _ in 0..self.config.degraded_payments {
            let address = match (&fixed, reuse) {
                (Some(a), true) => String::clone(a),
                _ => dest.next_address()?,
            };
            if reuse {
                fixed = Some(address.clone());
            }
            self.pay(address, self.config.minimal_payment).await;
        }
        Ok(())
    }

    /// Mine the confirmation batch and hand back the report.
    fn finish(self) -> PatternReport {
        let mined = self
            .wallet
            .new_address()
            .and_then(|a| mine_to(self.wallet.rpc().as_ref(), self.config.confirm_blocks, &a));
        if let Err(e) = mined {
            log::warn!("[{}] Confirmation mining failed: {}", self.wallet.name(), e);
        }
        log::info!(
            "[{}] Pattern complete: {} payments ({} accepted), total {}",
            self.wallet.name(),
            self.report.payments.len(),
            self.report.confirmed().count(),
            self.report.total()
        );
        self.report
    }
}

fn available(wallet: &WalletContext) -> Amount {
    wallet.balance().unwrap_or_else(|e| {
        log::warn!("[{}] Balance unavailable: {}", wallet.name(), e);
        Amount::ZERO
    })
}

/// Random amount in `[lo, hi)` satoshis that is not a multiple of 0.001 BTC.
fn odd_amount(rng: &mut StdRng, lo: u64, hi: u64) -> Amount {
    let mut sats = rng.gen_range(lo..hi);
    if sats % 100_000 == 0 {
        sats += 1_337;
    }
    Amount::from_sat(sats)
}

/// Address reuse and round amounts.
///
/// Requires 5 BTC to start. `funding` then brings the coordinator up to
/// [`BAD_PRIVACY_COST`] plus fees; if that falls short the sends that no
/// longer fit are recorded as rejected.
pub async fn bad_privacy(
    coordinator: &WalletContext,
    dest: &mut Destinations,
    funding: &FundingPlan,
    config: &PatternConfig,
) -> Result<PatternReport, FixtureError> {
    let mut emitter = Emitter::new(coordinator, config);

    if available(coordinator) < Amount::from_int_btc(5) {
        emitter.degrade(dest, true).await?;
        return Ok(emitter.finish());
    }

    let outcome = fund_wallet(coordinator, BAD_PRIVACY_COST + FEE_HEADROOM, funding).await;
    if !outcome.is_funded() {
        log::warn!(
            "[{}] Only {} available, some round-number payments will be rejected",
            coordinator.name(),
            outcome.balance()
        );
    }

    let reused = dest.next_address()?;
    log::info!("[{}] Paying {} 8 times", coordinator.name(), reused);
    for _ in 0..8 {
        emitter.pay(reused.clone(), REUSED_PAYMENT).await;
    }

    for btc in ROUND_AMOUNTS_BTC {
        let address = dest.next_address()?;
        emitter.pay(address, Amount::from_int_btc(btc)).await;
    }

    Ok(emitter.finish())
}

/// Dust, overpaid fees and many tiny payments.
pub async fn bad_waste(
    coordinator: &WalletContext,
    dest: &mut Destinations,
    rng: &mut StdRng,
    config: &PatternConfig,
) -> Result<PatternReport, FixtureError> {
    let mut emitter = Emitter::new(coordinator, config);

    if available(coordinator) < Amount::from_int_btc(1) {
        emitter.degrade(dest, false).await?;
        return Ok(emitter.finish());
    }

    let mut dust = BTreeMap::new();
    for _ in 0..20 {
        dust.insert(dest.next_address()?, DUST_OUTPUT);
    }
    emitter.pay_batch(dust).await;

    for _ in 0..5 {
        let address = dest.next_address()?;
        emitter
            .pay_at_fee_rate(address, Amount::from_sat(10_000), 50)
            .await;
    }

    for _ in 0..15 {
        let address = dest.next_address()?;
        let amount = Amount::from_sat(rng.gen_range(10_000..100_000));
        emitter.pay(address, amount).await;
    }

    Ok(emitter.finish())
}

/// Fresh addresses, odd amounts, jittered timing.
pub async fn good_privacy(
    coordinator: &WalletContext,
    dest: &mut Destinations,
    rng: &mut StdRng,
    config: &PatternConfig,
) -> Result<PatternReport, FixtureError> {
    let mut emitter = Emitter::new(coordinator, config);

    if available(coordinator) < Amount::from_int_btc(3) {
        emitter.degrade(dest, false).await?;
        return Ok(emitter.finish());
    }

    let max_jitter_ms = config.max_jitter.as_millis() as u64;
    for _ in 0..10 {
        let address = dest.next_address()?;
        let amount = odd_amount(rng, 1_000_000, 25_000_000);
        emitter.pay(address, amount).await;

        let jitter = Duration::from_millis(rng.gen_range(0..=max_jitter_ms));
        emitter.pause(jitter).await;
    }

    Ok(emitter.finish())
}

/// Well-sized payments, one batch, low-fee consolidation-style sends.
pub async fn good_waste(
    coordinator: &WalletContext,
    dest: &mut Destinations,
    rng: &mut StdRng,
    config: &PatternConfig,
) -> Result<PatternReport, FixtureError> {
    let mut emitter = Emitter::new(coordinator, config);

    if available(coordinator) < Amount::from_int_btc(3) {
        emitter.degrade(dest, false).await?;
        return Ok(emitter.finish());
    }

    for _ in 0..3 {
        let address = dest.next_address()?;
        let amount = Amount::from_sat(rng.gen_range(20_000_000..40_000_000));
        emitter.pay(address, amount).await;
    }

    let mut batch = BTreeMap::new();
    for _ in 0..5 {
        batch.insert(
            dest.next_address()?,
            Amount::from_sat(rng.gen_range(5_000_000..10_000_000)),
        );
    }
    emitter.pay_batch(batch).await;

    for _ in 0..2 {
        let address = dest.next_address()?;
        let amount = Amount::from_sat(rng.gen_range(40_000_000..60_000_000));
        emitter.pay_at_fee_rate(address, amount, 1).await;
    }

    Ok(emitter.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funding::RetryPolicy;
    use crate::test_utils::MockNode;
    use crate::wallet::ensure_wallet;
    use rand::SeedableRng;

    fn quiet() -> PatternConfig {
        PatternConfig {
            pacing: Duration::ZERO,
            max_jitter: Duration::ZERO,
            ..PatternConfig::default()
        }
    }

    fn funding() -> FundingPlan {
        FundingPlan {
            settle_delay: Duration::ZERO,
            retry: RetryPolicy::immediate(2),
            ..FundingPlan::default()
        }
    }

    fn setup(balance_btc: u64) -> (Arc<MockNode>, WalletContext, Destinations) {
        let node = Arc::new(MockNode::new());
        let rpc: Arc<dyn NodeRpc> = node.clone();
        let coordinator = ensure_wallet(&rpc, "coordinator", false).unwrap();
        let cosigner = ensure_wallet(&rpc, "cosigner", false).unwrap();
        node.set_balance("coordinator", Amount::from_int_btc(balance_btc));
        (node, coordinator, Destinations::from_wallet(cosigner))
    }

    #[tokio::test]
    async fn test_bad_privacy_shape() {
        let (node, coordinator, mut dest) = setup(20);

        let report = bad_privacy(&coordinator, &mut dest, &funding(), &quiet())
            .await
            .unwrap();
        assert!(!report.degraded);
        assert_eq!(report.payments.len(), 11);

        let reused = &report.payments[0].address;
        let half = Amount::from_sat(50_000_000);
        assert!(report.payments[..8]
            .iter()
            .all(|p| &p.address == reused && p.amount == half));

        let round: Vec<Amount> = report.payments[8..].iter().map(|p| p.amount).collect();
        assert_eq!(
            round,
            vec![
                Amount::from_int_btc(1),
                Amount::from_int_btc(2),
                Amount::from_int_btc(5)
            ]
        );
        let fresh: BTreeSet<&str> = report.payments[8..]
            .iter()
            .map(|p| p.address.as_str())
            .collect();
        assert_eq!(fresh.len(), 3);
        assert!(!fresh.contains(reused.as_str()));

        assert!(report.max_address_reuse() > 1);
        assert_eq!(node.count_calls("sendtoaddress"), 11);
        assert_eq!(node.count_calls("generatetoaddress"), 1);
    }

    #[tokio::test]
    async fn test_good_privacy_fresh_addresses() {
        let (_node, coordinator, mut dest) = setup(20);
        let mut rng = StdRng::seed_from_u64(7);

        let report = good_privacy(&coordinator, &mut dest, &mut rng, &quiet())
            .await
            .unwrap();
        assert_eq!(report.payments.len(), 10);
        assert_eq!(report.distinct_addresses(), 10);
        assert_eq!(report.max_address_reuse(), 1);
        assert!(report
            .payments
            .iter()
            .all(|p| p.amount.to_sat() % 100_000 != 0));
    }

    #[tokio::test]
    async fn test_good_privacy_degrades_when_empty() {
        let (node, coordinator, mut dest) = setup(0);
        let mut rng = StdRng::seed_from_u64(7);

        let report = good_privacy(&coordinator, &mut dest, &mut rng, &quiet())
            .await
            .unwrap();
        assert!(report.degraded);
        assert_eq!(report.payments.len(), 3);
        assert!(report
            .payments
            .iter()
            .all(|p| p.amount == quiet().minimal_payment));
        assert_eq!(node.count_calls("sendtoaddress"), 3);
    }

    #[tokio::test]
    async fn test_bad_privacy_degrades_with_reuse() {
        let (_node, coordinator, mut dest) = setup(1);

        let report = bad_privacy(&coordinator, &mut dest, &funding(), &quiet())
            .await
            .unwrap();
        assert!(report.degraded);
        assert_eq!(report.payments.len(), 3);
        assert_eq!(report.distinct_addresses(), 1);
    }

    #[tokio::test]
    async fn test_bad_waste_dust_batch() {
        let (node, coordinator, mut dest) = setup(20);
        let mut rng = StdRng::seed_from_u64(1);

        let report = bad_waste(&coordinator, &mut dest, &mut rng, &quiet())
            .await
            .unwrap();
        let dust: Vec<&Payment> = report.payments.iter().filter(|p| p.batched).collect();
        assert_eq!(dust.len(), 20);
        assert!(dust.iter().all(|p| p.amount == DUST_OUTPUT));
        assert_eq!(node.count_calls("sendmany"), 1);
        assert_eq!(node.count_calls("sendtoaddress"), 20);
    }

    #[tokio::test]
    async fn test_good_waste_batches_once() {
        let (node, coordinator, mut dest) = setup(20);
        let mut rng = StdRng::seed_from_u64(3);

        let report = good_waste(&coordinator, &mut dest, &mut rng, &quiet())
            .await
            .unwrap();
        assert_eq!(report.payments.len(), 10);
        assert_eq!(report.payments.iter().filter(|p| p.batched).count(), 5);
        assert_eq!(node.count_calls("sendmany"), 1);
        assert!(!report.degraded);
    }

    #[tokio::test]
    async fn test_seeded_rng_is_reproducible() {
        let run = |seed| async move {
            let (_node, coordinator, mut dest) = setup(20);
            let mut rng = StdRng::seed_from_u64(seed);
            good_privacy(&coordinator, &mut dest, &mut rng, &quiet())
                .await
                .unwrap()
                .payments
                .into_iter()
                .map(|p| p.amount)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42).await, run(42).await);
        assert_ne!(run(42).await, run(43).await);
    }

    #[tokio::test]
    async fn test_rejected_send_is_recorded_not_fatal() {
        let (node, coordinator, mut dest) = setup(20);
        node.fail_method("sendtoaddress", -26, "min relay fee not met");

        let report = bad_privacy(&coordinator, &mut dest, &funding(), &quiet())
            .await
            .unwrap();
        assert_eq!(report.payments.len(), 11);
        assert_eq!(report.confirmed().count(), 0);
        assert!(!report.degraded);
    }

    #[tokio::test]
    async fn test_bad_privacy_tops_up_at_threshold() {
        let (node, coordinator, mut dest) = setup(5);

        let report = bad_privacy(&coordinator, &mut dest, &funding(), &quiet())
            .await
            .unwrap();
        assert!(!report.degraded);
        assert_eq!(report.payments.len(), 11);
        assert_eq!(report.confirmed().count(), 11);
        assert_eq!(report.total(), BAD_PRIVACY_COST);
        // top-up mining plus the confirmation batch
        assert_eq!(node.count_calls("generatetoaddress"), 2);
    }

    #[tokio::test]
    async fn test_round_payments_rejected_without_top_up() {
        let (_node, coordinator, mut dest) = setup(6);
        let no_steps = FundingPlan {
            steps: Vec::new(),
            ..funding()
        };

        // 8 * 0.5 + 1 fit, the 2 and 5 BTC payments do not
        let report = bad_privacy(&coordinator, &mut dest, &no_steps, &quiet())
            .await
            .unwrap();
        assert_eq!(report.payments.len(), 11);
        assert_eq!(report.confirmed().count(), 9);
        assert!(report.payments[9..].iter().all(|p| p.txid.is_none()));
    }

    #[tokio::test]
    async fn test_bad_waste_degrades_to_fresh_addresses() {
        let (node, coordinator, mut dest) = setup(0);
        let mut rng = StdRng::seed_from_u64(1);

        let report = bad_waste(&coordinator, &mut dest, &mut rng, &quiet())
            .await
            .unwrap();
        assert!(report.degraded);
        assert_eq!(report.payments.len(), 3);
        assert_eq!(report.distinct_addresses(), 3);
        assert!(report
            .payments
            .iter()
            .all(|p| p.amount == quiet().minimal_payment && !p.batched));
        assert_eq!(node.count_calls("sendmany"), 0);
    }

    #[tokio::test]
    async fn test_good_waste_degrades_below_requirement() {
        let (node, coordinator, mut dest) = setup(2);
        let mut rng = StdRng::seed_from_u64(3);

        let report = good_waste(&coordinator, &mut dest, &mut rng, &quiet())
            .await
            .unwrap();
        assert!(report.degraded);
        assert_eq!(report.payments.len(), 3);
        assert_eq!(report.confirmed().count(), 3);
        assert_eq!(node.count_calls("sendmany"), 0);
        assert_eq!(node.count_calls("sendtoaddress"), 3);
    }

    fn watcher(node: &Arc<MockNode>, descriptor: &str) -> WatcherWallet {
        let rpc: Arc<dyn NodeRpc> = node.clone();
        WatcherWallet {
            wallet: ensure_wallet(&rpc, "watcher", true).unwrap(),
            descriptor: descriptor.to_string(),
            imported: Some(format!("{}#00000000", descriptor)),
        }
    }

    #[test]
    fn test_destinations_derive_from_watcher() {
        let (node, _coordinator, _) = setup(0);
        let rpc: Arc<dyn NodeRpc> = node.clone();
        let cosigner = ensure_wallet(&rpc, "cosigner", false).unwrap();
        let quorum = watcher(&node, "wsh(sortedmulti(2,a/0/*,b/0/*))");
        let mut dest = Destinations::new(&quorum, cosigner);

        let addrs: Vec<String> = (0..4).map(|_| dest.next_address().unwrap()).collect();
        assert!(addrs.iter().all(|a| a.starts_with("bcrt1qderived")));
        assert_eq!(addrs.iter().collect::<BTreeSet<_>>().len(), 4);
        assert_eq!(node.count_calls("deriveaddresses"), 4);
        assert_eq!(node.count_calls("getnewaddress"), 0);
    }

    #[test]
    fn test_destinations_fall_back_to_cosigner() {
        let (node, _coordinator, _) = setup(0);
        let rpc: Arc<dyn NodeRpc> = node.clone();
        let cosigner = ensure_wallet(&rpc, "cosigner", false).unwrap();
        let quorum = watcher(&node, "wsh(sortedmulti(2,a/0/*,b/0/*))");
        let mut dest = Destinations::new(&quorum, cosigner);
        node.fail_method("deriveaddresses", -5, "Invalid descriptor");

        let addrs: Vec<String> = (0..10).map(|_| dest.next_address().unwrap()).collect();
        assert_eq!(addrs.iter().collect::<BTreeSet<_>>().len(), 10);
        assert!(addrs.iter().all(|a| a.starts_with("bcrt1qmock")));
        // the descriptor is dropped after the first failure
        assert_eq!(node.count_calls("deriveaddresses"), 1);
        assert_eq!(node.count_calls("getnewaddress"), 10);
    }
}
