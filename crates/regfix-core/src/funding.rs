//! Funding convergence
//!
//! Drives a wallet toward a minimum balance. Regtest coinbase outputs need 100
//! confirmations before they are spendable, so mining to a fresh wallet often
//! yields nothing usable. The engine therefore works through an ordered list
//! of [`FundingStep`]s and stops at the first one that reaches the threshold:
//!
//! 1. [`FundingStep::MineToWallet`]: mine to the wallet and poll its balance
//! 2. [`FundingStep::TransferFromSource`]: pay it from a long-lived source
//!    wallet ("miner") whose coinbase outputs have matured
//!
//! Whatever is left is reported as [`FundingOutcome::Partial`] or
//! [`FundingOutcome::Unfunded`]. Funding never fails the pipeline.

use crate::wallet::{ensure_wallet, mine_to, WalletContext};
use crate::FixtureError;
use bitcoin::Amount;
use std::time::Duration;

/// Bounded polling: `max_attempts` reads, `delay` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Same attempt count with no waiting (tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

/// One strategy in the funding chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingStep {
    /// Mine `bootstrap_blocks` to a fresh wallet address
    MineToWallet,
    /// Transfer `transfer_amount` from the source wallet
    TransferFromSource,
}

/// How to fund a wallet
#[derive(Debug, Clone)]
pub struct FundingPlan {
    /// Strategies, tried in order
    pub steps: Vec<FundingStep>,
    /// Blocks mined by [`FundingStep::MineToWallet`]
    pub bootstrap_blocks: u64,
    /// Blocks mined to the source wallet when it is short (coinbase maturity + 1)
    pub maturity_blocks: u64,
    /// Name of the funding-source wallet
    pub source_wallet: String,
    /// Source must hold more than this before it pays out
    pub source_safety_margin: Amount,
    /// Amount sent by [`FundingStep::TransferFromSource`]
    pub transfer_amount: Amount,
    /// Pause after mining before the first balance read
    pub settle_delay: Duration,
    /// Balance polling after each step
    pub retry: RetryPolicy,
}

impl Default for FundingPlan {
    fn default() -> Self {
        Self {
            steps: vec![FundingStep::MineToWallet, FundingStep::TransferFromSource],
            bootstrap_blocks: 50,
            maturity_blocks: 101,
            source_wallet: "miner".to_string(),
            source_safety_margin: Amount::from_int_btc(25),
            transfer_amount: Amount::from_int_btc(20),
            settle_delay: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of [`fund_wallet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingOutcome {
    /// Threshold reached
    Funded(Amount),
    /// Some balance, below threshold
    Partial(Amount),
    /// Nothing spendable
    Unfunded,
}

impl FundingOutcome {
    pub fn balance(&self) -> Amount {
        match self {
            Self::Funded(a) | Self::Partial(a) => *a,
            Self::Unfunded => Amount::ZERO,
        }
    }

    pub fn is_funded(&self) -> bool {
        matches!(self, Self::Funded(_))
    }

    fn classify(balance: Amount, threshold: Amount) -> Self {
        if balance >= threshold {
            Self::Funded(balance)
        } else if balance > Amount::ZERO {
            Self::Partial(balance)
        } else {
            Self::Unfunded
        }
    }
}

/// Bring `wallet` to at least `threshold`, best effort.
///
/// Never returns an error: failed steps are logged and the next step runs.
/// The reported balance is the highest one observed, so it never decreases
/// across steps.
pub async fn fund_wallet(
    wallet: &WalletContext,
    threshold: Amount,
    plan: &FundingPlan,
) -> FundingOutcome {
    let mut best = match wallet.balance() {
        Ok(b) => b,
        Err(e) => {
            log::warn!("[{}] Balance unavailable: {}", wallet.name(), e);
            Amount::ZERO
        }
    };

    if best >= threshold {
        log::info!(
            "[{}] Already funded ({} >= {})",
            wallet.name(),
            best,
            threshold
        );
        return FundingOutcome::Funded(best);
    }

    for step in &plan.steps {
        log::info!(
            "[{}] Funding via {:?} (balance {}, need {})",
            wallet.name(),
            step,
            best,
            threshold
        );
        let result = match step {
            FundingStep::MineToWallet => {
                mine_and_poll(wallet, plan.bootstrap_blocks, threshold, plan).await
            }
            FundingStep::TransferFromSource => transfer_from_source(wallet, threshold, plan).await,
        };

        match result {
            Ok(balance) => best = best.max(balance),
            Err(e) => log::warn!("[{}] {:?} failed: {}", wallet.name(), step, e),
        }

        if best >= threshold {
            log::info!("[{}] Funded: {}", wallet.name(), best);
            return FundingOutcome::Funded(best);
        }
    }

    if let Ok(balance) = wallet.balance() {
        best = best.max(balance);
    }

    let outcome = FundingOutcome::classify(best, threshold);
    if !outcome.is_funded() {
        log::warn!(
            "[{}] Funding incomplete: {} of {}, continuing with reduced funds",
            wallet.name(),
            best,
            threshold
        );
    }
    outcome
}

/// Mine `blocks` to a fresh address of `wallet`, then poll toward `threshold`.
async fn mine_and_poll(
    wallet: &WalletContext,
    blocks: u64,
    threshold: Amount,
    plan: &FundingPlan,
) -> Result<Amount, FixtureError> {
    let address = wallet.new_address()?;
    mine_to(wallet.rpc().as_ref(), blocks, &address)?;
    tokio::time::sleep(plan.settle_delay).await;
    Ok(poll_balance(wallet, threshold, plan.retry).await)
}

async fn transfer_from_source(
    wallet: &WalletContext,
    threshold: Amount,
    plan: &FundingPlan,
) -> Result<Amount, FixtureError> {
    let source = ensure_wallet(wallet.rpc(), &plan.source_wallet, false)?;

    let mut available = source.balance().unwrap_or(Amount::ZERO);
    if available <= plan.source_safety_margin {
        log::info!(
            "[{}] Source wallet short ({}), mining {} blocks",
            source.name(),
            available,
            plan.maturity_blocks
        );
        let above_margin = plan.source_safety_margin + Amount::ONE_SAT;
        let mined = mine_and_poll(&source, plan.maturity_blocks, above_margin, plan).await?;
        available = available.max(mined);
    }

    if available <= plan.source_safety_margin {
        log::warn!(
            "[{}] Source wallet has {} (margin {}), skipping transfer",
            source.name(),
            available,
            plan.source_safety_margin
        );
        return Ok(wallet.balance().unwrap_or(Amount::ZERO));
    }

    let target = wallet.new_address()?;
    let txid = source.send_to_address(&target, plan.transfer_amount)?;
    log::info!(
        "[{}] Transferred {} from '{}' ({})",
        wallet.name(),
        plan.transfer_amount,
        source.name(),
        txid
    );

    let confirm = source.new_address()?;
    mine_to(wallet.rpc().as_ref(), 1, &confirm)?;
    tokio::time::sleep(plan.settle_delay).await;
    Ok(poll_balance(wallet, threshold, plan.retry).await)
}

/// Read the balance until it reaches `threshold` or attempts run out.
///
/// Returns the highest balance seen; read errors count as no progress.
pub async fn poll_balance(wallet: &WalletContext, threshold: Amount, retry: RetryPolicy) -> Amount {
    let attempts = retry.max_attempts.max(1);
    let mut best = Amount::ZERO;

    for attempt in 1..=attempts {
        match wallet.balance() {
            Ok(balance) => {
                best = best.max(balance);
                if balance >= threshold {
                    return balance;
                }
            }
            Err(e) => log::debug!("[{}] balance poll {}: {}", wallet.name(), attempt, e),
        }
        if attempt < attempts {
            tokio::time::sleep(retry.delay).await;
        }
    }

    best
}
