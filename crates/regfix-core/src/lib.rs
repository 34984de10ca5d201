//! regfix Core
//!
//! Provisions multisig wallet fixtures on a regtest node and exports them as
//! Caravan-style wallet configuration documents.
//!
//! # Pipeline
//!
//! For each [`Scenario`]:
//!
//! 1. Create or load two signer wallets ([`wallet::ensure_wallet`])
//! 2. Fund them to a threshold ([`funding::fund_wallet`])
//! 3. Extract xpub / fingerprint / path ([`keys::extract_keys`])
//! 4. Build 2-of-2 addresses and a watch-only watcher ([`multisig`])
//! 5. Emit the scenario's transaction pattern ([`patterns`])
//! 6. Write the fixture document ([`fixture`])
//!
//! The fixture file doubles as the idempotency marker: [`Provisioner::run_all`]
//! skips any scenario whose document already exists.
//!
//! # Example
//!
//! ```ignore
//! use regfix_core::{ProvisionConfig, Provisioner};
//! use regfix_rpc::{BitcoindRpc, RpcAuth};
//! use std::sync::Arc;
//!
//! let rpc = Arc::new(BitcoindRpc::new("127.0.0.1", 18443, RpcAuth::new("user", "pass")));
//! let mut provisioner = Provisioner::new(rpc, ProvisionConfig::default());
//! let statuses = provisioner.run_all().await?;
//! ```

pub mod fixture;
pub mod funding;
pub mod keys;
pub mod multisig;
pub mod patterns;
pub mod scenario;
pub mod wallet;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use fixture::FixtureDocument;
pub use funding::{FundingOutcome, FundingPlan, FundingStep, RetryPolicy};
pub use keys::{KeyFidelity, Signer};
pub use multisig::{MultisigAddress, MultisigSet, WatcherWallet};
pub use patterns::{PatternConfig, PatternReport, Payment};
pub use scenario::{ProvisionConfig, Provisioner, Scenario, ScenarioStatus};
pub use wallet::WalletContext;

use thiserror::Error;

/// Errors that abort provisioning
#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("Node unreachable at {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: regfix_rpc::Error,
    },

    #[error("Wallet '{wallet}': {source}")]
    Wallet {
        wallet: String,
        #[source]
        source: regfix_rpc::Error,
    },

    #[error("RPC error: {0}")]
    Rpc(#[from] regfix_rpc::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid signer set: {0}")]
    InvalidSigners(String),

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),
}
