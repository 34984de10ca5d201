//! One provisioning run: connect, provision the selected scenarios, report.

use crate::config::RegfixConfig;
use anyhow::{Context, Result};
use regfix_core::{Provisioner, Scenario, ScenarioStatus};
use regfix_rpc::{BitcoindRpc, NodeRpc, RpcAuth};
use std::path::Path;
use std::sync::Arc;

/// Provision `scenarios` (all of them when empty) against the configured node.
pub async fn run(config: &RegfixConfig, scenarios: &[Scenario], force: bool) -> Result<()> {
    log::info!("regfix starting…");
    log::info!("  Node:       {}", config.node_url());
    log::info!("  Output dir: {}", config.provision.output_dir.display());
    log::info!(
        "  Quorum:     {}-of-{}",
        config.provision.threshold,
        config.provision.signers
    );
    if let Some(seed) = config.provision.seed {
        log::info!("  Seed:       {}", seed);
    }

    let rpc: Arc<dyn NodeRpc> = Arc::new(BitcoindRpc::new(
        config.node.host.clone(),
        config.node.port,
        RpcAuth::new(config.node.user.clone(), config.node.password.clone()),
    ));

    let statuses = provision(rpc, config, scenarios, force).await?;
    for line in summarize(&statuses) {
        log::info!("{}", line);
    }
    Ok(())
}

/// Provision through an existing node handle.
pub async fn provision(
    rpc: Arc<dyn NodeRpc>,
    config: &RegfixConfig,
    scenarios: &[Scenario],
    force: bool,
) -> Result<Vec<ScenarioStatus>> {
    let provision_config = config.provision_config(force)?;
    let mut provisioner = Provisioner::new(rpc, provision_config);

    let statuses = if scenarios.is_empty() {
        provisioner.run_all().await
    } else {
        provisioner.run_selected(scenarios).await
    };
    statuses.context("Provisioning failed")
}

/// One line per scenario for the end-of-run report.
pub fn summarize(statuses: &[ScenarioStatus]) -> Vec<String> {
    statuses
        .iter()
        .map(|status| match status {
            ScenarioStatus::Skipped { scenario, path } => {
                format!("{:<13} skipped      {}", scenario, path.display())
            }
            ScenarioStatus::Provisioned(run) => {
                let mut notes = Vec::new();
                if run.report.degraded {
                    notes.push("degraded pattern");
                }
                if run.funding.iter().any(|f| !f.is_funded()) {
                    notes.push("underfunded");
                }
                if run.document.key_fidelity == regfix_core::KeyFidelity::Placeholder {
                    notes.push("placeholder keys");
                }
                format!(
                    "{:<13} provisioned  {} ({} payments{}{})",
                    run.scenario,
                    run.path.display(),
                    run.report.payments.len(),
                    if notes.is_empty() { "" } else { ", " },
                    notes.join(", ")
                )
            }
        })
        .collect()
}

/// Fixture status of every scenario, without contacting the node.
pub fn list(output_dir: &Path) -> Vec<(Scenario, bool)> {
    Scenario::ALL
        .into_iter()
        .map(|s| {
            let path = regfix_core::fixture::fixture_path(output_dir, s.slug());
            (s, path.exists())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use regfix_core::test_utils::MockNode;

    fn quiet_config(dir: &Path) -> RegfixConfig {
        let mut config = RegfixConfig::default();
        config.provision.output_dir = dir.to_path_buf();
        config.provision.seed = Some(1);
        config.provision.pacing_ms = 0;
        config.provision.max_jitter_ms = 0;
        config.funding.poll_interval_ms = 0;
        config.funding.poll_attempts = 2;
        config
    }

    #[tokio::test]
    async fn test_selected_scenarios_only() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(MockNode::new());
        let config = quiet_config(dir.path());

        let statuses = provision(node.clone(), &config, &[Scenario::GoodPrivacy], false)
            .await
            .unwrap();

        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].scenario(), Scenario::GoodPrivacy);
        let listed = list(dir.path());
        assert_eq!(
            listed,
            vec![
                (Scenario::BadPrivacy, false),
                (Scenario::BadWaste, false),
                (Scenario::GoodPrivacy, true),
                (Scenario::GoodWaste, false),
            ]
        );
    }

    #[tokio::test]
    async fn test_summary_marks_skips() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(MockNode::new());
        let config = quiet_config(dir.path());

        provision(node.clone(), &config, &[Scenario::BadWaste], false)
            .await
            .unwrap();
        let statuses = provision(node, &config, &[Scenario::BadWaste], false)
            .await
            .unwrap();

        let lines = summarize(&statuses);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("bad_waste"));
        assert!(lines[0].contains("skipped"));
    }

    #[tokio::test]
    async fn test_unreachable_node_errors() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(MockNode::new());
        node.fail_method("getblockchaininfo", -28, "Verifying blocks...");
        let config = quiet_config(dir.path());

        let err = provision(node, &config, &[], false).await.unwrap_err();
        assert!(format!("{:#}", err).contains("unreachable"));
    }
}
