//! One retention sweep, meant to be run by an external scheduler (cron,
//! a Kubernetes CronJob and the like).

use anyhow::Context;
use chrono::Utc;
use custodian::Custodian;
use custodian_core::config::CustodianConfig;
use custodian_core::observability::init_tracing;

fn main() -> anyhow::Result<()> {
    // Load configuration - fail fast if invalid
    let config = CustodianConfig::load().context("failed to load configuration")?;

    init_tracing(&config.service_name, &config.log_level, config.log_format)
        .context("failed to initialise logging")?;

    let custodian = Custodian::init(&config).context("failed to initialise services")?;

    let now = Utc::now();
    tracing::info!(now = %now.to_rfc3339(), "Starting retention sweep");
    let result = custodian.compliance().enforce_retention(now);

    // Flush audit events of the sweep even when it failed part-way.
    custodian.shutdown();

    let report = result.context("retention sweep failed")?;
    for conflict in &report.conflicts {
        tracing::warn!(
            category = %conflict.category,
            policies = conflict.policy_ids.len(),
            "Category skipped until its retention policies agree"
        );
    }
    tracing::info!(
        deleted = report.deleted,
        anonymized = report.anonymized,
        audit_purged = report.audit_events_purged,
        held = report.skipped_held,
        "Retention sweep complete"
    );
    Ok(())
}
