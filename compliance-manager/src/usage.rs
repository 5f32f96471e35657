use crate::document::ComplianceDocument;
use arc_swap::ArcSwap;
use key_vault::UsageReporter;
use std::sync::Arc;

/// Counts persisted blobs per vault key so rotated keys are not retired
/// while compliance data still depends on them.
pub(crate) struct RecordsUsage {
    pub snapshot: Arc<ArcSwap<ComplianceDocument>>,
}

impl UsageReporter for RecordsUsage {
    fn name(&self) -> &str {
        "compliance-manager"
    }

    fn outstanding(&self, key_id: &str) -> usize {
        self.snapshot.load().sealed_under(key_id)
    }
}
