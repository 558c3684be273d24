use async_trait::async_trait;
use thiserror::Error;

use crate::core::telemetry::TelemetryRecord;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TelemetryError {
    #[error("telemetry backend request failed: {0}")]
    Request(String),

    #[error("telemetry bulk call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("telemetry backend rejected {failed} of {total} documents")]
    Rejected { failed: usize, total: usize },
}

/// Port for the bulk-indexing telemetry backend.
#[async_trait]
pub trait BulkWriter: Send + Sync + 'static {
    /// Index one batch of records. Implementations bound the call with their own timeout.
    async fn bulk_index(&self, records: &[TelemetryRecord]) -> Result<(), TelemetryError>;
}
