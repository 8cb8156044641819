// Columnar store contract

use async_trait::async_trait;

use crate::rows::{AlertRow, CostMetricRow, SpanRow};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The store cannot be reached or rejected the request; callers keep
    /// their buffers and retry.
    #[error("columnar store unavailable: {0}")]
    Unavailable(String),
    #[error("row serialization failed: {0}")]
    Serialization(String),
}

/// Bulk-insert interface over the three analytics tables.
///
/// Inserts are atomic per call as far as the backing store allows; a
/// returned error means the caller may retry the whole batch (the store's
/// ordering key permits query-time deduplication of any partial write).
#[async_trait]
pub trait ColumnarStore: Send + Sync {
    async fn insert_spans(&self, rows: &[SpanRow]) -> Result<(), StorageError>;
    async fn insert_alerts(&self, rows: &[AlertRow]) -> Result<(), StorageError>;
    async fn insert_cost_metrics(&self, rows: &[CostMetricRow]) -> Result<(), StorageError>;
}
