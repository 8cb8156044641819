// In-memory columnar store
//
// Backs worker and ingress tests: rows land in Vecs, and inserts can be
// switched to fail to exercise the retry paths.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::columnar::{ColumnarStore, StorageError};
use crate::rows::{AlertRow, CostMetricRow, SpanRow};

/// In-memory [`ColumnarStore`] implementation.
#[derive(Default)]
pub struct MemoryColumnarStore {
    spans: Mutex<Vec<SpanRow>>,
    alerts: Mutex<Vec<AlertRow>>,
    cost_metrics: Mutex<Vec<CostMetricRow>>,
    failing: AtomicBool,
}

impl MemoryColumnarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, every insert fails with `Unavailable` until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("store offline".to_string()))
        } else {
            Ok(())
        }
    }

    pub async fn spans(&self) -> Vec<SpanRow> {
        self.spans.lock().await.clone()
    }

    pub async fn alerts(&self) -> Vec<AlertRow> {
        self.alerts.lock().await.clone()
    }

    pub async fn cost_metrics(&self) -> Vec<CostMetricRow> {
        self.cost_metrics.lock().await.clone()
    }
}

#[async_trait]
impl ColumnarStore for MemoryColumnarStore {
    async fn insert_spans(&self, rows: &[SpanRow]) -> Result<(), StorageError> {
        self.check()?;
        self.spans.lock().await.extend_from_slice(rows);
        Ok(())
    }

    async fn insert_alerts(&self, rows: &[AlertRow]) -> Result<(), StorageError> {
        self.check()?;
        self.alerts.lock().await.extend_from_slice(rows);
        Ok(())
    }

    async fn insert_cost_metrics(&self, rows: &[CostMetricRow]) -> Result<(), StorageError> {
        self.check()?;
        self.cost_metrics.lock().await.extend_from_slice(rows);
        Ok(())
    }
}
