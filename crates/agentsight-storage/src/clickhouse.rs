// ClickHouse adapter
//
// Inserts go over the HTTP interface as JSONEachRow batches: one POST per
// flush, newline-delimited rows in the body. Query responsibilities stay
// with the API tier; this adapter only writes.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error};

use crate::columnar::{ColumnarStore, StorageError};
use crate::rows::{AlertRow, CostMetricRow, SpanRow};

const SPANS_TABLE: &str = "spans";
const ALERTS_TABLE: &str = "security_alerts";
const COST_TABLE: &str = "cost_metrics";

/// ClickHouse [`ColumnarStore`] over the HTTP interface.
pub struct ClickHouseStore {
    client: Client,
    base_url: String,
}

impl ClickHouseStore {
    pub fn new(base_url: &str) -> Result<Self, StorageError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn insert<T: Serialize>(&self, table: &str, rows: &[T]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for row in rows {
            let line = serde_json::to_string(row)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            body.push_str(&line);
            body.push('\n');
        }

        let response = self
            .client
            .post(&self.base_url)
            .query(&[("query", format!("INSERT INTO {table} FORMAT JSONEachRow"))])
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            error!(table, status = %status, detail = %detail, "columnar insert failed");
            return Err(StorageError::Unavailable(format!("HTTP {status}: {detail}")));
        }

        debug!(table, rows = rows.len(), "columnar insert complete");
        Ok(())
    }
}

#[async_trait]
impl ColumnarStore for ClickHouseStore {
    async fn insert_spans(&self, rows: &[SpanRow]) -> Result<(), StorageError> {
        self.insert(SPANS_TABLE, rows).await
    }

    async fn insert_alerts(&self, rows: &[AlertRow]) -> Result<(), StorageError> {
        self.insert(ALERTS_TABLE, rows).await
    }

    async fn insert_cost_metrics(&self, rows: &[CostMetricRow]) -> Result<(), StorageError> {
        self.insert(COST_TABLE, rows).await
    }
}
