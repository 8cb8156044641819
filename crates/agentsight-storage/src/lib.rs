// Storage adapters for the AgentSight pipeline
//
// Two external stores sit behind this crate:
// - the columnar analytics store (ClickHouse over HTTP) holding spans,
//   security alerts and cost metrics
// - the relational metadata store (Postgres via sqlx) that backs the
//   API-key directory

pub mod clickhouse;
pub mod columnar;
pub mod keydir;
pub mod memory;
pub mod rows;

pub use clickhouse::ClickHouseStore;
pub use columnar::{ColumnarStore, StorageError};
pub use keydir::{
    hash_key_verifier, is_valid_key_format, KeyDirError, KeyDirectory, PgProjectKeyStore,
    ProjectKey, ProjectKeyStore, StaticProjectKeyStore,
};
pub use memory::MemoryColumnarStore;
pub use rows::{AlertRow, CostMetricRow, SpanRow};
