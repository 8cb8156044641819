// Stream workers for the AgentSight pipeline
//
// Three independent consumer groups read `spans.ingest`:
// - PersistenceWriter batches spans into the columnar store
// - SecurityAnalyzer runs the rule pipeline and emits alerts
// - CostAggregator derives cost rows from LLM spans
// Each worker runs as a single concurrent task per process; horizontal
// scaling is extra processes in the same group.

pub mod config;
pub mod cost;
pub mod retry;
pub mod rules;
pub mod security;
pub mod spill;
pub mod writer;

pub use config::WorkerConfig;
pub use cost::CostAggregator;
pub use retry::RetryPolicy;
pub use security::SecurityAnalyzer;
pub use writer::PersistenceWriter;

/// Consumer group names on `spans.ingest`.
pub const WRITER_GROUP: &str = "writer-group";
pub const SECURITY_GROUP: &str = "security-group";
pub const COST_GROUP: &str = "cost-group";
