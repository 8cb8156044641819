// AgentSight ingress: authenticated span intake
//
// One POST endpoint accepts batches of spans from instrumented agents,
// authenticates them against the key directory, validates each span and
// appends the survivors to the `spans.ingest` stream. Losing no accepted
// data under downstream failure is the collector's whole job: a span is
// only counted in the response after its append succeeded.

pub mod api;
pub mod body;
pub mod config;
pub mod error;
pub mod readiness;

pub use config::IngressConfig;
pub use error::IngressError;
pub use readiness::Readiness;
