// Trace intake route
//
// POST /v1/traces accepts a single span object, a bare list, or
// {"spans": [...]}, optionally gzip-encoded. The API key is resolved once
// per request; each candidate span is validated independently, tagged
// with the authoritative project id and appended to `spans.ingest`.
// Invalid spans are dropped and counted, never the whole batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use agentsight_bus::{encode_span, EventBus, SPANS_INGEST};
use agentsight_contracts::{
    coerce_attr_value, validate_span, Span, SpanEvent, SpanStatus,
};
use agentsight_storage::{KeyDirError, KeyDirectory};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::body::{decompress_limited, read_limited};
use crate::config::IngressConfig;
use crate::error::IngressError;
use crate::readiness::Readiness;

/// App state for the intake route
#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<dyn EventBus>,
    pub keydir: Arc<KeyDirectory>,
    pub readiness: Arc<Readiness>,
    pub config: Arc<IngressConfig>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/traces", post(ingest))
        .with_state(state)
}

/// 202 response body.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IngestResponse {
    pub status: String,
    pub spans_queued: usize,
    pub project_id: String,
}

/// A span as clients send it: attribute values may be any JSON scalar
/// (or nested structure) and several fields are optional. Any
/// client-supplied project id is ignored.
#[derive(Debug, Deserialize)]
struct IntakeSpan {
    span_id: String,
    trace_id: String,
    #[serde(default)]
    parent_span_id: Option<String>,
    name: String,
    #[serde(default)]
    service_name: Option<String>,
    #[serde(default)]
    status: Option<SpanStatus>,
    start_time: i64,
    end_time: i64,
    #[serde(default)]
    duration_ms: Option<f64>,
    #[serde(default)]
    attributes: HashMap<String, Value>,
    #[serde(default)]
    events: Vec<IntakeEvent>,
}

#[derive(Debug, Deserialize)]
struct IntakeEvent {
    name: String,
    #[serde(default, alias = "timestamp")]
    timestamp_ns: i64,
    #[serde(default)]
    attributes: HashMap<String, Value>,
}

impl IntakeSpan {
    /// Coerce into the canonical span shape (string attribute values).
    /// An omitted `duration_ms` is derived from the timestamps here; an
    /// explicit one is kept verbatim and must survive validation against
    /// them.
    fn into_span(self) -> Span {
        let duration_ms = self
            .duration_ms
            .unwrap_or_else(|| (self.end_time - self.start_time) as f64 / 1e6);
        Span {
            span_id: self.span_id,
            trace_id: self.trace_id,
            parent_span_id: self.parent_span_id,
            project_id: String::new(),
            name: self.name,
            service_name: self.service_name.unwrap_or_else(|| "default".to_string()),
            status: self.status.unwrap_or_default(),
            start_time: self.start_time,
            end_time: self.end_time,
            duration_ms,
            attributes: coerce_attrs(self.attributes),
            events: self
                .events
                .into_iter()
                .map(|event| SpanEvent {
                    name: event.name,
                    timestamp_ns: event.timestamp_ns,
                    attributes: coerce_attrs(event.attributes),
                })
                .collect(),
        }
    }
}

fn coerce_attrs(attrs: HashMap<String, Value>) -> HashMap<String, String> {
    attrs
        .into_iter()
        .map(|(key, value)| (key, coerce_attr_value(&value)))
        .collect()
}

/// POST /v1/traces - ingest a batch of spans
#[utoipa::path(
    post,
    path = "/v1/traces",
    request_body(content = String, content_type = "application/json", description = "A span object, a list of spans, or {\"spans\": [...]}; optionally gzip-encoded"),
    responses(
        (status = 202, description = "At least one span queued", body = IngestResponse),
        (status = 400, description = "Undecodable body or no valid spans", body = crate::error::ErrorBody),
        (status = 401, description = "Missing or unknown API key", body = crate::error::ErrorBody),
        (status = 413, description = "Body over the size ceiling", body = crate::error::ErrorBody),
        (status = 503, description = "Key directory or event bus unavailable", body = crate::error::ErrorBody)
    ),
    tag = "traces"
)]
pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Body,
) -> Result<(StatusCode, Json<IngestResponse>), IngressError> {
    let deadline = Instant::now() + state.config.request_timeout;
    let max_bytes = state.config.max_body_bytes;

    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| IngressError::Auth("missing X-API-Key header".to_string()))?;

    let raw = read_limited(body, max_bytes).await?;
    let decoded = if is_gzip(&headers) {
        decompress_limited(&raw, max_bytes)?
    } else {
        raw
    };

    let parsed: Value = serde_json::from_slice(&decoded)
        .map_err(|e| IngressError::BadRequest(format!("invalid JSON: {e}")))?;
    let candidates = candidate_spans(parsed)?;

    let project_id = match state.keydir.resolve(&api_key).await {
        Ok(project_id) => {
            state.readiness.mark_keydir_ok();
            project_id
        }
        Err(KeyDirError::UnknownKey) => {
            return Err(IngressError::Auth("invalid API key".to_string()))
        }
        Err(KeyDirError::Unavailable(detail)) => {
            tracing::error!(error = %detail, "key directory unavailable");
            return Err(IngressError::Unavailable(
                "key verification temporarily unavailable".to_string(),
            ));
        }
    };

    let mut queued = 0usize;
    let mut rejected = 0usize;
    let mut append_failures = 0usize;

    for candidate in candidates {
        let intake: IntakeSpan = match serde_json::from_value(candidate) {
            Ok(intake) => intake,
            Err(e) => {
                tracing::warn!(error = %e, "invalid span dropped");
                rejected += 1;
                continue;
            }
        };
        let mut span = intake.into_span();
        if let Err(violation) = validate_span(&span) {
            tracing::warn!(span_id = %span.span_id, error = %violation, "invalid span dropped");
            rejected += 1;
            continue;
        }
        span.project_id = project_id.clone();

        if Instant::now() >= deadline {
            tracing::warn!(queued, "request deadline reached, reporting partial count");
            break;
        }

        let payload = match encode_span(&span) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(span_id = %span.span_id, error = %e, "span encode failed, dropped");
                rejected += 1;
                continue;
            }
        };
        match state.bus.append(SPANS_INGEST, &payload).await {
            Ok(_) => {
                state.readiness.mark_bus_ok();
                queued += 1;
            }
            Err(e) => {
                tracing::warn!(span_id = %span.span_id, error = %e, "span append failed");
                append_failures += 1;
            }
        }
    }

    if queued == 0 {
        if append_failures > 0 {
            return Err(IngressError::Unavailable(
                "event bus rejected every span".to_string(),
            ));
        }
        return Err(IngressError::BadRequest(format!(
            "no valid spans in request ({rejected} rejected)"
        )));
    }

    if rejected > 0 || append_failures > 0 {
        tracing::warn!(queued, rejected, append_failures, "partial batch accepted");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            status: "accepted".to_string(),
            spans_queued: queued,
            project_id,
        }),
    ))
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("gzip"))
}

/// The three accepted body shapes: {"spans": [...]}, [...], or one span.
fn candidate_spans(parsed: Value) -> Result<Vec<Value>, IngressError> {
    match parsed {
        Value::Object(mut object) => match object.remove("spans") {
            Some(Value::Array(spans)) => Ok(spans),
            Some(_) => Err(IngressError::BadRequest(
                "\"spans\" must be an array".to_string(),
            )),
            None => Ok(vec![Value::Object(object)]),
        },
        Value::Array(spans) => Ok(spans),
        _ => Err(IngressError::BadRequest(
            "body must be a span object, a list, or {\"spans\": [...]}".to_string(),
        )),
    }
}
