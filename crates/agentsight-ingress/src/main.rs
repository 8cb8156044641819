// AgentSight collector: span ingestion endpoint

use std::sync::Arc;

use agentsight_bus::{EventBus, RedisEventBus};
use agentsight_contracts::telemetry::{init_telemetry, TelemetryConfig};
use agentsight_ingress::api::{self, traces};
use agentsight_ingress::{IngressConfig, Readiness};
use agentsight_storage::{KeyDirectory, PgProjectKeyStore};
use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        api::traces::ingest,
        api::health::health,
        api::health::ready,
    ),
    components(schemas(
        traces::IngestResponse,
        agentsight_ingress::error::ErrorBody,
        api::health::HealthResponse,
        api::health::ReadinessResponse,
        agentsight_contracts::Span,
        agentsight_contracts::SpanEvent,
        agentsight_contracts::SpanStatus,
    )),
    tags(
        (name = "traces", description = "Span ingestion endpoint"),
        (name = "system", description = "Health and readiness probes")
    ),
    info(
        title = "AgentSight Collector",
        description = "Trace ingestion endpoint for AgentSight SDKs",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry(&TelemetryConfig::new("agentsight-ingress"));
    tracing::info!("ingress starting...");

    let config = Arc::new(IngressConfig::from_env()?);

    let bus: Arc<dyn EventBus> = Arc::new(
        RedisEventBus::connect(&config.eventbus_url, config.stream_maxlen)
            .await
            .context("event bus connection failed")?,
    );

    let key_store = PgProjectKeyStore::connect(&config.metadata_store_url)
        .await
        .context("metadata store connection failed")?;
    let keydir = Arc::new(KeyDirectory::new(Arc::new(key_store)));
    tracing::info!("connected to metadata store");

    let readiness = Arc::new(Readiness::new());

    let traces_state = traces::AppState {
        bus,
        keydir,
        readiness: readiness.clone(),
        config: config.clone(),
    };

    let cors_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    tracing::info!(origins = ?config.allowed_origins, "CORS origins configured");

    let app = Router::new()
        .merge(traces::routes(traces_state))
        .merge(api::health::routes(readiness))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(cors_origins))
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::CONTENT_ENCODING,
                    header::HeaderName::from_static("x-api-key"),
                ]),
        )
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "ingress listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
