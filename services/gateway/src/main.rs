//! The HTTP API and process entry point: wires config, the KV store,
//! the realtime store, the engine client, the push dispatcher and the call
//! orchestrator together and runs them as concurrent tasks in one process.
//! There is no shared in-memory call table — only the stores coordinate state.

use axum::extract::{FromRequest, FromRequestParts, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dto::{
    CallCredentialsQuery, CallCredentialsResponse, CallTokenRequest, HealthConfig, HealthResponse,
    OkResponse, OutgoingCredentialsRequest, OutgoingCredentialsResponse, OutgoingCleanupRequest,
    PushRegisterRequest,
};
use engine_client::{EngineClient, EngineEvent, HttpEngineClient};
use kv_store::RedisKvStore;
use orchestrator::{Orchestrator, OrchestratorError, OrchestratorSettings};
use push_dispatcher::HttpPushDispatcher;
use realtime_store::{PgRealtimeStore, RealtimeStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    base_url: String,
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound => ApiError::NotFound,
            OrchestratorError::BadRequest(msg) => ApiError::BadRequest(msg),
            OrchestratorError::Store(msg) => ApiError::Unexpected(anyhow::anyhow!(msg)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Unexpected(error) => {
                tracing::error!(?error, "unexpected api error");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// `Json<T>` extractor wrapper that turns a body-deserialization failure
/// (missing/invalid fields, malformed JSON) into `ApiError::BadRequest` ->
/// HTTP 400, instead of axum's default `JsonRejection` response (422).
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::BadRequest(rejection.to_string()))?;
        Ok(ApiJson(value))
    }
}

/// `Query<T>` extractor wrapper, same rationale as [`ApiJson`]: a missing or
/// malformed query string must 400, not surface axum's default rejection.
struct ApiQuery<T>(T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| ApiError::BadRequest(rejection.to_string()))?;
        Ok(ApiQuery(value))
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: "intercom-gateway".to_string(),
        config: HealthConfig {
            base_url: state.base_url.clone(),
        },
    })
}

async fn push_register(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<PushRegisterRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state
        .orchestrator
        .register_push(&req.user_id, &req.push_token, req.platform, req.device_id)
        .await?;
    Ok(Json(OkResponse::ok()))
}

async fn calls_credentials(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<CallCredentialsQuery>,
) -> Result<Json<CallCredentialsResponse>, ApiError> {
    let credentials = state.orchestrator.resolve_credentials(&query.call_token).await?;
    Ok(Json(credentials))
}

async fn calls_end(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<CallTokenRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state.orchestrator.end_call(&req.call_token).await?;
    Ok(Json(OkResponse::ok()))
}

async fn calls_outgoing_credentials(
    State(state): State<AppState>,
    ApiJson(_req): ApiJson<OutgoingCredentialsRequest>,
) -> Result<Json<OutgoingCredentialsResponse>, ApiError> {
    let minted = state.orchestrator.mint_outgoing_credentials().await?;
    Ok(Json(minted))
}

async fn calls_outgoing_cleanup(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<OutgoingCleanupRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state.orchestrator.cleanup_outgoing(&req.outgoing_token).await?;
    Ok(Json(OkResponse::ok()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = match config::AppConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!(error = %err, "invalid configuration, refusing to start");
            std::process::exit(1);
        }
    };

    let kv = Arc::new(RedisKvStore::connect(&cfg.redis.url()).await?);

    let realtime = Arc::new(PgRealtimeStore::connect(&cfg.postgres.url()).await?);
    realtime.ensure_schema().await?;
    realtime.ensure_templates().await?;

    let engine = Arc::new(HttpEngineClient::new(
        cfg.engine.base_url(),
        cfg.engine.ws_url(),
        cfg.engine.user.clone(),
        cfg.engine.password.clone(),
        cfg.engine.app_name.clone(),
    ));
    engine.subscribe_endpoint_events().await?;

    let push = Arc::new(HttpPushDispatcher::new(
        cfg.push_vendor_url.clone(),
        cfg.push_access_token.clone(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        kv,
        realtime,
        engine.clone(),
        push,
        OrchestratorSettings {
            server_domain: cfg.server_domain.clone(),
            call_token_ttl_sec: cfg.call_token_ttl_sec,
            ring_timeout_sec: cfg.ring_timeout_sec,
            doorphone_context: "from-intercom".to_string(),
            client_context: "from-client".to_string(),
            push_recipient_user_id: cfg.realphone.clone(),
        },
    ));

    let orchestrator_for_events = orchestrator.clone();
    let _events_handle = engine_client::connect_events(
        cfg.engine.ws_url(),
        cfg.engine.user.clone(),
        cfg.engine.password.clone(),
        move |event: EngineEvent| {
            // The event-stream reader is single-consumer; hand each
            // event off to its own task so a slow handler never stalls it.
            let orchestrator = orchestrator_for_events.clone();
            tokio::spawn(async move {
                orchestrator.handle_event(event).await;
            });
        },
    );

    let _janitor_handles = orchestrator::spawn_janitor(orchestrator.clone());

    let state = AppState {
        orchestrator,
        base_url: cfg.engine.base_url(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/push/register", post(push_register))
        .route("/calls/credentials", get(calls_credentials))
        .route("/calls/end", post(calls_end))
        .route("/calls/reject", post(calls_end))
        .route("/calls/outgoing-credentials", post(calls_outgoing_credentials))
        .route("/calls/outgoing-cleanup", post(calls_outgoing_cleanup))
        .layer(cors)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.app_port));
    tracing::info!(%addr, "intercom gateway starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
