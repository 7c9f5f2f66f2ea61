use crate::{
    batch::{BatchProgress, EmbedOptions},
    errorlog::ErrorEntry,
    errors::IndexError,
    provider::{ProviderView, ValidationReport},
    scanner::{ScanOptions, ScanReport},
    search::{SearchRequest, SearchResponse},
    semantic::{
        clustering::ClusterOutcome,
        similarity::{DuplicateGroup, MoveProposal},
    },
    service::{HealthReport, IndexService, IndexStats, ProviderUpdate, Timeline},
};
use axum::{extract::State, response::IntoResponse, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashSet, path::PathBuf, sync::Arc};
use tokio::signal;

const DEFAULT_TIMELINE_DAYS: usize = 30;
const DEFAULT_ERROR_LIMIT: usize = 100;

#[derive(Clone)]
struct SharedState {
    service: Arc<IndexService>,
}

pub fn router(service: Arc<IndexService>) -> Router {
    let shared_state = Arc::new(SharedState { service });

    Router::new()
        .route("/api/scan", post(scan))
        .route("/api/embed/start", post(embed_start))
        .route("/api/embed/progress", post(embed_progress))
        .route("/api/embed/cancel", post(embed_cancel))
        .route("/api/cluster", post(cluster))
        .route("/api/clusters", post(clusters))
        .route("/api/search", post(search))
        .route("/api/similar", post(similar))
        .route("/api/stats", post(stats))
        .route("/api/timeline", post(timeline))
        .route("/api/check", post(check))
        .route("/api/errors", post(errors))
        .route("/api/errors/clear", post(clear_errors))
        .route("/api/provider", post(provider_get))
        .route("/api/provider/set", post(provider_set))
        .route("/api/provider/validate", post(provider_validate))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn shutdown_signal(service: Arc<IndexService>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("shutting down, waiting for embedding runs to stop");
    tokio::task::block_in_place(|| service.shutdown());
}

pub fn start_daemon(service: Arc<IndexService>, addr: &str) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!("listening on {}", listener.local_addr()?);

        axum::serve(listener, router(service.clone()))
            .with_graceful_shutdown(shutdown_signal(service))
            .await?;
        Ok::<(), anyhow::Error>(())
    })
}

#[derive(Debug)]
struct HttpError(IndexError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self.0 {
            IndexError::RootNotFound(_) | IndexError::IndexNotFound(_) => StatusCode::NOT_FOUND,
            IndexError::AlreadyRunning(_) | IndexError::Locked(_) => StatusCode::CONFLICT,
            IndexError::Config(_) | IndexError::Clustering(_) => StatusCode::BAD_REQUEST,
            IndexError::Provider(_) => {
                log::error!("{self:?}");
                StatusCode::BAD_GATEWAY
            }
            _ => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<IndexError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

type ApiResult<T> = Result<Json<T>, HttpError>;

#[derive(Debug, Clone, Deserialize)]
pub struct IndexRequest {
    /// Index root or storage directory
    pub index: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanRequest {
    pub root: PathBuf,
    pub extensions: Option<Vec<String>>,
    #[serde(default)]
    pub allow_all: bool,
    pub storage_dir: Option<PathBuf>,
}

async fn scan(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ScanRequest>,
) -> ApiResult<ScanReport> {
    log::debug!("payload: {payload:?}");

    let options = ScanOptions {
        extensions: payload.extensions,
        allow_all: payload.allow_all,
        storage_dir: payload.storage_dir,
    };
    tokio::task::block_in_place(move || {
        state
            .service
            .scan(&payload.root, &options)
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbedRequest {
    pub index: PathBuf,
    pub max_files: Option<usize>,
    pub batch_size: Option<usize>,
}

async fn embed_start(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<EmbedRequest>,
) -> ApiResult<BatchProgress> {
    log::debug!("payload: {payload:?}");

    let options = EmbedOptions {
        max_files: payload.max_files,
        batch_size: payload.batch_size,
    };
    tokio::task::block_in_place(move || {
        state
            .service
            .start_embedding(&payload.index, &options)
            .map(Json)
            .map_err(Into::into)
    })
}

async fn embed_progress(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<IndexRequest>,
) -> ApiResult<Option<BatchProgress>> {
    tokio::task::block_in_place(move || {
        state
            .service
            .progress(&payload.index)
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

async fn embed_cancel(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<IndexRequest>,
) -> ApiResult<CancelResponse> {
    tokio::task::block_in_place(move || {
        let cancelled = state.service.cancel_embedding(&payload.index)?;
        Ok(Json(CancelResponse { cancelled }))
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterRequest {
    pub index: PathBuf,
    pub k: Option<usize>,
}

async fn cluster(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ClusterRequest>,
) -> ApiResult<ClusterOutcome> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        state
            .service
            .cluster(&payload.index, payload.k)
            .map(Json)
            .map_err(Into::into)
    })
}

async fn clusters(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<IndexRequest>,
) -> ApiResult<Option<ClusterOutcome>> {
    tokio::task::block_in_place(move || {
        state
            .service
            .clusters(&payload.index)
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchPayload {
    pub index: PathBuf,
    pub query: String,
    pub top_k: Option<usize>,
    pub semantic_weight: Option<f32>,
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchPayload>,
) -> ApiResult<SearchResponse> {
    log::debug!("payload: {payload:?}");

    let request = SearchRequest {
        query: payload.query,
        top_k: payload.top_k,
        semantic_weight: payload.semantic_weight,
    };
    tokio::task::block_in_place(move || {
        state
            .service
            .search(&payload.index, &request)
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimilarRequest {
    pub index: PathBuf,
    pub threshold: Option<f32>,
    #[serde(default)]
    pub pinned: HashSet<String>,
    /// When set, each group also gets an advisory archive plan
    pub archive_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct SimilarResponse {
    pub groups: Vec<DuplicateGroup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moves: Option<Vec<MoveProposal>>,
}

async fn similar(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SimilarRequest>,
) -> ApiResult<SimilarResponse> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        let groups =
            state
                .service
                .similarity_groups(&payload.index, payload.threshold, &payload.pinned)?;
        let moves = payload
            .archive_dir
            .as_deref()
            .map(|dir| crate::semantic::similarity::propose_moves(&groups, dir));
        Ok(Json(SimilarResponse { groups, moves }))
    })
}

async fn stats(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<IndexRequest>,
) -> ApiResult<IndexStats> {
    tokio::task::block_in_place(move || {
        state
            .service
            .get_stats(&payload.index)
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimelineRequest {
    pub index: PathBuf,
    pub days: Option<usize>,
}

async fn timeline(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<TimelineRequest>,
) -> ApiResult<Timeline> {
    tokio::task::block_in_place(move || {
        state
            .service
            .timeline(&payload.index, payload.days.unwrap_or(DEFAULT_TIMELINE_DAYS))
            .map(Json)
            .map_err(Into::into)
    })
}

async fn check(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<IndexRequest>,
) -> ApiResult<HealthReport> {
    tokio::task::block_in_place(move || {
        state
            .service
            .check_index(&payload.index)
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorsRequest {
    pub index: PathBuf,
    pub limit: Option<usize>,
}

async fn errors(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ErrorsRequest>,
) -> ApiResult<Vec<ErrorEntry>> {
    tokio::task::block_in_place(move || {
        state
            .service
            .error_log(&payload.index, payload.limit.unwrap_or(DEFAULT_ERROR_LIMIT))
            .map(Json)
            .map_err(Into::into)
    })
}

async fn clear_errors(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<IndexRequest>,
) -> Result<(), HttpError> {
    tokio::task::block_in_place(move || {
        state
            .service
            .clear_error_log(&payload.index)
            .map_err(Into::into)
    })
}

async fn provider_get(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<IndexRequest>,
) -> ApiResult<ProviderView> {
    tokio::task::block_in_place(move || {
        state
            .service
            .provider_config(&payload.index)
            .map(Json)
            .map_err(Into::into)
    })
}

#[derive(Deserialize)]
pub struct ProviderSetRequest {
    pub index: PathBuf,
    #[serde(flatten)]
    pub update: ProviderUpdate,
}

// secrets stay out of the logs
impl std::fmt::Debug for ProviderSetRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ProviderSetRequest {{ index: {:?}, config: {:?}, secrets: [REDACTED] }}",
            self.index, self.update.config
        )
    }
}

async fn provider_set(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ProviderSetRequest>,
) -> ApiResult<ProviderView> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        state
            .service
            .save_provider_config(&payload.index, &payload.update)
            .map(Json)
            .map_err(Into::into)
    })
}

async fn provider_validate(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<IndexRequest>,
) -> ApiResult<Vec<ValidationReport>> {
    tokio::task::block_in_place(move || {
        state
            .service
            .validate_provider(&payload.index)
            .map(Json)
            .map_err(Into::into)
    })
}
