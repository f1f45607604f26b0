use crate::{
    config::{self, Config},
    error::AppError,
    formats::QualityTier,
    locks::{resilient_lock, resilient_read, resilient_write},
    models::{DownloadRequest, DownloadResponse, DownloadStatus, InfoRequest, VideoRecord},
    AppState, DownloadState,
};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::orchestrator::DownloadEvents;

/// All HTTP routes, wired to `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/info", get(get_info))
        .route("/download", post(start_download))
        .route("/status", get(get_status))
        .route("/config", get(get_config).post(update_config))
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any))
        .with_state(state)
}

// ===================================================================
//                          CONFIG HANDLERS
// ===================================================================

/// # GET /config - Returns the current application configuration.
pub async fn get_config(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let config = resilient_read(&state.config).clone();
    Ok((StatusCode::OK, Json(config)))
}

/// # POST /config - Validates, applies and saves a new configuration.
pub async fn update_config(
    State(state): State<AppState>,
    Json(payload): Json<Config>,
) -> Result<impl IntoResponse, AppError> {
    let settings = payload
        .to_settings()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    state.orchestrator.replace_settings(settings);
    *resilient_write(&state.config) = payload.clone();
    config::save_config(&payload).await?;
    tracing::info!("Configuration updated and saved.");
    Ok((StatusCode::OK, Json(payload)))
}

// ===================================================================
//                          METADATA HANDLER
// ===================================================================

/// # GET /info - Fetches the metadata of every video behind a URL.
pub async fn get_info(
    State(state): State<AppState>,
    Query(params): Query<InfoRequest>,
) -> Result<impl IntoResponse, AppError> {
    let records = fetch_records(&state, &params.url).await?;
    tracing::info!("Fetched {} record(s) for {}", records.len(), params.url);
    Ok((StatusCode::OK, Json(records)))
}

async fn fetch_records(state: &AppState, url: &str) -> Result<Vec<VideoRecord>, AppError> {
    if url.is_empty() {
        return Err(AppError::BadRequest("URL parameter cannot be empty".to_string()));
    }
    let (records, success) = state.orchestrator.fetch_metadata_one(url).collect().await;
    if records.is_empty() && !success {
        return Err(AppError::YtDlp(format!("could not fetch metadata for {}", url)));
    }
    Ok(records)
}

// ===================================================================
//                          DOWNLOAD HANDLERS
// ===================================================================

/// # POST /download - Queues the first video behind a URL for download.
pub async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<impl IntoResponse, AppError> {
    let tier = QualityTier::from_label(&payload.quality);
    if tier == QualityTier::Unknown {
        return Err(AppError::BadRequest(format!("Unknown quality '{}'", payload.quality)));
    }

    let record = fetch_records(&state, &payload.url)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::NotFound(format!("No downloadable video at {}", payload.url)))?;
    let download_key = record.id.clone();

    {
        let mut map = resilient_lock(&state.downloads);
        let busy = ["queued", "starting", "downloading", "converting"];
        if matches!(map.get(&download_key), Some(s) if busy.contains(&s.status.as_str())) {
            return Err(AppError::BadRequest("A download for this video is already in progress.".to_string()));
        }
        map.insert(download_key.clone(), DownloadStatus::queued(&record.title));
    }

    let events = state.orchestrator.download(record, tier, payload.container);
    tokio::spawn(track_download(state.downloads.clone(), download_key.clone(), events));

    Ok((StatusCode::ACCEPTED, Json(DownloadResponse {
        message: "Download queued".to_string(),
        download_key,
    })))
}

/// Mirrors a request's events into the shared status map until it ends.
async fn track_download(downloads: DownloadState, key: String, mut events: DownloadEvents) {
    while let Some(event) = events.next().await {
        let mut map = resilient_lock(&downloads);
        if let Some(status) = map.get_mut(&key) {
            status.apply(&event);
        }
    }
}

// ===================================================================
//                          STATUS HANDLER
// ===================================================================

/// # GET /status - Returns the status of all downloads.
pub async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let map = resilient_lock(&state.downloads).clone();
    (StatusCode::OK, Json(map))
}
