//! Configuration surface: HTTP endpoints for registering lots, querying
//! status and tuning the classifier on a single image.

use crate::classifier::{ParamOverrides, ParamRangeError, SpotClassifier};
use crate::config::ApiConfig;
use crate::debug_images;
use crate::frame::Frame;
use crate::lot::{
    build_regions, check_regions_fit, LotConfigRequest, LotId, LotValidationError, Region, SpotId,
    SpotRequest,
};
use crate::scheduler::{LotStatus, Scheduler, SchedulerError, UpsertOutcome};
use crate::source::SourceError;
use crate::worker::LotSnapshot;
use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub service_name: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Handler errors, rendered as `{error, code}` JSON.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidImage(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::InvalidImage(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_IMAGE"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<LotValidationError> for ApiError {
    fn from(err: LotValidationError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl From<ParamRangeError> for ApiError {
    fn from(err: ParamRangeError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Validation(e) => e.into(),
            SchedulerError::NotFound(lot_id) => ApiError::NotFound(format!("Parking lot {lot_id} not found")),
            SchedulerError::Source(e @ SourceError::Unsupported { .. }) => ApiError::Validation(e.to_string()),
            SchedulerError::Source(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

/// Register-or-replace response
#[derive(Debug, Serialize, Deserialize)]
pub struct UpsertResponse {
    pub lot_id: LotId,
    pub accepted: bool,
    pub outcome: UpsertOutcome,
}

/// Removal response
#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveResponse {
    pub stopped: bool,
}

/// Health response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
    pub active_lots: usize,
    pub max_workers: usize,
}

/// Single-image classification request
#[derive(Debug, Deserialize)]
pub struct SingleImageRequest {
    /// Base64 image, optionally as a `data:` URL
    pub image_base64: String,
    #[serde(default)]
    pub parking_spots: Vec<SpotRequest>,
    #[serde(default)]
    pub params: ParamOverrides,
    #[serde(default)]
    pub annotate: bool,
}

/// Raw classification of one spot
#[derive(Debug, Serialize, Deserialize)]
pub struct SpotDetectionResult {
    pub id: SpotId,
    pub occupied: bool,
    pub confidence: f32,
    pub foreground_pixels: u32,
}

/// Single-image classification response
#[derive(Debug, Serialize, Deserialize)]
pub struct SingleImageResponse {
    pub detections: Vec<SpotDetectionResult>,
    pub frame_width: u32,
    pub frame_height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotated_image: Option<String>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/config/parking-lot", post(upsert_lot))
        .route("/config/parking-lot/:lot_id", delete(remove_lot))
        .route("/status", get(list_status))
        .route("/status/:lot_id", get(lot_status))
        .route("/test/single-image", post(test_single_image))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: state.service_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_lots: state.scheduler.active_lots(),
        max_workers: state.scheduler.max_workers(),
    })
}

/// Register or replace a parking lot
#[instrument(skip(state, body))]
async fn upsert_lot(
    State(state): State<AppState>,
    body: Result<Json<LotConfigRequest>, JsonRejection>,
) -> Result<Json<UpsertResponse>, ApiError> {
    let Json(request) = body?;
    let default_size = state.scheduler.classifier_params().default_spot_size();
    let config = request.into_config(default_size)?;
    let lot_id = config.lot_id;

    let outcome = state.scheduler.upsert(config)?;
    Ok(Json(UpsertResponse {
        lot_id,
        accepted: true,
        outcome,
    }))
}

/// Stop processing a parking lot
#[instrument(skip(state))]
async fn remove_lot(
    State(state): State<AppState>,
    Path(lot_id): Path<LotId>,
) -> Result<Json<RemoveResponse>, ApiError> {
    state.scheduler.remove(lot_id)?;
    Ok(Json(RemoveResponse { stopped: true }))
}

/// Summary of every registered lot
async fn list_status(State(state): State<AppState>) -> Json<Vec<LotStatus>> {
    Json(state.scheduler.list_status())
}

/// Full snapshot of one lot, including spot states
#[instrument(skip(state))]
async fn lot_status(
    State(state): State<AppState>,
    Path(lot_id): Path<LotId>,
) -> Result<Json<LotSnapshot>, ApiError> {
    state
        .scheduler
        .lot_snapshot(lot_id)
        .map(|snapshot| Json(snapshot.as_ref().clone()))
        .ok_or_else(|| ApiError::NotFound(format!("Parking lot {lot_id} not found")))
}

/// Classify the given spots on one uploaded image, without registering anything
#[instrument(skip(state, body))]
async fn test_single_image(
    State(state): State<AppState>,
    body: Result<Json<SingleImageRequest>, JsonRejection>,
) -> Result<Json<SingleImageResponse>, ApiError> {
    let Json(request) = body?;
    let params = state.scheduler.classifier_params().with_overrides(&request.params)?;
    let regions = build_regions(&request.parking_spots, params.default_spot_size())?;
    let bytes = decode_base64_image(&request.image_base64)?;
    let annotate = request.annotate;

    let response = tokio::task::spawn_blocking(move || {
        let frame = Frame::decode(&bytes, 0).map_err(|e| ApiError::InvalidImage(e.to_string()))?;
        check_regions_fit(&regions, frame.size())?;

        let classifier = SpotClassifier::new(params);
        let mut detections = Vec::with_capacity(regions.len());
        for region in &regions {
            let result = classifier
                .classify(&frame.image, &region.geometry)
                .ok_or_else(|| ApiError::Validation(format!("Spot {} does not fit the image", region.spot_id)))?;
            detections.push(SpotDetectionResult {
                id: region.spot_id,
                occupied: result.occupied,
                confidence: result.confidence,
                foreground_pixels: result.foreground_pixels,
            });
        }

        let annotated_image = if annotate {
            let occupied = |r: &Region| {
                detections.iter().find(|d| d.id == r.spot_id).map(|d| d.occupied)
            };
            let image = debug_images::annotate(&frame.image, &regions, occupied);
            let jpeg = debug_images::encode_jpeg(&image).map_err(|e| ApiError::Internal(e.to_string()))?;
            Some(format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg)))
        } else {
            None
        };

        Ok::<_, ApiError>(SingleImageResponse {
            detections,
            frame_width: frame.width(),
            frame_height: frame.height(),
            annotated_image,
        })
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    info!(spots = response.detections.len(), "Single image classified");
    Ok(Json(response))
}

/// Decode base64 image data, accepting an optional `data:<mime>;base64,` prefix.
fn decode_base64_image(data: &str) -> Result<Vec<u8>, ApiError> {
    let payload = match data.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| ApiError::InvalidImage(format!("Invalid base64 image: {e}")))?;
    if bytes.is_empty() {
        return Err(ApiError::InvalidImage("Empty image".to_string()));
    }
    Ok(bytes)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting configuration API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_and_data_url() {
        let encoded = STANDARD.encode(b"abc");
        assert_eq!(decode_base64_image(&encoded).unwrap(), b"abc");
        assert_eq!(
            decode_base64_image(&format!("data:image/png;base64,{encoded}")).unwrap(),
            b"abc"
        );
    }

    #[test]
    fn test_decode_rejects_bad_base64() {
        assert!(matches!(decode_base64_image("%%%"), Err(ApiError::InvalidImage(_))));
        assert!(matches!(decode_base64_image(""), Err(ApiError::InvalidImage(_))));
    }

    #[test]
    fn test_error_status_codes() {
        let not_found: ApiError = SchedulerError::NotFound(3).into();
        assert_eq!(not_found.status_and_code(), (StatusCode::NOT_FOUND, "NOT_FOUND"));

        let unsupported: ApiError = SchedulerError::Source(SourceError::Unsupported {
            url: "ftp://x".to_string(),
            reason: "unknown scheme".to_string(),
        })
        .into();
        assert_eq!(unsupported.status_and_code().0, StatusCode::BAD_REQUEST);

        let invalid = ApiError::InvalidImage("bad".to_string());
        assert_eq!(invalid.into_response().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
