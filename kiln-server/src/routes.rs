use axum::{
    extract::{rejection::JsonRejection, State},
    http::header,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    types::{BatchBody, BatchItem, BatchResponse, GenerateBody, GenerateResponse, HealthResponse},
    ApiError, AppState,
};

const RUNTIME: &str = "candle";
const INDEX_HTML: &str = include_str!("../assets/index.html");

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/ui", get(ui))
        .route("/api/health", get(health))
        .route("/api/generate", post(generate))
        .route("/api/generate_file", post(generate_file))
        .route("/api/batch_generate", post(batch_generate))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(body)| body)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

async fn banner() -> Json<Value> {
    Json(json!({
        "name": "kiln",
        "description": "Pottery image generation with Stable Diffusion and LoRA adapters",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "GET /api/health": "service and model status",
            "POST /api/generate": "generate an image, returned as a base64 data URL",
            "POST /api/generate_file": "generate an image, returned as a PNG attachment",
            "POST /api/batch_generate": "generate one image per prompt",
            "GET /ui": "browser form",
        },
    }))
}

async fn ui() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let info = state.generator().ok().map(|generator| generator.info());
    let error = state.load_error().map(str::to_string);
    Json(HealthResponse {
        status: if error.is_some() { "unhealthy" } else { "healthy" },
        model_loaded: info.is_some(),
        device: info.as_ref().map(|info| info.device.clone()),
        lora_loaded: info.as_ref().is_some_and(|info| info.lora.is_some()),
        runtime: format!("{RUNTIME} (kiln {})", env!("CARGO_PKG_VERSION")),
        model: info,
        error,
    })
}

async fn generate(
    State(state): State<AppState>,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    // Validate before touching the model so bad input is a 400 even while loading.
    let request = json_body(body)?.to_request()?;
    let generator = state.generator()?;

    let _permit = state.admit().await?;
    let artifact = generator.generate(request).await?;
    Ok(Json(GenerateResponse::from_artifact(artifact)?))
}

async fn generate_file(
    State(state): State<AppState>,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = json_body(body)?.to_request()?;
    let generator = state.generator()?;

    let _permit = state.admit().await?;
    let artifact = generator.generate(request).await?;
    let filename = format!("generated_{}.png", uuid::Uuid::new_v4());
    info!("Serving {filename}");
    Ok((
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        artifact.png_bytes()?,
    )
        .into_response())
}

/// Runs the prompts one after another; a failing prompt is reported in its slot and the
/// rest of the batch still runs.
async fn batch_generate(
    State(state): State<AppState>,
    body: Result<Json<BatchBody>, JsonRejection>,
) -> Result<Json<BatchResponse>, ApiError> {
    let body = json_body(body)?;
    if body.prompts.is_empty() {
        return Err(ApiError::BadRequest("No prompts provided".to_string()));
    }
    let generator = state.generator()?;
    info!(count = body.prompts.len(), "Starting batch generation");

    let mut results = Vec::with_capacity(body.prompts.len());
    for prompt in body.prompts {
        let outcome = async {
            let request = body.params.to_request(&prompt)?;
            let _permit = state.admit().await?;
            let artifact = generator.generate(request).await?;
            Ok::<_, ApiError>((artifact.data_url()?, artifact.seed))
        }
        .await;

        results.push(match outcome {
            Ok((image, seed)) => BatchItem::Success {
                prompt,
                image,
                seed,
            },
            Err(err) => {
                warn!("batch item {prompt:?} failed: {err}");
                BatchItem::Failure {
                    prompt,
                    error: err.to_string(),
                }
            }
        });
    }

    let response: BatchResponse = results.into_iter().collect();
    info!(
        succeeded = response.succeeded,
        failed = response.failed,
        "Batch generation finished"
    );
    Ok(Json(response))
}
