use anyhow::Context;
use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::fs;
use tracing::info;

use crate::{
    artifact_store::{artifact_path, staged_input_path},
    error::ApiError,
    models::{DownloadRequest, ReviewRequest, SpeechRequest, TaskAcceptedResponse},
    registry::CancelError,
    runner,
    workers::{download::UrlDownload, speech::TextToSpeech, transcode::MediaTranscode},
    AppState,
};

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.url.trim().is_empty() {
        return Err(ApiError::Validation("url is required".into()));
    }

    let task_id = state.registry.create("download").await;
    info!(task_id = %task_id, url = %payload.url, quality = %payload.quality, "Download accepted");
    runner::spawn(
        state.clone(),
        task_id.clone(),
        Box::new(UrlDownload {
            url: payload.url,
            quality: payload.quality,
        }),
    );
    Ok((StatusCode::ACCEPTED, Json(TaskAcceptedResponse { task_id })))
}

pub async fn convert_video(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::Validation(format!("invalid multipart body: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field.file_name().unwrap_or("").to_string();
        if original_name.is_empty() {
            return Err(ApiError::Validation("no file selected".into()));
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::Validation(format!("failed reading upload: {err}")))?;

        let task_id = state.registry.create("convert-video").await;
        let input = staged_input_path(&state.config.storage_root, &task_id, &original_name);
        fs::write(&input, &bytes)
            .await
            .with_context(|| format!("Failed to stage upload at {}", input.display()))?;

        info!(
            task_id = %task_id,
            file = %original_name,
            size_bytes = bytes.len(),
            "Video conversion accepted"
        );
        runner::spawn(
            state.clone(),
            task_id.clone(),
            Box::new(MediaTranscode { input }),
        );
        return Ok((StatusCode::ACCEPTED, Json(TaskAcceptedResponse { task_id })));
    }

    Err(ApiError::Validation("no file uploaded".into()))
}

pub async fn convert_text(
    State(state): State<AppState>,
    Json(payload): Json<SpeechRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.text.trim().is_empty() {
        return Err(ApiError::Validation("text is required".into()));
    }

    let task_id = state.registry.create("convert-text").await;
    info!(task_id = %task_id, voice = %payload.voice, chars = payload.text.len(), "Speech synthesis accepted");
    runner::spawn(
        state.clone(),
        task_id.clone(),
        Box::new(TextToSpeech {
            text: payload.text,
            voice: payload.voice,
        }),
    );
    Ok((StatusCode::ACCEPTED, Json(TaskAcceptedResponse { task_id })))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .registry
        .get(&task_id)
        .await
        .ok_or_else(|| ApiError::NotFound("task not found".into()))?;
    Ok(Json(task.to_response()))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.registry.request_cancel(&task_id).await {
        Ok(()) => Ok(Json(json!({ "message": "Cancellation requested" }))),
        Err(CancelError::NotFound) => Err(ApiError::NotFound("task not found".into())),
        Err(CancelError::AlreadyFinished) => Err(ApiError::InvalidState(
            "task already completed or failed".into(),
        )),
    }
}

pub async fn download_file(
    State(state): State<AppState>,
    Path(file_name): Path<String>,
) -> Result<Response<Body>, ApiError> {
    let path = artifact_path(&state.config.storage_root, &file_name)
        .ok_or_else(|| ApiError::Validation("invalid file name".into()))?;

    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound("file not found".into()));
        }
        Err(err) => {
            return Err(ApiError::Internal(anyhow::Error::new(err).context(
                format!("Failed to read artifact {}", path.display()),
            )));
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_for(&file_name))
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )
        .body(Body::from(bytes))
        .map_err(|err| {
            ApiError::Internal(anyhow::anyhow!("Failed to build download response: {err}"))
        })
}

fn content_type_for(file_name: &str) -> &'static str {
    match file_name.rsplit('.').next() {
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        Some("wav") => "audio/wav",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: u32,
}

fn default_history_limit() -> u32 {
    50
}

pub async fn get_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.min(200);
    let history = state.history.clone();
    let entries = tokio::task::spawn_blocking(move || history.recent_tasks(limit))
        .await
        .map_err(|err| ApiError::Internal(anyhow::anyhow!("history query join error: {err}")))??;
    Ok(Json(entries))
}

pub async fn add_review(
    State(state): State<AppState>,
    Json(payload): Json<ReviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !(1..=5).contains(&payload.rating) {
        return Err(ApiError::Validation("rating must be between 1 and 5".into()));
    }

    let history = state.history.clone();
    let review = tokio::task::spawn_blocking(move || {
        history.add_review(payload.rating, payload.comment.as_deref())
    })
    .await
    .map_err(|err| ApiError::Internal(anyhow::anyhow!("review write join error: {err}")))??;
    Ok((StatusCode::CREATED, Json(review)))
}

pub async fn list_reviews(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let history = state.history.clone();
    let reviews = tokio::task::spawn_blocking(move || history.list_reviews(100))
        .await
        .map_err(|err| ApiError::Internal(anyhow::anyhow!("review query join error: {err}")))??;
    Ok(Json(reviews))
}
