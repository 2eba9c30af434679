//! Media upload, fetch and deletion.
//!
//! Uploads are multipart with a `file` field; an optional `kind` field
//! overrides the kind inferred from the content type. Content types are
//! allowlisted per kind and the size ceiling comes from configuration.

use axum::{
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use tracing::info;

use parley_shared::{MediaId, MediaKind, MediaPayload};
use parley_store::{Media, StoreError};

use crate::auth::AuthedUser;
use crate::error::ServerError;
use crate::payload::media_payload;
use crate::state::AppState;

const ALLOWED_IMAGE_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/gif", "image/webp"];
const ALLOWED_VIDEO_TYPES: [&str; 4] = ["video/mp4", "video/avi", "video/mov", "video/wmv"];

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/upload", post(upload_media))
        .route("/:media_id", get(get_media).delete(delete_media))
        .route("/:media_id/file", get(get_media_file))
}

fn validate_content_type(kind: MediaKind, content_type: &str) -> Result<(), ServerError> {
    let allowed: &[&str] = match kind {
        MediaKind::Image => &ALLOWED_IMAGE_TYPES,
        MediaKind::Video => &ALLOWED_VIDEO_TYPES,
        MediaKind::Document => {
            return Err(ServerError::Validation(
                "Only image and video uploads are accepted".to_string(),
            ))
        }
    };
    if allowed.contains(&content_type.to_ascii_lowercase().as_str()) {
        Ok(())
    } else {
        Err(ServerError::Validation(format!(
            "Content type {content_type} is not allowed"
        )))
    }
}

fn infer_kind(content_type: &str) -> MediaKind {
    if content_type.starts_with("image/") {
        MediaKind::Image
    } else if content_type.starts_with("video/") {
        MediaKind::Video
    } else {
        MediaKind::Document
    }
}

async fn upload_media(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<MediaPayload>), ServerError> {
    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut requested_kind: Option<MediaKind> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::Validation(format!("Multipart error: {e}")))?
    {
        match field.name().unwrap_or("") {
            "file" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ServerError::Validation(format!("Failed to read field: {e}")))?;
                file = Some((file_name, content_type, data.to_vec()));
            }
            "kind" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ServerError::Validation(format!("Failed to read field: {e}")))?;
                requested_kind = Some(MediaKind::parse(&value).ok_or_else(|| {
                    ServerError::Validation(format!("Unknown media kind: {value}"))
                })?);
            }
            _ => {}
        }
    }

    let Some((file_name, content_type, data)) = file else {
        return Err(ServerError::Validation(
            "Missing 'file' field in multipart form".to_string(),
        ));
    };

    let kind = requested_kind.unwrap_or_else(|| infer_kind(&content_type));
    validate_content_type(kind, &content_type)?;

    let stored = state.media_store.store_file(&file_name, &data, kind).await?;

    let media = Media {
        id: MediaId::new(),
        file_name,
        file_path: stored.file_path,
        content_type,
        file_size: data.len() as i64,
        kind,
        thumbnail_path: stored.thumbnail_path,
        uploaded_by: caller,
        uploaded_at: Utc::now(),
    };

    let uploader_name = {
        let db = state.db.lock().await;
        db.insert_media(&media)?;
        db.display_name(caller)?
    };

    info!(media = %media.id, size = media.file_size, uploader = %caller, "media uploaded");

    Ok((
        StatusCode::CREATED,
        Json(media_payload(media, uploader_name)),
    ))
}

async fn get_media(
    AuthedUser(_caller): AuthedUser,
    State(state): State<AppState>,
    Path(media_id): Path<MediaId>,
) -> Result<Json<MediaPayload>, ServerError> {
    let db = state.db.lock().await;
    let media = db.get_media(media_id).map_err(|e| match e {
        StoreError::NotFound => ServerError::NotFound("Media"),
        other => other.into(),
    })?;
    let uploader_name = db.display_name(media.uploaded_by)?;
    Ok(Json(media_payload(media, uploader_name)))
}

async fn get_media_file(
    AuthedUser(_caller): AuthedUser,
    State(state): State<AppState>,
    Path(media_id): Path<MediaId>,
) -> Result<impl IntoResponse, ServerError> {
    let media = {
        let db = state.db.lock().await;
        db.get_media(media_id).map_err(|e| match e {
            StoreError::NotFound => ServerError::NotFound("Media"),
            other => other.into(),
        })?
    };

    let data = state.media_store.read_file(&media.file_path).await?;
    Ok(([(header::CONTENT_TYPE, media.content_type)], data))
}

/// Uploader-only deletion: file, thumbnail, and row.
async fn delete_media(
    AuthedUser(caller): AuthedUser,
    State(state): State<AppState>,
    Path(media_id): Path<MediaId>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let media = {
        let db = state.db.lock().await;
        db.get_media(media_id).map_err(|e| match e {
            StoreError::NotFound => ServerError::NotFound("Media"),
            other => other.into(),
        })?
    };

    if media.uploaded_by != caller {
        return Err(ServerError::NotParticipant);
    }

    state.media_store.remove_file(&media.file_path).await?;
    if let Some(thumbnail) = &media.thumbnail_path {
        state.media_store.remove_file(thumbnail).await?;
    }

    {
        let db = state.db.lock().await;
        db.delete_media(media_id)?;
    }

    info!(media = %media_id, "media deleted");
    Ok(Json(serde_json::json!({ "deleted": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_allowlists() {
        assert!(validate_content_type(MediaKind::Image, "image/png").is_ok());
        assert!(validate_content_type(MediaKind::Image, "IMAGE/PNG").is_ok());
        assert!(validate_content_type(MediaKind::Image, "image/svg+xml").is_err());
        assert!(validate_content_type(MediaKind::Video, "video/mp4").is_ok());
        assert!(validate_content_type(MediaKind::Video, "image/png").is_err());
        assert!(validate_content_type(MediaKind::Document, "application/pdf").is_err());
    }

    #[test]
    fn test_kind_inference() {
        assert_eq!(infer_kind("image/png"), MediaKind::Image);
        assert_eq!(infer_kind("video/mp4"), MediaKind::Video);
        assert_eq!(infer_kind("application/pdf"), MediaKind::Document);
    }
}
