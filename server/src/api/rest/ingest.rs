//! Ingest-session routes: negotiation, batch admission, finalization.
//!
//! Binary payloads (missing-sets, batches) use the engine's wire codecs;
//! the handlers are thin shells that authenticate, decode, and hand off
//! to the session manager on a blocking thread.

use crate::api::AppState;
use axum::{
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use stash_core::codec::{transpose, wire};
use uuid::Uuid;

use super::error::{require_auth, AppError};

#[derive(Deserialize)]
pub struct CreateSessionRequest {
    pub repo_id: Uuid,
    pub intended_release: String,
    #[serde(default)]
    pub client_agent: String,
}

#[derive(Serialize)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
}

pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    require_auth(&state.config, &headers)?;
    let session =
        state
            .sessions
            .create(req.repo_id, &req.intended_release, &req.client_agent)?;
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id,
        }),
    ))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_auth(&state.config, &headers)?;
    Ok(Json(state.sessions.session(id)?))
}

fn octet_stream(bytes: Vec<u8>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/octet-stream"),
        )],
        bytes,
    )
}

/// Transpose-compressed hashes in, transpose-compressed missing subset
/// out. The reply reflects store state at query time; concurrent uploads
/// may shrink the set before the client acts on it.
pub async fn missing_chunks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, AppError> {
    require_auth(&state.config, &headers)?;
    let hashes = transpose::decode_hashes(&body)?;
    let sessions = state.sessions.clone();
    let missing = tokio::task::spawn_blocking(move || sessions.missing_chunks(id, &hashes))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;
    Ok(octet_stream(transpose::encode_hashes(&missing)?))
}

pub async fn missing_files(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, AppError> {
    require_auth(&state.config, &headers)?;
    let hashes = transpose::decode_hashes(&body)?;
    let sessions = state.sessions.clone();
    let missing = tokio::task::spawn_blocking(move || sessions.missing_files(id, &hashes))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;
    Ok(octet_stream(transpose::encode_hashes(&missing)?))
}

pub async fn upload_chunk_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<StatusCode, AppError> {
    require_auth(&state.config, &headers)?;
    let batch = wire::decode_chunk_batch(&body)?;
    let sessions = state.sessions.clone();
    tokio::task::spawn_blocking(move || sessions.upload_chunks(id, &batch))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;
    Ok(StatusCode::OK)
}

pub async fn upload_file_batch(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<StatusCode, AppError> {
    require_auth(&state.config, &headers)?;
    let defs = wire::decode_file_definitions(&body)?;
    let sessions = state.sessions.clone();
    tokio::task::spawn_blocking(move || sessions.upload_file_definitions(id, &defs))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;
    Ok(StatusCode::OK)
}

/// Multipart finalize: a `repo_id` field naming the target repository and
/// a `release_definition` part carrying the `.rdef` bytes.
pub async fn finalize_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    require_auth(&state.config, &headers)?;

    let mut repo_id: Option<Uuid> = None;
    let mut definition: Option<Vec<u8>> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("bad multipart body: {e}")))?
    {
        match field.name() {
            Some("repo_id") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                repo_id = Some(
                    text.parse()
                        .map_err(|_| AppError::BadRequest("invalid repo_id".into()))?,
                );
            }
            Some("release_definition") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                definition = Some(bytes.to_vec());
            }
            _ => {}
        }
    }
    let repo_id = repo_id.ok_or_else(|| AppError::BadRequest("missing repo_id field".into()))?;
    let definition = definition
        .ok_or_else(|| AppError::BadRequest("missing release_definition field".into()))?;

    let session = state.sessions.session(id)?;
    if session.repo_id != repo_id {
        return Err(AppError::BadRequest(format!(
            "session {id} belongs to repository {}, not {repo_id}",
            session.repo_id
        )));
    }

    let sessions = state.sessions.clone();
    let release = tokio::task::spawn_blocking(move || sessions.finalize(id, &definition))
        .await
        .map_err(|e| AppError::Internal(e.to_string()))??;
    Ok((StatusCode::CREATED, Json(release)))
}

pub async fn abort_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_auth(&state.config, &headers)?;
    Ok(Json(state.sessions.abort(id)?))
}
