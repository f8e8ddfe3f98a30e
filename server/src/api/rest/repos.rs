//! Repository management and the server-info handshake.

use crate::api::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{require_auth, AppError};

#[derive(Deserialize)]
pub struct CreateRepoRequest {
    pub name: String,
    #[serde(default = "default_storage_class")]
    pub storage_class: String,
}

fn default_storage_class() -> String {
    "standard".to_string()
}

pub async fn create_repo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateRepoRequest>,
) -> Result<impl IntoResponse, AppError> {
    require_auth(&state.config, &headers)?;
    if req.name.is_empty() || req.name.len() > 100 {
        return Err(AppError::BadRequest("repository name must be 1-100 chars".into()));
    }
    let repo = state.catalog.create_repository(&req.name, &req.storage_class)?;
    tracing::info!(repo = %repo.name, id = %repo.id, "repository created");
    Ok((StatusCode::CREATED, Json(repo)))
}

pub async fn list_repos(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_auth(&state.config, &headers)?;
    Ok(Json(state.catalog.list_repositories()?))
}

pub async fn get_repo(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_auth(&state.config, &headers)?;
    let repo = state
        .catalog
        .repository(id)?
        .ok_or_else(|| AppError::NotFound(format!("repository {id} not found")))?;
    Ok(Json(repo))
}

#[derive(Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Unauthenticated handshake endpoint.
pub async fn server_info(State(state): State<AppState>) -> Json<ServerInfo> {
    Json(ServerInfo {
        name: state.config.server_name.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
