//! Release routes: metadata lookup and full or delta downloads.
//!
//! Downloads stream back as `tar.zst`. A plain download contains the
//! reassembled files under `<component>/<path>`; a `?diff=` download
//! contains `delta-manifest.json` plus only the chunks the old release is
//! missing, under `chunks/<hex>`.

use crate::api::AppState;
use crate::catalog::Release;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use stash_core::delta::manifest::compute_delta;
use stash_core::package::codec::decode_package;
use stash_core::package::ReleasePackage;
use stash_core::pack::store::ChunkStore;
use stash_core::{Error, Hash32};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::error::{require_auth, AppError};

const ARCHIVE_ZSTD_LEVEL: i32 = 3;

pub async fn get_release(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_auth(&state.config, &headers)?;
    let release = state
        .catalog
        .release(&id)?
        .ok_or_else(|| AppError::NotFound(format!("release {id} not found")))?;
    Ok(Json(release))
}

pub async fn list_releases(
    State(state): State<AppState>,
    Path(repo_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_auth(&state.config, &headers)?;
    state
        .catalog
        .repository(repo_id)?
        .ok_or_else(|| AppError::NotFound(format!("repository {repo_id} not found")))?;
    Ok(Json(state.catalog.list_releases(repo_id)?))
}

#[derive(Deserialize)]
pub struct DownloadQuery {
    pub component: Option<String>,
    /// Old release id; switches the download into delta form.
    pub diff: Option<String>,
}

pub async fn download_release(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_auth(&state.config, &headers)?;

    let state_for_task = state.clone();
    let archive = tokio::task::spawn_blocking(move || {
        build_archive(&state_for_task, &id, query.component.as_deref(), query.diff.as_deref())
    })
    .await
    .map_err(|e| AppError::Internal(e.to_string()))??;

    let disposition = format!("attachment; filename=\"{}\"", archive.filename);
    Ok((
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/zstd"),
            ),
            (
                header::CONTENT_DISPOSITION,
                header::HeaderValue::from_str(&disposition)
                    .map_err(|e| AppError::Internal(e.to_string()))?,
            ),
        ],
        archive.bytes,
    ))
}

struct Archive {
    filename: String,
    bytes: Vec<u8>,
}

/// Load, checksum-verify, and decode one release definition.
fn load_package(state: &AppState, release: &Release) -> Result<ReleasePackage, Error> {
    let bytes = state.releases.load(&release.id)?;
    if Hash32::compute(&bytes) != release.definition_checksum {
        return Err(Error::Corrupt(format!(
            "release definition {} does not match its recorded checksum",
            release.id
        )));
    }
    decode_package(&bytes)
}

fn build_archive(
    state: &AppState,
    release_id: &str,
    component: Option<&str>,
    diff: Option<&str>,
) -> Result<Archive, AppError> {
    let release = state
        .catalog
        .release(release_id)?
        .ok_or_else(|| AppError::NotFound(format!("release {release_id} not found")))?;
    let repo = state
        .catalog
        .repository(release.repo_id)?
        .ok_or_else(|| AppError::NotFound(format!("repository {} not found", release.repo_id)))?;
    let pkg = load_package(state, &release)?;
    if let Some(name) = component {
        if pkg.component(name).is_none() {
            return Err(AppError::NotFound(format!(
                "release {release_id} has no component '{name}'"
            )));
        }
    }
    let store = state.stores.store(repo.chunk_store_id)?;

    let encoder = zstd::stream::Encoder::new(Vec::new(), ARCHIVE_ZSTD_LEVEL)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let mut builder = tar::Builder::new(encoder);

    let filename = match diff {
        None => {
            append_full_release(&mut builder, &pkg, component, &store)?;
            format!("{release_id}.tar.zst")
        }
        Some(old_id) => {
            let old_release = state
                .catalog
                .release(old_id)?
                .ok_or_else(|| AppError::NotFound(format!("release {old_id} not found")))?;
            if old_release.repo_id != release.repo_id {
                return Err(AppError::BadRequest(format!(
                    "releases {old_id} and {release_id} belong to different repositories"
                )));
            }
            let old_pkg = load_package(state, &old_release)?;
            append_delta_release(&mut builder, &old_pkg, &pkg, component, &store)?;
            format!("{old_id}-to-{release_id}.tar.zst")
        }
    };

    let encoder = builder
        .into_inner()
        .map_err(|e| AppError::Internal(e.to_string()))?;
    let bytes = encoder
        .finish()
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Archive { filename, bytes })
}

fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
) -> Result<(), AppError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, path, data)
        .map_err(|e| AppError::Internal(e.to_string()))
}

fn append_full_release<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    pkg: &ReleasePackage,
    component: Option<&str>,
    store: &Arc<ChunkStore>,
) -> Result<(), AppError> {
    for (comp, file) in pkg.iter_files() {
        if component.map_or(false, |c| c != comp.name) {
            continue;
        }
        let data = pkg.reassemble_file(file, |hash| store.read(hash))?;
        let path = format!("{}/{}", comp.name, file.name);
        append_entry(builder, &path, &data)?;
    }
    Ok(())
}

fn append_delta_release<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    old: &ReleasePackage,
    new: &ReleasePackage,
    component: Option<&str>,
    store: &Arc<ChunkStore>,
) -> Result<(), AppError> {
    let plan = compute_delta(old, new, component, &HashMap::new(), &HashMap::new())?;
    let manifest_json = serde_json::to_vec_pretty(&plan.manifest)
        .map_err(|e| AppError::Internal(e.to_string()))?;
    append_entry(builder, "delta-manifest.json", &manifest_json)?;
    for hash in &plan.unique_new_chunks {
        let data = store.read(hash)?;
        append_entry(builder, &format!("chunks/{hash}"), &data)?;
    }
    tracing::debug!(
        old = %plan.manifest.old_id,
        new = %plan.manifest.new_id,
        new_chunks = plan.unique_new_chunks.len(),
        "delta archive assembled"
    );
    Ok(())
}
