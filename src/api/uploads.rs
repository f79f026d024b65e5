//! Upload and signed-download endpoints.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{
        header::{CONTENT_LENGTH, CONTENT_TYPE},
        HeaderMap, HeaderValue,
    },
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::{ReaderStream, StreamReader};

use super::{created, new_id, ApiResult, ValidQuery};
use crate::auth::Identity;
use crate::blob::{content_type_for, user_file_path, user_image_path};
use crate::errors::AppError;
use crate::models::{collections, is_image_path, TempFile};
use crate::AppState;

/// Lifetime of the URLs returned by uploads.
pub const SIGNED_URL_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub path: String,
    pub url: String,
    pub size: u64,
    pub content_type: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    /// Register the upload for removal by the daily cleanup
    #[serde(default)]
    pub temporary: bool,
}

#[derive(Debug, Deserialize)]
pub struct SignedParams {
    pub expires: i64,
    pub signature: String,
}

/// PUT /users/:id/images/:name - Owner or admin; image extensions only.
pub async fn upload_image(
    State(state): State<AppState>,
    identity: Identity,
    Path((user_id, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<UploadResponse> {
    identity.ensure_can_manage(&user_id)?;
    let path = user_image_path(&user_id, &name);
    if !is_image_path(&path) {
        return Err(AppError::Validation(format!(
            "{} is not a supported image",
            name
        )));
    }
    store_upload(&state, &path, &headers, body).await
}

/// PUT /users/:id/files/:name - Owner or admin.
pub async fn upload_file(
    State(state): State<AppState>,
    identity: Identity,
    Path((user_id, name)): Path<(String, String)>,
    ValidQuery(params): ValidQuery<UploadParams>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<UploadResponse> {
    identity.ensure_can_manage(&user_id)?;
    let path = user_file_path(&user_id, &name);
    let response = store_upload(&state, &path, &headers, body).await?;
    if params.temporary {
        let record = TempFile {
            id: new_id(),
            path: path.clone(),
            user_id,
            created_at: Utc::now(),
        };
        state
            .store
            .put_as(collections::TEMP_FILES, &record.id, &record)
            .await?;
    }
    Ok(response)
}

async fn store_upload(
    state: &AppState,
    path: &str,
    headers: &HeaderMap,
    body: Body,
) -> ApiResult<UploadResponse> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && *v != "application/octet-stream")
        .unwrap_or_else(|| content_type_for(path))
        .to_string();

    let stream = body.into_data_stream().map_err(std::io::Error::other);
    let reader = Box::pin(StreamReader::new(stream));
    let info = state
        .blobs
        .upload(path, reader, &content_type, BTreeMap::new())
        .await?;

    tracing::info!(path = %info.name, size = info.size, "object uploaded");
    created(UploadResponse {
        url: state.blobs.signed_url(&info.name, SIGNED_URL_TTL),
        path: info.name,
        size: info.size,
        content_type: info.content_type,
    })
}

/// GET /blobs/*path?expires=&signature= - Serve an object behind a valid signature.
pub async fn download_blob(
    State(state): State<AppState>,
    Path(path): Path<String>,
    ValidQuery(params): ValidQuery<SignedParams>,
) -> Result<Response, AppError> {
    if !state
        .blobs
        .verify_signature(&path, params.expires, &params.signature)
    {
        return Err(AppError::Forbidden(
            "Invalid or expired signature".to_string(),
        ));
    }
    let info = state.blobs.stat(&path).await?;
    let reader = state.blobs.download(&path).await?;
    let body = Body::from_stream(ReaderStream::new(reader));

    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&info.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(CONTENT_TYPE, content_type);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(info.size));
    Ok((headers, body).into_response())
}
