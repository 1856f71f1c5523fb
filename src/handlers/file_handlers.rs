//! HTTP handlers for uploads, downloads and file info.
//! Bodies are streamed in both directions; all lifecycle rules live in
//! `LifecycleEngine`.

use crate::{
    errors::AppError,
    models::record::ObjectRecord,
    routes::auth::{API_KEY_FIELD, ApiKeyStatus},
    services::lifecycle::{Download, UploadMeta},
    state::AppState,
    units::format_bytes,
};
use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, Multipart, Path, Query, State},
    http::{Extensions, HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::{io, net::SocketAddr};
use tokio_util::io::ReaderStream;

const DEFAULT_FILENAME: &str = "upload.bin";
const MAX_FILENAME_LEN: usize = 255;

/// Query params accepted by the raw `PUT /` upload.
#[derive(Debug, Deserialize)]
pub struct RawUploadQuery {
    pub filename: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
    pub unique_id: String,
    pub download_url: String,
    pub file_size: i64,
}

#[derive(Debug, Serialize)]
pub struct FileInfo {
    pub id: i64,
    pub unique_id: String,
    pub original_name: String,
    pub file_size: i64,
    pub mime_type: Option<String>,
    pub extension: String,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub downloads: i64,
}

impl From<ObjectRecord> for FileInfo {
    fn from(record: ObjectRecord) -> Self {
        Self {
            id: record.seq,
            unique_id: record.id,
            original_name: record.original_name,
            file_size: record.size_bytes,
            mime_type: record.mime_type,
            extension: record.extension,
            uploaded_at: record.uploaded_at,
            expires_at: record.expires_at,
            downloads: record.download_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileInfoResponse {
    pub success: bool,
    pub data: FileInfo,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub success: bool,
    pub total_files: i64,
    pub total_size: i64,
    pub total_size_formatted: String,
}

/// `PUT /` - raw body upload, answers with the bare download URL.
pub async fn upload_raw(
    State(state): State<AppState>,
    Query(q): Query<RawUploadQuery>,
    headers: HeaderMap,
    extensions: Extensions,
    body: Body,
) -> Result<Response, AppError> {
    let original_name = headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_disposition)
        .or(q.filename)
        .map(|name| sanitize_filename(&name))
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string());

    let meta = UploadMeta {
        original_name,
        mime_type: header_string(&headers, header::CONTENT_TYPE),
        owner_address: client_address(&extensions),
        declared_size: header_string(&headers, header::CONTENT_LENGTH)
            .and_then(|len| len.parse::<u64>().ok()),
    };

    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));
    let record = state
        .engine
        .store(meta, stream)
        .await
        .map_err(|err| AppError::from(err).plain())?;

    let url = download_url(&state, &headers, &record);
    tracing::info!("raw upload {} stored as {}", record.original_name, record.id);
    Ok((StatusCode::OK, format!("{}\n", url)).into_response())
}

/// `POST /api/upload` - multipart upload of the `file` field.
pub async fn upload_multipart(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let key_pending = extensions.get::<ApiKeyStatus>() == Some(&ApiKeyStatus::PendingFormField);
    let mut form_key: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("Malformed multipart body: {}", err)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(API_KEY_FIELD) => {
                let value = field.text().await.map_err(|err| {
                    AppError::bad_request(format!("Malformed multipart body: {}", err))
                })?;
                form_key = Some(value);
            }
            Some("file") => {
                if key_pending && !form_key_matches(&state, form_key.as_deref()) {
                    return Err(AppError::unauthorized());
                }

                let meta = UploadMeta {
                    original_name: field
                        .file_name()
                        .map(sanitize_filename)
                        .unwrap_or_else(|| DEFAULT_FILENAME.to_string()),
                    mime_type: field.content_type().map(str::to_string),
                    owner_address: client_address(&extensions),
                    declared_size: None,
                };
                let stream = field.map(|chunk| chunk.map_err(io::Error::other));
                let record = state.engine.store(meta, stream).await?;

                tracing::info!("form upload {} stored as {}", record.original_name, record.id);
                return Ok(Json(UploadResponse {
                    success: true,
                    message: "File uploaded successfully".into(),
                    download_url: download_url(&state, &headers, &record),
                    unique_id: record.id,
                    file_size: record.size_bytes,
                }));
            }
            _ => {}
        }
    }

    if key_pending && !form_key_matches(&state, form_key.as_deref()) {
        return Err(AppError::unauthorized());
    }
    Err(AppError::bad_request("No file provided"))
}

/// `GET /d/{id}{.ext}` and `GET /download/{id}{.ext}`.
///
/// The download is counted before the first byte goes out.
pub async fn download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let id = filename
        .split_once('.')
        .map_or(filename.as_str(), |(id, _)| id);
    let Download { record, file } = state.engine.retrieve(id).await?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &record);
    Ok(response)
}

/// `GET /api/files/{id}` - metadata only, never counts as a download.
pub async fn file_info(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FileInfoResponse>, AppError> {
    let record = state.engine.describe(&id).await?;
    Ok(Json(FileInfoResponse {
        success: true,
        data: record.into(),
    }))
}

/// `GET /api/stats`
pub async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, AppError> {
    let stats = state.engine.stats().await?;
    Ok(Json(StatsResponse {
        success: true,
        total_files: stats.total_files,
        total_size: stats.total_size,
        total_size_formatted: format_bytes(stats.total_size.max(0) as u64),
    }))
}

fn form_key_matches(state: &AppState, provided: Option<&str>) -> bool {
    match (state.settings.api_key.as_ref(), provided) {
        (None, _) => true,
        (Some(expected), Some(key)) => expected.matches(key),
        (Some(_), None) => false,
    }
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn client_address(extensions: &Extensions) -> Option<String> {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// Public link for a stored record, e.g. `https://host/d/<id>.pdf`.
fn download_url(state: &AppState, headers: &HeaderMap, record: &ObjectRecord) -> String {
    let base = match &state.settings.public_url {
        Some(url) => url.clone(),
        None => {
            let scheme = header_string(headers, header::HeaderName::from_static("x-forwarded-proto"))
                .and_then(|proto| proto.split(',').next().map(|p| p.trim().to_string()))
                .filter(|proto| proto == "https" || proto == "http")
                .unwrap_or_else(|| "http".into());
            let host = header_string(headers, header::HOST).unwrap_or_else(|| "localhost".into());
            format!("{}://{}", scheme, host)
        }
    };
    format!("{}/d/{}{}", base, record.id, record.extension)
}

/// Pull `filename="..."` (or unquoted `filename=...`) out of a
/// Content-Disposition header.
fn filename_from_disposition(value: &str) -> Option<String> {
    value.split(';').map(str::trim).find_map(|part| {
        let (key, raw) = part.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("filename") {
            return None;
        }
        let name = raw.trim().trim_matches('"');
        (!name.is_empty()).then(|| name.to_string())
    })
}

/// Keep only the final path component and drop control characters.
fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_FILENAME_LEN)
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        DEFAULT_FILENAME.to_string()
    } else {
        cleaned.to_string()
    }
}

fn set_download_headers(headers: &mut HeaderMap, record: &ObjectRecord) {
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&record.original_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(record.size_bytes.max(0) as u64),
    );

    if let Some(value) = record
        .mime_type
        .as_deref()
        .and_then(|mime| HeaderValue::from_str(mime).ok())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
}

/// `attachment; filename="..."`, plus an RFC 5987 `filename*` when the name
/// is not plain ASCII.
fn content_disposition(name: &str) -> String {
    let fallback: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();

    if name.is_ascii() {
        return format!("attachment; filename=\"{}\"", fallback);
    }
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        percent_encode(name)
    )
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}
