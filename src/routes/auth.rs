//! Shared-secret gate for the upload and API routes.
//!
//! The key may arrive as an `X-API-Key` header, an `api_key` query parameter,
//! or (multipart uploads only) an `api_key` form field. Form fields can only
//! be read by the handler, so for a multipart `POST /api/upload` without a
//! header or query key the middleware marks the request as pending and the
//! upload handler finishes the check. Every other gated route is decided
//! here.

use crate::{errors::AppError, state::AppState};
use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, Method, header},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_KEY_FIELD: &str = "api_key";

const MULTIPART_UPLOAD_PATH: &str = "/api/upload";

/// Outcome of the gate, stored in request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKeyStatus {
    Verified,
    /// Must be satisfied by an `api_key` form field before the file field.
    PendingFormField,
}

#[derive(Debug, Deserialize)]
struct ApiKeyQuery {
    api_key: Option<String>,
}

/// Middleware rejecting requests without the configured API key.
///
/// A no-op when no key is configured.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.settings.api_key.as_ref() else {
        return Ok(next.run(req).await);
    };

    let provided = header_key(req.headers()).or_else(|| {
        Query::<ApiKeyQuery>::try_from_uri(req.uri())
            .ok()
            .and_then(|Query(q)| q.api_key)
    });

    let status = match provided {
        Some(key) if expected.matches(&key) => ApiKeyStatus::Verified,
        None if accepts_form_key(&req) => ApiKeyStatus::PendingFormField,
        _ => {
            tracing::debug!("rejected {} {}: bad api key", req.method(), req.uri().path());
            let err = AppError::unauthorized();
            return Err(if is_raw_upload(&req) { err.plain() } else { err });
        }
    };

    req.extensions_mut().insert(status);
    Ok(next.run(req).await)
}

fn header_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|key| !key.is_empty())
}

/// `PUT /`, the curl-style upload that answers in plain text.
pub(crate) fn is_raw_upload(req: &Request) -> bool {
    req.method() == Method::PUT && req.uri().path() == "/"
}

/// Only the multipart upload handler reads an `api_key` form field.
fn accepts_form_key(req: &Request) -> bool {
    req.method() == Method::POST
        && req.uri().path() == MULTIPART_UPLOAD_PATH
        && is_multipart(req.headers())
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().starts_with("multipart/form-data"))
}
