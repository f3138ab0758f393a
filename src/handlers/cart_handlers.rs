//! HTTP handlers for cart operations.
//! Validates the uid and request body, then delegates to `CartService`.
//! Bundles are streamed so a download never buffers the whole archive.

use crate::{
    errors::AppError,
    services::{
        cart_service::{CartService, DeleteOutcome, Download},
        cart_store::NewFile,
        delivery::stream_bundle,
        layout::{fix_absolute_path, is_safe_relative_path},
    },
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};

/// Headers carrying cart status on HEAD responses, which have no body.
pub const STATUS_HEADER: &str = "x-cart-status";
pub const MESSAGE_HEADER: &str = "x-cart-message";

/// Body of `POST /{uid}`.
#[derive(Debug, Deserialize)]
pub struct StageRequest {
    pub fileids: Vec<FileRequest>,
}

#[derive(Debug, Deserialize)]
pub struct FileRequest {
    /// Archive id; clients send either a string or a number.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub path: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "file id must be a string or number, got {}",
            other
        ))),
    }
}

/// Strip a single leading separator from a uid taken off the request path.
pub fn fix_cart_uid(uid: &str) -> &str {
    fix_absolute_path(uid)
}

/// A uid is usable when it is present, non-empty, and resolves to a single
/// directory beneath the cart's root.
pub fn is_valid_uid(uid: Option<&str>) -> bool {
    match uid {
        Some(uid) => is_safe_relative_path(uid),
        None => false,
    }
}

/// Resolve and validate the uid taken from the request path.
fn cart_uid(raw: &str) -> Result<String, AppError> {
    let fixed = fix_cart_uid(raw);
    if !is_valid_uid(Some(fixed)) {
        return Err(invalid_uid(fixed));
    }
    Ok(fixed.to_string())
}

fn invalid_uid(uid: &str) -> AppError {
    AppError::bad_request(format!(
        "The uid `{}` is not valid: it must be a non-empty relative path after one \
         leading `/`, without `..` components",
        uid
    ))
}

/// Any verb on `/`: the request carries no uid at all.
pub async fn missing_uid() -> AppError {
    invalid_uid("")
}

/// GET `/{uid}`: stream the cart bundle as a tar archive.
pub async fn get_cart(
    State(service): State<CartService>,
    Path(raw): Path<String>,
) -> Result<Response, AppError> {
    let uid = cart_uid(&raw)?;

    match service.download(&uid).await? {
        Download::NotReady => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "message": "The cart is not ready for download" })),
        )
            .into_response()),
        Download::BundleMissing => Err(AppError::not_found("The cart bundle does not exist")),
        Download::Ready {
            bundle_dir,
            arcname,
        } => {
            let body = Body::from_stream(stream_bundle(bundle_dir, arcname.clone()));
            let mut response = Response::new(body);
            *response.status_mut() = StatusCode::OK;
            set_download_headers(response.headers_mut(), &arcname);
            Ok(response)
        }
    }
}

/// HEAD `/{uid}`: current `[status, error]` of the cart.
pub async fn head_cart(
    State(service): State<CartService>,
    Path(raw): Path<String>,
) -> Result<Response, AppError> {
    let uid = cart_uid(&raw)?;
    let report = service.cart_status(&uid).await?;

    let mut response = Json(json!({
        "error": report.error,
        "status": report.status,
    }))
    .into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&report.status) {
        headers.insert(HeaderName::from_static(STATUS_HEADER), value);
    }
    if let Some(value) = report
        .error
        .as_deref()
        .and_then(|e| HeaderValue::from_str(&e.replace(['\r', '\n'], " ")).ok())
    {
        headers.insert(HeaderName::from_static(MESSAGE_HEADER), value);
    }
    Ok(response)
}

/// POST `/{uid}`: queue the listed files for staging.
pub async fn stage_cart(
    State(service): State<CartService>,
    Path(raw): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let uid = cart_uid(&raw)?;

    let request: StageRequest = serde_json::from_slice(&body)
        .map_err(|err| AppError::bad_request(format!("Invalid staging request body: {}", err)))?;

    let mut files = Vec::with_capacity(request.fileids.len());
    for file in request.fileids {
        let bundle_path = fix_absolute_path(&file.path);
        if !is_safe_relative_path(bundle_path) {
            return Err(AppError::bad_request(format!(
                "Invalid file path `{}` for file `{}`",
                file.path, file.id
            )));
        }
        files.push(NewFile {
            file_name: file.id,
            bundle_path: bundle_path.to_string(),
        });
    }

    service.request_stage(&uid, files)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Cart Processing has begun" })),
    )
        .into_response())
}

/// DELETE `/{uid}`: remove every live cart for the uid.
pub async fn delete_cart(
    State(service): State<CartService>,
    Path(raw): Path<String>,
) -> Result<Response, AppError> {
    let uid = cart_uid(&raw)?;

    let (status, message) = match service.delete_cart(&uid).await? {
        DeleteOutcome::Deleted => (StatusCode::OK, "Cart Deleted Successfully".to_string()),
        DeleteOutcome::NotFound => (
            StatusCode::NOT_FOUND,
            format!("Cart with uid {} was not found or has already been deleted", uid),
        ),
        DeleteOutcome::Partial => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error with deleting cart with uid {}", uid),
        ),
    };
    Ok((status, Json(json!({ "message": message }))).into_response())
}

fn set_download_headers(headers: &mut HeaderMap, arcname: &str) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    let disposition = format!(
        "attachment; filename=\"{}.tar\"",
        arcname.replace(['"', '\\', '/'], "_")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}
