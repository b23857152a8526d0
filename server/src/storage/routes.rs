use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::auth::middleware::SignedDownload;
use crate::state::AppState;
use crate::storage::Retrieval;

/// GET /download/{hash}?sign={signature}
///
/// The signature has already been checked by the `SignedDownload` extractor.
/// Local backends stream the bytes; remote backends answer with a 302 to the
/// object's URL on the backend.
pub async fn download(
    State(state): State<AppState>,
    SignedDownload { hash }: SignedDownload,
) -> Response {
    match state.store.get(&hash).await {
        Ok(Some(Retrieval::Redirect(url))) => {
            (StatusCode::FOUND, [(header::LOCATION, url)]).into_response()
        }
        Ok(Some(Retrieval::Inline { body, len })) => {
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream");
            if let Some(len) = len {
                builder = builder.header(header::CONTENT_LENGTH, len);
            }
            builder
                .body(Body::from_stream(body))
                .unwrap_or_else(|_| internal_error())
        }
        Ok(None) => (StatusCode::NOT_FOUND, "not found").into_response(),
        Err(e) => {
            tracing::error!(hash = %hash, "Failed to read object: {}", e);
            internal_error()
        }
    }
}

/// GET /download and /download/ with no hash.
pub async fn missing_hash() -> impl IntoResponse {
    (StatusCode::BAD_REQUEST, "bad request")
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}
