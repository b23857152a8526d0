use axum::{
    extract::{FromRequestParts, Path, Query},
    http::{request::Parts, StatusCode},
};
use serde::Deserialize;

use crate::auth::sign;
use crate::state::AppState;
use crate::storage;

const BAD_REQUEST: (StatusCode, &str) = (StatusCode::BAD_REQUEST, "bad request");
const FORBIDDEN: (StatusCode, &str) = (StatusCode::FORBIDDEN, "forbidden");

#[derive(Debug, Deserialize)]
pub struct SignQuery {
    pub sign: Option<String>,
}

/// A download request whose `sign` query parameter has been verified against
/// `hex(HMAC-SHA256(cluster_secret, hash))`.
///
/// Implements axum's FromRequestParts so handlers taking it never run for a
/// malformed hash (400) or a missing/incorrect signature (403).
#[derive(Debug, Clone)]
pub struct SignedDownload {
    pub hash: String,
}

impl FromRequestParts<AppState> for SignedDownload {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Path(hash) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(|_| BAD_REQUEST)?;

        if storage::validate_hash(&hash).is_err() {
            return Err(BAD_REQUEST);
        }

        let Query(query) = Query::<SignQuery>::from_request_parts(parts, state)
            .await
            .map_err(|_| FORBIDDEN)?;

        let signature = query.sign.ok_or(FORBIDDEN)?;
        if !sign::verify(&state.cluster_secret, &hash, &signature) {
            return Err(FORBIDDEN);
        }

        Ok(SignedDownload { hash })
    }
}
