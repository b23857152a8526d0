use std::sync::Arc;

use crate::storage::ContentStore;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Backend the download route serves from
    pub store: Arc<dyn ContentStore>,
    /// Key for download signatures
    pub cluster_secret: Arc<str>,
    /// Emit one `access` event per request
    pub access_log: bool,
}

impl AppState {
    pub fn new(store: Arc<dyn ContentStore>, cluster_secret: &str, access_log: bool) -> Self {
        Self {
            store,
            cluster_secret: Arc::from(cluster_secret),
            access_log,
        }
    }
}
