use serde::{Deserialize, Serialize};

/// One manifest record. `hash` is the content fingerprint and the only
/// identity key: two entries with the same hash are the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    /// Path on the authority server, relative to its base URL (usually `/...`).
    pub path: String,
    pub hash: String,
    pub size: i64,
    /// Modification time (unix seconds).
    pub mtime: i64,
}

/// An object found by enumerating a content store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub hash: String,
    pub size: i64,
    /// Modification time (unix seconds), 0 when the backend does not report it.
    pub mtime: i64,
}

/// Aggregate of one download pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Outcome of a garbage collection sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub deleted: usize,
    pub failed: usize,
}
