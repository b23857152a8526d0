//! The authority's manifest: a zstd-compressed Avro datum holding an array of
//! `{path, hash, size, mtime}` records.

use std::path::Path;

use apache_avro::Schema;
use reqwest::StatusCode;

use crate::error::{Error, Result};
use crate::models::ContentEntry;
use crate::sync::authority::AuthorityClient;

/// Writer schema of the manifest datum.
pub const MANIFEST_SCHEMA: &str = r#"{
  "type": "array",
  "items": {
    "name": "FileListEntry",
    "type": "record",
    "fields": [
      {"name": "path", "type": "string"},
      {"name": "hash", "type": "string"},
      {"name": "size", "type": "long"},
      {"name": "mtime", "type": "long"}
    ]
  }
}"#;

const ZSTD_LEVEL: i32 = 3;

fn schema() -> Result<Schema> {
    Schema::parse_str(MANIFEST_SCHEMA)
        .map_err(|e| Error::Decode(format!("Invalid manifest schema: {}", e)))
}

/// Decompress and decode a manifest body.
pub fn decode_manifest(compressed: &[u8]) -> Result<Vec<ContentEntry>> {
    let schema = schema()?;
    let mut decoder = zstd::stream::read::Decoder::new(compressed)
        .map_err(|e| Error::Decode(format!("Failed to start zstd decoder: {}", e)))?;

    let value = apache_avro::from_avro_datum(&schema, &mut decoder, None)
        .map_err(|e| Error::Decode(format!("Failed to decode manifest: {}", e)))?;

    apache_avro::from_value::<Vec<ContentEntry>>(&value)
        .map_err(|e| Error::Decode(format!("Manifest has unexpected shape: {}", e)))
}

/// Inverse of [`decode_manifest`]. The node never sends manifests; this
/// exists for tooling and for standing up test authorities.
pub fn encode_manifest(entries: &[ContentEntry]) -> Result<Vec<u8>> {
    let schema = schema()?;
    let value = apache_avro::to_value(entries)
        .map_err(|e| Error::Decode(format!("Failed to encode manifest: {}", e)))?;
    let datum = apache_avro::to_avro_datum(&schema, value)
        .map_err(|e| Error::Decode(format!("Failed to encode manifest: {}", e)))?;

    zstd::encode_all(datum.as_slice(), ZSTD_LEVEL)
        .map_err(|e| Error::Decode(format!("Failed to compress manifest: {}", e)))
}

/// GET /files?lastModified={unix seconds}
///
/// 204 means no entries. Decoding runs on the blocking pool; large manifests
/// hold hundreds of thousands of records.
pub async fn fetch(client: &AuthorityClient, last_modified: i64) -> Result<Vec<ContentEntry>> {
    let resp = client
        .get_expecting(
            "/files",
            &[("lastModified", last_modified.to_string())],
            &[StatusCode::OK, StatusCode::NO_CONTENT],
        )
        .await?;

    if resp.status() == StatusCode::NO_CONTENT {
        tracing::info!("Authority reports no content (204)");
        return Ok(Vec::new());
    }

    let body = resp
        .bytes()
        .await
        .map_err(|e| Error::Transport(format!("Failed to read manifest body: {}", e)))?;

    let entries = tokio::task::spawn_blocking(move || decode_manifest(&body))
        .await
        .map_err(|e| Error::Decode(format!("Task join error: {}", e)))??;

    tracing::info!(entries = entries.len(), last_modified, "Fetched manifest");
    Ok(entries)
}

/// Write the decoded manifest as pretty JSON, for debugging.
pub async fn save_json(path: &Path, entries: &[ContentEntry]) -> Result<()> {
    let json = serde_json::to_vec_pretty(entries)
        .map_err(|e| Error::Storage(format!("Failed to serialize manifest: {}", e)))?;
    tokio::fs::write(path, json).await.map_err(|e| {
        Error::Storage(format!("Failed to write manifest to {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<ContentEntry> {
        vec![
            ContentEntry {
                path: "/assets/ab/abc123".into(),
                hash: "abc123".into(),
                size: 1024,
                mtime: 1_700_000_000_000,
            },
            ContentEntry {
                path: "/maven/de/def456".into(),
                hash: "def456".into(),
                size: 0,
                mtime: 0,
            },
        ]
    }

    #[test]
    fn test_decode_encoded_manifest() {
        let encoded = encode_manifest(&sample()).unwrap();
        assert_eq!(decode_manifest(&encoded).unwrap(), sample());
    }

    #[test]
    fn test_decode_empty_array() {
        let encoded = encode_manifest(&[]).unwrap();
        assert!(decode_manifest(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_decode_hand_built_datum() {
        // Avro array: block count 1 (zigzag 2), one record, terminating 0.
        // Strings are zigzag length + bytes, longs are zigzag varints.
        let mut datum = vec![0x02];
        datum.extend([0x04, b'/', b'a']);
        datum.extend([0x04, b'a', b'b']);
        datum.push(0x14); // size 10
        datum.push(0x03); // mtime -2
        datum.push(0x00);

        let compressed = zstd::encode_all(datum.as_slice(), 0).unwrap();
        assert_eq!(
            decode_manifest(&compressed).unwrap(),
            vec![ContentEntry {
                path: "/a".into(),
                hash: "ab".into(),
                size: 10,
                mtime: -2,
            }]
        );
    }

    #[test]
    fn test_uncompressed_body_is_decode_error() {
        assert!(matches!(
            decode_manifest(b"definitely not zstd"),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_truncated_datum_is_decode_error() {
        // Claims two records, carries none.
        let compressed = zstd::encode_all(&[0x04u8][..], 0).unwrap();
        assert!(matches!(decode_manifest(&compressed), Err(Error::Decode(_))));
    }

    #[tokio::test]
    async fn test_save_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("manifest.json");
        save_json(&path, &sample()).await.unwrap();

        let back: Vec<ContentEntry> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(back, sample());
    }
}
