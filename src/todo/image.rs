use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use std::fs;
use std::path::Path;
use uuid::Uuid;

use super::item::ItemId;

/// A file picked by the user, read fully into memory before upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let content_type = mime_guess::from_path(&file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Self {
            file_name,
            content_type,
            bytes,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("Failed to read image {path:?}"))?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        Ok(Self::new(file_name, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Lowercase extension of the original file name, `bin` when there is none
    pub fn extension(&self) -> String {
        Path::new(&self.file_name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| "bin".to_string())
    }
}

/// Object key for an upload: `<user>/<item>-<unix millis>-<nonce>.<ext>`.
/// The user prefix keeps objects scoped to their owner.
pub fn storage_path_for(user_id: &str, item_id: ItemId, at: DateTime<Utc>, extension: &str) -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!(
        "{user_id}/{item_id}-{}-{}.{extension}",
        at.timestamp_millis(),
        &nonce[..8]
    )
}

/// Recover the object key from a public URL of the form
/// `<base>/object/public/<bucket>/<path>`.
///
/// Returns `None` when the URL does not have that shape.
pub fn path_from_public_url(url: &str, bucket: &str) -> Option<String> {
    let marker = format!("/object/public/{bucket}/");
    let start = url.find(&marker)? + marker.len();
    let rest = &url[start..];
    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    if rest.is_empty() {
        return None;
    }

    let decoded = percent_decode_str(rest).decode_utf8().ok()?.into_owned();
    if decoded.split('/').any(|segment| segment.is_empty() || segment == "..") {
        return None;
    }
    Some(decoded)
}
