use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Content type announced when the sender does not know a better one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Longest file name accepted in a METADATA frame, in bytes.
const MAX_NAME_LEN: usize = 255;

/// Description of the file being transferred, sent once per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub name: String,
    /// Total size in bytes.
    pub size: u64,
    #[serde(rename = "type", default)]
    pub content_type: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub last_modified: i64,
}

impl FileMetadata {
    /// Checks the fields a receiver relies on before buffering any chunk.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.name.trim().is_empty() {
            return Err(ProtocolError::InvalidMetadata("empty file name".into()));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(ProtocolError::InvalidMetadata(format!(
                "file name too long: {} bytes (max {MAX_NAME_LEN})",
                self.name.len()
            )));
        }
        if self.name.contains('\0') {
            return Err(ProtocolError::InvalidMetadata(
                "file name contains NUL".into(),
            ));
        }
        Ok(())
    }
}

/// Replaces every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
