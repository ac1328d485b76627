use std::path::{Component, Path, PathBuf};

use dropwire_protocol::sanitize_file_name;
use tracing::info;

use crate::TransferError;
use crate::types::ReceivedFile;

/// Validates that a file name is a single plain path component.
///
/// Rejects:
/// - Empty names, `.` and `..`
/// - Anything with a separator, root or Windows prefix
pub fn validate_output_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty file name".into()));
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::CurDir | Component::ParentDir), None) => Err(
            TransferError::InvalidPath(format!("reserved file name: {name}")),
        ),
        _ => Err(TransferError::InvalidPath(format!(
            "file name must be a single component: {name}"
        ))),
    }
}

/// Writes a received file into `dir` and returns the path used.
///
/// The announced name is sanitized first. An existing file is never
/// overwritten; `name-1.ext`, `name-2.ext`, ... are tried instead.
pub fn save_received_file(dir: &Path, file: &ReceivedFile) -> Result<PathBuf, TransferError> {
    let name = sanitize_file_name(&file.metadata.name);
    validate_output_name(&name)?;

    std::fs::create_dir_all(dir)?;
    let path = unique_path(dir, &name);
    std::fs::write(&path, &file.data)?;

    info!(
        path = %path.display(),
        size = file.data.len(),
        "received file saved"
    );
    Ok(path)
}

fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };

    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem}-{n}.{ext}")),
            None => dir.join(format!("{stem}-{n}")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
