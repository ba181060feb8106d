use std::path::{Component, Path};

use sha2::{Digest, Sha256};

use crate::error::SinkError;

/// Validates a local destination path before any file is created.
///
/// Absolute and relative paths are both fine. Rejects:
/// - Empty paths
/// - Parent directory traversal (`..`)
/// - Paths without a final file name (`/`, `dir/`, `.`)
pub fn validate_destination_path(path: &Path) -> Result<(), SinkError> {
    if path.as_os_str().is_empty() {
        return Err(SinkError::InvalidAddress("empty path".into()));
    }

    if path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(SinkError::InvalidAddress(format!(
            "parent directory traversal not allowed: {}",
            path.display()
        )));
    }

    let has_file_name = !path.to_string_lossy().ends_with(['/', '\\'])
        && matches!(path.components().next_back(), Some(Component::Normal(_)));
    if !has_file_name {
        return Err(SinkError::InvalidAddress(format!(
            "path does not name a file: {}",
            path.display()
        )));
    }

    Ok(())
}

/// Validates an object-store key (`bucket/<key>`).
pub fn validate_object_key(key: &str) -> Result<(), SinkError> {
    if key.is_empty() {
        return Err(SinkError::InvalidAddress("empty object key".into()));
    }
    if key.ends_with('/') {
        return Err(SinkError::InvalidAddress(format!(
            "object key names a prefix, not an object: {key}"
        )));
    }
    if key.split('/').any(|segment| segment == "..") {
        return Err(SinkError::InvalidAddress(format!(
            "parent segment not allowed in object key: {key}"
        )));
    }
    Ok(())
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
