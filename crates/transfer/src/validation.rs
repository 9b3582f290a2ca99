use std::path::{Component, Path};

use crate::TransferError;
use crate::receiver::is_partial_name;

/// Validates a cache file name received from a peer.
///
/// Names are joined onto a cache directory, so anything that could
/// resolve outside of it is rejected:
/// - Empty names
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
/// - Names that reduce to nothing (`.`, `./`)
/// - Staging names of files still being received (`.<name>.part`)
pub fn validate_cache_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty name".into()));
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {name}"
        )));
    }

    let mut has_file = false;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidPath(format!(
                    "parent directory traversal not allowed: {name}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute path not allowed: {name}"
                )));
            }
            Component::Normal(_) => has_file = true,
            Component::CurDir => {}
        }
    }

    if !has_file {
        return Err(TransferError::InvalidPath(format!("no file name: {name}")));
    }
    if path
        .file_name()
        .is_some_and(|n| is_partial_name(&n.to_string_lossy()))
    {
        return Err(TransferError::InvalidPath(format!(
            "in-progress transfer name: {name}"
        )));
    }
    Ok(())
}
