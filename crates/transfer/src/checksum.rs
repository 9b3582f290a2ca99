//! Content digests for naming cache artifacts.

use std::io::Read;
use std::path::Path;

use assetcache_protocol::CacheKey;
use sha2::{Digest, Sha256};

use crate::TransferError;

const READ_BUFFER: usize = 64 * 1024;

/// Hex SHA-256 of everything in `path`.
pub fn file_digest(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Builds the key for `path` published under the logical name `file_name`.
pub fn cache_key_for_file(file_name: &str, path: &Path) -> Result<CacheKey, TransferError> {
    Ok(CacheKey::new(file_name, file_digest(path)?))
}
