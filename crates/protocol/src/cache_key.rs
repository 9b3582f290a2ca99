//! Content-addressed cache naming.
//!
//! A cached artifact is stored as `<stem>.[<hash>]<ext>`: the hash marker is
//! inserted before the last `.` of the logical name, or appended when the
//! name has no extension.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one cache artifact: a logical file name plus its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub file_name: String,
    pub hash: String,
}

impl CacheKey {
    pub fn new(file_name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            hash: hash.into(),
        }
    }

    /// Returns the composite on-disk name, e.g. `mesh.[abc123].fbx`.
    pub fn cache_file_name(&self) -> String {
        compose_cache_name(&self.file_name, &self.hash)
    }

    /// Parses a composite on-disk name back into a key.
    ///
    /// Names without a `.[hash]` marker yield an empty hash.
    pub fn from_cache_file_name(name: &str) -> Self {
        let (file_name, hash) = split_cache_name(name);
        Self { file_name, hash }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_file_name())
    }
}

/// Inserts `.[hash]` before the extension of `file_name`.
pub fn compose_cache_name(file_name: &str, hash: &str) -> String {
    match file_name.rfind('.') {
        Some(dot) => format!("{}.[{hash}]{}", &file_name[..dot], &file_name[dot..]),
        None => format!("{file_name}.[{hash}]"),
    }
}

/// Splits a composite name at its last `.[` ... `]` marker.
pub fn split_cache_name(name: &str) -> (String, String) {
    let Some(open) = name.rfind(".[") else {
        return (name.to_string(), String::new());
    };
    let hash_start = open + 2;
    let Some(close) = name[hash_start..].find(']') else {
        return (name.to_string(), String::new());
    };
    let close = hash_start + close;

    let file_name = format!("{}{}", &name[..open], &name[close + 1..]);
    (file_name, name[hash_start..close].to_string())
}
