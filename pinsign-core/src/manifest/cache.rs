//! Cached unsigned manifests
//!
//! The last built manifest is kept under the data directory so a re-sign does
//! not have to contact every endpoint again. Older caches hold only the array
//! of host records; both shapes load.

use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use super::{HostRecord, Manifest};
use crate::error::SignerError;

#[derive(Deserialize)]
#[serde(untagged)]
enum CachedHosts {
    Manifest(Manifest),
    Records(Vec<HostRecord>),
}

/// Load cached host records; `Ok(None)` when no cache exists
pub fn load_cached_hosts(path: &Path) -> Result<Option<Vec<HostRecord>>, SignerError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read(path).map_err(|source| SignerError::CacheRead {
        path: path.to_path_buf(),
        source,
    })?;

    let records = match serde_json::from_slice::<CachedHosts>(&content) {
        Ok(CachedHosts::Manifest(manifest)) => manifest.hashes,
        Ok(CachedHosts::Records(records)) => records,
        Err(e) => {
            return Err(SignerError::CacheInvalid {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };

    for record in &records {
        record.validate().map_err(|reason| SignerError::CacheInvalid {
            path: path.to_path_buf(),
            reason,
        })?;
    }

    debug!("Loaded {} cached host records from {}", records.len(), path.display());
    Ok(Some(records))
}

/// Persist the unsigned manifest as the cache
pub fn save_cache(path: &Path, manifest: &Manifest) -> Result<(), SignerError> {
    let json = serde_json::to_string_pretty(manifest)
        .map_err(|source| SignerError::Serialization { source })?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| SignerError::CacheWrite {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    std::fs::write(path, json).map_err(|source| SignerError::CacheWrite {
        path: path.to_path_buf(),
        source,
    })
}
