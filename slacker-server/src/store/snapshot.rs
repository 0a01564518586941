//! On-disk form of a tenant: gzip-compressed JSON, one file per tenant,
//! replaced atomically via a temp file and rename.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use slacker_core::TenantData;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub const SNAPSHOT_SUFFIX: &str = ".json.gz";
const TEMP_SUFFIX: &str = ".tmp";
const CORRUPT_SUFFIX: &str = ".corrupt";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("snapshot {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// File name for a tenant. Bytes outside `[A-Za-z0-9_-]` are percent-encoded
/// so any tenant id maps to a single safe path component.
pub fn file_name(tenant_id: &str) -> String {
    let mut name = String::with_capacity(tenant_id.len() + SNAPSHOT_SUFFIX.len());
    for byte in tenant_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{:02X}", byte));
        }
    }
    name.push_str(SNAPSHOT_SUFFIX);
    name
}

/// Inverse of [`file_name`]; `None` for anything that is not a snapshot.
pub fn tenant_from_file_name(name: &str) -> Option<String> {
    let encoded = name.strip_suffix(SNAPSHOT_SUFFIX)?;
    if encoded.is_empty() {
        return None;
    }
    let bytes = encoded.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    let tenant = String::from_utf8(decoded).ok()?;
    // Only canonical names, so every tenant has exactly one file.
    (file_name(&tenant) == name).then_some(tenant)
}

pub fn snapshot_path(dir: &Path, tenant_id: &str) -> PathBuf {
    dir.join(file_name(tenant_id))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Read a snapshot. A missing file is `Ok(None)`.
pub fn load(path: &Path) -> Result<Option<TenantData>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let decoder = GzDecoder::new(BufReader::new(file));
    serde_json::from_reader(decoder)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Replace the snapshot at `path` without ever exposing a partial file.
pub fn write_atomic(path: &Path, data: &TenantData) -> Result<(), StoreError> {
    let temp = sibling(path, TEMP_SUFFIX);
    let result = write_then_rename(&temp, path, data);
    if result.is_err() {
        if let Err(e) = fs::remove_file(&temp) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove temp snapshot {}: {}", temp.display(), e);
            }
        }
    }
    result
}

fn write_then_rename(temp: &Path, path: &Path, data: &TenantData) -> Result<(), StoreError> {
    let file = File::create(temp)?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    serde_json::to_writer(&mut encoder, data).map_err(StoreError::Encode)?;
    let file = encoder.finish()?.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);

    fs::rename(temp, path)?;

    // Persist the rename itself. Not every platform lets us open a directory.
    if let Some(dir) = path.parent() {
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Move an unreadable snapshot aside so the tenant can start fresh without
/// losing the evidence.
pub fn quarantine(path: &Path) -> Result<PathBuf, StoreError> {
    let target = sibling(path, CORRUPT_SUFFIX);
    fs::rename(path, &target)?;
    Ok(target)
}

/// Tenant ids of every snapshot in `dir`.
pub fn list_tenants(dir: &Path) -> Result<Vec<String>, StoreError> {
    let mut tenants = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(tenant) = entry.file_name().to_str().and_then(tenant_from_file_name) {
            tenants.push(tenant);
        }
    }
    tenants.sort();
    Ok(tenants)
}
