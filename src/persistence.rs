//! Registry snapshots on disk.
//!
//! A snapshot is one pretty-printed JSON document. Saving writes a sibling
//! temp file unique to that save, syncs it and renames it over the
//! destination, so a crash mid-write leaves the previous snapshot intact and
//! concurrent saves never share a temp file. Loading refuses any snapshot
//! whose approvals do not verify under the current signer.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::identity::{derive_hash, derive_id, ModuleId};
use crate::registry::{ModuleEntry, ModuleStatus, RegistryRecord};
use crate::signing::ApprovalSigner;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("snapshot I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("snapshot integrity violation: {0}")]
    IntegrityViolation(String),
    #[error("unsupported snapshot version {0} (expected {})", SNAPSHOT_VERSION)]
    UnsupportedVersion(u32),
}

/// On-disk document. Loading reads entries as raw JSON first so that one
/// malformed entry is reported as an integrity problem with that entry.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot<E = StoredEntry> {
    version: u32,
    saved_at: DateTime<Utc>,
    signer_public_key: String,
    entries: Vec<E>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    #[serde(flatten)]
    entry: ModuleEntry,
    /// Base64 module source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    PathBuf::from(tmp)
}

/// Write `records` to `path` atomically.
pub fn save(
    records: &[RegistryRecord],
    signer_public_key: &str,
    path: &Path,
) -> Result<(), PersistenceError> {
    let snapshot: Snapshot = Snapshot {
        version: SNAPSHOT_VERSION,
        saved_at: Utc::now(),
        signer_public_key: signer_public_key.to_string(),
        entries: records
            .iter()
            .map(|record| StoredEntry {
                entry: record.entry.clone(),
                source: record.source.as_deref().map(|bytes| STANDARD.encode(bytes)),
            })
            .collect(),
    };
    let data = serde_json::to_string_pretty(&snapshot)?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(io_error(dir))?;
    }

    let tmp = temp_path(path);
    let written = write_synced(&tmp, data.as_bytes()).and_then(|_| fs::rename(&tmp, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(io_error(path)(e));
    }

    info!(path = %path.display(), entries = records.len(), "snapshot saved");
    Ok(())
}

fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

/// Read and verify a snapshot. Every approved entry must carry signatures
/// that `signer` accepts for its content hash.
pub fn load(path: &Path, signer: &ApprovalSigner) -> Result<Vec<RegistryRecord>, PersistenceError> {
    let data = fs::read_to_string(path).map_err(io_error(path))?;

    let header: VersionHeader = serde_json::from_str(&data)?;
    if header.version != SNAPSHOT_VERSION {
        return Err(PersistenceError::UnsupportedVersion(header.version));
    }
    let snapshot: Snapshot<serde_json::Value> = serde_json::from_str(&data)?;

    let current_key = signer.public_key_hex();
    let key_matches = snapshot.signer_public_key == current_key;
    if !key_matches {
        warn!(
            snapshot_key = %snapshot.signer_public_key,
            current_key = %current_key,
            "snapshot was saved under a different approval key"
        );
    }

    let mut seen = HashSet::with_capacity(snapshot.entries.len());
    let mut records = Vec::with_capacity(snapshot.entries.len());
    for (index, raw) in snapshot.entries.into_iter().enumerate() {
        let stored: StoredEntry = serde_json::from_value(raw).map_err(|e| {
            PersistenceError::IntegrityViolation(format!("entry {}: {}", index, e))
        })?;
        let entry = stored.entry;
        let violation =
            |reason: String| PersistenceError::IntegrityViolation(format!("{}: {}", entry.module_id, reason));

        if entry.module_id.as_str().parse::<ModuleId>().as_ref() != Ok(&entry.module_id) {
            return Err(violation("malformed module id".to_string()));
        }
        if !seen.insert(entry.module_id.clone()) {
            return Err(violation("duplicate entry".to_string()));
        }
        entry.check_invariants().map_err(violation)?;

        if entry.status == ModuleStatus::Approved {
            let forged = entry
                .signatures
                .iter()
                .any(|sig| !signer.verify(sig, &entry.content_hash));
            if forged {
                let reason = if key_matches {
                    "approval signature does not verify".to_string()
                } else {
                    "approval signature does not verify (snapshot key differs from current key)"
                        .to_string()
                };
                return Err(violation(reason));
            }
        }

        let source = match stored.source {
            Some(encoded) => {
                let bytes = STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| violation(format!("undecodable source: {}", e)))?;
                if derive_id(&bytes) != entry.module_id {
                    return Err(violation("source does not match module id".to_string()));
                }
                if derive_hash(&bytes) != entry.content_hash {
                    return Err(violation("source does not match content hash".to_string()));
                }
                Some(Arc::<[u8]>::from(bytes))
            }
            None => None,
        };

        debug!(module_id = %entry.module_id, status = %entry.status, "snapshot entry verified");
        records.push(RegistryRecord { entry, source });
    }

    info!(
        path = %path.display(),
        entries = records.len(),
        saved_at = %snapshot.saved_at,
        "snapshot loaded"
    );
    Ok(records)
}
