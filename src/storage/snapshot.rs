//! UTXO snapshot file
//!
//! The live set and nonce table as of some active block, written as JSON
//! beside the block database. Each write first rotates the previous file to
//! `.bak`; a load that fails on the primary falls back to the backup.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::crypto::Hash;
use crate::validation::NonceSnapshot;
use super::{snapshot_digest, StorageError, StorageResult, UtxoSnapshot};

/// Persisted snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub height: u64,
    pub tip_hash: Hash,
    pub utxos: UtxoSnapshot,
    #[serde(default)]
    pub nonces: NonceSnapshot,
    /// Digest of `utxos`, checked on load
    pub digest: Hash,
}

impl SnapshotFile {
    pub fn new(height: u64, tip_hash: Hash, utxos: UtxoSnapshot, nonces: NonceSnapshot) -> Self {
        let digest = snapshot_digest(&utxos);
        Self { height, tip_hash, utxos, nonces, digest }
    }

    pub fn verify(&self) -> bool {
        snapshot_digest(&self.utxos) == self.digest
    }
}

/// Which copy a snapshot was loaded from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    Primary,
    Backup,
}

/// Rotate the current file to `.bak`, then write `snapshot` via a temp file
pub fn write_snapshot(path: &Path, snapshot: &SnapshotFile) -> StorageResult<()> {
    let backup = backup_path(path);
    let tmp = path.with_extension("json.tmp");

    fs::write(&tmp, serde_json::to_vec(snapshot)?)?;
    if path.exists() {
        fs::rename(path, &backup)?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_one(path: &Path) -> StorageResult<SnapshotFile> {
    let snapshot: SnapshotFile = serde_json::from_slice(&fs::read(path)?)?;
    if !snapshot.verify() {
        return Err(StorageError::Corrupt(format!("{} digest mismatch", path.display())));
    }
    Ok(snapshot)
}

/// Load the newest usable snapshot. `Ok(None)` when neither copy exists.
pub fn load_snapshot(path: &Path) -> StorageResult<Option<(SnapshotFile, SnapshotSource)>> {
    let backup = backup_path(path);
    let mut last_error = None;

    if path.exists() {
        match read_one(path) {
            Ok(snapshot) => return Ok(Some((snapshot, SnapshotSource::Primary))),
            Err(e) => {
                warn!(event = "snapshot unreadable", path = %path.display(), error = %e);
                last_error = Some(e);
            }
        }
    }
    if backup.exists() {
        return read_one(&backup).map(|s| Some((s, SnapshotSource::Backup)));
    }
    match last_error {
        Some(e) => Err(e),
        None => Ok(None),
    }
}

/// Remove both copies
pub fn remove_snapshot(path: &Path) -> StorageResult<()> {
    for file in [path.to_path_buf(), backup_path(path)] {
        if file.exists() {
            fs::remove_file(file)?;
        }
    }
    Ok(())
}

pub fn backup_path(path: &Path) -> PathBuf {
    path.with_extension("json.bak")
}
