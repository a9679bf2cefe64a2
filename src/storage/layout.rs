//! On-disk layout under the node's data directory
//!
//! ```text
//! <data_dir>/blocks/               sled database
//! <data_dir>/utxo_snapshot.json    (+ .bak)
//! <data_dir>/checkpoints/          checkpoint_<height>.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use super::StorageResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.root.join("blocks")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join("utxo_snapshot.json")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    /// Create any missing directories
    pub fn ensure(&self) -> StorageResult<()> {
        fs::create_dir_all(self.blocks_dir())?;
        fs::create_dir_all(self.checkpoints_dir())?;
        Ok(())
    }

    /// Remove snapshot files and checkpoints, leaving empty directories.
    /// The block database is cleared through its open handle.
    pub fn reset_files(&self) -> StorageResult<()> {
        super::snapshot::remove_snapshot(&self.snapshot_path())?;
        let checkpoints = self.checkpoints_dir();
        if checkpoints.exists() {
            fs::remove_dir_all(&checkpoints)?;
        }
        self.ensure()
    }
}
