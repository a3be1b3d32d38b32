use std::path::{Path, PathBuf};
use std::fs;
use crate::core::error::Result;
use crate::core::types::{Collection, RowId};

/// Shared file-system resources under one injected root
#[derive(Debug, Clone)]
pub struct StorageLayout {
    pub base_dir: PathBuf,       // Resource root visible to every client
    pub edit_locks_dir: PathBuf, // One file per locked (collection, row)
}

impl StorageLayout {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        let edit_locks_dir = base_dir.join("edit_locks");

        fs::create_dir_all(&base_dir)?;
        fs::create_dir_all(&edit_locks_dir)?;

        Ok(StorageLayout {
            base_dir,
            edit_locks_dir,
        })
    }

    /// Exists while some operation is inside the serialized section.
    pub fn marker_path(&self) -> PathBuf {
        self.base_dir.join(".lock")
    }

    // Name predates the byte-marker format; clients already watch this path.
    pub fn change_log_path(&self) -> PathBuf {
        self.base_dir.join("changes_log.json")
    }

    pub fn edit_lock_path(&self, collection: Collection, row_id: RowId) -> PathBuf {
        self.edit_locks_dir
            .join(format!("edit_lock_{}_{}.lock", collection.name(), row_id))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}
