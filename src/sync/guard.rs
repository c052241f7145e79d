//! Small durable files kept next to the status store: the cached
//! UIDVALIDITY token, the min-uid window marker, and the ledger of
//! consecutive zero-returning saves. All writes go temp-then-rename.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{SyncError, SyncResult};
use crate::folder::tmp_sibling;
use crate::types::Uid;

fn read_int(path: &Path) -> SyncResult<Option<i64>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| SyncError::Folder(format!("corrupt value in {}", path.display())))
}

fn write_int(path: &Path, value: i64) -> SyncResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_sibling(path);
    {
        let mut file = File::create(&tmp)?;
        writeln!(file, "{value}")?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Compare the source's current UIDVALIDITY against the cached token.
/// A missing cache is first contact: save and proceed. A mismatch is
/// a distinguished folder-level failure; recovery is manual.
pub fn check_uid_validity(cache_path: &Path, current: u32, folder: &str) -> SyncResult<()> {
    match read_int(cache_path)? {
        None => {
            write_int(cache_path, i64::from(current))?;
            Ok(())
        }
        Some(cached) if cached == i64::from(current) => Ok(()),
        Some(cached) => Err(SyncError::UidValidity {
            folder: folder.to_string(),
            cached: cached as u32,
            current,
        }),
    }
}

pub fn read_min_uid(path: &Path) -> SyncResult<Option<Uid>> {
    read_int(path)
}

pub fn write_min_uid(path: &Path, min_uid: Uid) -> SyncResult<()> {
    write_int(path, min_uid)
}

/// Counts consecutive saves that returned an unknown UID for this
/// folder pair. A destination that persistently hides new UIDs would
/// otherwise make the copy pass delete and re-upload forever; after
/// `limit` strikes the condition is promoted to a folder error.
pub struct ZeroSaveLedger {
    path: PathBuf,
    count: u32,
    limit: u32,
}

impl ZeroSaveLedger {
    pub fn open(path: impl Into<PathBuf>, limit: u32) -> SyncResult<Self> {
        let path = path.into();
        let count = read_int(&path)?.unwrap_or(0) as u32;
        Ok(Self { path, count, limit })
    }

    /// Record another zero-return. Returns true while the normal
    /// delete-and-retry recovery should still run.
    pub fn strike(&mut self) -> SyncResult<bool> {
        self.count += 1;
        write_int(&self.path, i64::from(self.count))?;
        Ok(self.count < self.limit)
    }

    pub fn clear(&mut self) -> SyncResult<()> {
        if self.count != 0 {
            self.count = 0;
            write_int(&self.path, 0)?;
        }
        Ok(())
    }
}
