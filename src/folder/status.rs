//! The status store: a line-oriented file per synced folder recording
//! the last state both sides agreed on. Never stores bodies.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::errors::{SyncError, SyncResult};
use crate::folder::{tmp_sibling, Folder};
use crate::types::{FlagSet, ListFilter, MessageMeta, Uid};

const MAGIC: &str = "tern-status 1";
const DELIMITER: char = '|';

pub struct StatusFolder {
    name: String,
    path: PathBuf,
    fsync: bool,
    list: Mutex<BTreeMap<Uid, MessageMeta>>,
}

impl StatusFolder {
    /// Open (or create on first sync) the status file for a folder.
    pub fn open(path: impl Into<PathBuf>, name: impl Into<String>, fsync: bool) -> SyncResult<Self> {
        let path = path.into();
        let list = if path.exists() {
            parse_file(&path)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            name: name.into(),
            path,
            fsync,
            list: Mutex::new(list),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Uid, MessageMeta>> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the backing file; used for manual uidvalidity recovery.
    pub fn wipe(&self) -> SyncResult<()> {
        self.lock().clear();
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn write_out(&self) -> SyncResult<()> {
        let snapshot: Vec<(Uid, MessageMeta)> = {
            let list = self.lock();
            list.iter().map(|(&uid, meta)| (uid, meta.clone())).collect()
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = tmp_sibling(&self.path);
        {
            let mut file = File::create(&tmp)?;
            writeln!(file, "{MAGIC}")?;
            for (uid, meta) in &snapshot {
                let keywords: Vec<&str> = meta.keywords.iter().map(String::as_str).collect();
                writeln!(
                    file,
                    "{uid}{DELIMITER}{}{DELIMITER}{}{DELIMITER}{}",
                    meta.flags.to_letters(),
                    meta.internal_time,
                    keywords.join(",")
                )?;
            }
            if self.fsync {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn parse_file(path: &Path) -> SyncResult<BTreeMap<Uid, MessageMeta>> {
    let raw = fs::read_to_string(path)?;
    let mut lines = raw.lines();

    match lines.next() {
        Some(MAGIC) => {}
        Some(other) => {
            return Err(SyncError::Folder(format!(
                "unrecognized status file header {other:?} in {}",
                path.display()
            )))
        }
        None => return Ok(BTreeMap::new()),
    }

    let mut list = BTreeMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let mut fields = line.splitn(4, DELIMITER);
        let (Some(uid), Some(flags), Some(mtime)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(SyncError::Folder(format!(
                "short status record {line:?} in {}",
                path.display()
            )));
        };
        let uid: Uid = uid
            .parse()
            .map_err(|_| SyncError::Folder(format!("bad uid in status record {line:?}")))?;
        let mtime: i64 = mtime
            .parse()
            .map_err(|_| SyncError::Folder(format!("bad mtime in status record {line:?}")))?;
        let keywords: BTreeSet<String> = fields
            .next()
            .unwrap_or("")
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        list.insert(uid, MessageMeta::new(FlagSet::from_letters(flags), keywords, mtime));
    }
    Ok(list)
}

#[async_trait]
impl Folder for StatusFolder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn cache_list(&self, _filter: &ListFilter) -> SyncResult<()> {
        // Loaded in full at open time; the window is the engine's
        // business, not the status store's.
        Ok(())
    }

    fn uids(&self) -> Vec<Uid> {
        self.lock().keys().copied().collect()
    }

    fn uid_exists(&self, uid: Uid) -> bool {
        self.lock().contains_key(&uid)
    }

    fn meta(&self, uid: Uid) -> Option<MessageMeta> {
        self.lock().get(&uid).cloned()
    }

    async fn body(&self, _uid: Uid) -> SyncResult<Vec<u8>> {
        Err(SyncError::Unsupported("body"))
    }

    async fn save(
        &self,
        uid_hint: Uid,
        _body: Option<&[u8]>,
        flags: FlagSet,
        internal_time: i64,
    ) -> SyncResult<Uid> {
        if uid_hint <= 0 {
            return Err(SyncError::Message(format!(
                "status store needs a concrete uid, got {uid_hint}"
            )));
        }
        let mut list = self.lock();
        let entry = list.entry(uid_hint).or_default();
        entry.flags = flags;
        entry.internal_time = internal_time;
        Ok(uid_hint)
    }

    async fn save_flags(&self, uid: Uid, flags: FlagSet) -> SyncResult<()> {
        let mut list = self.lock();
        if let Some(meta) = list.get_mut(&uid) {
            meta.flags = flags;
        }
        Ok(())
    }

    async fn add_flags(&self, uids: &[Uid], flags: FlagSet) -> SyncResult<()> {
        let mut list = self.lock();
        for uid in uids {
            if let Some(meta) = list.get_mut(uid) {
                meta.flags = meta.flags.union(flags);
            }
        }
        Ok(())
    }

    async fn del_flags(&self, uids: &[Uid], flags: FlagSet) -> SyncResult<()> {
        let mut list = self.lock();
        for uid in uids {
            if let Some(meta) = list.get_mut(uid) {
                meta.flags = meta.flags.difference(flags);
            }
        }
        Ok(())
    }

    async fn delete_many(&self, uids: &[Uid]) -> SyncResult<()> {
        let mut list = self.lock();
        for uid in uids {
            list.remove(uid);
        }
        Ok(())
    }

    async fn uid_validity(&self) -> SyncResult<u32> {
        Err(SyncError::Unsupported("uid_validity"))
    }

    fn stores_bodies(&self) -> bool {
        false
    }

    async fn commit(&self) -> SyncResult<()> {
        self.write_out()
    }
}
