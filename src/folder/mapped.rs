//! UID-mapped IMAP folder, used whenever both sides of a sync are
//! IMAP. Wraps the plain IMAP backend and presents stable *local*
//! UIDs to the engine; the two directions of the mapping are
//! persisted together next to the status file. Remote messages with
//! no mapping yet surface as transient negative UIDs until the copy
//! pass uploads them and rebinds.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::errors::{SyncError, SyncResult};
use crate::folder::imap::ImapFolder;
use crate::folder::{tmp_sibling, Folder};
use crate::types::{FlagSet, ListFilter, MessageMeta, Uid};

const MAGIC: &str = "tern-uidmap 1";

struct MapState {
    local_to_remote: BTreeMap<Uid, Uid>,
    remote_to_local: BTreeMap<Uid, Uid>,
    next_transient: Uid,
}

impl MapState {
    fn bind(&mut self, local: Uid, remote: Uid) {
        self.local_to_remote.insert(local, remote);
        self.remote_to_local.insert(remote, local);
    }

    fn unbind_local(&mut self, local: Uid) {
        if let Some(remote) = self.local_to_remote.remove(&local) {
            self.remote_to_local.remove(&remote);
        }
    }

    fn max_local(&self) -> Uid {
        self.local_to_remote
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
            .max(0)
    }
}

/// The production shape: a UID map over the plain IMAP backend.
pub type MappedImapFolder = MappedFolder<ImapFolder>;

pub struct MappedFolder<F: Folder> {
    inner: F,
    path: PathBuf,
    fsync: bool,
    map: Mutex<MapState>,
}

impl<F: Folder> MappedFolder<F> {
    pub fn open(inner: F, path: impl Into<PathBuf>, fsync: bool) -> SyncResult<Self> {
        let path = path.into();
        let (local_to_remote, remote_to_local) = if path.exists() {
            parse_file(&path)?
        } else {
            (BTreeMap::new(), BTreeMap::new())
        };
        Ok(Self {
            inner,
            path,
            fsync,
            map: Mutex::new(MapState {
                local_to_remote,
                remote_to_local,
                next_transient: -1,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MapState> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remote_for(&self, local: Uid) -> SyncResult<Uid> {
        self.lock()
            .local_to_remote
            .get(&local)
            .copied()
            .ok_or_else(|| {
                SyncError::Message(format!("local uid {local} has no remote mapping"))
            })
    }

    fn write_out(&self) -> SyncResult<()> {
        let pairs: Vec<(Uid, Uid)> = {
            let map = self.lock();
            map.local_to_remote
                .iter()
                .filter(|(&l, _)| l > 0)
                .map(|(&l, &r)| (l, r))
                .collect()
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = tmp_sibling(&self.path);
        {
            let mut file = File::create(&tmp)?;
            writeln!(file, "{MAGIC}")?;
            for (local, remote) in &pairs {
                writeln!(file, "{local}:{remote}")?;
            }
            if self.fsync {
                file.sync_all()?;
            }
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn parse_file(path: &Path) -> SyncResult<(BTreeMap<Uid, Uid>, BTreeMap<Uid, Uid>)> {
    let raw = fs::read_to_string(path)?;
    let mut lines = raw.lines();
    match lines.next() {
        Some(MAGIC) | None => {}
        Some(other) => {
            return Err(SyncError::Folder(format!(
                "unrecognized uid map header {other:?} in {}",
                path.display()
            )))
        }
    }

    let mut local_to_remote = BTreeMap::new();
    let mut remote_to_local = BTreeMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((local, remote)) = line.split_once(':') else {
            return Err(SyncError::Folder(format!("bad uid map record {line:?}")));
        };
        let local: Uid = local
            .parse()
            .map_err(|_| SyncError::Folder(format!("bad uid map record {line:?}")))?;
        let remote: Uid = remote
            .parse()
            .map_err(|_| SyncError::Folder(format!("bad uid map record {line:?}")))?;
        local_to_remote.insert(local, remote);
        remote_to_local.insert(remote, local);
    }
    Ok((local_to_remote, remote_to_local))
}

#[async_trait]
impl<F: Folder> Folder for MappedFolder<F> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn cache_list(&self, filter: &ListFilter) -> SyncResult<()> {
        // min_uid is in local terms and does not translate to the
        // remote UID space; the other filters pass straight through.
        let inner_filter = ListFilter {
            min_uid: None,
            ..*filter
        };
        self.inner.cache_list(&inner_filter).await?;

        let remote_uids = self.inner.uids();
        let mut map = self.lock();
        for remote in remote_uids {
            if !map.remote_to_local.contains_key(&remote) {
                let local = map.next_transient;
                map.next_transient -= 1;
                map.bind(local, remote);
            }
        }
        // Drop stale bindings for messages gone from the server so
        // the local view matches what a fresh LIST would say.
        let gone: Vec<Uid> = map
            .local_to_remote
            .iter()
            .filter(|(_, &r)| !self.inner.uid_exists(r))
            .map(|(&l, _)| l)
            .collect();
        for local in gone {
            map.unbind_local(local);
        }
        Ok(())
    }

    fn uids(&self) -> Vec<Uid> {
        let map = self.lock();
        map.local_to_remote.keys().copied().collect()
    }

    fn uid_exists(&self, uid: Uid) -> bool {
        self.lock().local_to_remote.contains_key(&uid)
    }

    fn meta(&self, uid: Uid) -> Option<MessageMeta> {
        let remote = *self.lock().local_to_remote.get(&uid)?;
        self.inner.meta(remote)
    }

    async fn body(&self, uid: Uid) -> SyncResult<Vec<u8>> {
        let remote = self.remote_for(uid)?;
        self.inner.body(remote).await
    }

    async fn save(
        &self,
        uid_hint: Uid,
        body: Option<&[u8]>,
        flags: FlagSet,
        internal_time: i64,
    ) -> SyncResult<Uid> {
        if uid_hint > 0 && self.uid_exists(uid_hint) {
            self.save_flags(uid_hint, flags).await?;
            return Ok(uid_hint);
        }

        let remote = self.inner.save(-1, body, flags, internal_time).await?;
        if remote <= 0 {
            // Could not learn the remote UID; nothing to map.
            return Ok(remote);
        }

        let local = {
            let mut map = self.lock();
            let local = if uid_hint > 0 {
                uid_hint
            } else if remote > 0 && !map.local_to_remote.contains_key(&remote) {
                remote
            } else {
                map.max_local() + 1
            };
            map.bind(local, remote);
            local
        };
        self.write_out()?;
        Ok(local)
    }

    async fn save_flags(&self, uid: Uid, flags: FlagSet) -> SyncResult<()> {
        let remote = self.remote_for(uid)?;
        self.inner.save_flags(remote, flags).await
    }

    async fn add_flags(&self, uids: &[Uid], flags: FlagSet) -> SyncResult<()> {
        let remotes = self.translate_batch(uids);
        self.inner.add_flags(&remotes, flags).await
    }

    async fn del_flags(&self, uids: &[Uid], flags: FlagSet) -> SyncResult<()> {
        let remotes = self.translate_batch(uids);
        self.inner.del_flags(&remotes, flags).await
    }

    async fn delete_many(&self, uids: &[Uid]) -> SyncResult<()> {
        let remotes = self.translate_batch(uids);
        self.inner.delete_many(&remotes).await?;
        let mut map = self.lock();
        for &uid in uids {
            map.unbind_local(uid);
        }
        drop(map);
        self.write_out()
    }

    async fn uid_validity(&self) -> SyncResult<u32> {
        self.inner.uid_validity().await
    }

    /// Supported here, unlike raw IMAP: rebinding a local UID keeps
    /// the remote side untouched.
    async fn change_uid(&self, uid: Uid, new_uid: Uid) -> SyncResult<()> {
        let mut map = self.lock();
        let Some(remote) = map.local_to_remote.remove(&uid) else {
            return Err(SyncError::Message(format!(
                "local uid {uid} has no remote mapping"
            )));
        };
        map.remote_to_local.remove(&remote);
        map.bind(new_uid, remote);
        drop(map);
        self.write_out()
    }

    fn suggests_threads(&self) -> bool {
        self.inner.suggests_threads()
    }

    async fn commit(&self) -> SyncResult<()> {
        self.write_out()?;
        self.inner.commit().await
    }
}

impl<F: Folder> MappedFolder<F> {
    fn translate_batch(&self, uids: &[Uid]) -> Vec<Uid> {
        let map = self.lock();
        uids.iter()
            .filter_map(|u| map.local_to_remote.get(u).copied())
            .collect()
    }
}
