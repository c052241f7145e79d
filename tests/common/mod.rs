//! Shared test double: an in-memory folder with configurable save
//! behavior, standing in for the maildir / IMAP / status backends.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tern::errors::{SyncError, SyncResult};
use tern::folder::Folder;
use tern::types::{FlagSet, ListFilter, MessageMeta, Uid};

/// How `save` treats the uid hint.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum AssignMode {
    /// Keep a positive hint, allocate otherwise (maildir-like).
    PreserveHint,
    /// Always allocate a fresh UID (IMAP-like).
    ServerAssign,
    /// Message is stored but the UID stays unknown (non-UIDPLUS).
    ReturnZero,
    /// Nothing is written (read-only).
    RefuseWrite,
}

#[derive(Default)]
pub struct Counters {
    pub saves: usize,
    pub deletes: usize,
    pub flag_calls: usize,
}

struct Mem {
    list: BTreeMap<Uid, (MessageMeta, Option<Vec<u8>>)>,
    next_uid: Uid,
    counters: Counters,
}

pub struct MemoryFolder {
    name: String,
    mode: AssignMode,
    allow_change_uid: bool,
    fan_out: bool,
    validity: u32,
    state: Mutex<Mem>,
}

impl MemoryFolder {
    pub fn new(name: &str, mode: AssignMode) -> Self {
        Self {
            name: name.to_string(),
            mode,
            allow_change_uid: false,
            fan_out: false,
            validity: 1,
            state: Mutex::new(Mem {
                list: BTreeMap::new(),
                next_uid: 1,
                counters: Counters::default(),
            }),
        }
    }

    pub fn allow_change_uid(mut self) -> Self {
        self.allow_change_uid = true;
        self
    }

    pub fn fan_out(mut self) -> Self {
        self.fan_out = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Mem> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a message; flag letters as in the status file format.
    pub fn add(&self, uid: Uid, letters: &str) {
        self.add_with(uid, letters, &[], 1_000_000);
    }

    pub fn add_with(&self, uid: Uid, letters: &str, keywords: &[&str], time: i64) {
        let meta = MessageMeta::new(
            FlagSet::from_letters(letters),
            keywords.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
            time,
        );
        let body = format!("Subject: test {uid}\r\n\r\nbody {uid}\r\n").into_bytes();
        let mut mem = self.lock();
        if uid >= mem.next_uid {
            mem.next_uid = uid + 1;
        }
        mem.list.insert(uid, (meta, Some(body)));
    }

    pub fn letters_of(&self, uid: Uid) -> String {
        self.lock()
            .list
            .get(&uid)
            .map(|(m, _)| m.flags.to_letters())
            .unwrap_or_default()
    }

    pub fn save_count(&self) -> usize {
        self.lock().counters.saves
    }

    pub fn delete_count(&self) -> usize {
        self.lock().counters.deletes
    }

    pub fn flag_call_count(&self) -> usize {
        self.lock().counters.flag_calls
    }
}

#[async_trait]
impl Folder for MemoryFolder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn cache_list(&self, _filter: &ListFilter) -> SyncResult<()> {
        Ok(())
    }

    fn uids(&self) -> Vec<Uid> {
        self.lock().list.keys().copied().collect()
    }

    fn uid_exists(&self, uid: Uid) -> bool {
        self.lock().list.contains_key(&uid)
    }

    fn meta(&self, uid: Uid) -> Option<MessageMeta> {
        self.lock().list.get(&uid).map(|(m, _)| m.clone())
    }

    async fn body(&self, uid: Uid) -> SyncResult<Vec<u8>> {
        self.lock()
            .list
            .get(&uid)
            .and_then(|(_, b)| b.clone())
            .ok_or_else(|| SyncError::Message(format!("no body for uid {uid}")))
    }

    async fn save(
        &self,
        uid_hint: Uid,
        body: Option<&[u8]>,
        flags: FlagSet,
        internal_time: i64,
    ) -> SyncResult<Uid> {
        let mut mem = self.lock();
        mem.counters.saves += 1;
        match self.mode {
            AssignMode::RefuseWrite => Ok(-1),
            AssignMode::ReturnZero => Ok(0),
            mode => {
                let uid = if mode == AssignMode::PreserveHint && uid_hint > 0 {
                    uid_hint
                } else {
                    mem.next_uid
                };
                if uid >= mem.next_uid {
                    mem.next_uid = uid + 1;
                }
                mem.list.insert(
                    uid,
                    (
                        MessageMeta::new(flags, BTreeSet::new(), internal_time),
                        body.map(<[u8]>::to_vec),
                    ),
                );
                Ok(uid)
            }
        }
    }

    async fn save_flags(&self, uid: Uid, flags: FlagSet) -> SyncResult<()> {
        let mut mem = self.lock();
        mem.counters.flag_calls += 1;
        if let Some((meta, _)) = mem.list.get_mut(&uid) {
            meta.flags = flags;
        }
        Ok(())
    }

    async fn add_flags(&self, uids: &[Uid], flags: FlagSet) -> SyncResult<()> {
        let mut mem = self.lock();
        mem.counters.flag_calls += 1;
        for uid in uids {
            if let Some((meta, _)) = mem.list.get_mut(uid) {
                meta.flags = meta.flags.union(flags);
            }
        }
        Ok(())
    }

    async fn del_flags(&self, uids: &[Uid], flags: FlagSet) -> SyncResult<()> {
        let mut mem = self.lock();
        mem.counters.flag_calls += 1;
        for uid in uids {
            if let Some((meta, _)) = mem.list.get_mut(uid) {
                meta.flags = meta.flags.difference(flags);
            }
        }
        Ok(())
    }

    async fn delete_many(&self, uids: &[Uid]) -> SyncResult<()> {
        let mut mem = self.lock();
        mem.counters.deletes += 1;
        for uid in uids {
            mem.list.remove(uid);
        }
        Ok(())
    }

    async fn uid_validity(&self) -> SyncResult<u32> {
        Ok(self.validity)
    }

    async fn change_uid(&self, uid: Uid, new_uid: Uid) -> SyncResult<()> {
        if !self.allow_change_uid {
            return Err(SyncError::Unsupported("change_uid"));
        }
        let mut mem = self.lock();
        let Some(entry) = mem.list.remove(&uid) else {
            return Err(SyncError::Message(format!("change_uid: no uid {uid}")));
        };
        mem.list.insert(new_uid, entry);
        if new_uid >= mem.next_uid {
            mem.next_uid = new_uid + 1;
        }
        Ok(())
    }

    fn suggests_threads(&self) -> bool {
        self.fan_out
    }
}
