//! The uniform folder contract the sync engine runs against, plus its
//! concrete backends: IMAP, UID-mapped IMAP, maildir, and the status
//! store. Composition replaces inheritance: the mapped variant wraps
//! the plain IMAP folder.

pub mod imap;
pub mod maildir;
pub mod mapped;
pub mod status;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::{SyncError, SyncResult};
use crate::types::{FlagSet, ListFilter, MessageMeta, Uid};

/// Scratch name for temp-then-rename writes. Appends to the full
/// file name so sibling files (`x.status`, `x.uidvalidity`, ...)
/// never share a temp path.
pub(crate) fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// A folder backend. Methods take `&self`; implementations guard
/// their metadata cache internally so the copy pass can fan out over
/// a shared handle.
#[async_trait]
pub trait Folder: Send + Sync {
    /// Visible (translated) folder name.
    fn name(&self) -> &str;

    /// Load message metadata matching the filter into the in-memory
    /// list. After return, `uids`/`meta` cover everything matching.
    async fn cache_list(&self, filter: &ListFilter) -> SyncResult<()>;

    fn uids(&self) -> Vec<Uid>;

    fn uid_exists(&self, uid: Uid) -> bool;

    fn meta(&self, uid: Uid) -> Option<MessageMeta>;

    fn flags(&self, uid: Uid) -> FlagSet {
        self.meta(uid).map(|m| m.flags).unwrap_or_default()
    }

    fn keywords(&self, uid: Uid) -> BTreeSet<String> {
        self.meta(uid).map(|m| m.keywords).unwrap_or_default()
    }

    fn internal_time(&self, uid: Uid) -> i64 {
        self.meta(uid).map(|m| m.internal_time).unwrap_or(0)
    }

    /// Fetch the message body. Lazy; may fail per message.
    async fn body(&self, uid: Uid) -> SyncResult<Vec<u8>>;

    /// Save a message. A negative `uid_hint` asks the backend to
    /// assign a fresh UID; a positive one asks it to preserve the
    /// value if it can. Returns the UID actually used, `0` when the
    /// message was stored but its UID could not be determined, or a
    /// negative value when nothing was written (read-only backend).
    async fn save(
        &self,
        uid_hint: Uid,
        body: Option<&[u8]>,
        flags: FlagSet,
        internal_time: i64,
    ) -> SyncResult<Uid>;

    /// Replace the flag set of one message. Idempotent.
    async fn save_flags(&self, uid: Uid, flags: FlagSet) -> SyncResult<()>;

    /// Add `flags` to every UID in the batch. Idempotent.
    async fn add_flags(&self, uids: &[Uid], flags: FlagSet) -> SyncResult<()>;

    /// Remove `flags` from every UID in the batch. Idempotent.
    async fn del_flags(&self, uids: &[Uid], flags: FlagSet) -> SyncResult<()>;

    /// Delete the batch. Deleting an absent UID is not an error.
    async fn delete_many(&self, uids: &[Uid]) -> SyncResult<()>;

    async fn uid_validity(&self) -> SyncResult<u32>;

    /// Rewrite a message's UID in place. Only backends with local
    /// control over identifiers support this; IMAP refuses.
    async fn change_uid(&self, _uid: Uid, _new_uid: Uid) -> SyncResult<()> {
        Err(SyncError::Unsupported("change_uid"))
    }

    /// Whether the copy pass may fan message copies out to workers.
    fn suggests_threads(&self) -> bool {
        false
    }

    /// Status folders store no bodies; sources skip loading them when
    /// every destination answers false.
    fn stores_bodies(&self) -> bool {
        true
    }

    /// Flush any durable state (no-op for purely remote backends).
    async fn commit(&self) -> SyncResult<()> {
        Ok(())
    }
}
