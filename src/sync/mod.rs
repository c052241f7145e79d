//! The three-pass folder synchronizer. Given a source, a destination
//! and the status store recording the last agreed-upon state, runs
//! copy, delete and flag reconciliation in that order. Each pass is
//! restartable: an interruption at any point leaves a state from
//! which the next run converges without loss.

pub mod guard;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::codec::flags as flagcodec;
use crate::errors::{Severity, SyncError, SyncResult};
use crate::folder::Folder;
use crate::hooks;
use crate::sched::AbortFlag;
use crate::sync::guard::ZeroSaveLedger;
use crate::types::{FlagSet, Uid};
use crate::ui;

pub struct PairOptions {
    pub account: String,
    pub dry_run: bool,
    pub sync_deletes: bool,
    pub keyword_map: Option<BTreeMap<String, char>>,
    /// UIDs excluded from the copy pass for this folder.
    pub copy_ignore: Vec<Uid>,
    /// Shell command fired once per copy pass that saw unseen mail.
    pub newmail_hook: Option<String>,
}

pub struct SyncEngine {
    abort: AbortFlag,
    copy_workers: Arc<Semaphore>,
    zero_saves: Arc<Mutex<ZeroSaveLedger>>,
}

impl SyncEngine {
    pub fn new(abort: AbortFlag, copy_workers: Arc<Semaphore>, ledger: ZeroSaveLedger) -> Self {
        Self {
            abort,
            copy_workers,
            zero_saves: Arc::new(Mutex::new(ledger)),
        }
    }

    /// Run the three passes for one direction of a folder pair.
    /// Ordering is strict: copy, then delete, then flags. A folder-
    /// severity failure aborts the remaining passes for this folder.
    pub async fn sync(
        &self,
        src: Arc<dyn Folder>,
        dst: Arc<dyn Folder>,
        status: Arc<dyn Folder>,
        opts: &PairOptions,
    ) -> SyncResult<()> {
        self.pass_copy(src.clone(), dst.clone(), status.clone(), opts)
            .await?;
        if self.abort.is_set() {
            return Ok(());
        }
        // Pass 2 runs to completion once started; its status-first
        // ordering is the safety property, not the abort poll.
        self.pass_delete(&*src, &*dst, &*status, opts).await?;
        if self.abort.is_set() {
            return Ok(());
        }
        self.pass_flags(&*src, &*dst, &*status, opts).await?;
        Ok(())
    }

    /// Pass 1: copy messages present in src but unknown to status.
    async fn pass_copy(
        &self,
        src: Arc<dyn Folder>,
        dst: Arc<dyn Folder>,
        status: Arc<dyn Folder>,
        opts: &PairOptions,
    ) -> SyncResult<()> {
        let mut copylist: Vec<Uid> = src
            .uids()
            .into_iter()
            .filter(|uid| !status.uid_exists(*uid))
            .collect();
        copylist.sort_unstable();
        copylist.retain(|uid| {
            if opts.copy_ignore.contains(uid) {
                ui::ignoring_copy(&opts.account, src.name(), *uid);
                false
            } else {
                true
            }
        });

        if copylist.is_empty() {
            return Ok(());
        }
        if opts.dry_run {
            info!(
                account = %opts.account,
                folder = %src.name(),
                count = copylist.len(),
                "[dryrun] would copy messages"
            );
            return Ok(());
        }

        let total = copylist.len();
        let have_newmail = Arc::new(AtomicBool::new(false));
        let mut first_err: Option<SyncError> = None;

        if src.suggests_threads() {
            let mut handles = Vec::new();
            for (num, &uid) in copylist.iter().enumerate() {
                if self.abort.is_set() {
                    break;
                }
                let permit = self
                    .copy_workers
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| SyncError::Folder("copy worker pool closed".into()))?;
                let ctx = CopyCtx {
                    src: src.clone(),
                    dst: dst.clone(),
                    status: status.clone(),
                    account: opts.account.clone(),
                    have_newmail: have_newmail.clone(),
                    zero_saves: self.zero_saves.clone(),
                };
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    copy_message_guarded(&ctx, uid, num + 1, total).await
                }));
            }
            for handle in handles {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                    Err(join) => {
                        if first_err.is_none() {
                            first_err =
                                Some(SyncError::Folder(format!("copy worker panicked: {join}")));
                        }
                    }
                }
            }
        } else {
            let ctx = CopyCtx {
                src: src.clone(),
                dst: dst.clone(),
                status: status.clone(),
                account: opts.account.clone(),
                have_newmail: have_newmail.clone(),
                zero_saves: self.zero_saves.clone(),
            };
            for (num, &uid) in copylist.iter().enumerate() {
                if self.abort.is_set() {
                    break;
                }
                if let Err(e) = copy_message_guarded(&ctx, uid, num + 1, total).await {
                    first_err = Some(e);
                    break;
                }
            }
        }

        status.commit().await?;
        if let Some(e) = first_err {
            return Err(e);
        }

        if have_newmail.load(Ordering::Relaxed) {
            if let Some(hook) = &opts.newmail_hook {
                hooks::run_hook("newmail", hook).await;
            }
        }
        Ok(())
    }

    /// Pass 2: messages known to status but gone from src were
    /// deleted there; drop the status record first, then (if enabled)
    /// the destination copy. Removing status first means an aborted
    /// run can at worst re-transmit, never lose mail.
    async fn pass_delete(
        &self,
        src: &dyn Folder,
        dst: &dyn Folder,
        status: &dyn Folder,
        opts: &PairOptions,
    ) -> SyncResult<()> {
        let deletelist: Vec<Uid> = status
            .uids()
            .into_iter()
            .filter(|&uid| uid >= 0 && !src.uid_exists(uid))
            .collect();
        if deletelist.is_empty() {
            return Ok(());
        }

        ui::deleting(&opts.account, dst.name(), &deletelist);
        if opts.dry_run {
            return Ok(());
        }

        status.delete_many(&deletelist).await?;

        if opts.sync_deletes {
            let on_dst: Vec<Uid> = deletelist
                .into_iter()
                .filter(|&uid| dst.uid_exists(uid))
                .collect();
            if !on_dst.is_empty() {
                dst.delete_many(&on_dst).await?;
            }
        }
        status.commit().await
    }

    /// Pass 3: reconcile flags for messages present on both sides,
    /// batched per (operation, flag) so a folder costs at most one
    /// store per changed flag letter.
    async fn pass_flags(
        &self,
        src: &dyn Folder,
        dst: &dyn Folder,
        status: &dyn Folder,
        opts: &PairOptions,
    ) -> SyncResult<()> {
        let mut add_lists: BTreeMap<char, Vec<Uid>> = BTreeMap::new();
        let mut del_lists: BTreeMap<char, Vec<Uid>> = BTreeMap::new();

        for uid in src.uids() {
            if uid < 0 || !dst.uid_exists(uid) {
                continue;
            }
            let status_flags = status.flags(uid);
            let src_effective = effective_flags(src, uid, opts);

            for letter in src_effective.difference(status_flags).iter() {
                add_lists.entry(letter).or_default().push(uid);
            }
            for letter in status_flags.difference(src_effective).iter() {
                del_lists.entry(letter).or_default().push(uid);
            }
        }

        for (letter, uids) in &add_lists {
            if self.abort.is_set() {
                return Ok(());
            }
            ui::adding_flags(&opts.account, dst.name(), *letter, uids);
            if opts.dry_run {
                continue;
            }
            let set = FlagSet::single(*letter);
            dst.add_flags(uids, set).await?;
            status.add_flags(uids, set).await?;
        }

        for (letter, uids) in &del_lists {
            if self.abort.is_set() {
                return Ok(());
            }
            ui::removing_flags(&opts.account, dst.name(), *letter, uids);
            if opts.dry_run {
                continue;
            }
            let set = FlagSet::single(*letter);
            dst.del_flags(uids, set).await?;
            status.del_flags(uids, set).await?;
        }

        if !opts.dry_run && (!add_lists.is_empty() || !del_lists.is_empty()) {
            status.commit().await?;
        }
        Ok(())
    }
}

/// Source flags plus whatever keywords the destination's map can
/// express as flag letters.
fn effective_flags(src: &dyn Folder, uid: Uid, opts: &PairOptions) -> FlagSet {
    let flags = src.flags(uid);
    let keywords: BTreeSet<String> = src.keywords(uid);
    flags.union(flagcodec::map_keywords(&keywords, opts.keyword_map.as_ref()))
}

struct CopyCtx {
    src: Arc<dyn Folder>,
    dst: Arc<dyn Folder>,
    status: Arc<dyn Folder>,
    account: String,
    have_newmail: Arc<AtomicBool>,
    zero_saves: Arc<Mutex<ZeroSaveLedger>>,
}

/// Message-severity failures are logged and swallowed so one broken
/// message cannot sink the folder; anything worse propagates.
async fn copy_message_guarded(ctx: &CopyCtx, uid: Uid, num: usize, total: usize) -> SyncResult<()> {
    match copy_message(ctx, uid, num, total).await {
        Ok(()) => Ok(()),
        Err(e) if e.severity() <= Severity::Message => {
            warn!(
                account = %ctx.account,
                uid,
                error = %e,
                "copying message failed"
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn copy_message(ctx: &CopyCtx, uid: Uid, num: usize, total: usize) -> SyncResult<()> {
    if uid == 0 {
        warn!(account = %ctx.account, "message with uid 0 in source list, skipping");
        return Ok(());
    }

    // Destination already has this UID: nothing to transfer, just
    // record the agreement.
    if uid > 0 && ctx.dst.uid_exists(uid) {
        let flags = ctx.src.flags(uid);
        let time = ctx.src.internal_time(uid);
        ctx.status.save(uid, None, flags, time).await?;
        return Ok(());
    }

    ui::copying(&ctx.account, ctx.src.name(), uid, num, total);

    let flags = ctx.src.flags(uid);
    let time = ctx.src.internal_time(uid);
    let body = if ctx.dst.stores_bodies() {
        Some(ctx.src.body(uid).await?)
    } else {
        None
    };

    let new_uid = ctx.dst.save(uid, body.as_deref(), flags, time).await?;

    if new_uid > 0 {
        if new_uid != uid {
            ctx.src.change_uid(uid, new_uid).await?;
            ctx.status.delete_many(&[uid]).await?;
        }
        ctx.status.save(new_uid, None, flags, time).await?;
        if !flags.contains('S') {
            ctx.have_newmail.store(true, Ordering::Relaxed);
        }
        ctx.zero_saves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear()?;
    } else if new_uid == 0 {
        // Stored, but the destination would not tell us where. Drop
        // the source copy; the next run re-syncs it back. A ledger
        // bounds how often that recovery may repeat.
        let keep_retrying = ctx
            .zero_saves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .strike()?;
        if !keep_retrying {
            return Err(SyncError::Folder(format!(
                "destination {} kept hiding uids of appended messages",
                ctx.dst.name()
            )));
        }
        warn!(
            account = %ctx.account,
            uid,
            "new uid unknown after save; deleting source copy for re-sync"
        );
        ctx.src.delete_many(&[uid]).await?;
    } else {
        return Err(SyncError::Message(format!(
            "saving uid {uid} to {} returned invalid uid {new_uid}",
            ctx.dst.name()
        )));
    }
    Ok(())
}
