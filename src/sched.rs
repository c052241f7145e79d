//! Account and folder scheduling: one worker per account, bounded
//! folder workers inside each account, a process-wide abort latch,
//! keepalive, and the IDLE hint for selected source folders.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::TryStreamExt;
use regex::Regex;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::codec::{names, sequence};
use crate::config::{AccountConfig, General, LocalEndpoint};
use crate::errors::{SyncError, SyncResult};
use crate::folder::imap::{ImapFolder, ImapFolderOptions};
use crate::folder::maildir::MaildirFolder;
use crate::folder::mapped::MappedImapFolder;
use crate::folder::status::StatusFolder;
use crate::folder::Folder;
use crate::imap::pool::{build_pool, spawn_keepalive, with_conn, ImapPool};
use crate::sync::guard::{self, ZeroSaveLedger};
use crate::sync::{PairOptions, SyncEngine};
use crate::types::ListFilter;
use crate::ui;

/// How long one IDLE round is allowed to sit before we cycle it;
/// RFC 2177 recommends re-issuing before 30 minutes.
const IDLE_ROUND: Duration = Duration::from_secs(29 * 60);

/// Process-wide cancellation latch. Set once, polled at checkpoints;
/// never a lock.
#[derive(Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Listen for SIGINT/SIGTERM and trip the latch. Workers notice at
/// their next checkpoint and wind down without further network I/O.
pub fn install_signal_handlers(abort: AbortFlag) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    warn!(error = %e, "could not install SIGTERM handler");
                    let _ = ctrl_c.await;
                    abort.set();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("abort requested, finishing at next checkpoint");
        abort.set();
    });
}

pub struct AccountReport {
    pub folders_synced: usize,
    pub folders_failed: usize,
}

enum LocalBackend {
    Maildir { root: PathBuf },
    Imap { pool: ImapPool },
}

/// Run one account: enumerate folders, sync each pair under the
/// folder-worker semaphore, then hold IDLE watchers until aborted.
pub async fn sync_account(
    account: Arc<AccountConfig>,
    general: Arc<General>,
    status_dir: PathBuf,
    abort: AbortFlag,
    run_once: bool,
) -> SyncResult<AccountReport> {
    let opts = &account.options;

    let remote_pool = build_pool(&account.remote)?;
    let local = match &account.local {
        LocalEndpoint::Maildir { path } => LocalBackend::Maildir { root: path.clone() },
        LocalEndpoint::Imap(endpoint) => LocalBackend::Imap {
            pool: build_pool(endpoint)?,
        },
    };

    let mut keepalives = Vec::new();
    if account.remote.keepalive > 0 {
        keepalives.push(spawn_keepalive(
            remote_pool.clone(),
            account.remote.keepalive,
            abort.clone(),
        ));
    }
    if let (LocalBackend::Imap { pool }, LocalEndpoint::Imap(endpoint)) = (&local, &account.local) {
        if endpoint.keepalive > 0 {
            keepalives.push(spawn_keepalive(
                pool.clone(),
                endpoint.keepalive,
                abort.clone(),
            ));
        }
    }

    let folders = list_sync_folders(&account, &remote_pool).await?;
    info!(
        account = %account.name,
        folders = folders.len(),
        "folder list resolved"
    );

    // Folder workers share one semaphore sized for the connection
    // budget; message-copy fanout has its own, account-scoped.
    let worker_slots = account
        .remote
        .maxconnections
        .max(opts.idle_folders.len())
        .max(general.max_folder_workers)
        .max(1);
    let folder_sem = Arc::new(Semaphore::new(worker_slots));
    let copy_sem = Arc::new(Semaphore::new(general.copy_workers.max(1)));

    let local = Arc::new(local);
    let mut handles = Vec::new();
    for folder in &folders {
        if abort.is_set() {
            break;
        }
        let permit = folder_sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Repo("folder worker pool closed".into()))?;
        let ctx = FolderCtx {
            account: account.clone(),
            general: general.clone(),
            status_dir: status_dir.clone(),
            remote_pool: remote_pool.clone(),
            local: local.clone(),
            abort: abort.clone(),
            copy_sem: copy_sem.clone(),
        };
        let folder = folder.clone();
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            let outcome = sync_folder_pair(&ctx, &folder).await;
            ui::thread_exited(&ctx.account.name, &folder.visible, outcome.is_ok());
            if let Err(e) = &outcome {
                error!(
                    account = %ctx.account.name,
                    folder = %folder.visible,
                    error = %e,
                    "folder sync failed"
                );
            }
            outcome
        }));
    }

    let mut report = AccountReport {
        folders_synced: 0,
        folders_failed: 0,
    };
    for handle in join_all(handles).await {
        match handle {
            Ok(Ok(())) => report.folders_synced += 1,
            Ok(Err(_)) => report.folders_failed += 1,
            Err(e) => {
                warn!(account = %account.name, error = %e, "folder worker panicked");
                report.folders_failed += 1;
            }
        }
    }

    // IDLE hint: keep watching the configured source folders and
    // re-sync one when the server pushes news.
    if !run_once && !opts.idle_folders.is_empty() && !abort.is_set() {
        let mut watchers = Vec::new();
        for folder in folders
            .iter()
            .filter(|f| opts.idle_folders.contains(&f.visible))
        {
            let ctx = FolderCtx {
                account: account.clone(),
                general: general.clone(),
                status_dir: status_dir.clone(),
                remote_pool: remote_pool.clone(),
                local: local.clone(),
                abort: abort.clone(),
                copy_sem: copy_sem.clone(),
            };
            let folder = folder.clone();
            watchers.push(tokio::spawn(async move {
                idle_watch(&ctx, &folder).await;
            }));
        }
        join_all(watchers).await;
    }

    for handle in keepalives {
        handle.abort();
    }
    Ok(report)
}

#[derive(Clone)]
struct SyncFolder {
    visible: String,
    wire: String,
    separator: char,
}

struct FolderCtx {
    account: Arc<AccountConfig>,
    general: Arc<General>,
    status_dir: PathBuf,
    remote_pool: ImapPool,
    local: Arc<LocalBackend>,
    abort: AbortFlag,
    copy_sem: Arc<Semaphore>,
}

/// LIST the remote side, run every name through the translation
/// pipeline, and keep what the folder filter accepts.
async fn list_sync_folders(
    account: &AccountConfig,
    pool: &ImapPool,
) -> SyncResult<Vec<SyncFolder>> {
    let opts = &account.options;
    let translator = names::NameTranslator::new(
        &opts
            .nametrans
            .iter()
            .map(|r| (r.pattern.clone(), r.replace.clone()))
            .collect::<Vec<_>>(),
    )?;

    let mut filters = Vec::new();
    for pattern in &opts.folderfilter {
        let re = Regex::new(pattern)
            .map_err(|e| SyncError::Config(format!("bad folderfilter {pattern:?}: {e}")))?;
        filters.push(re);
    }

    let listed: Vec<(String, Option<String>)> =
        with_conn(pool, opts.retrycount, move |conn| {
            Box::pin(async move {
                let stream = conn
                    .session
                    .list(Some(""), Some("*"))
                    .await
                    .map_err(SyncError::from_imap)?;
                let items: Vec<_> = stream.try_collect().await.map_err(SyncError::from_imap)?;
                Ok(items
                    .iter()
                    .filter(|name| {
                        !name
                            .attributes()
                            .contains(&async_imap::types::NameAttribute::NoSelect)
                    })
                    .map(|name| {
                        (
                            name.name().to_string(),
                            name.delimiter().map(str::to_string),
                        )
                    })
                    .collect())
            })
        })
        .await?;

    let mut folders = Vec::new();
    for (raw, delimiter) in listed {
        let separator = delimiter
            .as_deref()
            .and_then(|d| d.chars().next())
            .unwrap_or('/');
        let visible = names::visible_name(&raw, separator, opts.utf8foldernames, &translator);
        if visible.is_empty() {
            continue;
        }
        if !filters.is_empty() && !filters.iter().any(|re| re.is_match(&visible)) {
            debug!(folder = %visible, "filtered out");
            continue;
        }
        folders.push(SyncFolder {
            visible,
            wire: names::dequote(&raw),
            separator,
        });
    }
    folders.sort_by(|a, b| a.visible.cmp(&b.visible));
    folders.dedup_by(|a, b| a.visible == b.visible);
    Ok(folders)
}

fn folder_basename(folder: &SyncFolder) -> String {
    folder
        .visible
        .chars()
        .map(|c| {
            if c == folder.separator || c == '/' || c == std::path::MAIN_SEPARATOR {
                '.'
            } else {
                c
            }
        })
        .collect()
}

fn imap_folder_options(account: &AccountConfig) -> ImapFolderOptions {
    ImapFolderOptions {
        filterheaders: account.options.filterheaders.clone(),
        expunge: account.options.expunge,
        retrycount: account.options.retrycount,
    }
}

/// Sync both directions of one folder pair: guard UIDVALIDITY, load
/// the three message lists, run remote→local, then local→remote.
async fn sync_folder_pair(ctx: &FolderCtx, folder: &SyncFolder) -> SyncResult<()> {
    let account = &ctx.account;
    let opts = &account.options;
    let basename = folder_basename(folder);
    let dir = ctx.status_dir.join(&account.name);

    // Build the two ends.
    let remote_imap = ImapFolder::new(
        ctx.remote_pool.clone(),
        folder.visible.clone(),
        folder.wire.clone(),
        imap_folder_options(account),
    );

    let (remote, local): (Arc<dyn Folder>, Arc<dyn Folder>) = match &*ctx.local {
        LocalBackend::Maildir { root } => {
            let local_root = root.join(&basename);
            let local = MaildirFolder::open(local_root, folder.visible.clone(), ctx.general.fsync)?;
            (
                Arc::new(remote_imap) as Arc<dyn Folder>,
                Arc::new(local) as Arc<dyn Folder>,
            )
        }
        LocalBackend::Imap { pool } => {
            // Two IMAP UID spaces never share identifiers by luck;
            // the remote side always goes through the UID map here.
            let mapped = MappedImapFolder::open(
                remote_imap,
                dir.join(format!("{basename}.uidmap")),
                ctx.general.fsync,
            )?;
            let local = ImapFolder::new(
                pool.clone(),
                folder.visible.clone(),
                names::wire_name(&folder.visible, opts.utf8foldernames),
                imap_folder_options(account),
            );
            (
                Arc::new(mapped) as Arc<dyn Folder>,
                Arc::new(local) as Arc<dyn Folder>,
            )
        }
    };

    // UID-validity guard runs before any pass touches anything.
    let remote_validity = remote.uid_validity().await?;
    guard::check_uid_validity(
        &dir.join(format!("{basename}.uidvalidity")),
        remote_validity,
        &folder.visible,
    )?;
    let local_validity = local.uid_validity().await?;
    guard::check_uid_validity(
        &dir.join(format!("{basename}.local-uidvalidity")),
        local_validity,
        &folder.visible,
    )?;

    let status: Arc<dyn Folder> = Arc::new(StatusFolder::open(
        dir.join(format!("{basename}.status")),
        folder.visible.clone(),
        ctx.general.fsync,
    )?);

    // Load the window. The smallest remote UID inside the date
    // window is persisted so later runs and the local side keep
    // loading a consistent slice.
    let min_date = opts.min_date();
    let remote_filter = ListFilter {
        min_date,
        min_uid: None,
        max_size: opts.maxsize,
    };
    remote.cache_list(&remote_filter).await?;

    let min_uid = if min_date.is_some() {
        let min_uid_path = dir.join(format!("{basename}.minuid"));
        let current_min = remote.uids().into_iter().filter(|&u| u > 0).min();
        match (guard::read_min_uid(&min_uid_path)?, current_min) {
            (Some(saved), _) => Some(saved),
            (None, Some(current)) => {
                guard::write_min_uid(&min_uid_path, current)?;
                Some(current)
            }
            (None, None) => None,
        }
    } else {
        None
    };

    let local_filter = ListFilter {
        min_date,
        min_uid: match &*ctx.local {
            LocalBackend::Maildir { .. } => min_uid,
            LocalBackend::Imap { .. } => None,
        },
        max_size: opts.maxsize,
    };
    local.cache_list(&local_filter).await?;
    status.cache_list(&ListFilter::default()).await?;

    let copy_ignore = match opts.copy_ignore.get(&folder.visible) {
        Some(seq) => sequence::parse(seq)?,
        None => Vec::new(),
    };

    let ledger = ZeroSaveLedger::open(dir.join(format!("{basename}.zerosaves")), 3)?;
    let engine = SyncEngine::new(ctx.abort.clone(), ctx.copy_sem.clone(), ledger);

    let keyword_map = if opts.keyword_map.is_empty() {
        None
    } else {
        Some(opts.keyword_map.clone())
    };

    // Remote changes come down first, then local changes go up.
    let down = PairOptions {
        account: account.name.clone(),
        dry_run: opts.dry_run,
        sync_deletes: opts.sync_deletes,
        keyword_map: keyword_map.clone(),
        copy_ignore: copy_ignore.clone(),
        newmail_hook: opts.newmail_hook.clone(),
    };
    engine
        .sync(remote.clone(), local.clone(), status.clone(), &down)
        .await?;

    if ctx.abort.is_set() {
        return finish_pair(&*remote, &*local, &*status, opts.dry_run).await;
    }

    let up = PairOptions {
        account: account.name.clone(),
        dry_run: opts.dry_run,
        sync_deletes: opts.sync_deletes,
        keyword_map,
        copy_ignore,
        newmail_hook: None,
    };
    engine
        .sync(local.clone(), remote.clone(), status.clone(), &up)
        .await?;

    finish_pair(&*remote, &*local, &*status, opts.dry_run).await
}

async fn finish_pair(
    remote: &dyn Folder,
    local: &dyn Folder,
    status: &dyn Folder,
    dry_run: bool,
) -> SyncResult<()> {
    if dry_run {
        return Ok(());
    }
    local.commit().await?;
    remote.commit().await?;
    status.commit().await
}

/// Hold a connection in IDLE on the folder and re-sync it whenever
/// the server reports news. One watcher per configured folder.
async fn idle_watch(ctx: &FolderCtx, folder: &SyncFolder) {
    use async_imap::extensions::idle::IdleResponse;
    use deadpool::managed::Object;

    while !ctx.abort.is_set() {
        let conn = match ctx.remote_pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(folder = %folder.visible, error = %e, "idle: no connection");
                tokio::time::sleep(Duration::from_secs(30)).await;
                continue;
            }
        };
        // IDLE consumes the session, so this connection leaves the
        // pool for good and is dropped after the round.
        let mut inner = Object::take(conn);
        if let Err(e) = inner.ensure_selected(&folder.wire).await {
            warn!(folder = %folder.visible, error = %e, "idle: select failed");
            tokio::time::sleep(Duration::from_secs(30)).await;
            continue;
        }

        let mut handle = inner.session.idle();
        if let Err(e) = handle.init().await {
            warn!(folder = %folder.visible, error = %e, "idle: init failed");
            continue;
        }
        let (wait, _stop) = handle.wait_with_timeout(IDLE_ROUND);
        let outcome = wait.await;
        let _ = handle.done().await;

        match outcome {
            Ok(IdleResponse::NewData(_)) => {
                info!(folder = %folder.visible, "idle: server reported news, syncing");
                if let Err(e) = sync_folder_pair(ctx, folder).await {
                    error!(folder = %folder.visible, error = %e, "idle-triggered sync failed");
                }
            }
            Ok(IdleResponse::Timeout) => {}
            Ok(IdleResponse::ManualInterrupt) => break,
            Err(e) => {
                warn!(folder = %folder.visible, error = %e, "idle wait failed");
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        }
    }
}
