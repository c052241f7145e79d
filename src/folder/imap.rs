//! IMAP-backed folder. All network traffic goes through the account's
//! connection pool with transport-level retry; the metadata cache is
//! refreshed by `cache_list` and kept consistent by the mutating ops.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::TryStreamExt;
use mailparse::MailHeaderMap;
use rand::Rng;
use tracing::{debug, warn};

use crate::codec::{flags as flagcodec, sequence};
use crate::errors::{SyncError, SyncResult};
use crate::folder::Folder;
use crate::imap::pool::{with_conn, ImapPool};
use crate::types::{FlagSet, ListFilter, MessageMeta, Uid};

/// Marker header injected before APPEND so the new UID can be found
/// again; the name is wire-compatible with what other synchronizers
/// leave behind.
pub const MARKER_HEADER: &str = "X-OfflineIMAP";

/// IMAP STORE lines are length-bounded; flag updates go out in chunks.
const FLAG_BATCH: usize = 100;

pub struct ImapFolderOptions {
    pub filterheaders: Vec<String>,
    pub expunge: bool,
    pub retrycount: u32,
}

struct ImapState {
    list: BTreeMap<Uid, MessageMeta>,
    uid_validity: Option<u32>,
}

pub struct ImapFolder {
    visible: String,
    wire: String,
    pool: ImapPool,
    opts: ImapFolderOptions,
    state: Mutex<ImapState>,
}

impl ImapFolder {
    pub fn new(
        pool: ImapPool,
        visible: impl Into<String>,
        wire: impl Into<String>,
        opts: ImapFolderOptions,
    ) -> Self {
        Self {
            visible: visible.into(),
            wire: wire.into(),
            pool,
            opts,
            state: Mutex::new(ImapState {
                list: BTreeMap::new(),
                uid_validity: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ImapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wire_uid(uid: Uid) -> SyncResult<u32> {
        u32::try_from(uid)
            .ok()
            .filter(|&u| u > 0)
            .ok_or_else(|| SyncError::Message(format!("uid {uid} cannot go on the wire")))
    }

    fn search_query(filter: &ListFilter) -> String {
        let mut conditions = Vec::new();
        if let Some(min_uid) = filter.min_uid {
            conditions.push(format!("UID {min_uid}:*"));
        }
        if let Some(date) = filter.min_date {
            conditions.push(format!("SINCE {}", date.format("%d-%b-%Y")));
        }
        if let Some(max_size) = filter.max_size {
            conditions.push(format!("SMALLER {max_size}"));
        }
        if conditions.is_empty() {
            "ALL".to_string()
        } else {
            conditions.join(" ")
        }
    }

    /// The APPEND date-time argument, quoted per RFC 3501 syntax.
    fn append_date(internal_time: i64) -> Option<String> {
        let dt = Utc.timestamp_opt(internal_time, 0).single()?;
        Some(format!("\"{}\"", dt.format("%d-%b-%Y %H:%M:%S +0000")))
    }

    /// Search for the injected marker header; a unique hit is the UID
    /// the server assigned to our APPEND.
    async fn find_by_marker(&self, marker: &str) -> SyncResult<Uid> {
        let wire = self.wire.clone();
        let query = format!("HEADER {MARKER_HEADER} {marker}");
        let found: Vec<u32> = with_conn(&self.pool, self.opts.retrycount, move |conn| {
            let wire = wire.clone();
            let query = query.clone();
            Box::pin(async move {
                conn.ensure_selected(&wire).await?;
                let uids = conn
                    .session
                    .uid_search(&query)
                    .await
                    .map_err(SyncError::from_imap)?;
                Ok(uids.into_iter().collect())
            })
        })
        .await?;

        match found.as_slice() {
            [] => Ok(0),
            [uid] => Ok(Uid::from(*uid)),
            many => Err(SyncError::Message(format!(
                "marker search returned {} uids for {MARKER_HEADER}",
                many.len()
            ))),
        }
    }

    /// Fallback when SEARCH found nothing: fetch headers of every UID
    /// above the highest one we knew before the APPEND and scan for
    /// the marker by hand.
    async fn find_by_header_scan(&self, marker: &str, scan_from: Uid) -> SyncResult<Uid> {
        let wire = self.wire.clone();
        let needle = format!("{MARKER_HEADER}: {marker}");
        let range = format!("{scan_from}:*");

        let headers: Vec<(Option<u32>, Vec<u8>)> =
            with_conn(&self.pool, self.opts.retrycount, move |conn| {
                let wire = wire.clone();
                let range = range.clone();
                Box::pin(async move {
                    conn.ensure_selected(&wire).await?;
                    let stream = conn
                        .session
                        .uid_fetch(&range, "(UID RFC822.HEADER)")
                        .await
                        .map_err(SyncError::from_imap)?;
                    let fetches: Vec<_> =
                        stream.try_collect().await.map_err(SyncError::from_imap)?;
                    Ok(fetches
                        .iter()
                        .map(|f| (f.uid, f.header().unwrap_or_default().to_vec()))
                        .collect())
                })
            })
            .await?;

        for (uid, header) in headers {
            let text = String::from_utf8_lossy(&header);
            if text.lines().any(|l| l.trim_end() == needle) {
                if let Some(uid) = uid {
                    return Ok(Uid::from(uid));
                }
            }
        }
        Ok(0)
    }
}

/// Remove the named headers from the message's header block,
/// including folded continuation lines.
pub fn strip_headers(body: &[u8], names: &[String]) -> Vec<u8> {
    if names.is_empty() {
        return body.to_vec();
    }

    let mut out = Vec::with_capacity(body.len());
    let mut skipping = false;
    let mut in_headers = true;
    let mut rest = body;

    while !rest.is_empty() {
        let line_end = rest
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(rest.len());
        let (line, tail) = rest.split_at(line_end);
        rest = tail;

        if in_headers {
            let trimmed = trim_line(line);
            if trimmed.is_empty() {
                in_headers = false;
                skipping = false;
            } else if line[0] == b' ' || line[0] == b'\t' {
                // Continuation of the previous header.
                if skipping {
                    continue;
                }
            } else {
                let lower = trimmed.to_ascii_lowercase();
                skipping = names.iter().any(|name| {
                    let mut prefix = name.to_ascii_lowercase().into_bytes();
                    prefix.push(b':');
                    lower.starts_with(&prefix)
                });
                if skipping {
                    continue;
                }
            }
        }
        out.extend_from_slice(line);
    }
    out
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Prepend the marker header; value is derived from the content plus
/// a random component so the same mail uploaded twice stays apart.
fn inject_marker(body: &[u8]) -> (Vec<u8>, String) {
    let crc = crc32fast::hash(body);
    let nonce: u64 = rand::thread_rng().gen();
    let marker = format!("{crc}-{nonce}");
    let mut out = format!("{MARKER_HEADER}: {marker}\r\n").into_bytes();
    out.extend_from_slice(body);
    (out, marker)
}

/// Fall back to the Date header when the caller has no better time.
fn date_header_epoch(body: &[u8]) -> Option<i64> {
    let (headers, _) = mailparse::parse_headers(body).ok()?;
    let date = headers.get_first_value("Date")?;
    mailparse::dateparse(&date).ok()
}

#[async_trait]
impl Folder for ImapFolder {
    fn name(&self) -> &str {
        &self.visible
    }

    async fn cache_list(&self, filter: &ListFilter) -> SyncResult<()> {
        let wire = self.wire.clone();
        let query = Self::search_query(filter);

        let (uid_validity, metas): (Option<u32>, Vec<(u32, MessageMeta)>) =
            with_conn(&self.pool, self.opts.retrycount, move |conn| {
                let wire = wire.clone();
                let query = query.clone();
                Box::pin(async move {
                    let mailbox = conn.select(&wire).await?;
                    let uids = conn
                        .session
                        .uid_search(&query)
                        .await
                        .map_err(SyncError::from_imap)?;
                    if uids.is_empty() {
                        return Ok((mailbox.uid_validity, Vec::new()));
                    }

                    let seq = sequence::format(
                        &uids.iter().map(|&u| Uid::from(u)).collect::<Vec<_>>(),
                    );
                    let stream = conn
                        .session
                        .uid_fetch(&seq, "(UID FLAGS INTERNALDATE)")
                        .await
                        .map_err(SyncError::from_imap)?;
                    let fetches: Vec<_> =
                        stream.try_collect().await.map_err(SyncError::from_imap)?;

                    let mut metas = Vec::with_capacity(fetches.len());
                    for fetch in &fetches {
                        let Some(uid) = fetch.uid else { continue };
                        let (flags, keywords) = flagcodec::from_imap_flags(fetch.flags());
                        let internal_time = fetch
                            .internal_date()
                            .map(|dt| dt.timestamp())
                            .unwrap_or_default();
                        metas.push((uid, MessageMeta::new(flags, keywords, internal_time)));
                    }
                    Ok((mailbox.uid_validity, metas))
                })
            })
            .await?;

        let mut state = self.lock();
        state.uid_validity = uid_validity;
        state.list = metas
            .into_iter()
            .map(|(uid, meta)| (Uid::from(uid), meta))
            .collect();
        debug!(folder = %self.visible, count = state.list.len(), "message list cached");
        Ok(())
    }

    fn uids(&self) -> Vec<Uid> {
        self.lock().list.keys().copied().collect()
    }

    fn uid_exists(&self, uid: Uid) -> bool {
        self.lock().list.contains_key(&uid)
    }

    fn meta(&self, uid: Uid) -> Option<MessageMeta> {
        self.lock().list.get(&uid).cloned()
    }

    async fn body(&self, uid: Uid) -> SyncResult<Vec<u8>> {
        let wire_uid = Self::wire_uid(uid)?;
        let wire = self.wire.clone();

        with_conn(&self.pool, self.opts.retrycount, move |conn| {
            let wire = wire.clone();
            Box::pin(async move {
                conn.ensure_selected(&wire).await?;
                let stream = conn
                    .session
                    .uid_fetch(wire_uid.to_string(), "(UID BODY.PEEK[])")
                    .await
                    .map_err(SyncError::from_imap)?;
                let fetches: Vec<_> = stream.try_collect().await.map_err(SyncError::from_imap)?;
                fetches
                    .iter()
                    .find_map(|f| f.body().map(<[u8]>::to_vec))
                    .ok_or_else(|| SyncError::Message(format!("no body returned for uid {uid}")))
            })
        })
        .await
    }

    async fn save(
        &self,
        uid_hint: Uid,
        body: Option<&[u8]>,
        flags: FlagSet,
        internal_time: i64,
    ) -> SyncResult<Uid> {
        // Already present: nothing to upload, just align the flags.
        if uid_hint > 0 && self.uid_exists(uid_hint) {
            self.save_flags(uid_hint, flags).await?;
            return Ok(uid_hint);
        }

        let Some(body) = body else {
            return Err(SyncError::Message("imap save needs a body".into()));
        };

        let stripped = strip_headers(body, &self.opts.filterheaders);
        let (message, marker) = inject_marker(&stripped);

        let time = if internal_time > 0 {
            internal_time
        } else {
            date_header_epoch(&stripped).unwrap_or_default()
        };
        let date = if time > 0 { Self::append_date(time) } else { None };
        let flags_str = flagcodec::render_server_flags(flags);

        // Highest UID known before the APPEND bounds the fallback
        // header scan.
        let scan_from = self.lock().list.keys().next_back().copied().unwrap_or(0) + 1;

        let wire = self.wire.clone();
        with_conn(&self.pool, self.opts.retrycount, move |conn| {
            let wire = wire.clone();
            let date = date.clone();
            let flags_str = flags_str.clone();
            let message = message.clone();
            Box::pin(async move {
                conn.ensure_selected(&wire).await?;
                conn.session
                    .append(&wire, Some(&flags_str), date.as_deref(), &message)
                    .await
                    .map_err(SyncError::from_imap)?;
                // Some servers invalidate the selection state after
                // APPEND; drop the cached selection.
                conn.forget_selection();
                Ok(())
            })
        })
        .await?;

        // The client collaborator does not expose APPENDUID, so the
        // new UID is always discovered through the marker header.
        let mut new_uid = self.find_by_marker(&marker).await.unwrap_or_else(|e| {
            warn!(folder = %self.visible, error = %e, "marker search failed");
            0
        });
        if new_uid == 0 {
            new_uid = self.find_by_header_scan(&marker, scan_from).await?;
        }

        if new_uid > 0 {
            self.lock().list.insert(
                new_uid,
                MessageMeta::new(flags, Default::default(), time),
            );
        } else {
            warn!(folder = %self.visible, "could not determine uid of appended message");
        }
        Ok(new_uid)
    }

    async fn save_flags(&self, uid: Uid, flags: FlagSet) -> SyncResult<()> {
        let wire_uid = Self::wire_uid(uid)?;
        let wire = self.wire.clone();
        let rendered = flagcodec::render_server_flags(flags);

        with_conn(&self.pool, self.opts.retrycount, move |conn| {
            let wire = wire.clone();
            let rendered = rendered.clone();
            Box::pin(async move {
                conn.ensure_selected(&wire).await?;
                let stream = conn
                    .session
                    .uid_store(wire_uid.to_string(), format!("FLAGS {rendered}"))
                    .await
                    .map_err(SyncError::from_imap)?;
                let _: Vec<_> = stream.try_collect().await.map_err(SyncError::from_imap)?;
                Ok(())
            })
        })
        .await?;

        let mut state = self.lock();
        if let Some(meta) = state.list.get_mut(&uid) {
            meta.flags = flags;
        }
        Ok(())
    }

    async fn add_flags(&self, uids: &[Uid], flags: FlagSet) -> SyncResult<()> {
        self.store_flags('+', uids, flags).await
    }

    async fn del_flags(&self, uids: &[Uid], flags: FlagSet) -> SyncResult<()> {
        self.store_flags('-', uids, flags).await
    }

    async fn delete_many(&self, uids: &[Uid]) -> SyncResult<()> {
        let present: Vec<Uid> = {
            let state = self.lock();
            uids.iter()
                .copied()
                .filter(|u| state.list.contains_key(u))
                .collect()
        };
        if present.is_empty() {
            return Ok(());
        }

        self.store_flags('+', &present, FlagSet::single('T')).await?;

        if self.opts.expunge {
            let seq = sequence::format(&present);
            let wire = self.wire.clone();
            with_conn(&self.pool, self.opts.retrycount, move |conn| {
                let wire = wire.clone();
                let seq = seq.clone();
                Box::pin(async move {
                    conn.ensure_selected(&wire).await?;
                    if conn.has_capability("UIDPLUS") {
                        let stream = conn
                            .session
                            .uid_expunge(&seq)
                            .await
                            .map_err(SyncError::from_imap)?;
                        let _: Vec<u32> =
                            stream.try_collect().await.map_err(SyncError::from_imap)?;
                    } else {
                        let stream = conn
                            .session
                            .expunge()
                            .await
                            .map_err(SyncError::from_imap)?;
                        let _: Vec<u32> =
                            stream.try_collect().await.map_err(SyncError::from_imap)?;
                    }
                    Ok(())
                })
            })
            .await?;
        }

        let mut state = self.lock();
        for uid in &present {
            state.list.remove(uid);
        }
        Ok(())
    }

    async fn uid_validity(&self) -> SyncResult<u32> {
        if let Some(value) = self.lock().uid_validity {
            return Ok(value);
        }
        let wire = self.wire.clone();
        let value = with_conn(&self.pool, self.opts.retrycount, move |conn| {
            let wire = wire.clone();
            Box::pin(async move {
                let mailbox = conn.select(&wire).await?;
                mailbox.uid_validity.ok_or_else(|| {
                    SyncError::Folder("server reported no uidvalidity".into())
                })
            })
        })
        .await?;
        self.lock().uid_validity = Some(value);
        Ok(value)
    }

    fn suggests_threads(&self) -> bool {
        true
    }
}

impl ImapFolder {
    async fn store_flags(&self, op: char, uids: &[Uid], flags: FlagSet) -> SyncResult<()> {
        if uids.is_empty() || flags.is_empty() {
            return Ok(());
        }
        let rendered = flagcodec::render_server_flags(flags);

        for chunk in uids.chunks(FLAG_BATCH) {
            let seq = sequence::format(chunk);
            let command = format!("{op}FLAGS {rendered}");
            let wire = self.wire.clone();

            with_conn(&self.pool, self.opts.retrycount, move |conn| {
                let wire = wire.clone();
                let seq = seq.clone();
                let command = command.clone();
                Box::pin(async move {
                    conn.ensure_selected(&wire).await?;
                    let stream = conn
                        .session
                        .uid_store(&seq, &command)
                        .await
                        .map_err(SyncError::from_imap)?;
                    let _: Vec<_> = stream.try_collect().await.map_err(SyncError::from_imap)?;
                    Ok(())
                })
            })
            .await?;

            let mut state = self.lock();
            for uid in chunk {
                if let Some(meta) = state.list.get_mut(uid) {
                    meta.flags = match op {
                        '+' => meta.flags.union(flags),
                        _ => meta.flags.difference(flags),
                    };
                }
            }
        }
        Ok(())
    }
}
