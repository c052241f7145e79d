//! Maildir backend. Standard `cur`/`new`/`tmp` layout; the sync UID
//! is embedded in the filename as a `,U=<uid>` marker and allocated
//! from a monotonic counter persisted next to the mail. Files that
//! show up without a marker (dropped in by an MUA) get transient
//! negative UIDs and are uploaded by the copy pass.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::RngCore;

use crate::errors::{SyncError, SyncResult};
use crate::folder::{tmp_sibling, Folder};
use crate::types::{FlagSet, ListFilter, MessageMeta, Uid};

const UIDNEXT_FILE: &str = ".tern-uidnext";
const UIDVALIDITY_FILE: &str = ".tern-uidvalidity";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Subdir {
    New,
    Cur,
}

impl Subdir {
    fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Cur => "cur",
        }
    }
}

#[derive(Clone)]
struct Entry {
    meta: MessageMeta,
    filename: String,
    subdir: Subdir,
}

struct State {
    list: BTreeMap<Uid, Entry>,
    uid_next: Uid,
}

pub struct MaildirFolder {
    name: String,
    root: PathBuf,
    fsync: bool,
    uid_validity: u32,
    state: Mutex<State>,
}

impl MaildirFolder {
    pub fn open(root: impl Into<PathBuf>, name: impl Into<String>, fsync: bool) -> SyncResult<Self> {
        let root = root.into();
        for sub in ["cur", "new", "tmp"] {
            fs::create_dir_all(root.join(sub))?;
        }

        let uid_validity = read_or_init_uidvalidity(&root)?;
        let uid_next = read_counter(&root.join(UIDNEXT_FILE))?.unwrap_or(1);

        Ok(Self {
            name: name.into(),
            root,
            fsync,
            uid_validity,
            state: Mutex::new(State {
                list: BTreeMap::new(),
                uid_next,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn file_path(&self, entry: &Entry) -> PathBuf {
        self.root.join(entry.subdir.as_str()).join(&entry.filename)
    }

    fn entry(&self, uid: Uid) -> SyncResult<Entry> {
        self.lock()
            .list
            .get(&uid)
            .cloned()
            .ok_or_else(|| SyncError::Message(format!("uid {uid} not in {}", self.name)))
    }

    /// Rename a message file so its info suffix matches `flags`,
    /// moving from `new` to `cur` once the message has been seen.
    fn rewrite_entry(&self, uid: Uid, flags: FlagSet, new_uid: Option<Uid>) -> SyncResult<()> {
        let entry = self.entry(uid)?;
        let old_path = self.file_path(&entry);

        let base = match entry.filename.split_once(":2,") {
            Some((base, _)) => base.to_string(),
            None => entry.filename.clone(),
        };
        let base = match new_uid {
            Some(n) => set_uid_marker(&base, n),
            None => base,
        };
        let subdir = if flags.contains('S') { Subdir::Cur } else { entry.subdir };
        let filename = format!("{base}:2,{}", maildir_letters(flags));
        let new_path = self.root.join(subdir.as_str()).join(&filename);

        if new_path != old_path {
            fs::rename(&old_path, &new_path)?;
        }

        let mut state = self.lock();
        state.list.remove(&uid);
        let target_uid = new_uid.unwrap_or(uid);
        let mut meta = entry.meta;
        meta.flags = flags;
        state.list.insert(
            target_uid,
            Entry {
                meta,
                filename,
                subdir,
            },
        );
        if target_uid > 0 && target_uid >= state.uid_next {
            state.uid_next = target_uid + 1;
        }
        Ok(())
    }

    fn persist_uid_next(&self) -> SyncResult<()> {
        let uid_next = self.lock().uid_next;
        write_counter(&self.root.join(UIDNEXT_FILE), uid_next, self.fsync)
    }
}

fn read_counter(path: &Path) -> SyncResult<Option<Uid>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    let value = raw
        .trim()
        .parse()
        .map_err(|_| SyncError::Folder(format!("corrupt counter file {}", path.display())))?;
    Ok(Some(value))
}

fn write_counter(path: &Path, value: Uid, fsync: bool) -> SyncResult<()> {
    let tmp = tmp_sibling(path);
    {
        let mut file = File::create(&tmp)?;
        writeln!(file, "{value}")?;
        if fsync {
            file.sync_all()?;
        }
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_or_init_uidvalidity(root: &Path) -> SyncResult<u32> {
    let path = root.join(UIDVALIDITY_FILE);
    if let Some(value) = read_counter(&path)? {
        return u32::try_from(value)
            .map_err(|_| SyncError::Folder(format!("corrupt uidvalidity in {}", path.display())));
    }
    let token = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(1);
    write_counter(&path, Uid::from(token), true)?;
    Ok(token)
}

/// Flags in the filename suffix are sorted alphabetically, maildir
/// convention, which differs from the S,R,F,T,D order used elsewhere.
fn maildir_letters(flags: FlagSet) -> String {
    let mut letters: Vec<char> = flags.iter().collect();
    letters.sort_unstable();
    letters.into_iter().collect()
}

fn set_uid_marker(base: &str, uid: Uid) -> String {
    match base.find(",U=") {
        Some(idx) => {
            let tail = &base[idx + 3..];
            let rest = tail
                .find(|c: char| !c.is_ascii_digit() && c != '-')
                .map(|end| &tail[end..])
                .unwrap_or("");
            format!("{},U={uid}{rest}", &base[..idx])
        }
        None => format!("{base},U={uid}"),
    }
}

fn parse_filename(filename: &str) -> (Option<Uid>, FlagSet) {
    let (base, info) = match filename.split_once(":2,") {
        Some((base, info)) => (base, info),
        None => (filename, ""),
    };
    let uid = base.find(",U=").and_then(|idx| {
        let tail = &base[idx + 3..];
        let digits: String = tail
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '-')
            .collect();
        digits.parse().ok()
    });
    (uid, FlagSet::from_letters(info))
}

fn unique_basename(uid: Uid) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let pid = std::process::id();
    let nonce = rand::thread_rng().next_u64();
    format!("{secs}.R{nonce:x}.{pid},U={uid}")
}

fn mtime_epoch(path: &Path) -> i64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl Folder for MaildirFolder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn cache_list(&self, filter: &ListFilter) -> SyncResult<()> {
        let min_time = filter
            .min_date
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp());

        let mut list = BTreeMap::new();
        let mut next_transient: Uid = -1;
        let mut max_seen: Uid = 0;

        for subdir in [Subdir::Cur, Subdir::New] {
            let dir = self.root.join(subdir.as_str());
            for dirent in fs::read_dir(&dir)? {
                let dirent = dirent?;
                let filename = dirent.file_name().to_string_lossy().into_owned();
                if filename.starts_with('.') {
                    continue;
                }
                let (uid, mut flags) = parse_filename(&filename);
                // Anything still sitting in new/ has not been seen.
                if subdir == Subdir::New {
                    flags.remove('S');
                }

                let path = dirent.path();
                let mtime = mtime_epoch(&path);
                if let Some(min) = min_time {
                    if mtime < min {
                        continue;
                    }
                }
                if let Some(max_size) = filter.max_size {
                    let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                    if size > u64::from(max_size) {
                        continue;
                    }
                }

                let uid = match uid {
                    Some(uid) => {
                        if let Some(min_uid) = filter.min_uid {
                            if uid < min_uid {
                                continue;
                            }
                        }
                        max_seen = max_seen.max(uid);
                        uid
                    }
                    None => {
                        let uid = next_transient;
                        next_transient -= 1;
                        uid
                    }
                };

                list.insert(
                    uid,
                    Entry {
                        meta: MessageMeta::new(flags, Default::default(), mtime),
                        filename,
                        subdir,
                    },
                );
            }
        }

        let mut state = self.lock();
        state.list = list;
        if max_seen >= state.uid_next {
            state.uid_next = max_seen + 1;
        }
        Ok(())
    }

    fn uids(&self) -> Vec<Uid> {
        self.lock().list.keys().copied().collect()
    }

    fn uid_exists(&self, uid: Uid) -> bool {
        self.lock().list.contains_key(&uid)
    }

    fn meta(&self, uid: Uid) -> Option<MessageMeta> {
        self.lock().list.get(&uid).map(|e| e.meta.clone())
    }

    async fn body(&self, uid: Uid) -> SyncResult<Vec<u8>> {
        let entry = self.entry(uid)?;
        fs::read(self.file_path(&entry))
            .map_err(|e| SyncError::Message(format!("reading uid {uid}: {e}")))
    }

    async fn save(
        &self,
        uid_hint: Uid,
        body: Option<&[u8]>,
        flags: FlagSet,
        internal_time: i64,
    ) -> SyncResult<Uid> {
        let Some(body) = body else {
            return Err(SyncError::Message("maildir save needs a body".into()));
        };

        let uid = {
            let mut state = self.lock();
            if uid_hint > 0 {
                if state.uid_next <= uid_hint {
                    state.uid_next = uid_hint + 1;
                }
                uid_hint
            } else {
                let uid = state.uid_next;
                state.uid_next += 1;
                uid
            }
        };

        let subdir = if flags.contains('S') { Subdir::Cur } else { Subdir::New };
        let base = unique_basename(uid);
        let filename = format!("{base}:2,{}", maildir_letters(flags));

        // tmp first, rename into place: delivery is atomic per message.
        let tmp_path = self.root.join("tmp").join(&base);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)?;
            file.write_all(body)?;
            if self.fsync {
                file.sync_all()?;
            }
        }
        let final_path = self.root.join(subdir.as_str()).join(&filename);
        fs::rename(&tmp_path, &final_path)?;

        self.lock().list.insert(
            uid,
            Entry {
                meta: MessageMeta::new(flags, Default::default(), internal_time),
                filename,
                subdir,
            },
        );
        self.persist_uid_next()?;
        Ok(uid)
    }

    async fn save_flags(&self, uid: Uid, flags: FlagSet) -> SyncResult<()> {
        self.rewrite_entry(uid, flags, None)
    }

    async fn add_flags(&self, uids: &[Uid], flags: FlagSet) -> SyncResult<()> {
        for &uid in uids {
            let current = self.flags(uid);
            self.rewrite_entry(uid, current.union(flags), None)?;
        }
        Ok(())
    }

    async fn del_flags(&self, uids: &[Uid], flags: FlagSet) -> SyncResult<()> {
        for &uid in uids {
            let current = self.flags(uid);
            self.rewrite_entry(uid, current.difference(flags), None)?;
        }
        Ok(())
    }

    async fn delete_many(&self, uids: &[Uid]) -> SyncResult<()> {
        for &uid in uids {
            let entry = match self.lock().list.remove(&uid) {
                Some(entry) => entry,
                None => continue,
            };
            let path = self.file_path(&entry);
            if let Err(e) = fs::remove_file(&path) {
                // Gone already is fine; both sides may have deleted.
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn uid_validity(&self) -> SyncResult<u32> {
        Ok(self.uid_validity)
    }

    async fn change_uid(&self, uid: Uid, new_uid: Uid) -> SyncResult<()> {
        let flags = self.flags(uid);
        self.rewrite_entry(uid, flags, Some(new_uid))
    }

    async fn commit(&self) -> SyncResult<()> {
        self.persist_uid_next()
    }
}
