use crate::errors::{SyncError, SyncResult};
use crate::types::Uid;

/// Collapse a UID list into an IMAP sequence set.
///
/// `[1,2,3,4,5,10,12,13]` becomes `"1:5,10,12:13"`. The input is
/// sorted first; only runs of consecutive values collapse into a
/// range. IMAP command lines are length-limited, so callers batch
/// through this rather than joining raw UIDs.
pub fn format(uids: &[Uid]) -> String {
    if uids.is_empty() {
        return String::new();
    }

    let mut sorted: Vec<Uid> = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let render = |start: Uid, end: Uid| {
        if start == end {
            start.to_string()
        } else {
            format!("{start}:{end}")
        }
    };

    let mut parts = Vec::new();
    let mut start = sorted[0];
    let mut end = sorted[0];
    for &uid in &sorted[1..] {
        if uid == end + 1 {
            end = uid;
        } else {
            parts.push(render(start, end));
            start = uid;
            end = uid;
        }
    }
    parts.push(render(start, end));
    parts.join(",")
}

/// Exact inverse of [`format`]. Rejects empty input, non-numeric
/// atoms and descending ranges.
pub fn parse(s: &str) -> SyncResult<Vec<Uid>> {
    if s.is_empty() {
        return Err(SyncError::Message("empty uid sequence".into()));
    }

    let mut uids = Vec::new();
    for atom in s.split(',') {
        match atom.split_once(':') {
            None => {
                let uid: Uid = atom
                    .parse()
                    .map_err(|_| SyncError::Message(format!("bad uid atom {atom:?}")))?;
                uids.push(uid);
            }
            Some((lo, hi)) => {
                let lo: Uid = lo
                    .parse()
                    .map_err(|_| SyncError::Message(format!("bad uid range {atom:?}")))?;
                let hi: Uid = hi
                    .parse()
                    .map_err(|_| SyncError::Message(format!("bad uid range {atom:?}")))?;
                if hi < lo {
                    return Err(SyncError::Message(format!(
                        "descending uid range {atom:?}"
                    )));
                }
                uids.extend(lo..=hi);
            }
        }
    }
    Ok(uids)
}
