//! Durability of the status store and the per-folder guard files.

use tempfile::TempDir;

use tern::errors::SyncError;
use tern::folder::status::StatusFolder;
use tern::folder::Folder;
use tern::sync::guard;
use tern::types::FlagSet;

#[tokio::test]
async fn status_records_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("inbox.status");

    {
        let status = StatusFolder::open(&path, "INBOX", true).unwrap();
        status.save(3, None, FlagSet::from_letters("SF"), 1_700_000_000).await.unwrap();
        status.save(9, None, FlagSet::empty(), 1_700_000_100).await.unwrap();
        status.commit().await.unwrap();
    }

    let status = StatusFolder::open(&path, "INBOX", true).unwrap();
    assert_eq!(status.uids(), vec![3, 9]);
    assert_eq!(status.flags(3).to_letters(), "SF");
    assert_eq!(status.internal_time(9), 1_700_000_100);
}

#[tokio::test]
async fn status_flag_updates_persist() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("kw.status");

    {
        let status = StatusFolder::open(&path, "kw", false).unwrap();
        status.save(1, None, FlagSet::from_letters("S"), 10).await.unwrap();
        status.add_flags(&[1], FlagSet::from_letters("F")).await.unwrap();
        status.commit().await.unwrap();
    }

    let status = StatusFolder::open(&path, "kw", false).unwrap();
    assert_eq!(status.flags(1).to_letters(), "SF");
}

#[tokio::test]
async fn status_rewrite_leaves_no_partial_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("x.status");
    let status = StatusFolder::open(&path, "x", false).unwrap();
    status.save(1, None, FlagSet::empty(), 0).await.unwrap();
    status.commit().await.unwrap();

    // The temp file from the rename dance must not linger.
    assert!(path.exists());
    assert!(!path.parent().unwrap().join("x.status.tmp").exists());
}

#[tokio::test]
async fn wipe_clears_records_and_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("w.status");
    let status = StatusFolder::open(&path, "w", false).unwrap();
    status.save(1, None, FlagSet::from_letters("S"), 0).await.unwrap();
    status.commit().await.unwrap();

    // Manual uidvalidity recovery starts from an empty record.
    status.wipe().unwrap();
    assert!(status.uids().is_empty());
    assert!(!path.exists());
}

#[tokio::test]
async fn status_rejects_foreign_files() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("bad.status");
    std::fs::write(&path, "not a status file\n1|S|0|\n").unwrap();
    assert!(StatusFolder::open(&path, "bad", false).is_err());
}

#[tokio::test]
async fn status_has_no_bodies() {
    let tmp = TempDir::new().unwrap();
    let status = StatusFolder::open(tmp.path().join("b.status"), "b", false).unwrap();
    status.save(1, Some(b"ignored"), FlagSet::empty(), 0).await.unwrap();
    assert!(status.body(1).await.is_err());
}

#[test]
fn uidvalidity_guard_saves_then_matches_then_fails() {
    let tmp = TempDir::new().unwrap();
    let cache = tmp.path().join("inbox.uidvalidity");

    // First contact: token is cached and the folder proceeds.
    guard::check_uid_validity(&cache, 444, "INBOX").unwrap();
    // Same token: proceed.
    guard::check_uid_validity(&cache, 444, "INBOX").unwrap();
    // Server reset its UID space: distinguished error, no passes.
    let err = guard::check_uid_validity(&cache, 555, "INBOX").unwrap_err();
    match err {
        SyncError::UidValidity { cached, current, .. } => {
            assert_eq!(cached, 444);
            assert_eq!(current, 555);
        }
        other => panic!("unexpected error {other:?}"),
    }
    // The cache is left untouched by the failure.
    guard::check_uid_validity(&cache, 444, "INBOX").unwrap();
}

#[test]
fn min_uid_marker_round_trips() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("inbox.minuid");
    assert_eq!(guard::read_min_uid(&path).unwrap(), None);
    guard::write_min_uid(&path, 1234).unwrap();
    assert_eq!(guard::read_min_uid(&path).unwrap(), Some(1234));
}

#[test]
fn zero_save_ledger_counts_and_clears() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("f.zerosaves");

    let mut ledger = guard::ZeroSaveLedger::open(&path, 3).unwrap();
    assert!(ledger.strike().unwrap());
    assert!(ledger.strike().unwrap());
    // Counts survive a reopen mid-streak.
    let mut ledger = guard::ZeroSaveLedger::open(&path, 3).unwrap();
    assert!(!ledger.strike().unwrap());
    ledger.clear().unwrap();
    let mut ledger = guard::ZeroSaveLedger::open(&path, 3).unwrap();
    assert!(ledger.strike().unwrap());
}
