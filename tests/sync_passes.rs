//! End-to-end scenarios for the three-pass engine, run against
//! in-memory folders and the real status store.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{AssignMode, MemoryFolder};
use tempfile::TempDir;
use tokio::sync::Semaphore;

use tern::folder::status::StatusFolder;
use tern::folder::Folder;
use tern::sched::AbortFlag;
use tern::sync::guard::ZeroSaveLedger;
use tern::sync::{PairOptions, SyncEngine};

fn engine(tmp: &TempDir) -> SyncEngine {
    engine_with_abort(tmp, AbortFlag::new())
}

fn engine_with_abort(tmp: &TempDir, abort: AbortFlag) -> SyncEngine {
    let ledger = ZeroSaveLedger::open(tmp.path().join("zerosaves"), 3).unwrap();
    SyncEngine::new(abort, Arc::new(Semaphore::new(4)), ledger)
}

fn options() -> PairOptions {
    PairOptions {
        account: "test".to_string(),
        dry_run: false,
        sync_deletes: true,
        keyword_map: None,
        copy_ignore: Vec::new(),
        newmail_hook: None,
    }
}

fn status_folder(tmp: &TempDir) -> Arc<StatusFolder> {
    Arc::new(StatusFolder::open(tmp.path().join("folder.status"), "folder", false).unwrap())
}

#[tokio::test]
async fn copy_new_mail_preserves_uid_when_destination_can() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::PreserveHint));
    let status = status_folder(&tmp);
    src.add(10, "S");

    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &options())
        .await
        .unwrap();

    assert!(dst.uid_exists(10));
    assert_eq!(dst.letters_of(10), "S");
    assert_eq!(status.flags(10).to_letters(), "S");
}

#[tokio::test]
async fn copy_new_mail_follows_server_assigned_uid() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint).allow_change_uid());
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::ServerAssign));
    let status = status_folder(&tmp);
    src.add(10, "S");

    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &options())
        .await
        .unwrap();

    // The destination allocated uid 1; the source was renamed to
    // match and the status records the new identity.
    assert!(dst.uid_exists(1));
    assert!(!src.uid_exists(10));
    assert!(src.uid_exists(1));
    assert!(status.uid_exists(1));
    assert!(!status.uid_exists(10));
}

#[tokio::test]
async fn already_present_destination_is_recorded_without_copy() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::PreserveHint));
    let status = status_folder(&tmp);
    src.add(10, "S");
    dst.add(10, "S");

    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &options())
        .await
        .unwrap();

    assert_eq!(dst.save_count(), 0);
    assert!(status.uid_exists(10));
}

#[tokio::test]
async fn delete_propagates_to_destination() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::PreserveHint));
    let status = status_folder(&tmp);
    dst.add(7, "S");
    status.save(7, None, tern::types::FlagSet::from_letters("S"), 0).await.unwrap();

    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &options())
        .await
        .unwrap();

    assert!(!dst.uid_exists(7));
    assert!(!status.uid_exists(7));
}

#[tokio::test]
async fn delete_suppressed_still_clears_status() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::PreserveHint));
    let status = status_folder(&tmp);
    dst.add(7, "S");
    status.save(7, None, tern::types::FlagSet::from_letters("S"), 0).await.unwrap();

    let mut opts = options();
    opts.sync_deletes = false;
    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &opts)
        .await
        .unwrap();

    assert!(dst.uid_exists(7));
    assert!(!status.uid_exists(7));
}

#[tokio::test]
async fn flag_add_reaches_destination_and_status() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::PreserveHint));
    let status = status_folder(&tmp);
    src.add(5, "SF");
    dst.add(5, "S");
    status.save(5, None, tern::types::FlagSet::from_letters("S"), 0).await.unwrap();

    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &options())
        .await
        .unwrap();

    assert_eq!(dst.letters_of(5), "SF");
    assert_eq!(status.flags(5).to_letters(), "SF");
}

#[tokio::test]
async fn flag_removal_follows_source() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::PreserveHint));
    let status = status_folder(&tmp);
    src.add(5, "S");
    dst.add(5, "SF");
    status.save(5, None, tern::types::FlagSet::from_letters("SF"), 0).await.unwrap();

    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &options())
        .await
        .unwrap();

    assert_eq!(dst.letters_of(5), "S");
    assert_eq!(status.flags(5).to_letters(), "S");
}

#[tokio::test]
async fn second_run_with_no_changes_is_a_noop() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::PreserveHint));
    let status = status_folder(&tmp);
    src.add(1, "S");
    src.add(2, "F");
    src.add(3, "");

    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &options())
        .await
        .unwrap();

    let saves = dst.save_count();
    let deletes = dst.delete_count();
    let flag_calls = dst.flag_call_count();

    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &options())
        .await
        .unwrap();

    assert_eq!(dst.save_count(), saves);
    assert_eq!(dst.delete_count(), deletes);
    assert_eq!(dst.flag_call_count(), flag_calls);
}

#[tokio::test]
async fn full_sync_aligns_status_with_both_sides() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::PreserveHint));
    let status = status_folder(&tmp);
    src.add(1, "S");
    src.add(2, "SF");
    dst.add(2, "S");
    status.save(2, None, tern::types::FlagSet::from_letters("S"), 0).await.unwrap();
    // uid 9 was deleted on the source.
    dst.add(9, "S");
    status.save(9, None, tern::types::FlagSet::from_letters("S"), 0).await.unwrap();

    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &options())
        .await
        .unwrap();

    assert_eq!(status.uids(), src.uids());
    assert_eq!(src.uids(), dst.uids());
    for uid in src.uids() {
        assert_eq!(status.flags(uid).to_letters(), src.letters_of(uid));
        assert_eq!(dst.letters_of(uid), src.letters_of(uid));
    }
}

#[tokio::test]
async fn zero_return_deletes_source_for_resync() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::ReturnZero));
    let status = status_folder(&tmp);
    src.add(10, "S");

    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &options())
        .await
        .unwrap();

    assert!(!src.uid_exists(10));
    assert!(status.uids().is_empty());
}

#[tokio::test]
async fn repeated_zero_returns_become_a_folder_error() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::ReturnZero));
    let status = status_folder(&tmp);

    for round in 0..2i64 {
        src.add(10 + round, "S");
        engine(&tmp)
            .sync(src.clone(), dst.clone(), status.clone(), &options())
            .await
            .unwrap();
    }

    src.add(20, "S");
    let err = engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &options())
        .await
        .unwrap_err();
    assert_eq!(err.severity(), tern::errors::Severity::Folder);
    // The third strike keeps the source copy for manual attention.
    assert!(src.uid_exists(20));
}

#[tokio::test]
async fn read_only_destination_is_survivable() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::RefuseWrite));
    let status = status_folder(&tmp);
    src.add(10, "S");

    // Message-severity failure: logged, swallowed, nothing recorded.
    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &options())
        .await
        .unwrap();

    assert!(src.uid_exists(10));
    assert!(status.uids().is_empty());
}

#[tokio::test]
async fn keyword_map_projects_onto_destination_flags() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::PreserveHint));
    let status = status_folder(&tmp);
    src.add_with(5, "S", &["$Work", "$Unmapped"], 0);
    dst.add(5, "S");
    status.save(5, None, tern::types::FlagSet::from_letters("S"), 0).await.unwrap();

    let mut opts = options();
    let mut map = BTreeMap::new();
    map.insert("$Work".to_string(), 'F');
    opts.keyword_map = Some(map);

    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &opts)
        .await
        .unwrap();

    // $Work maps to F; $Unmapped is warned about and skipped.
    assert_eq!(dst.letters_of(5), "SF");
    assert_eq!(status.flags(5).to_letters(), "SF");
}

#[tokio::test]
async fn copy_ignore_skips_without_status_update() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::PreserveHint));
    let status = status_folder(&tmp);
    src.add(10, "S");
    src.add(11, "S");

    let mut opts = options();
    opts.copy_ignore = vec![10];
    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &opts)
        .await
        .unwrap();

    assert!(!dst.uid_exists(10));
    assert!(!status.uid_exists(10));
    assert!(dst.uid_exists(11));
}

#[tokio::test]
async fn dry_run_changes_nothing() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::PreserveHint));
    let status = status_folder(&tmp);
    src.add(10, "SF");
    dst.add(7, "S");
    status.save(7, None, tern::types::FlagSet::from_letters("S"), 0).await.unwrap();

    let mut opts = options();
    opts.dry_run = true;
    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &opts)
        .await
        .unwrap();

    assert_eq!(dst.save_count(), 0);
    assert_eq!(dst.delete_count(), 0);
    assert!(dst.uid_exists(7));
    assert!(status.uid_exists(7));
    assert!(!dst.uid_exists(10));
}

#[tokio::test]
async fn abort_latch_stops_before_any_work() {
    let tmp = TempDir::new().unwrap();
    let abort = AbortFlag::new();
    abort.set();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint));
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::PreserveHint));
    let status = status_folder(&tmp);
    src.add(10, "S");

    engine_with_abort(&tmp, abort)
        .sync(src.clone(), dst.clone(), status.clone(), &options())
        .await
        .unwrap();

    assert_eq!(dst.save_count(), 0);
}

#[tokio::test]
async fn fanned_out_copy_transfers_everything() {
    let tmp = TempDir::new().unwrap();
    let src = Arc::new(MemoryFolder::new("src", AssignMode::PreserveHint).fan_out());
    let dst = Arc::new(MemoryFolder::new("dst", AssignMode::PreserveHint));
    let status = status_folder(&tmp);
    for uid in 1..=20 {
        src.add(uid, if uid % 2 == 0 { "S" } else { "" });
    }

    engine(&tmp)
        .sync(src.clone(), dst.clone(), status.clone(), &options())
        .await
        .unwrap();

    assert_eq!(dst.uids().len(), 20);
    assert_eq!(status.uids().len(), 20);
}
