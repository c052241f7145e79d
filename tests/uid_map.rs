//! The UID map presents local identifiers over a remote folder and
//! persists the binding between the two spaces.

mod common;

use common::{AssignMode, MemoryFolder};
use tempfile::TempDir;

use tern::folder::mapped::MappedFolder;
use tern::folder::Folder;
use tern::types::{FlagSet, ListFilter};

fn remote_with(uids: &[(i64, &str)]) -> MemoryFolder {
    let remote = MemoryFolder::new("remote", AssignMode::ServerAssign);
    for (uid, letters) in uids {
        remote.add(*uid, letters);
    }
    remote
}

#[tokio::test]
async fn unmapped_remote_messages_surface_as_negative() {
    let tmp = TempDir::new().unwrap();
    let mapped =
        MappedFolder::open(remote_with(&[(100, "S")]), tmp.path().join("f.uidmap"), false).unwrap();

    mapped.cache_list(&ListFilter::default()).await.unwrap();
    let uids = mapped.uids();
    assert_eq!(uids.len(), 1);
    assert!(uids[0] < 0);
    assert_eq!(mapped.flags(uids[0]).to_letters(), "S");
}

#[tokio::test]
async fn save_binds_local_hint_to_remote_uid() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("f.uidmap");
    let mapped = MappedFolder::open(remote_with(&[]), &path, false).unwrap();

    // The engine hands over the source-side uid; the wrapped folder
    // assigns its own remote uid underneath, and the caller sees its
    // hint preserved.
    let local = mapped
        .save(42, Some(b"m\r\n"), FlagSet::from_letters("S"), 0)
        .await
        .unwrap();
    assert_eq!(local, 42);
    assert!(mapped.uid_exists(42));
    assert_eq!(mapped.flags(42).to_letters(), "S");
}

#[tokio::test]
async fn bindings_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("f.uidmap");
    let remote = remote_with(&[]);
    {
        let mapped = MappedFolder::open(remote, &path, false).unwrap();
        mapped
            .save(42, Some(b"m\r\n"), FlagSet::empty(), 0)
            .await
            .unwrap();
        mapped.commit().await.unwrap();
    }

    // Rebuild over a remote that still has the message the map
    // points at (the memory double allocated uid 1).
    let remote = remote_with(&[(1, "")]);
    let mapped = MappedFolder::open(remote, &path, false).unwrap();
    mapped.cache_list(&ListFilter::default()).await.unwrap();
    assert!(mapped.uid_exists(42));
}

#[tokio::test]
async fn change_uid_rebinds_locally() {
    let tmp = TempDir::new().unwrap();
    let mapped =
        MappedFolder::open(remote_with(&[(100, "S")]), tmp.path().join("f.uidmap"), false).unwrap();
    mapped.cache_list(&ListFilter::default()).await.unwrap();
    let transient = mapped.uids()[0];

    mapped.change_uid(transient, 7).await.unwrap();
    assert!(mapped.uid_exists(7));
    assert!(!mapped.uid_exists(transient));
    assert_eq!(mapped.flags(7).to_letters(), "S");
}

#[tokio::test]
async fn delete_drops_binding_and_remote_copy() {
    let tmp = TempDir::new().unwrap();
    let remote = remote_with(&[(100, "S")]);
    let mapped = MappedFolder::open(remote, tmp.path().join("f.uidmap"), false).unwrap();
    mapped.cache_list(&ListFilter::default()).await.unwrap();
    let local = mapped.uids()[0];
    mapped.change_uid(local, 5).await.unwrap();

    mapped.delete_many(&[5]).await.unwrap();
    assert!(!mapped.uid_exists(5));
    assert!(mapped.uids().is_empty());
}

#[tokio::test]
async fn stale_bindings_are_dropped_on_rescan() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("f.uidmap");
    {
        let mapped = MappedFolder::open(remote_with(&[]), &path, false).unwrap();
        mapped.save(9, Some(b"m\r\n"), FlagSet::empty(), 0).await.unwrap();
        mapped.commit().await.unwrap();
    }

    // The remote lost the message; the binding must go with it.
    let mapped = MappedFolder::open(remote_with(&[]), &path, false).unwrap();
    mapped.cache_list(&ListFilter::default()).await.unwrap();
    assert!(!mapped.uid_exists(9));
}
