//! Sync integration tests: local directory into an in-memory store

use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use vcp_core::{
    Error, ExecutorConfig, LocalBackend, MemoryStore, SyncCommand, SyncComparator, SyncOptions,
    TransactionManager, TransferExecutor,
};

fn local_tree() -> TempDir {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir_all(tmp.path().join("data/sub")).unwrap();
    std::fs::write(tmp.path().join("data/one.txt"), b"one").unwrap();
    std::fs::write(tmp.path().join("data/sub/two.txt"), b"two!").unwrap();
    std::fs::write(tmp.path().join("data/.gitattributes"), b"* binary").unwrap();
    tmp
}

async fn store() -> Arc<MemoryStore> {
    let store = MemoryStore::new("hub");
    store.create_repo("alice/data", &["main"]).await;
    Arc::new(store)
}

fn executor() -> TransferExecutor {
    TransferExecutor::new(Arc::new(Semaphore::new(4)), ExecutorConfig::default())
}

fn command(tmp: &TempDir, store: &Arc<MemoryStore>, comparator: SyncComparator, dryrun: bool) -> SyncCommand {
    let source = format!("{}/data", tmp.path().to_str().unwrap());
    SyncCommand::new(
        Arc::new(LocalBackend::new()),
        &source,
        store.clone(),
        "alice/data/main/mirror",
        SyncOptions {
            comparator,
            dryrun,
            message: "sync".into(),
        },
    )
}

#[tokio::test]
async fn test_sync_is_idempotent() {
    for comparator in [SyncComparator::SizeOnly, SyncComparator::SizeAndTime] {
        let tmp = local_tree();
        let store = store().await;

        let cmd = command(&tmp, &store, comparator, false);
        cmd.validate().await.unwrap();
        let first = cmd.run(Arc::new(TransactionManager::default()), &executor()).await.unwrap();
        assert_eq!(first.copied, 2);
        assert_eq!(first.ignored, 1);
        assert_eq!(first.failed, 0);
        assert_eq!(&store.read_file("alice/data/main/mirror/sub/two.txt").await.unwrap()[..], b"two!");
        assert!(store.read_file("alice/data/main/mirror/.gitattributes").await.is_err());

        let second = cmd.run(Arc::new(TransactionManager::default()), &executor()).await.unwrap();
        assert_eq!(second.copied, 0, "{:?} should find nothing to copy", comparator);
        assert_eq!(second.ignored, 3);
    }
}

#[tokio::test]
async fn test_changed_size_is_copied_again() {
    let tmp = local_tree();
    let store = store().await;
    let cmd = command(&tmp, &store, SyncComparator::SizeOnly, false);
    cmd.run(Arc::new(TransactionManager::default()), &executor()).await.unwrap();

    std::fs::write(tmp.path().join("data/one.txt"), b"one, longer").unwrap();
    let stats = cmd.run(Arc::new(TransactionManager::default()), &executor()).await.unwrap();
    assert_eq!(stats.copied, 1);
    assert_eq!(&store.read_file("alice/data/main/mirror/one.txt").await.unwrap()[..], b"one, longer");
}

#[tokio::test]
async fn test_kind_mismatch_does_not_stop_sync() {
    let tmp = local_tree();
    let store = store().await;
    // `sub` is a directory locally but a file in the store.
    store.put_file("alice/data/main/mirror/sub", b"file").await.unwrap();

    let stats = command(&tmp, &store, SyncComparator::SizeOnly, false)
        .run(Arc::new(TransactionManager::default()), &executor())
        .await
        .unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.copied, 1);
    assert_eq!(&store.read_file("alice/data/main/mirror/one.txt").await.unwrap()[..], b"one");
    assert!(store.read_file("alice/data/main/mirror/sub/two.txt").await.is_err());
}

#[tokio::test]
async fn test_file_onto_directory_does_not_stop_sync() {
    let tmp = local_tree();
    let store = store().await;
    // `one.txt` is a file locally but a directory in the store.
    store.put_file("alice/data/main/mirror/one.txt/inner", b"in").await.unwrap();

    let stats = command(&tmp, &store, SyncComparator::SizeOnly, false)
        .run(Arc::new(TransactionManager::default()), &executor())
        .await
        .unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.copied, 1);
    assert_eq!(stats.ignored, 1);
    assert_eq!(&store.read_file("alice/data/main/mirror/sub/two.txt").await.unwrap()[..], b"two!");
    assert_eq!(&store.read_file("alice/data/main/mirror/one.txt/inner").await.unwrap()[..], b"in");
}

#[tokio::test]
async fn test_dryrun_writes_nothing() {
    let tmp = local_tree();
    let store = store().await;
    let stats = command(&tmp, &store, SyncComparator::SizeOnly, true)
        .run(Arc::new(TransactionManager::default()), &executor())
        .await
        .unwrap();
    assert_eq!(stats.copied, 2);
    assert!(store.read_file("alice/data/main/mirror/one.txt").await.is_err());
    assert_eq!(store.object_count().await, 0);
}

#[tokio::test]
async fn test_validate_rejects_bad_requests() {
    let tmp = local_tree();
    let store = store().await;
    let local = Arc::new(LocalBackend::new());
    let base = tmp.path().to_str().unwrap();

    let wildcard = SyncCommand::new(
        local.clone(),
        &format!("{}/data/*", base),
        store.clone(),
        "alice/data/main",
        SyncOptions::default(),
    );
    assert!(matches!(wildcard.validate().await, Err(Error::Validation(_))));

    let missing_branch = SyncCommand::new(
        local.clone(),
        &format!("{}/data", base),
        store.clone(),
        "alice/data/nope/dir",
        SyncOptions::default(),
    );
    assert!(matches!(missing_branch.validate().await, Err(Error::NotFound(_))));

    let file_source = SyncCommand::new(
        local,
        &format!("{}/data/one.txt", base),
        store.clone(),
        "alice/data/main",
        SyncOptions::default(),
    );
    assert!(matches!(file_source.validate().await, Err(Error::Validation(_))));
}
