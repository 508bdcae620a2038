//! End-to-end operations against the on-disk store

use std::sync::Arc;
use tempfile::TempDir;
use vcp_core::ops::{self, Context, CopyOptions};
use vcp_core::{BackendRegistry, Config, DiskStore, Error, MemoryStore, SyncOptions};

struct Fixture {
    tmp: TempDir,
    ctx: Context,
    mem: Arc<MemoryStore>,
}

impl Fixture {
    fn local(&self, name: &str) -> String {
        format!("{}/{}", self.tmp.path().to_str().unwrap(), name)
    }
}

async fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let store = DiskStore::new(tmp.path().join("store"), "local");
    store.init_repo("alice/data", "main").await.unwrap();

    let mem = Arc::new(MemoryStore::new("local"));
    mem.create_repo("alice/src", &["main"]).await;

    let mut registry = BackendRegistry::new("local", tmp.path().join("work"));
    registry.register(Arc::new(store)).unwrap();
    registry.register(mem.clone()).unwrap();

    let config = Config {
        store_root: tmp.path().join("store"),
        ..Config::default()
    };
    std::fs::create_dir_all(tmp.path().join("work")).unwrap();
    Fixture {
        ctx: Context::new(registry, config),
        tmp,
        mem,
    }
}

fn names(entries: &[vcp_core::DirEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.name.as_str()).collect()
}

#[tokio::test]
async fn test_copy_move_remove_round() {
    let fx = fixture().await;
    std::fs::write(fx.local("readme.md"), b"hello").unwrap();

    let report = ops::copy(
        &fx.ctx,
        &[fx.local("readme.md")],
        "vcp://alice/data/main/docs/",
        &CopyOptions::default(),
    )
    .await
    .unwrap();
    assert_eq!(report.summary.copied, 1);
    assert_eq!(report.changes.new_files, vec!["main/docs/readme.md"]);

    let listed = ops::list(&fx.ctx, "vcp://alice/data/main/docs").await.unwrap();
    assert_eq!(names(&listed), vec!["readme.md"]);
    assert_eq!(listed[0].info.size, 5);

    ops::move_path(
        &fx.ctx,
        "vcp://alice/data/main/docs/readme.md",
        "vcp://alice/data/main/README.md",
        "",
    )
    .await
    .unwrap();
    let listed = ops::list(&fx.ctx, "vcp://alice/data/main").await.unwrap();
    assert_eq!(names(&listed), vec!["README.md", "docs"]);

    ops::remove(&fx.ctx, &["vcp://alice/data/main/README.md".to_string()], "cleanup")
        .await
        .unwrap();
    assert!(ops::list(&fx.ctx, "vcp://alice/data/main/README.md").await.is_err());

    let log = ops::log(&fx.ctx, "vcp://alice/data/main").await.unwrap();
    assert_eq!(log.len(), 3);
    assert!(log[0].message.starts_with("Copying "));
    assert!(log[1].message.starts_with("Moving "));
    assert_eq!(log[2].message, "cleanup");
}

#[tokio::test]
async fn test_copy_branch_creates_branch() {
    let fx = fixture().await;
    std::fs::create_dir_all(fx.local("tree/sub")).unwrap();
    std::fs::write(fx.local("tree/a.txt"), b"a").unwrap();
    std::fs::write(fx.local("tree/sub/b.txt"), b"bb").unwrap();

    let recursive = CopyOptions {
        recursive: true,
        message: "import".into(),
    };
    ops::copy(&fx.ctx, &[fx.local("tree/")], "vcp://alice/data/main", &recursive)
        .await
        .unwrap();

    let report = ops::copy(
        &fx.ctx,
        &["vcp://alice/data/main".to_string()],
        "vcp://alice/data/release",
        &recursive,
    )
    .await
    .unwrap();
    assert_eq!(report.summary.structural, 1);

    let branches = ops::list(&fx.ctx, "vcp://alice/data").await.unwrap();
    assert_eq!(names(&branches), vec!["main", "release"]);
    let listed = ops::list(&fx.ctx, "vcp://alice/data/release/sub").await.unwrap();
    assert_eq!(names(&listed), vec!["b.txt"]);
}

#[tokio::test]
async fn test_copy_to_missing_branch_fails() {
    let fx = fixture().await;
    std::fs::write(fx.local("f"), b"f").unwrap();
    let err = ops::copy(&fx.ctx, &[fx.local("f")], "vcp://alice/data/nope/f", &CopyOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_partial_copy_commits_successes() {
    let fx = fixture().await;
    fx.mem.put_file("alice/src/main/in/good", b"good").await.unwrap();
    fx.mem.put_file("alice/src/main/in/bad", b"bad").await.unwrap();
    fx.mem.fail_reads_on("alice/src/main/in/bad").await;

    let options = CopyOptions {
        recursive: true,
        message: String::new(),
    };
    let err = ops::copy(
        &fx.ctx,
        &["mem://alice/src/main/in/".to_string()],
        "vcp://alice/data/main/in",
        &options,
    )
    .await
    .unwrap_err();
    match err {
        Error::PartialTransfer { failed, total, first } => {
            assert_eq!(failed, 1);
            assert_eq!(total, 2);
            assert!(first.contains("in/bad"));
        }
        other => panic!("expected partial transfer, got {:?}", other),
    }
    let listed = ops::list(&fx.ctx, "vcp://alice/data/main/in").await.unwrap();
    assert_eq!(names(&listed), vec!["good"]);
}

#[tokio::test]
async fn test_move_rules() {
    let fx = fixture().await;
    fx.mem.put_file("alice/src/main/x", b"x").await.unwrap();

    let err = ops::move_path(&fx.ctx, "mem://alice/src/main/x", "vcp://alice/data/main/x", "")
        .await
        .unwrap_err();
    match err {
        Error::Validation(msg) => assert_eq!(msg, "moves can only happen within a branch"),
        other => panic!("expected validation error, got {:?}", other),
    }

    std::fs::write(fx.local("old.txt"), b"old").unwrap();
    ops::move_path(&fx.ctx, &fx.local("old.txt"), &fx.local("new.txt"), "")
        .await
        .unwrap();
    assert!(!fx.tmp.path().join("old.txt").exists());
    assert_eq!(std::fs::read(fx.tmp.path().join("new.txt")).unwrap(), b"old");
}

#[tokio::test]
async fn test_local_move_into_existing_directory() {
    let fx = fixture().await;
    std::fs::write(fx.local("a.txt"), b"a").unwrap();
    std::fs::create_dir_all(fx.local("d")).unwrap();

    ops::move_path(&fx.ctx, &fx.local("a.txt"), &fx.local("d"), "")
        .await
        .unwrap();
    assert!(!fx.tmp.path().join("a.txt").exists());
    assert_eq!(std::fs::read(fx.tmp.path().join("d/a.txt")).unwrap(), b"a");
}

#[tokio::test]
async fn test_remove_refuses_branch_root() {
    let fx = fixture().await;
    let err = ops::remove(&fx.ctx, &["vcp://alice/data/main".to_string()], "")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    std::fs::create_dir_all(fx.local("junk/deep")).unwrap();
    std::fs::write(fx.local("junk/deep/f"), b"f").unwrap();
    ops::remove(&fx.ctx, &[fx.local("junk")], "").await.unwrap();
    assert!(!fx.tmp.path().join("junk").exists());
}

#[tokio::test]
async fn test_remove_keeps_local_files_when_commit_fails() {
    let fx = fixture().await;
    fx.mem.put_file("alice/src/main/x", b"x").await.unwrap();
    fx.mem.fail_commits_on("main").await;
    std::fs::write(fx.local("keep.txt"), b"keep").unwrap();

    let paths = vec![fx.local("keep.txt"), "mem://alice/src/main/x".to_string()];
    let err = ops::remove(&fx.ctx, &paths, "").await.unwrap_err();
    assert!(matches!(err, Error::Commit { .. }));
    assert!(fx.tmp.path().join("keep.txt").exists());
    assert!(fx.mem.read_file("alice/src/main/x").await.is_ok());
}

#[tokio::test]
async fn test_sync_into_store() {
    let fx = fixture().await;
    std::fs::create_dir_all(fx.local("site/css")).unwrap();
    std::fs::write(fx.local("site/index.html"), b"<html>").unwrap();
    std::fs::write(fx.local("site/css/main.css"), b"body{}").unwrap();

    let stats = ops::sync(&fx.ctx, &fx.local("site"), "vcp://alice/data/main/site", SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(stats.copied, 2);

    let again = ops::sync(&fx.ctx, &fx.local("site"), "vcp://alice/data/main/site", SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(again.copied, 0);
    assert_eq!(again.ignored, 2);

    let log = ops::log(&fx.ctx, "vcp://alice/data/main").await.unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].message.starts_with("Sync "));
}

#[tokio::test]
async fn test_copy_report_includes_flushed_changes() {
    let mut fx = fixture().await;
    fx.ctx.config.transaction_file_limit = 2;
    std::fs::create_dir_all(fx.local("batch")).unwrap();
    for name in ["a", "b", "c"] {
        std::fs::write(fx.local(&format!("batch/{}", name)), name).unwrap();
    }

    let options = CopyOptions {
        recursive: true,
        message: "batch".into(),
    };
    let report = ops::copy(&fx.ctx, &[fx.local("batch/")], "vcp://alice/data/main/b", &options)
        .await
        .unwrap();
    let mut files = report.changes.new_files.clone();
    files.sort();
    assert_eq!(files, vec!["main/b/a", "main/b/b", "main/b/c"]);
    assert_eq!(ops::log(&fx.ctx, "vcp://alice/data/main").await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_cat_whole_and_limited() {
    let mut fx = fixture().await;
    fx.ctx.config.chunk_size = 4;
    fx.mem.put_file("alice/src/main/notes.txt", b"hello world").await.unwrap();

    let mut out = Vec::new();
    let n = ops::cat(&fx.ctx, "mem://alice/src/main/notes.txt", None, &mut out)
        .await
        .unwrap();
    assert_eq!(n, 11);
    assert_eq!(out, b"hello world");

    let mut out = Vec::new();
    ops::cat(&fx.ctx, "mem://alice/src/main/notes.txt", Some(5), &mut out)
        .await
        .unwrap();
    assert_eq!(out, b"hello");

    let mut out = Vec::new();
    let err = ops::cat(&fx.ctx, "mem://alice/src/main", None, &mut out)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(ops::cat(&fx.ctx, "mem://alice/src/main/none", None, &mut out)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_branch_make_list_delete() {
    let fx = fixture().await;
    std::fs::write(fx.local("f.txt"), b"f").unwrap();
    ops::copy(&fx.ctx, &[fx.local("f.txt")], "vcp://alice/data/main/", &CopyOptions::default())
        .await
        .unwrap();

    ops::make_branch(&fx.ctx, "vcp://alice/data", "main", "feature")
        .await
        .unwrap();
    let branches = ops::list_branches(&fx.ctx, "vcp://alice/data").await.unwrap();
    assert_eq!(names(&branches), vec!["feature", "main"]);
    let listed = ops::list(&fx.ctx, "vcp://alice/data/feature").await.unwrap();
    assert_eq!(names(&listed), vec!["f.txt"]);
    assert!(matches!(
        ops::make_branch(&fx.ctx, "vcp://alice/data", "main", "feature").await,
        Err(Error::Validation(_))
    ));

    ops::delete_branch(&fx.ctx, "vcp://alice/data", "feature")
        .await
        .unwrap();
    let branches = ops::list_branches(&fx.ctx, "vcp://alice/data").await.unwrap();
    assert_eq!(names(&branches), vec!["main"]);

    assert!(matches!(
        ops::delete_branch(&fx.ctx, "vcp://alice/data", "main").await,
        Err(Error::Validation(_))
    ));
    assert!(ops::delete_branch(&fx.ctx, "vcp://alice/data", "feature")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(matches!(
        ops::list_branches(&fx.ctx, "vcp://alice/data/main").await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        ops::delete_branch(&fx.ctx, &fx.local("x"), "dev").await,
        Err(Error::Validation(_))
    ));
}
