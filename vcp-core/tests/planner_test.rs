//! Copy planner integration tests

use std::sync::Arc;
use tempfile::TempDir;
use vcp_core::{Error, LocalBackend, MemoryStore, Planner, RepoBackend, TransferMode};

fn local_planner() -> Planner {
    let local: Arc<dyn RepoBackend> = Arc::new(LocalBackend::new());
    Planner::new(Arc::clone(&local), local)
}

fn root(tmp: &TempDir) -> String {
    tmp.path().to_str().unwrap().to_string()
}

fn write_files(base: &std::path::Path, files: &[(&str, usize)]) {
    for (name, size) in files {
        let p = base.join(name);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, vec![b'x'; *size]).unwrap();
    }
}

#[tokio::test]
async fn test_wildcard_outside_last_segment_rejected() {
    let planner = local_planner();
    let err = planner
        .plan("/nowhere/a/*/b*", "/also/nowhere", false)
        .await
        .unwrap_err();
    match err {
        Error::Validation(msg) => assert!(msg.contains("last path segment")),
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_three_files_into_new_directory() {
    let tmp = TempDir::new().unwrap();
    write_files(
        &tmp.path().join("src"),
        &[("a.bin", 1024), ("b.bin", 1024), ("nested/c.bin", 1024)],
    );
    let base = root(&tmp);

    let plan = local_planner()
        .plan(&format!("{}/src/", base), &format!("{}/out", base), true)
        .await
        .unwrap();

    let mut dests: Vec<String> = plan.units.iter().map(|u| u.destination_path.clone()).collect();
    dests.sort();
    assert_eq!(
        dests,
        vec![
            format!("{}/out/a.bin", base),
            format!("{}/out/b.bin", base),
            format!("{}/out/nested/c.bin", base),
        ]
    );
    assert!(plan.units.iter().all(|u| u.size_hint == Some(1024)));
    assert!(plan.units.iter().all(|u| u.mode == TransferMode::Bytes));
    assert_eq!(plan.total_bytes(), 3072);
}

#[tokio::test]
async fn test_directory_naming_follows_trailing_slash() {
    let tmp = TempDir::new().unwrap();
    write_files(&tmp.path().join("src/data"), &[("f.txt", 3)]);
    std::fs::create_dir_all(tmp.path().join("dst")).unwrap();
    let base = root(&tmp);
    let planner = local_planner();

    let plan = planner
        .plan(&format!("{}/src/data", base), &format!("{}/dst", base), true)
        .await
        .unwrap();
    assert_eq!(plan.units[0].destination_path, format!("{}/dst/data/f.txt", base));

    let plan = planner
        .plan(&format!("{}/src/data/", base), &format!("{}/dst", base), true)
        .await
        .unwrap();
    assert_eq!(plan.units[0].destination_path, format!("{}/dst/f.txt", base));
}

#[tokio::test]
async fn test_file_into_missing_directory_with_trailing_slash() {
    let tmp = TempDir::new().unwrap();
    write_files(tmp.path(), &[("one.txt", 1)]);
    let base = root(&tmp);
    let planner = local_planner();

    let plan = planner
        .plan(&format!("{}/one.txt", base), &format!("{}/new/", base), false)
        .await
        .unwrap();
    assert_eq!(plan.units[0].destination_path, format!("{}/new/one.txt", base));
    assert_eq!(plan.units[0].destination_dir.as_deref(), Some(format!("{}/new", base).as_str()));

    let plan = planner
        .plan(&format!("{}/one.txt", base), &format!("{}/renamed.txt", base), false)
        .await
        .unwrap();
    assert_eq!(plan.units[0].destination_path, format!("{}/renamed.txt", base));
}

#[tokio::test]
async fn test_non_recursive_directory_is_skipped() {
    let tmp = TempDir::new().unwrap();
    write_files(&tmp.path().join("dir"), &[("f", 1)]);
    let base = root(&tmp);

    let plan = local_planner()
        .plan(&format!("{}/dir", base), &format!("{}/out", base), false)
        .await
        .unwrap();
    assert!(plan.units.is_empty());
    assert_eq!(plan.skipped_directories, vec![format!("{}/dir", base)]);
}

#[tokio::test]
async fn test_directory_onto_file_is_kind_mismatch() {
    let tmp = TempDir::new().unwrap();
    write_files(tmp.path(), &[("dir/f", 1), ("plain.txt", 1)]);
    let base = root(&tmp);

    let err = local_planner()
        .plan(&format!("{}/dir", base), &format!("{}/plain.txt", base), true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::KindMismatch { .. }));
}

#[tokio::test]
async fn test_glob_matches_last_segment() {
    let tmp = TempDir::new().unwrap();
    write_files(tmp.path(), &[("in/a.csv", 2), ("in/b.csv", 2), ("in/c.txt", 2), ("in/sub/d.csv", 2)]);
    std::fs::create_dir_all(tmp.path().join("out")).unwrap();
    let base = root(&tmp);

    let plan = local_planner()
        .plan(&format!("{}/in/*.csv", base), &format!("{}/out", base), false)
        .await
        .unwrap();
    let names: Vec<String> = plan.units.iter().map(|u| u.destination_path.clone()).collect();
    assert_eq!(names, vec![format!("{}/out/a.csv", base), format!("{}/out/b.csv", base)]);
}

#[tokio::test]
async fn test_gitattributes_never_planned() {
    let tmp = TempDir::new().unwrap();
    write_files(&tmp.path().join("src"), &[(".gitattributes", 10), ("keep.txt", 4)]);
    let base = root(&tmp);

    let plan = local_planner()
        .plan(&format!("{}/src/", base), &format!("{}/out", base), true)
        .await
        .unwrap();
    assert_eq!(plan.units.len(), 1);
    assert!(plan.units[0].destination_path.ends_with("keep.txt"));
}

#[tokio::test]
async fn test_several_sources_land_in_directory() {
    let tmp = TempDir::new().unwrap();
    write_files(tmp.path(), &[("a.txt", 1), ("b.txt", 1)]);
    let base = root(&tmp);

    let sources = vec![format!("{}/a.txt", base), format!("{}/b.txt", base)];
    let plan = local_planner()
        .plan_many(&sources, &format!("{}/bundle", base), false)
        .await
        .unwrap();
    assert_eq!(plan.units[0].destination_path, format!("{}/bundle/a.txt", base));
    assert_eq!(plan.units[1].destination_path, format!("{}/bundle/b.txt", base));
}

#[tokio::test]
async fn test_same_store_directory_copy_is_structural() {
    let store = MemoryStore::new("hub");
    store.create_repo("alice/data", &["main", "dev"]).await;
    store.put_file("alice/data/main/dir/a", b"a").await.unwrap();
    store.put_file("alice/data/main/dir/b", b"b").await.unwrap();
    let store: Arc<dyn RepoBackend> = Arc::new(store);

    let plan = Planner::new(Arc::clone(&store), Arc::clone(&store))
        .plan("alice/data/main/dir", "alice/data/dev/copy", true)
        .await
        .unwrap();
    assert_eq!(plan.units.len(), 1);
    assert_eq!(plan.units[0].mode, TransferMode::Structural);
    assert_eq!(plan.units[0].source_path, "alice/data/main/dir");
    assert_eq!(plan.units[0].destination_path, "alice/data/dev/copy");
}

#[tokio::test]
async fn test_cross_store_copy_streams_bytes() {
    let a = MemoryStore::new("hub");
    a.create_repo("alice/data", &["main"]).await;
    a.put_file("alice/data/main/dir/a", b"a").await.unwrap();
    let b = MemoryStore::new("other");
    b.create_repo("alice/data", &["main"]).await;

    let plan = Planner::new(Arc::new(a), Arc::new(b))
        .plan("alice/data/main/dir", "alice/data/main/copy", true)
        .await
        .unwrap();
    assert_eq!(plan.units.len(), 1);
    assert_eq!(plan.units[0].mode, TransferMode::Bytes);
    assert_eq!(plan.units[0].destination_path, "alice/data/main/copy/a");
}
