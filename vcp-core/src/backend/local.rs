//! Plain local filesystem backend (`file://` and bare paths)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::Metadata;
use tokio::fs;

use super::{
    ByteReader, ByteWriter, CommitRecord, DirEntry, EntryInfo, RemoteId, RepoBackend,
    RepoBranchKey, RepoPath, WriteTransaction,
};
use crate::error::{Error, Result};
use crate::path;

/// Non-versioned backend over `tokio::fs`. Writes land immediately.
#[derive(Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

fn entry_info(meta: &Metadata) -> EntryInfo {
    if meta.is_dir() {
        return EntryInfo::directory();
    }
    let mtime = meta.modified().ok().map(DateTime::<Utc>::from);
    EntryInfo::file(meta.len(), mtime)
}

#[async_trait]
impl RepoBackend for LocalBackend {
    fn protocol(&self) -> &str {
        "file"
    }

    fn endpoint(&self) -> &str {
        "localhost"
    }

    fn is_versioned(&self) -> bool {
        false
    }

    fn resolve(&self, _path: &str) -> Result<Option<RepoPath>> {
        Ok(None)
    }

    async fn stat(&self, path: &str) -> Result<Option<EntryInfo>> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(Some(entry_info(&meta))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut rd = fs::read_dir(dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let full = path::join(dir, &name);
            // Follow symlinks; dangling ones are skipped.
            let meta = match fs::metadata(&full).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!("Skipping dangling entry {}", full);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            entries.push(DirEntry {
                name,
                path: full,
                info: entry_info(&meta),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn open_for_read(&self, path: &str) -> Result<ByteReader> {
        let file = fs::File::open(path).await?;
        Ok(Box::new(file))
    }

    async fn open_for_write(&self, path: &str) -> Result<ByteWriter> {
        let file = fs::File::create(path).await?;
        Ok(Box::new(file))
    }

    async fn create_dir_all(&self, path: &str) -> Result<()> {
        fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn begin_write_transaction(
        &self,
        key: &RepoBranchKey,
        _message: &str,
    ) -> Result<Box<dyn WriteTransaction>> {
        Err(Error::validation(format!(
            "local filesystem has no branches ({})",
            key
        )))
    }

    async fn preload_dedup_hints(
        &self,
        _remote: &RemoteId,
        _paths: &[(String, String)],
        _min_size: u64,
    ) -> Result<()> {
        Ok(())
    }

    async fn commit_log(&self, key: &RepoBranchKey) -> Result<Vec<CommitRecord>> {
        Err(Error::validation(format!(
            "local filesystem keeps no commit log ({})",
            key
        )))
    }
}
