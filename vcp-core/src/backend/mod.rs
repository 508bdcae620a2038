//! Repository backend abstraction
//!
//! Every storage location the planner and executor touch goes through
//! [`RepoBackend`]. Versioned stores additionally hand out
//! [`WriteTransaction`]s that stage mutations for one branch and apply
//! them atomically on commit.

pub mod disk;
pub mod local;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::path;

pub use disk::DiskStore;
pub use local::LocalBackend;
pub use memory::MemoryStore;

/// Streaming reader handed out by [`RepoBackend::open_for_read`].
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Streaming writer handed out by write operations.
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// Metadata for one entry, as returned by `stat` and `list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub kind: EntryKind,
    pub size: u64,
    /// Last modification time, when the backend knows it.
    pub mtime: Option<DateTime<Utc>>,
}

impl EntryInfo {
    pub fn file(size: u64, mtime: Option<DateTime<Utc>>) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            mtime,
        }
    }

    pub fn directory() -> Self {
        Self {
            kind: EntryKind::Directory,
            size: 0,
            mtime: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// One child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Final path component.
    pub name: String,
    /// Full backend path.
    pub path: String,
    pub info: EntryInfo,
}

/// One entry found by [`walk`], addressed relative to the walk root.
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub relative: String,
    pub path: String,
    pub info: EntryInfo,
}

/// A repository on a store endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteId {
    pub endpoint: String,
    pub user: String,
    pub repo: String,
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.endpoint, self.user, self.repo)
    }
}

/// One atomic commit scope: a branch of a remote repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoBranchKey {
    pub remote: RemoteId,
    pub branch: String,
}

impl RepoBranchKey {
    pub fn new(remote: RemoteId, branch: impl Into<String>) -> Self {
        Self {
            remote,
            branch: branch.into(),
        }
    }
}

impl fmt::Display for RepoBranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.remote, self.branch)
    }
}

/// A versioned path split into its commit scope and the path inside the branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoPath {
    pub key: RepoBranchKey,
    /// Path inside the branch; empty for the branch root.
    pub path: String,
}

/// A committed transaction, as recorded in a branch's commit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: String,
    pub branch: String,
    pub message: String,
    /// Commit time (Unix seconds).
    pub timestamp: i64,
    /// Number of staged operations applied by this commit.
    pub changes: usize,
}

/// Storage location consumed by the planner, executor and transaction manager.
///
/// Paths are backend paths: `user/repo/branch/path` for versioned stores,
/// absolute paths for the local filesystem.
#[async_trait]
pub trait RepoBackend: Send + Sync {
    /// URL scheme served by this backend (`file`, `vcp`, `mem`).
    fn protocol(&self) -> &str;

    /// Endpoint name used to address this backend in URLs and remote ids.
    fn endpoint(&self) -> &str;

    /// Whether writes must go through branch transactions.
    fn is_versioned(&self) -> bool;

    /// Whether the backend can copy files and subtrees without moving bytes.
    fn supports_structural_copy(&self) -> bool {
        false
    }

    /// Split a path into its commit scope; `None` for non-versioned backends.
    fn resolve(&self, path: &str) -> Result<Option<RepoPath>>;

    /// Metadata for `path`, or `None` when nothing exists there.
    async fn stat(&self, path: &str) -> Result<Option<EntryInfo>>;

    /// Children of the directory at `path`.
    async fn list(&self, path: &str) -> Result<Vec<DirEntry>>;

    async fn open_for_read(&self, path: &str) -> Result<ByteReader>;

    /// Direct, non-transactional write. Versioned backends reject this.
    async fn open_for_write(&self, path: &str) -> Result<ByteWriter>;

    /// Ensure a directory exists. No-op on backends without directories.
    async fn create_dir_all(&self, path: &str) -> Result<()>;

    async fn begin_write_transaction(
        &self,
        key: &RepoBranchKey,
        message: &str,
    ) -> Result<Box<dyn WriteTransaction>>;

    /// Best-effort preloading of dedup metadata for `(branch, path)` pairs.
    async fn preload_dedup_hints(
        &self,
        remote: &RemoteId,
        paths: &[(String, String)],
        min_size: u64,
    ) -> Result<()>;

    /// Commits recorded for a branch, oldest first.
    async fn commit_log(&self, key: &RepoBranchKey) -> Result<Vec<CommitRecord>>;

    /// Remove a branch together with its commit log.
    async fn delete_branch(&self, key: &RepoBranchKey) -> Result<()> {
        Err(Error::validation(format!(
            "{}:// has no branches to delete ({})",
            self.protocol(),
            key
        )))
    }
}

/// Staged mutations against one branch.
///
/// Nothing becomes visible until [`WriteTransaction::commit`].
#[async_trait]
pub trait WriteTransaction: Send + Sync {
    /// Stage a new file (or overwrite) at `path` inside the branch.
    async fn open_for_write(&self, path: &str) -> Result<ByteWriter>;

    /// Drop the most recent staged write of `path`, e.g. after its
    /// content stream failed. Staged writes of other paths are kept.
    async fn discard_write(&self, path: &str) -> Result<()>;

    /// Copy `src_path` of `src_branch` (same repository) to `dst_path` of this branch.
    /// Empty source and destination paths copy the whole branch.
    async fn copy(&self, src_branch: &str, src_path: &str, dst_path: &str) -> Result<()>;

    async fn mv(&self, src_path: &str, dst_path: &str) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Number of staged operations.
    async fn transaction_size(&self) -> usize;

    /// Apply everything staged so far and keep the transaction open.
    async fn commit_and_restart(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    /// Discard everything staged without touching the branch.
    async fn cancel(&self) -> Result<()>;
}

/// A `user/repo[/branch[/path]]` store path broken into components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StorePath {
    pub user: String,
    pub repo: String,
    pub branch: Option<String>,
    pub inner: String,
}

impl StorePath {
    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim_matches('/');
        let mut parts = trimmed.splitn(4, '/');
        let user = parts.next().unwrap_or_default();
        let repo = parts.next().unwrap_or_default();
        if user.is_empty() || repo.is_empty() {
            return Err(Error::validation(format!(
                "expecting user/repo/[branch]/[path], got {:?}",
                path
            )));
        }
        let branch = parts.next().filter(|b| !b.is_empty()).map(str::to_string);
        let inner = parts.next().unwrap_or_default().trim_matches('/').to_string();
        Ok(Self {
            user: user.to_string(),
            repo: repo.to_string(),
            branch,
            inner,
        })
    }

    pub fn repo_name(&self) -> String {
        format!("{}/{}", self.user, self.repo)
    }

    pub fn remote(&self, endpoint: &str) -> RemoteId {
        RemoteId {
            endpoint: endpoint.to_string(),
            user: self.user.clone(),
            repo: self.repo.clone(),
        }
    }

    /// Resolve into a commit scope; writes need a branch.
    pub fn into_repo_path(self, endpoint: &str) -> Result<RepoPath> {
        let remote = self.remote(endpoint);
        let branch = self.branch.ok_or_else(|| {
            Error::validation(format!("branch not specified for {}", remote))
        })?;
        Ok(RepoPath {
            key: RepoBranchKey::new(remote, branch),
            path: self.inner,
        })
    }
}

/// Collect every entry below `root` with one flat, iterative traversal.
///
/// Directories are included so callers can detect kind mismatches; the
/// root itself is not.
pub async fn walk(backend: &dyn RepoBackend, root: &str) -> Result<Vec<WalkEntry>> {
    let root = path::strip_trailing_slash(root).to_string();
    let mut out = Vec::new();
    let mut pending = vec![(root.clone(), String::new())];

    while let Some((dir, prefix)) = pending.pop() {
        for entry in backend.list(&dir).await? {
            let relative = path::join(&prefix, &entry.name);
            if entry.info.is_dir() {
                pending.push((entry.path.clone(), relative.clone()));
            }
            out.push(WalkEntry {
                relative,
                path: entry.path,
                info: entry.info,
            });
        }
    }

    out.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_path_parse() {
        let p = StorePath::parse("alice/data/main/sub/file.csv").unwrap();
        assert_eq!(p.user, "alice");
        assert_eq!(p.repo, "data");
        assert_eq!(p.branch.as_deref(), Some("main"));
        assert_eq!(p.inner, "sub/file.csv");

        let p = StorePath::parse("alice/data/").unwrap();
        assert_eq!(p.branch, None);
        assert_eq!(p.inner, "");

        assert!(StorePath::parse("alice").is_err());
    }

    #[test]
    fn test_into_repo_path_requires_branch() {
        let p = StorePath::parse("alice/data").unwrap();
        assert!(matches!(p.into_repo_path("local"), Err(Error::Validation(_))));

        let rp = StorePath::parse("alice/data/main")
            .unwrap()
            .into_repo_path("local")
            .unwrap();
        assert_eq!(rp.key.to_string(), "local/alice/data/main");
        assert_eq!(rp.path, "");
    }
}
