//! In-memory versioned store (`mem://`)
//!
//! Content is stored once per SHA-256 object id; each branch is a flat map
//! from path to object. Directories are implicit path prefixes. The store
//! carries failure-injection knobs so callers can exercise commit and read
//! failures without a real remote.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Mutex, RwLock};

use super::{
    ByteReader, ByteWriter, CommitRecord, DirEntry, EntryInfo, RemoteId, RepoBackend,
    RepoBranchKey, RepoPath, StorePath, WriteTransaction,
};
use crate::error::{Error, Result};
use crate::path;

/// Content hash identifying a stored blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    pub fn from_data(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, Clone)]
struct FileRecord {
    id: ObjectId,
    size: u64,
    mtime: DateTime<Utc>,
}

type Tree = BTreeMap<String, FileRecord>;

#[derive(Debug, Default)]
struct RepoState {
    branches: HashMap<String, Tree>,
    log: HashMap<String, Vec<CommitRecord>>,
}

#[derive(Debug, Default)]
struct StoreState {
    objects: HashMap<ObjectId, Bytes>,
    repos: HashMap<String, RepoState>,
    failing_commits: HashSet<String>,
    failing_reads: HashSet<String>,
    interrupted_reads: HashSet<String>,
    dedup_requests: Vec<(String, String)>,
}

/// In-memory versioned store
pub struct MemoryStore {
    endpoint: String,
    state: Arc<RwLock<StoreState>>,
}

impl MemoryStore {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Arc::new(RwLock::new(StoreState::default())),
        }
    }

    /// Create `user/repo` with the given (empty) branches.
    pub async fn create_repo(&self, repo: &str, branches: &[&str]) {
        let mut state = self.state.write().await;
        let entry = state.repos.entry(repo.trim_matches('/').to_string()).or_default();
        for branch in branches {
            entry.branches.entry(branch.to_string()).or_default();
        }
    }

    /// Place a file directly into a branch, bypassing transactions.
    pub async fn put_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.put_file_at(path, data, Utc::now()).await
    }

    /// Like [`MemoryStore::put_file`] with an explicit modification time.
    pub async fn put_file_at(&self, path: &str, data: &[u8], mtime: DateTime<Utc>) -> Result<()> {
        let sp = StorePath::parse(path)?;
        let inner = sp.inner.clone();
        if inner.is_empty() {
            return Err(Error::validation(format!("{} is not a file path", path)));
        }
        let mut state = self.state.write().await;
        let StoreState { objects, repos, .. } = &mut *state;
        let tree = branch_tree_mut(repos, &sp)?;
        let data = Bytes::copy_from_slice(data);
        let id = ObjectId::from_data(&data);
        let size = data.len() as u64;
        objects.entry(id).or_insert(data);
        tree.insert(inner, FileRecord { id, size, mtime });
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<Bytes> {
        let sp = StorePath::parse(path)?;
        let state = self.state.read().await;
        let record = lookup_file(&state, &sp).ok_or_else(|| Error::NotFound(path.to_string()))?;
        state
            .objects
            .get(&record.id)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("object {} missing", record.id)))
    }

    /// Make every commit against `branch` (in any repository) fail.
    pub async fn fail_commits_on(&self, branch: &str) {
        self.state.write().await.failing_commits.insert(branch.to_string());
    }

    /// Make reads of `path` fail.
    pub async fn fail_reads_on(&self, path: &str) {
        let normalized = path.trim_matches('/').to_string();
        self.state.write().await.failing_reads.insert(normalized);
    }

    /// Make reads of `path` deliver the first half of the file, then fail.
    pub async fn interrupt_reads_on(&self, path: &str) {
        let normalized = path.trim_matches('/').to_string();
        self.state.write().await.interrupted_reads.insert(normalized);
    }

    /// `(branch, path)` pairs passed to `preload_dedup_hints` so far.
    pub async fn dedup_hint_requests(&self) -> Vec<(String, String)> {
        self.state.read().await.dedup_requests.clone()
    }

    /// Number of distinct blobs held.
    pub async fn object_count(&self) -> usize {
        self.state.read().await.objects.len()
    }
}

fn branch_tree_mut<'a>(
    repos: &'a mut HashMap<String, RepoState>,
    sp: &StorePath,
) -> Result<&'a mut Tree> {
    let repo = repos
        .get_mut(&sp.repo_name())
        .ok_or_else(|| Error::NotFound(format!("repository {}", sp.repo_name())))?;
    let branch = sp
        .branch
        .as_deref()
        .ok_or_else(|| Error::validation(format!("branch not specified for {}", sp.repo_name())))?;
    repo.branches
        .get_mut(branch)
        .ok_or_else(|| Error::NotFound(format!("branch {}/{}", sp.repo_name(), branch)))
}

fn branch_tree<'a>(state: &'a StoreState, sp: &StorePath) -> Option<&'a Tree> {
    let repo = state.repos.get(&sp.repo_name())?;
    repo.branches.get(sp.branch.as_deref()?)
}

fn lookup_file<'a>(state: &'a StoreState, sp: &StorePath) -> Option<&'a FileRecord> {
    branch_tree(state, sp)?.get(&sp.inner)
}

/// Whether `tree` has anything at `p`, file or directory.
fn tree_has(tree: &Tree, p: &str) -> bool {
    if p.is_empty() || tree.contains_key(p) {
        return true;
    }
    let prefix = format!("{}/", p);
    tree.range(prefix.clone()..).next().is_some_and(|(k, _)| k.starts_with(&prefix))
}

/// Entries under `src` re-addressed under `dst`.
fn select(tree: &Tree, src: &str, dst: &str) -> Vec<(String, FileRecord)> {
    if src.is_empty() {
        return tree
            .iter()
            .map(|(k, v)| (path::join(dst, k), v.clone()))
            .collect();
    }
    if let Some(record) = tree.get(src) {
        return vec![(dst.to_string(), record.clone())];
    }
    let prefix = format!("{}/", src);
    tree.range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .map(|(k, v)| (path::join(dst, &k[prefix.len()..]), v.clone()))
        .collect()
}

fn remove_subtree(tree: &mut Tree, p: &str) -> bool {
    let mut removed = tree.remove(p).is_some();
    let prefix = format!("{}/", p);
    let nested: Vec<String> = tree
        .range(prefix.clone()..)
        .take_while(|(k, _)| k.starts_with(&prefix))
        .map(|(k, _)| k.clone())
        .collect();
    for k in nested {
        tree.remove(&k);
        removed = true;
    }
    removed
}

#[async_trait]
impl RepoBackend for MemoryStore {
    fn protocol(&self) -> &str {
        "mem"
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_versioned(&self) -> bool {
        true
    }

    fn supports_structural_copy(&self) -> bool {
        true
    }

    fn resolve(&self, path: &str) -> Result<Option<RepoPath>> {
        StorePath::parse(path)?.into_repo_path(&self.endpoint).map(Some)
    }

    async fn stat(&self, path: &str) -> Result<Option<EntryInfo>> {
        let sp = StorePath::parse(path)?;
        let state = self.state.read().await;
        let Some(repo) = state.repos.get(&sp.repo_name()) else {
            return Ok(None);
        };
        let Some(branch) = sp.branch.as_deref() else {
            return Ok(Some(EntryInfo::directory()));
        };
        let Some(tree) = repo.branches.get(branch) else {
            return Ok(None);
        };
        if let Some(record) = tree.get(&sp.inner) {
            return Ok(Some(EntryInfo::file(record.size, Some(record.mtime))));
        }
        Ok(tree_has(tree, &sp.inner).then(EntryInfo::directory))
    }

    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let sp = StorePath::parse(dir)?;
        let base = path::strip_trailing_slash(dir.trim_start_matches('/')).to_string();
        let state = self.state.read().await;
        let repo = state
            .repos
            .get(&sp.repo_name())
            .ok_or_else(|| Error::NotFound(dir.to_string()))?;

        let Some(branch) = sp.branch.as_deref() else {
            let mut names: Vec<&String> = repo.branches.keys().collect();
            names.sort();
            return Ok(names
                .into_iter()
                .map(|name| DirEntry {
                    name: name.clone(),
                    path: path::join(&base, name),
                    info: EntryInfo::directory(),
                })
                .collect());
        };

        let tree = repo
            .branches
            .get(branch)
            .ok_or_else(|| Error::NotFound(dir.to_string()))?;
        if tree.contains_key(&sp.inner) {
            return Err(Error::validation(format!("{} is not a directory", dir)));
        }
        if !tree_has(tree, &sp.inner) {
            return Err(Error::NotFound(dir.to_string()));
        }

        let prefix = if sp.inner.is_empty() {
            String::new()
        } else {
            format!("{}/", sp.inner)
        };
        let mut files = BTreeMap::new();
        let mut dirs = BTreeSet::new();
        for (key, record) in tree.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((child, _)) => {
                    dirs.insert(child.to_string());
                }
                None => {
                    files.insert(rest.to_string(), record);
                }
            }
        }

        let mut entries: Vec<DirEntry> = dirs
            .into_iter()
            .map(|name| DirEntry {
                path: path::join(&base, &name),
                name,
                info: EntryInfo::directory(),
            })
            .chain(files.into_iter().map(|(name, record)| DirEntry {
                path: path::join(&base, &name),
                name,
                info: EntryInfo::file(record.size, Some(record.mtime)),
            }))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn open_for_read(&self, path: &str) -> Result<ByteReader> {
        let sp = StorePath::parse(path)?;
        let state = self.state.read().await;
        if state.failing_reads.contains(path.trim_matches('/')) {
            return Err(Error::Backend(format!("read failed for {}", path)));
        }
        let record = lookup_file(&state, &sp).ok_or_else(|| Error::NotFound(path.to_string()))?;
        let data = state
            .objects
            .get(&record.id)
            .cloned()
            .ok_or_else(|| Error::Backend(format!("object {} missing", record.id)))?;
        if state.interrupted_reads.contains(path.trim_matches('/')) {
            let head = data.slice(..data.len() / 2);
            return Ok(Box::new(InterruptedReader {
                head: io::Cursor::new(head),
            }));
        }
        Ok(Box::new(io::Cursor::new(data)))
    }

    async fn open_for_write(&self, path: &str) -> Result<ByteWriter> {
        Err(Error::validation(format!(
            "{} is versioned; writes must go through a transaction",
            path
        )))
    }

    async fn create_dir_all(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn begin_write_transaction(
        &self,
        key: &RepoBranchKey,
        message: &str,
    ) -> Result<Box<dyn WriteTransaction>> {
        let repo = format!("{}/{}", key.remote.user, key.remote.repo);
        if !self.state.read().await.repos.contains_key(&repo) {
            return Err(Error::NotFound(format!("repository {}", repo)));
        }
        tracing::debug!("Opening memory transaction on {}", key);
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            repo,
            branch: key.branch.clone(),
            message: message.to_string(),
            staged: Mutex::new(Staged::default()),
        }))
    }

    async fn preload_dedup_hints(
        &self,
        _remote: &RemoteId,
        paths: &[(String, String)],
        _min_size: u64,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.dedup_requests.extend(paths.iter().cloned());
        Ok(())
    }

    async fn commit_log(&self, key: &RepoBranchKey) -> Result<Vec<CommitRecord>> {
        let repo = format!("{}/{}", key.remote.user, key.remote.repo);
        let state = self.state.read().await;
        let repo_state = state
            .repos
            .get(&repo)
            .ok_or_else(|| Error::NotFound(format!("repository {}", repo)))?;
        Ok(repo_state.log.get(&key.branch).cloned().unwrap_or_default())
    }

    async fn delete_branch(&self, key: &RepoBranchKey) -> Result<()> {
        let repo = format!("{}/{}", key.remote.user, key.remote.repo);
        let mut state = self.state.write().await;
        let repo_state = state
            .repos
            .get_mut(&repo)
            .ok_or_else(|| Error::NotFound(format!("repository {}", repo)))?;
        if repo_state.branches.remove(&key.branch).is_none() {
            return Err(Error::NotFound(format!("branch {}", key)));
        }
        repo_state.log.remove(&key.branch);
        tracing::info!("Deleted branch {}", key);
        Ok(())
    }
}

type SharedBuffer = Arc<std::sync::Mutex<Vec<u8>>>;

#[derive(Debug)]
enum StagedOp {
    Write { path: String, buffer: SharedBuffer },
    Copy { src_branch: String, src_path: String, dst_path: String },
    Move { src_path: String, dst_path: String },
    Delete { path: String },
}

impl StagedOp {
    /// Path this operation creates content at, if any.
    fn target(&self) -> Option<&str> {
        match self {
            StagedOp::Write { path, .. } => Some(path),
            StagedOp::Copy { dst_path, .. } | StagedOp::Move { dst_path, .. } => Some(dst_path),
            StagedOp::Delete { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
struct Staged {
    ops: Vec<StagedOp>,
    finished: bool,
}

struct MemoryTransaction {
    state: Arc<RwLock<StoreState>>,
    repo: String,
    branch: String,
    message: String,
    staged: Mutex<Staged>,
}

impl MemoryTransaction {
    fn check_open(&self, staged: &Staged) -> Result<()> {
        if staged.finished {
            return Err(Error::validation(format!(
                "transaction on {}/{} already finalized",
                self.repo, self.branch
            )));
        }
        Ok(())
    }

    /// `p` exists in the committed branch or is produced by a staged op.
    async fn exists(&self, p: &str, staged: &Staged) -> bool {
        let p = p.trim_matches('/');
        let staged_hit = staged
            .ops
            .iter()
            .filter_map(StagedOp::target)
            .any(|t| path::overlaps(t, p));
        if staged_hit {
            return true;
        }
        let state = self.state.read().await;
        state
            .repos
            .get(&self.repo)
            .and_then(|r| r.branches.get(&self.branch))
            .is_some_and(|tree| tree_has(tree, p))
    }

    /// Apply staged operations to the branch and log the commit.
    async fn apply(&self, staged: &mut Staged) -> Result<()> {
        let ops = std::mem::take(&mut staged.ops);
        let mut state = self.state.write().await;
        if state.failing_commits.contains(&self.branch) {
            return Err(Error::Backend(format!(
                "commit rejected for {}/{}",
                self.repo, self.branch
            )));
        }
        if ops.is_empty() {
            return Ok(());
        }

        let StoreState { objects, repos, .. } = &mut *state;
        let repo = repos
            .get_mut(&self.repo)
            .ok_or_else(|| Error::NotFound(format!("repository {}", self.repo)))?;
        let mut tree = repo.branches.get(&self.branch).cloned().unwrap_or_default();
        let now = Utc::now();

        for op in &ops {
            match op {
                StagedOp::Write { path, buffer } => {
                    let data = buffer
                        .lock()
                        .map_err(|_| Error::Backend("write buffer poisoned".into()))?
                        .clone();
                    let data = Bytes::from(data);
                    let id = ObjectId::from_data(&data);
                    let size = data.len() as u64;
                    objects.entry(id).or_insert(data);
                    tree.insert(path.clone(), FileRecord { id, size, mtime: now });
                }
                StagedOp::Copy { src_branch, src_path, dst_path } => {
                    let copied = if *src_branch == self.branch {
                        select(&tree, src_path, dst_path)
                    } else {
                        let source = repo.branches.get(src_branch).ok_or_else(|| {
                            Error::NotFound(format!("branch {}/{}", self.repo, src_branch))
                        })?;
                        select(source, src_path, dst_path)
                    };
                    if copied.iter().any(|(k, _)| k.is_empty()) {
                        return Err(Error::validation(format!(
                            "cannot copy file {}/{} onto a branch root",
                            src_branch, src_path
                        )));
                    }
                    if copied.is_empty() && !src_path.is_empty() {
                        return Err(Error::NotFound(format!("{}/{}", src_branch, src_path)));
                    }
                    tree.extend(copied);
                }
                StagedOp::Move { src_path, dst_path } => {
                    let moved = select(&tree, src_path, dst_path);
                    if moved.is_empty() {
                        return Err(Error::NotFound(format!("{}/{}", self.branch, src_path)));
                    }
                    remove_subtree(&mut tree, src_path);
                    tree.extend(moved);
                }
                StagedOp::Delete { path } => {
                    if !remove_subtree(&mut tree, path) {
                        return Err(Error::NotFound(format!("{}/{}", self.branch, path)));
                    }
                }
            }
        }

        repo.branches.insert(self.branch.clone(), tree);
        let record = CommitRecord {
            id: uuid::Uuid::new_v4().to_string(),
            branch: self.branch.clone(),
            message: self.message.clone(),
            timestamp: now.timestamp(),
            changes: ops.len(),
        };
        tracing::info!(
            "Committed {} change(s) to {}/{} ({})",
            record.changes,
            self.repo,
            self.branch,
            record.id
        );
        repo.log.entry(self.branch.clone()).or_default().push(record);
        Ok(())
    }
}

#[async_trait]
impl WriteTransaction for MemoryTransaction {
    async fn open_for_write(&self, path: &str) -> Result<ByteWriter> {
        let path = path.trim_matches('/');
        path::validate_relative(path)?;
        let mut staged = self.staged.lock().await;
        self.check_open(&staged)?;
        let buffer = SharedBuffer::default();
        staged.ops.push(StagedOp::Write {
            path: path.to_string(),
            buffer: Arc::clone(&buffer),
        });
        Ok(Box::new(BufferWriter { buffer }))
    }

    async fn discard_write(&self, path: &str) -> Result<()> {
        let path = path.trim_matches('/');
        let mut staged = self.staged.lock().await;
        self.check_open(&staged)?;
        let found = staged
            .ops
            .iter()
            .rposition(|op| matches!(op, StagedOp::Write { path: p, .. } if p == path));
        match found {
            Some(index) => {
                staged.ops.remove(index);
                tracing::debug!("Discarded staged write of {}/{}", self.branch, path);
                Ok(())
            }
            None => Err(Error::NotFound(format!("staged write {}/{}", self.branch, path))),
        }
    }

    async fn copy(&self, src_branch: &str, src_path: &str, dst_path: &str) -> Result<()> {
        let src_path = src_path.trim_matches('/');
        let dst_path = dst_path.trim_matches('/');
        let source_exists = {
            let state = self.state.read().await;
            state
                .repos
                .get(&self.repo)
                .and_then(|r| r.branches.get(src_branch))
                .is_some_and(|tree| tree_has(tree, src_path))
        };
        let mut staged = self.staged.lock().await;
        self.check_open(&staged)?;
        if !source_exists && !(src_branch == self.branch && self.exists(src_path, &staged).await) {
            return Err(Error::NotFound(format!("{}/{}", src_branch, src_path)));
        }
        staged.ops.push(StagedOp::Copy {
            src_branch: src_branch.to_string(),
            src_path: src_path.to_string(),
            dst_path: dst_path.to_string(),
        });
        Ok(())
    }

    async fn mv(&self, src_path: &str, dst_path: &str) -> Result<()> {
        let src_path = src_path.trim_matches('/');
        let dst_path = dst_path.trim_matches('/');
        path::validate_relative(src_path)?;
        path::validate_relative(dst_path)?;
        let mut staged = self.staged.lock().await;
        self.check_open(&staged)?;
        if !self.exists(src_path, &staged).await {
            return Err(Error::NotFound(format!("{}/{}", self.branch, src_path)));
        }
        staged.ops.push(StagedOp::Move {
            src_path: src_path.to_string(),
            dst_path: dst_path.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = path.trim_matches('/');
        path::validate_relative(path)?;
        let mut staged = self.staged.lock().await;
        self.check_open(&staged)?;
        if !self.exists(path, &staged).await {
            return Err(Error::NotFound(format!("{}/{}", self.branch, path)));
        }
        staged.ops.push(StagedOp::Delete {
            path: path.to_string(),
        });
        Ok(())
    }

    async fn transaction_size(&self) -> usize {
        self.staged.lock().await.ops.len()
    }

    async fn commit_and_restart(&self) -> Result<()> {
        let mut staged = self.staged.lock().await;
        self.check_open(&staged)?;
        self.apply(&mut staged).await
    }

    async fn commit(&self) -> Result<()> {
        let mut staged = self.staged.lock().await;
        self.check_open(&staged)?;
        staged.finished = true;
        self.apply(&mut staged).await
    }

    async fn cancel(&self) -> Result<()> {
        let mut staged = self.staged.lock().await;
        staged.finished = true;
        let dropped = std::mem::take(&mut staged.ops).len();
        tracing::debug!(
            "Canceled transaction on {}/{} ({} staged)",
            self.repo,
            self.branch,
            dropped
        );
        Ok(())
    }
}

/// Collects staged file content until commit.
struct BufferWriter {
    buffer: SharedBuffer,
}

impl AsyncWrite for BufferWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        match self.buffer.lock() {
            Ok(mut buf) => {
                buf.extend_from_slice(data);
                Poll::Ready(Ok(data.len()))
            }
            Err(_) => Poll::Ready(Err(io::Error::other("write buffer poisoned"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Serves a prefix of a blob and then fails like a dropped connection.
struct InterruptedReader {
    head: io::Cursor<Bytes>,
}

impl AsyncRead for InterruptedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.head).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == before => Poll::Ready(Err(
                io::Error::new(io::ErrorKind::ConnectionReset, "read interrupted"),
            )),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn key(branch: &str) -> RepoBranchKey {
        RepoBranchKey::new(
            RemoteId {
                endpoint: "test".into(),
                user: "alice".into(),
                repo: "data".into(),
            },
            branch,
        )
    }

    async fn store() -> MemoryStore {
        let store = MemoryStore::new("test");
        store.create_repo("alice/data", &["main"]).await;
        store
    }

    #[test]
    fn test_object_id_from_data() {
        let a = ObjectId::from_data(b"hello");
        let b = ObjectId::from_data(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
        assert_ne!(a, ObjectId::from_data(b"world"));
    }

    #[tokio::test]
    async fn test_stat_and_list_implicit_dirs() {
        let store = store().await;
        store.put_file("alice/data/main/a/b/c.txt", b"abc").await.unwrap();
        store.put_file("alice/data/main/top.txt", b"t").await.unwrap();

        let info = store.stat("alice/data/main/a").await.unwrap().unwrap();
        assert!(info.is_dir());
        let info = store.stat("alice/data/main/a/b/c.txt").await.unwrap().unwrap();
        assert_eq!(info.size, 3);
        assert!(store.stat("alice/data/main/zzz").await.unwrap().is_none());
        assert!(store.stat("alice/data/dev").await.unwrap().is_none());
        assert!(store.stat("alice/data").await.unwrap().unwrap().is_dir());

        let names: Vec<_> = store
            .list("alice/data/main")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(names, vec!["alice/data/main/a", "alice/data/main/top.txt"]);
    }

    #[tokio::test]
    async fn test_transaction_visible_only_after_commit() {
        let store = store().await;
        let txn = store.begin_write_transaction(&key("main"), "add").await.unwrap();
        let mut w = txn.open_for_write("new.txt").await.unwrap();
        w.write_all(b"fresh").await.unwrap();
        w.shutdown().await.unwrap();

        assert!(store.stat("alice/data/main/new.txt").await.unwrap().is_none());
        assert_eq!(txn.transaction_size().await, 1);
        txn.commit().await.unwrap();

        let mut r = store.open_for_read("alice/data/main/new.txt").await.unwrap();
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"fresh");

        let log = store.commit_log(&key("main")).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].message, "add");
        assert!(txn.delete("new.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_discard_write_drops_only_that_file() {
        let store = store().await;
        let txn = store.begin_write_transaction(&key("main"), "partial").await.unwrap();
        let mut w = txn.open_for_write("good.txt").await.unwrap();
        w.write_all(b"good").await.unwrap();
        w.shutdown().await.unwrap();
        let mut w = txn.open_for_write("torn.txt").await.unwrap();
        w.write_all(b"to").await.unwrap();
        drop(w);

        txn.discard_write("torn.txt").await.unwrap();
        assert!(txn.discard_write("torn.txt").await.unwrap_err().is_not_found());
        assert_eq!(txn.transaction_size().await, 1);
        txn.commit().await.unwrap();

        assert!(store.stat("alice/data/main/good.txt").await.unwrap().is_some());
        assert!(store.stat("alice/data/main/torn.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_interrupted_read_fails_after_prefix() {
        let store = store().await;
        store.put_file("alice/data/main/big", &[1u8; 10]).await.unwrap();
        store.interrupt_reads_on("alice/data/main/big").await;

        let mut r = store.open_for_read("alice/data/main/big").await.unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(r.read(&mut buf).await.unwrap(), 3);
        let mut rest = Vec::new();
        let err = r.read_to_end(&mut rest).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_delete_branch() {
        let store = store().await;
        store.create_repo("alice/data", &["dev"]).await;
        store.put_file("alice/data/dev/f", b"f").await.unwrap();

        store.delete_branch(&key("dev")).await.unwrap();
        assert!(store.stat("alice/data/dev").await.unwrap().is_none());
        assert!(store.delete_branch(&key("dev")).await.unwrap_err().is_not_found());
        let names: Vec<_> = store
            .list("alice/data")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["main"]);
    }

    #[tokio::test]
    async fn test_cancel_discards() {
        let store = store().await;
        store.put_file("alice/data/main/keep.txt", b"k").await.unwrap();
        let txn = store.begin_write_transaction(&key("main"), "rm").await.unwrap();
        txn.delete("keep.txt").await.unwrap();
        txn.cancel().await.unwrap();
        assert!(store.stat("alice/data/main/keep.txt").await.unwrap().is_some());
        assert!(store.commit_log(&key("main")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copy_move_and_branch_creation() {
        let store = store().await;
        store.put_file("alice/data/main/d/x.txt", b"x").await.unwrap();
        store.put_file("alice/data/main/d/y.txt", b"y").await.unwrap();

        let txn = store.begin_write_transaction(&key("main"), "cp").await.unwrap();
        txn.copy("main", "d", "e").await.unwrap();
        txn.mv("d/x.txt", "moved.txt").await.unwrap();
        txn.commit().await.unwrap();

        assert!(store.stat("alice/data/main/e/x.txt").await.unwrap().is_some());
        assert!(store.stat("alice/data/main/moved.txt").await.unwrap().is_some());
        assert!(store.stat("alice/data/main/d/x.txt").await.unwrap().is_none());
        // identical content is stored once
        assert_eq!(store.object_count().await, 2);

        let txn = store.begin_write_transaction(&key("dev"), "branch").await.unwrap();
        txn.copy("main", "", "").await.unwrap();
        txn.commit().await.unwrap();
        assert_eq!(store.read_file("alice/data/dev/e/y.txt").await.unwrap(), &b"y"[..]);
    }

    #[tokio::test]
    async fn test_missing_sources_rejected_eagerly() {
        let store = store().await;
        let txn = store.begin_write_transaction(&key("main"), "m").await.unwrap();
        assert!(txn.delete("ghost.txt").await.unwrap_err().is_not_found());
        assert!(txn.mv("ghost.txt", "b.txt").await.unwrap_err().is_not_found());
        assert!(txn.copy("main", "ghost", "b").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = store().await;
        store.put_file("alice/data/main/f.txt", b"f").await.unwrap();
        store.fail_reads_on("alice/data/main/f.txt").await;
        assert!(store.open_for_read("alice/data/main/f.txt").await.is_err());

        store.fail_commits_on("main").await;
        let txn = store.begin_write_transaction(&key("main"), "x").await.unwrap();
        txn.delete("f.txt").await.unwrap();
        assert!(matches!(txn.commit().await, Err(Error::Backend(_))));
        assert!(store.stat("alice/data/main/f.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_direct_write_rejected() {
        let store = store().await;
        assert!(matches!(
            store.open_for_write("alice/data/main/x").await,
            Err(Error::Validation(_))
        ));
    }
}
