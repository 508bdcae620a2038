//! On-disk versioned store (`vcp://`)
//!
//! Layout under the store root:
//!
//! ```text
//! <user>/<repo>/branches/<branch>/...     committed branch content
//! <user>/<repo>/.vcp/txn/<id>/            per-transaction staging
//! <user>/<repo>/.vcp/log/<branch>.json    commit log
//! ```
//!
//! A commit builds the next branch tree next to the staging area (unchanged
//! files are hard-linked), applies the staged operations to it and swaps it
//! in with a rename. Commits on one store are serialized.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;

use super::{
    ByteReader, ByteWriter, CommitRecord, DirEntry, EntryInfo, RemoteId, RepoBackend,
    RepoBranchKey, RepoPath, StorePath, WriteTransaction,
};
use crate::error::{Error, Result};
use crate::path;

const BRANCHES_DIR: &str = "branches";
const META_DIR: &str = ".vcp";

/// Versioned store rooted at a local directory
pub struct DiskStore {
    endpoint: String,
    root: PathBuf,
    commit_lock: Arc<Mutex<()>>,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            root: root.into(),
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create `user/repo` with an empty `branch`. Existing content is kept.
    pub async fn init_repo(&self, repo: &str, branch: &str) -> Result<()> {
        let repo = repo.trim_matches('/');
        path::validate_relative(repo)?;
        path::validate_relative(branch)?;
        if repo.split('/').count() != 2 || branch.contains('/') {
            return Err(Error::validation(format!(
                "expecting user/repo and a plain branch name, got {}:{}",
                repo, branch
            )));
        }
        let repo_dir = self.root.join(repo);
        fs::create_dir_all(repo_dir.join(BRANCHES_DIR).join(branch)).await?;
        fs::create_dir_all(repo_dir.join(META_DIR).join("log")).await?;
        tracing::info!("Initialized {} with branch {}", repo, branch);
        Ok(())
    }

    fn repo_dir(&self, user: &str, repo: &str) -> Result<PathBuf> {
        path::validate_relative(user)?;
        path::validate_relative(repo)?;
        Ok(self.root.join(user).join(repo))
    }

    /// Filesystem location of a store path's branch directory and entry.
    fn locate(&self, sp: &StorePath) -> Result<(PathBuf, Option<PathBuf>)> {
        let repo_dir = self.repo_dir(&sp.user, &sp.repo)?;
        let Some(branch) = sp.branch.as_deref() else {
            return Ok((repo_dir, None));
        };
        path::validate_relative(branch)?;
        let branch_dir = repo_dir.join(BRANCHES_DIR).join(branch);
        let entry = if sp.inner.is_empty() {
            branch_dir.clone()
        } else {
            path::validate_relative(&sp.inner)?;
            branch_dir.join(&sp.inner)
        };
        Ok((branch_dir, Some(entry)))
    }
}

fn log_path(repo_dir: &Path, branch: &str) -> PathBuf {
    repo_dir.join(META_DIR).join("log").join(format!("{}.json", branch))
}

async fn read_log(repo_dir: &Path, branch: &str) -> Result<Vec<CommitRecord>> {
    let file = log_path(repo_dir, branch);
    match fs::read_to_string(&file).await {
        Ok(data) => Ok(serde_json::from_str(&data)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

async fn append_log(repo_dir: &Path, record: CommitRecord) -> Result<()> {
    let file = log_path(repo_dir, &record.branch);
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut log = read_log(repo_dir, &record.branch).await?;
    log.push(record);
    let tmp = file.with_extension("tmp");
    fs::write(&tmp, serde_json::to_string_pretty(&log)?).await?;
    fs::rename(&tmp, &file).await?;
    Ok(())
}

async fn exists(p: &Path) -> Result<bool> {
    Ok(fs::try_exists(p).await?)
}

async fn ensure_parent(p: &Path) -> Result<()> {
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Link (or copy, where linking fails) a single file into place.
async fn link_file(src: &Path, dst: &Path) -> Result<()> {
    ensure_parent(dst).await?;
    if exists(dst).await? {
        fs::remove_file(dst).await?;
    }
    if fs::hard_link(src, dst).await.is_err() {
        fs::copy(src, dst).await?;
    }
    Ok(())
}

/// Mirror the tree at `src` into `dst`, linking files.
async fn link_tree(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::metadata(src).await?;
    if !meta.is_dir() {
        return link_file(src, dst).await;
    }
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to).await?;
        let mut rd = fs::read_dir(&from).await?;
        while let Some(entry) = rd.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                link_file(&entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

async fn remove_entry(p: &Path) -> Result<()> {
    if fs::metadata(p).await?.is_dir() {
        fs::remove_dir_all(p).await?;
    } else {
        fs::remove_file(p).await?;
    }
    Ok(())
}

#[async_trait]
impl RepoBackend for DiskStore {
    fn protocol(&self) -> &str {
        "vcp"
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
        let (scope, entry) = self.locate(&sp)?;
        let Some(entry) = entry else {
            let branches = scope.join(BRANCHES_DIR);
            return Ok(exists(&branches).await?.then(EntryInfo::directory));
        };
        match fs::metadata(&entry).await {
            Ok(meta) if meta.is_dir() => Ok(Some(EntryInfo::directory())),
            Ok(meta) => {
                let mtime = meta.modified().ok().map(DateTime::<Utc>::from);
                Ok(Some(EntryInfo::file(meta.len(), mtime)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let sp = StorePath::parse(dir)?;
        let base = path::strip_trailing_slash(dir.trim_start_matches('/')).to_string();
        let (scope, entry) = self.locate(&sp)?;
        let fs_dir = match entry {
            Some(entry) => entry,
            None => scope.join(BRANCHES_DIR),
        };
        if !exists(&fs_dir).await? {
            return Err(Error::NotFound(dir.to_string()));
        }

        let mut entries = Vec::new();
        let mut rd = fs::read_dir(&fs_dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata().await?;
            let info = if meta.is_dir() {
                EntryInfo::directory()
            } else {
                let mtime = meta.modified().ok().map(DateTime::<Utc>::from);
                EntryInfo::file(meta.len(), mtime)
            };
            entries.push(DirEntry {
                path: path::join(&base, &name),
                name,
                info,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn open_for_read(&self, path: &str) -> Result<ByteReader> {
        let sp = StorePath::parse(path)?;
        let (_, entry) = self.locate(&sp)?;
        let entry = entry.ok_or_else(|| Error::validation(format!("{} is not a file", path)))?;
        match fs::File::open(&entry).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
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
        let repo_dir = self.repo_dir(&key.remote.user, &key.remote.repo)?;
        path::validate_relative(&key.branch)?;
        if !exists(&repo_dir.join(BRANCHES_DIR)).await? {
            return Err(Error::NotFound(format!(
                "repository {}/{}",
                key.remote.user, key.remote.repo
            )));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let staging = repo_dir.join(META_DIR).join("txn").join(&id);
        fs::create_dir_all(&staging).await?;
        tracing::debug!("Opened transaction {} on {}", id, key);

        Ok(Box::new(DiskTransaction {
            branch_dir: repo_dir.join(BRANCHES_DIR).join(&key.branch),
            repo_dir,
            branch: key.branch.clone(),
            message: message.to_string(),
            staging,
            commit_lock: Arc::clone(&self.commit_lock),
            staged: Mutex::new(Staged::default()),
        }))
    }

    async fn preload_dedup_hints(
        &self,
        remote: &RemoteId,
        paths: &[(String, String)],
        min_size: u64,
    ) -> Result<()> {
        // Local content is never chunked, so there is nothing to preload.
        tracing::debug!(
            "Dedup hints for {} path(s) on {} (min size {})",
            paths.len(),
            remote,
            min_size
        );
        Ok(())
    }

    async fn commit_log(&self, key: &RepoBranchKey) -> Result<Vec<CommitRecord>> {
        let repo_dir = self.repo_dir(&key.remote.user, &key.remote.repo)?;
        path::validate_relative(&key.branch)?;
        if !exists(&repo_dir.join(BRANCHES_DIR)).await? {
            return Err(Error::NotFound(format!(
                "repository {}/{}",
                key.remote.user, key.remote.repo
            )));
        }
        read_log(&repo_dir, &key.branch).await
    }

    async fn delete_branch(&self, key: &RepoBranchKey) -> Result<()> {
        let repo_dir = self.repo_dir(&key.remote.user, &key.remote.repo)?;
        path::validate_relative(&key.branch)?;
        let branch_dir = repo_dir.join(BRANCHES_DIR).join(&key.branch);

        let _guard = self.commit_lock.lock().await;
        if !exists(&branch_dir).await? {
            return Err(Error::NotFound(format!("branch {}", key)));
        }
        // Rename first so the branch disappears in one step.
        let trash = repo_dir
            .join(META_DIR)
            .join(format!("deleted-{}", uuid::Uuid::new_v4()));
        ensure_parent(&trash).await?;
        fs::rename(&branch_dir, &trash).await?;
        if let Err(e) = fs::remove_dir_all(&trash).await {
            tracing::warn!("Failed to remove deleted branch tree {:?}: {}", trash, e);
        }
        match fs::remove_file(log_path(&repo_dir, &key.branch)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!("Deleted branch {}", key);
        Ok(())
    }
}

#[derive(Debug)]
enum DiskOp {
    Write { path: String, staged_file: PathBuf },
    Copy { src_branch: String, src_path: String, dst_path: String },
    Move { src_path: String, dst_path: String },
    Delete { path: String },
}

impl DiskOp {
    fn target(&self) -> Option<&str> {
        match self {
            DiskOp::Write { path, .. } => Some(path),
            DiskOp::Copy { dst_path, .. } | DiskOp::Move { dst_path, .. } => Some(dst_path),
            DiskOp::Delete { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
struct Staged {
    ops: Vec<DiskOp>,
    next_file: u64,
    finished: bool,
}

struct DiskTransaction {
    repo_dir: PathBuf,
    branch_dir: PathBuf,
    branch: String,
    message: String,
    staging: PathBuf,
    commit_lock: Arc<Mutex<()>>,
    staged: Mutex<Staged>,
}

impl DiskTransaction {
    fn check_open(&self, staged: &Staged) -> Result<()> {
        if staged.finished {
            return Err(Error::validation(format!(
                "transaction on branch {} already finalized",
                self.branch
            )));
        }
        Ok(())
    }

    async fn exists(&self, p: &str, staged: &Staged) -> Result<bool> {
        if staged.ops.iter().filter_map(DiskOp::target).any(|t| path::overlaps(t, p)) {
            return Ok(true);
        }
        exists(&self.branch_dir.join(p)).await
    }

    fn branch_source(&self, src_branch: &str, src_path: &str) -> Result<PathBuf> {
        path::validate_relative(src_branch)?;
        let dir = self.repo_dir.join(BRANCHES_DIR).join(src_branch);
        Ok(if src_path.is_empty() {
            dir
        } else {
            dir.join(src_path)
        })
    }

    /// Build the next tree in `work` and swap it in.
    async fn apply(&self, staged: &mut Staged) -> Result<()> {
        let ops = std::mem::take(&mut staged.ops);
        if ops.is_empty() {
            return Ok(());
        }
        let _guard = self.commit_lock.lock().await;
        let id = uuid::Uuid::new_v4().to_string();
        let work = self.staging.join(format!("next-{}", id));

        if let Err(e) = self.build(&ops, &work).await {
            let _ = fs::remove_dir_all(&work).await;
            return Err(e);
        }

        let retired = self.staging.join(format!("old-{}", id));
        let had_branch = exists(&self.branch_dir).await?;
        if had_branch {
            fs::rename(&self.branch_dir, &retired).await?;
        }
        fs::rename(&work, &self.branch_dir).await?;
        if had_branch {
            if let Err(e) = fs::remove_dir_all(&retired).await {
                tracing::warn!("Failed to remove retired tree {:?}: {}", retired, e);
            }
        }

        let record = CommitRecord {
            id,
            branch: self.branch.clone(),
            message: self.message.clone(),
            timestamp: Utc::now().timestamp(),
            changes: ops.len(),
        };
        tracing::info!(
            "Committed {} change(s) to branch {} ({})",
            record.changes,
            self.branch,
            record.id
        );
        append_log(&self.repo_dir, record).await
    }

    async fn build(&self, ops: &[DiskOp], work: &Path) -> Result<()> {
        if exists(&self.branch_dir).await? {
            link_tree(&self.branch_dir, work).await?;
        } else {
            fs::create_dir_all(work).await?;
        }

        for op in ops {
            match op {
                DiskOp::Write { path, staged_file } => {
                    let target = work.join(path);
                    ensure_parent(&target).await?;
                    fs::rename(staged_file, &target).await?;
                }
                DiskOp::Copy { src_branch, src_path, dst_path } => {
                    let source = if *src_branch == self.branch {
                        work.join(src_path)
                    } else {
                        self.branch_source(src_branch, src_path)?
                    };
                    if !exists(&source).await? {
                        return Err(Error::NotFound(format!("{}/{}", src_branch, src_path)));
                    }
                    link_tree(&source, &work.join(dst_path)).await?;
                }
                DiskOp::Move { src_path, dst_path } => {
                    let source = work.join(src_path);
                    if !exists(&source).await? {
                        return Err(Error::NotFound(format!("{}/{}", self.branch, src_path)));
                    }
                    let target = work.join(dst_path);
                    ensure_parent(&target).await?;
                    fs::rename(&source, &target).await?;
                }
                DiskOp::Delete { path } => {
                    let target = work.join(path);
                    if !exists(&target).await? {
                        return Err(Error::NotFound(format!("{}/{}", self.branch, path)));
                    }
                    remove_entry(&target).await?;
                }
            }
        }
        Ok(())
    }

    async fn discard_staging(&self) {
        if let Err(e) = fs::remove_dir_all(&self.staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to clean staging {:?}: {}", self.staging, e);
            }
        }
    }
}

#[async_trait]
impl WriteTransaction for DiskTransaction {
    async fn open_for_write(&self, path: &str) -> Result<ByteWriter> {
        let path = path.trim_matches('/');
        path::validate_relative(path)?;
        let mut staged = self.staged.lock().await;
        self.check_open(&staged)?;
        let staged_file = self.staging.join(format!("{:08}.blob", staged.next_file));
        staged.next_file += 1;
        let file = fs::File::create(&staged_file).await?;
        staged.ops.push(DiskOp::Write {
            path: path.to_string(),
            staged_file,
        });
        Ok(Box::new(file))
    }

    async fn discard_write(&self, path: &str) -> Result<()> {
        let path = path.trim_matches('/');
        let mut staged = self.staged.lock().await;
        self.check_open(&staged)?;
        let found = staged
            .ops
            .iter()
            .rposition(|op| matches!(op, DiskOp::Write { path: p, .. } if p == path));
        let Some(index) = found else {
            return Err(Error::NotFound(format!("staged write {}/{}", self.branch, path)));
        };
        if let DiskOp::Write { staged_file, .. } = staged.ops.remove(index) {
            match fs::remove_file(&staged_file).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!("Discarded staged write of {}/{}", self.branch, path);
        Ok(())
    }

    async fn copy(&self, src_branch: &str, src_path: &str, dst_path: &str) -> Result<()> {
        let src_path = src_path.trim_matches('/');
        let dst_path = dst_path.trim_matches('/');
        if !src_path.is_empty() {
            path::validate_relative(src_path)?;
        }
        if !dst_path.is_empty() {
            path::validate_relative(dst_path)?;
        }
        if src_branch == self.branch
            && (src_path == dst_path || path::relative_to(dst_path, src_path).is_some())
        {
            return Err(Error::validation(format!(
                "cannot copy {}/{} into itself",
                src_branch, src_path
            )));
        }
        let mut staged = self.staged.lock().await;
        self.check_open(&staged)?;
        let found = if src_branch == self.branch {
            self.exists(src_path, &staged).await?
        } else {
            exists(&self.branch_source(src_branch, src_path)?).await?
        };
        if !found {
            return Err(Error::NotFound(format!("{}/{}", src_branch, src_path)));
        }
        staged.ops.push(DiskOp::Copy {
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
        if !self.exists(src_path, &staged).await? {
            return Err(Error::NotFound(format!("{}/{}", self.branch, src_path)));
        }
        staged.ops.push(DiskOp::Move {
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
        if !self.exists(path, &staged).await? {
            return Err(Error::NotFound(format!("{}/{}", self.branch, path)));
        }
        staged.ops.push(DiskOp::Delete {
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
        let result = self.apply(&mut staged).await;
        self.discard_staging().await;
        result
    }

    async fn cancel(&self) -> Result<()> {
        let mut staged = self.staged.lock().await;
        staged.finished = true;
        staged.ops.clear();
        self.discard_staging().await;
        Ok(())
    }
}
