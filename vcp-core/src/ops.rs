//! High-level operations: copy, sync, move, remove, list, log, cat and
//! branch management
//!
//! Each write operation runs in its own transaction scope: begin, plan,
//! execute, then commit (or cancel when planning fails).

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;

use crate::backend::{CommitRecord, DirEntry, RepoBackend, RepoBranchKey, RepoPath};
use crate::config::{Config, DEFAULT_BRANCH};
use crate::error::{Error, Result};
use crate::executor::{ExecutorConfig, TransferExecutor, TransferSummary, first_failure};
use crate::path;
use crate::planner::Planner;
use crate::registry::BackendRegistry;
use crate::sync::{SyncCommand, SyncOptions, SyncStats};
use crate::transaction::{ChangeList, TransactionManager};

/// Everything an operation needs, built once per session.
pub struct Context {
    pub registry: BackendRegistry,
    pub config: Config,
    pub limiter: Arc<Semaphore>,
}

impl Context {
    pub fn new(registry: BackendRegistry, config: Config) -> Self {
        let limiter = Arc::new(Semaphore::new(config.parallel.max(1)));
        Self {
            registry,
            config,
            limiter,
        }
    }

    pub fn manager(&self) -> Arc<TransactionManager> {
        Arc::new(TransactionManager::new(self.config.transaction_file_limit))
    }

    pub fn executor(&self) -> TransferExecutor {
        TransferExecutor::new(Arc::clone(&self.limiter), ExecutorConfig::from(&self.config))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub recursive: bool,
    /// Commit message; a default describing the copy is used when empty.
    pub message: String,
}

#[derive(Debug, Default)]
pub struct CopyReport {
    pub summary: TransferSummary,
    /// Directory sources left out because the copy was not recursive.
    pub skipped_directories: Vec<String>,
    /// Operations committed to versioned destinations, forced flushes
    /// included.
    pub changes: ChangeList,
}

/// Fail unless `repo_path`'s branch exists.
async fn require_branch(backend: &dyn RepoBackend, repo_path: &RepoPath) -> Result<()> {
    let remote = &repo_path.key.remote;
    let root = format!("{}/{}/{}", remote.user, remote.repo, repo_path.key.branch);
    match backend.stat(&root).await? {
        Some(info) if info.is_dir() => Ok(()),
        _ => Err(Error::NotFound(format!("branch {}", repo_path.key))),
    }
}

/// Close a scope after a failure, keeping the original error.
async fn abort(manager: &TransactionManager, err: Error) -> Error {
    if let Err(cancel_err) = manager.end(false).await {
        tracing::warn!("Cancel after failure also failed: {}", cancel_err);
    }
    err
}

/// Copy one or more sources to a destination.
///
/// Every unit is attempted. When any fail, the successful ones are still
/// committed and [`Error::PartialTransfer`] is returned.
pub async fn copy(
    ctx: &Context,
    sources: &[String],
    destination: &str,
    options: &CopyOptions,
) -> Result<CopyReport> {
    let Some(first) = sources.first() else {
        return Err(Error::validation("no source given"));
    };
    let (src, _) = ctx.registry.resolve(first)?;
    let (dst, dst_path) = ctx.registry.resolve(destination)?;

    let mut src_paths = Vec::with_capacity(sources.len());
    for source in sources {
        let (backend, p) = ctx.registry.resolve(source)?;
        if !Arc::ptr_eq(&backend, &src) {
            return Err(Error::validation(
                "all sources of one copy must live on the same store",
            ));
        }
        src_paths.push(p);
    }

    // A versioned source or destination must name an existing branch,
    // except when copying one branch root onto another (branch creation).
    let dst_repo = dst.resolve(&dst_path)?;
    let mut branch_copy = dst_repo.as_ref().is_some_and(|d| d.path.is_empty());
    for p in &src_paths {
        if let Some(s) = src.resolve(path::strip_trailing_slash(p))? {
            if !path::has_wildcard(p) {
                require_branch(src.as_ref(), &s).await?;
            }
            branch_copy &= s.path.is_empty();
        } else {
            branch_copy = false;
        }
    }
    if let Some(d) = &dst_repo {
        if !branch_copy {
            require_branch(dst.as_ref(), d).await?;
        }
    }

    let message = if options.message.trim().is_empty() {
        format!("Copying {} to {}", sources.join(", "), destination)
    } else {
        options.message.clone()
    };

    let manager = ctx.manager();
    let versioned = dst.is_versioned();
    if versioned {
        manager.begin(&message).await?;
    }

    let planner = Planner::new(Arc::clone(&src), Arc::clone(&dst));
    let plan = match planner.plan_many(&src_paths, &dst_path, options.recursive).await {
        Ok(plan) => plan,
        Err(e) if versioned => return Err(abort(&manager, e).await),
        Err(e) => return Err(e),
    };
    for dir in &plan.skipped_directories {
        tracing::warn!("{} is a directory; use recursive copy to include it", dir);
    }

    let outcomes = ctx
        .executor()
        .execute(plan.units, Arc::clone(&src), Arc::clone(&dst), Arc::clone(&manager))
        .await;
    let summary = TransferSummary::from_outcomes(&outcomes);

    let changes = if versioned {
        manager.end(true).await?;
        manager.committed_changes().await
    } else {
        ChangeList::default()
    };
    tracing::info!("{}", summary.summary());

    if let Some((unit, err)) = first_failure(&outcomes) {
        return Err(Error::PartialTransfer {
            failed: summary.failed,
            total: summary.total(),
            first: format!("{}: {}", unit.source_path, err),
        });
    }
    Ok(CopyReport {
        summary,
        skipped_directories: plan.skipped_directories,
        changes,
    })
}

/// Sync a directory tree into a destination. Per-file failures are counted,
/// not returned.
pub async fn sync(
    ctx: &Context,
    source: &str,
    destination: &str,
    options: SyncOptions,
) -> Result<SyncStats> {
    let (src, src_path) = ctx.registry.resolve(source)?;
    let (dst, dst_path) = ctx.registry.resolve(destination)?;
    let mut options = options;
    if options.message.trim().is_empty() {
        options.message = format!("Sync {} to {}", source, destination);
    }
    let command = SyncCommand::new(src, &src_path, dst, &dst_path, options);
    command.validate().await?;
    command.run(ctx.manager(), &ctx.executor()).await
}

/// Move a file or directory within one branch, or within the local filesystem.
pub async fn move_path(ctx: &Context, source: &str, destination: &str, message: &str) -> Result<()> {
    let (src, src_path) = ctx.registry.resolve(source)?;
    let (dst, dst_path) = ctx.registry.resolve(destination)?;
    let src_path = path::strip_trailing_slash(&src_path).to_string();
    let dst_path = path::strip_trailing_slash(&dst_path).to_string();

    if !src.is_versioned() && !dst.is_versioned() {
        if src.stat(&src_path).await?.is_none() {
            return Err(Error::NotFound(source.to_string()));
        }
        let target = match dst.stat(&dst_path).await? {
            Some(info) if info.is_dir() => path::join(&dst_path, path::file_name(&src_path)),
            _ => dst_path,
        };
        tracing::debug!("Renaming {} to {}", src_path, target);
        tokio::fs::rename(&src_path, &target).await?;
        return Ok(());
    }

    let within_branch = Arc::ptr_eq(&src, &dst)
        && match (src.resolve(&src_path)?, dst.resolve(&dst_path)?) {
            (Some(s), Some(d)) => s.key == d.key,
            _ => false,
        };
    if !within_branch {
        return Err(Error::validation("moves can only happen within a branch"));
    }
    let (Some(s), Some(d)) = (src.resolve(&src_path)?, dst.resolve(&dst_path)?) else {
        return Err(Error::validation("moves can only happen within a branch"));
    };
    if s.path.is_empty() || d.path.is_empty() {
        return Err(Error::validation("cannot move a branch root"));
    }
    require_branch(src.as_ref(), &s).await?;
    if src.stat(&src_path).await?.is_none() {
        return Err(Error::NotFound(source.to_string()));
    }
    let target = match dst.stat(&dst_path).await? {
        Some(info) if info.is_dir() => path::join(&d.path, path::file_name(&s.path)),
        _ => d.path.clone(),
    };

    let message = if message.trim().is_empty() {
        format!("Moving {} to {}", source, destination)
    } else {
        message.to_string()
    };
    let manager = ctx.manager();
    manager.begin(&message).await?;
    if let Err(e) = manager.record_move(dst.as_ref(), &d.key, &s.path, &target).await {
        return Err(abort(&manager, e).await);
    }
    manager.end(true).await
}

/// Delete files or directories. Branch roots are refused.
///
/// Versioned deletes are committed first; local paths are only touched
/// once that commit succeeded.
pub async fn remove(ctx: &Context, paths: &[String], message: &str) -> Result<()> {
    let mut versioned = Vec::new();
    let mut local = Vec::new();
    for url in paths {
        let (backend, p) = ctx.registry.resolve(url)?;
        let p = path::strip_trailing_slash(&p).to_string();
        match backend.resolve(&p)? {
            Some(rp) if rp.path.is_empty() => {
                return Err(Error::validation(format!(
                    "refusing to delete branch {}; delete branches explicitly",
                    rp.key
                )));
            }
            Some(rp) => {
                if backend.stat(&p).await?.is_none() {
                    return Err(Error::NotFound(url.clone()));
                }
                versioned.push((backend, rp));
            }
            None => local.push((backend, p)),
        }
    }

    for (backend, p) in &local {
        if backend.stat(p).await?.is_none() {
            return Err(Error::NotFound(p.clone()));
        }
    }

    if !versioned.is_empty() {
        let message = if message.trim().is_empty() {
            format!("Removing {}", paths.join(", "))
        } else {
            message.to_string()
        };
        let manager = ctx.manager();
        manager.begin(&message).await?;
        for (backend, rp) in &versioned {
            if let Err(e) = manager.record_delete(backend.as_ref(), &rp.key, &rp.path).await {
                return Err(abort(&manager, e).await);
            }
        }
        manager.end(true).await?;
    }

    for (backend, p) in &local {
        match backend.stat(p).await? {
            Some(info) if info.is_dir() => tokio::fs::remove_dir_all(p).await?,
            Some(_) => tokio::fs::remove_file(p).await?,
            None => return Err(Error::NotFound(p.clone())),
        }
    }
    Ok(())
}

/// Entries at a location: the children of a directory, or the file itself.
pub async fn list(ctx: &Context, url: &str) -> Result<Vec<DirEntry>> {
    let (backend, p) = ctx.registry.resolve(url)?;
    let p = path::strip_trailing_slash(&p).to_string();
    match backend.stat(&p).await? {
        Some(info) if info.is_dir() => backend.list(&p).await,
        Some(info) => Ok(vec![DirEntry {
            name: path::file_name(&p).to_string(),
            path: p,
            info,
        }]),
        None => Err(Error::NotFound(url.to_string())),
    }
}

/// Commit history of the branch named by `url`.
pub async fn log(ctx: &Context, url: &str) -> Result<Vec<CommitRecord>> {
    let (backend, p) = ctx.registry.resolve(url)?;
    let rp = backend
        .resolve(&p)?
        .ok_or_else(|| Error::validation(format!("{} is not in a versioned store", url)))?;
    backend.commit_log(&rp.key).await
}

/// Write the file at `url` to `out`, at most `limit` bytes when given.
/// Returns the number of bytes written.
pub async fn cat<W>(ctx: &Context, url: &str, limit: Option<u64>, out: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let (backend, p) = ctx.registry.resolve(url)?;
    match backend.stat(&p).await? {
        Some(info) if info.is_dir() => {
            return Err(Error::validation(format!("{} is a directory", url)));
        }
        Some(_) => {}
        None => return Err(Error::NotFound(url.to_string())),
    }

    let mut reader = backend.open_for_read(&p).await?;
    let mut buf = vec![0u8; ctx.config.chunk_size.max(1)];
    let mut total = 0u64;
    loop {
        let want = match limit {
            Some(limit) if limit <= total => break,
            Some(limit) => buf.len().min((limit - total) as usize),
            None => buf.len(),
        };
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    out.flush().await?;
    Ok(total)
}

/// Backend and `user/repo` path of a repository location.
fn repository(ctx: &Context, url: &str) -> Result<(Arc<dyn RepoBackend>, String)> {
    let (backend, p) = ctx.registry.resolve(url)?;
    let repo = p.trim_matches('/').to_string();
    if !backend.is_versioned() || repo.split('/').count() != 2 {
        return Err(Error::validation(format!(
            "expecting a repository as scheme://user/repo, got {}",
            url
        )));
    }
    Ok((backend, repo))
}

fn branch_key(backend: &dyn RepoBackend, repo: &str, branch: &str) -> Result<RepoBranchKey> {
    if branch.is_empty() || branch.contains('/') {
        return Err(Error::validation(format!("invalid branch name {:?}", branch)));
    }
    backend
        .resolve(&format!("{}/{}", repo, branch))?
        .map(|rp| rp.key)
        .ok_or_else(|| Error::validation(format!("{} has no branches", repo)))
}

/// Branches of the repository at `url`.
pub async fn list_branches(ctx: &Context, url: &str) -> Result<Vec<DirEntry>> {
    let (backend, repo) = repository(ctx, url)?;
    backend.list(&repo).await
}

/// Create `new_branch` as a copy of `src_branch` in the repository at `url`.
pub async fn make_branch(
    ctx: &Context,
    url: &str,
    src_branch: &str,
    new_branch: &str,
) -> Result<CopyReport> {
    let (backend, repo) = repository(ctx, url)?;
    branch_key(backend.as_ref(), &repo, src_branch)?;
    let key = branch_key(backend.as_ref(), &repo, new_branch)?;
    let root = format!("{}/{}", repo, new_branch);
    if backend.stat(&root).await?.is_some() {
        return Err(Error::validation(format!("branch {} already exists", key)));
    }
    let base = path::strip_trailing_slash(url);
    let options = CopyOptions {
        recursive: true,
        message: format!("Create branch {} from {}", new_branch, src_branch),
    };
    copy(
        ctx,
        &[format!("{}/{}", base, src_branch)],
        &format!("{}/{}", base, new_branch),
        &options,
    )
    .await
}

/// Delete a branch and its history. The default branch is refused.
pub async fn delete_branch(ctx: &Context, url: &str, branch: &str) -> Result<()> {
    let (backend, repo) = repository(ctx, url)?;
    let key = branch_key(backend.as_ref(), &repo, branch)?;
    if branch == DEFAULT_BRANCH {
        return Err(Error::validation(format!(
            "cannot delete the {} branch",
            DEFAULT_BRANCH
        )));
    }
    backend.delete_branch(&key).await
}
