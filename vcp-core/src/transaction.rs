//! Multi-branch transaction manager
//!
//! One scope (`begin` .. `end`) batches writes across any number of
//! branches. Each `(store, remote, branch)` gets its own
//! [`TransactionHandle`], created on first use and committed or canceled
//! exactly once when the scope ends.
//!
//! Handles live behind `Arc<RwLock<_>>`. An [`AccessToken`] is an owned read
//! guard, so committing a handle (which takes the write lock) waits until
//! every outstanding token has been dropped. Once a handle has queued
//! `limit` operations it is swapped for a fresh one under the pool lock and
//! the retired handle is committed by the routing task after the lock is
//! released. `end` waits for such in-flight flushes before it reports.

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, OwnedRwLockReadGuard, RwLock};

use crate::backend::{ByteWriter, RepoBackend, RepoBranchKey, WriteTransaction};
use crate::config::TRANSACTION_FILE_LIMIT;
use crate::error::{CommitFailure, Error, Result};

/// Operations queued on a handle, as `branch/path` strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeList {
    pub new_files: Vec<String>,
    pub copies: Vec<(String, String)>,
    pub deletes: Vec<String>,
    pub moves: Vec<(String, String)>,
}

impl ChangeList {
    pub fn len(&self) -> usize {
        self.new_files.len() + self.copies.len() + self.deletes.len() + self.moves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn extend(&mut self, other: ChangeList) {
        self.new_files.extend(other.new_files);
        self.copies.extend(other.copies);
        self.deletes.extend(other.deletes);
        self.moves.extend(other.moves);
    }
}

/// Pending writes against one branch.
pub struct TransactionHandle {
    key: RepoBranchKey,
    txn: Box<dyn WriteTransaction>,
    changes: Mutex<ChangeList>,
    open_tokens: AtomicUsize,
}

impl TransactionHandle {
    fn new(key: RepoBranchKey, txn: Box<dyn WriteTransaction>) -> Self {
        Self {
            key,
            txn,
            changes: Mutex::new(ChangeList::default()),
            open_tokens: AtomicUsize::new(0),
        }
    }

    pub fn key(&self) -> &RepoBranchKey {
        &self.key
    }

    /// Tokens currently borrowing this handle.
    pub fn open_tokens(&self) -> usize {
        self.open_tokens.load(Ordering::SeqCst)
    }

    pub async fn change_list(&self) -> ChangeList {
        self.changes.lock().await.clone()
    }

    fn entry(&self, branch: &str, path: &str) -> String {
        format!("{}/{}", branch, path.trim_matches('/'))
    }

    /// Stage a new file. It only enters the change list through
    /// [`TransactionHandle::finish_write`]; a failed write must be dropped
    /// with [`TransactionHandle::abort_write`] or it is committed as is.
    pub async fn open_for_write(&self, path: &str) -> Result<ByteWriter> {
        self.txn.open_for_write(path).await
    }

    /// Record a staged file whose writer was shut down cleanly.
    pub async fn finish_write(&self, path: &str) {
        self.record_new_file(path).await;
    }

    /// Drop a staged file whose content never arrived in full.
    pub async fn abort_write(&self, path: &str) -> Result<()> {
        self.txn.discard_write(path).await
    }

    /// Record a new file without staging anything.
    pub async fn record_new_file(&self, path: &str) {
        let entry = self.entry(&self.key.branch, path);
        self.changes.lock().await.new_files.push(entry);
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.txn.delete(path).await?;
        let entry = self.entry(&self.key.branch, path);
        self.changes.lock().await.deletes.push(entry);
        Ok(())
    }

    /// Copy from `src_branch` (same repository) into this handle's branch.
    pub async fn copy(&self, src_branch: &str, src_path: &str, dst_path: &str) -> Result<()> {
        self.txn.copy(src_branch, src_path, dst_path).await?;
        let entry = (
            self.entry(src_branch, src_path),
            self.entry(&self.key.branch, dst_path),
        );
        self.changes.lock().await.copies.push(entry);
        Ok(())
    }

    pub async fn mv(&self, src_path: &str, dst_path: &str) -> Result<()> {
        self.txn.mv(src_path, dst_path).await?;
        let entry = (
            self.entry(&self.key.branch, src_path),
            self.entry(&self.key.branch, dst_path),
        );
        self.changes.lock().await.moves.push(entry);
        Ok(())
    }
}

/// Shared borrow of a [`TransactionHandle`], returned by
/// [`TransactionManager::route`]. The handle cannot be committed while a
/// token is alive.
pub struct AccessToken {
    guard: OwnedRwLockReadGuard<TransactionHandle>,
}

impl AccessToken {
    fn new(guard: OwnedRwLockReadGuard<TransactionHandle>) -> Self {
        guard.open_tokens.fetch_add(1, Ordering::SeqCst);
        Self { guard }
    }
}

impl Deref for AccessToken {
    type Target = TransactionHandle;

    fn deref(&self) -> &TransactionHandle {
        &self.guard
    }
}

impl Drop for AccessToken {
    fn drop(&mut self) {
        self.guard.open_tokens.fetch_sub(1, Ordering::SeqCst);
    }
}

type PoolKey = (String, RepoBranchKey);

struct Slot {
    handle: Arc<RwLock<TransactionHandle>>,
    /// Operations reserved on this handle so far.
    queued: usize,
}

#[derive(Default)]
struct Pool {
    active: bool,
    /// Set while `end` is finalizing; `begin` is refused until it clears.
    closing: bool,
    message: String,
    slots: HashMap<PoolKey, Slot>,
    /// Failed forced flushes, reported again by `end`.
    failures: Vec<CommitFailure>,
    /// Operations committed in this scope, by flushes and by `end`.
    committed: ChangeList,
}

/// Routes writes to per-branch handles and finalizes them together.
pub struct TransactionManager {
    limit: usize,
    pool: Mutex<Pool>,
    flushes: AtomicUsize,
    /// Read-held by every flush in progress; `end` takes the write side.
    flush_gate: Arc<RwLock<()>>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(TRANSACTION_FILE_LIMIT)
    }
}

impl TransactionManager {
    /// `limit` is the number of operations a handle may queue before a
    /// forced commit.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            pool: Mutex::new(Pool::default()),
            flushes: AtomicUsize::new(0),
            flush_gate: Arc::new(RwLock::new(())),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Open a scope. An empty message defaults to `Commit <timestamp>`.
    pub async fn begin(&self, message: &str) -> Result<()> {
        let mut pool = self.pool.lock().await;
        if pool.active || pool.closing {
            return Err(Error::validation("a transaction scope is already active"));
        }
        pool.active = true;
        pool.message = commit_message(message);
        pool.failures.clear();
        pool.committed = ChangeList::default();
        tracing::debug!("Transaction scope opened: {}", pool.message);
        Ok(())
    }

    /// Message used for handles created from now on.
    pub async fn set_commit_message(&self, message: &str) {
        self.pool.lock().await.message = commit_message(message);
    }

    pub async fn is_active(&self) -> bool {
        self.pool.lock().await.active
    }

    pub async fn handle_count(&self) -> usize {
        self.pool.lock().await.slots.len()
    }

    /// Forced intermediate commits performed so far.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Everything committed so far in the current (or last) scope, forced
    /// flushes included.
    pub async fn committed_changes(&self) -> ChangeList {
        self.pool.lock().await.committed.clone()
    }

    /// Union of the change lists of every live handle. Operations already
    /// committed by a forced flush are not included.
    pub async fn change_list(&self) -> ChangeList {
        let pool = self.pool.lock().await;
        let mut all = ChangeList::default();
        for slot in pool.slots.values() {
            all.extend(slot.handle.read().await.change_list().await);
        }
        all
    }

    /// Reserve one operation on the handle for `key`, creating it if needed.
    ///
    /// When the handle is full, a fresh one replaces it and the full one is
    /// committed before this returns.
    pub async fn route(&self, store: &dyn RepoBackend, key: &RepoBranchKey) -> Result<AccessToken> {
        let pool_key = (store.protocol().to_string(), key.clone());
        let (token, retired) = {
            let mut pool = self.pool.lock().await;
            if !pool.active {
                return Err(Error::validation(format!(
                    "write to {} outside a transaction scope",
                    key
                )));
            }
            let message = pool.message.clone();

            if !pool.slots.contains_key(&pool_key) {
                let txn = store.begin_write_transaction(key, &message).await?;
                tracing::debug!("New transaction handle for {}", key);
                pool.slots.insert(
                    pool_key.clone(),
                    Slot {
                        handle: Arc::new(RwLock::new(TransactionHandle::new(key.clone(), txn))),
                        queued: 0,
                    },
                );
            }
            let Some(slot) = pool.slots.get_mut(&pool_key) else {
                return Err(Error::Backend(format!("handle for {} vanished", key)));
            };

            let staged = slot.handle.read().await.txn.transaction_size().await;
            let retired = if slot.queued.max(staged) >= self.limit {
                let txn = store.begin_write_transaction(key, &message).await?;
                let fresh = Slot {
                    handle: Arc::new(RwLock::new(TransactionHandle::new(key.clone(), txn))),
                    queued: 0,
                };
                let gate = Arc::clone(&self.flush_gate).read_owned().await;
                Some((std::mem::replace(slot, fresh).handle, gate))
            } else {
                None
            };

            slot.queued += 1;
            // Taken under the pool lock so the handle cannot be retired
            // and committed before this token exists.
            let token = AccessToken::new(Arc::clone(&slot.handle).read_owned().await);
            (token, retired)
        };

        if let Some((handle, gate)) = retired {
            let flushed = self.flush(key, handle).await;
            drop(gate);
            flushed?;
        }
        Ok(token)
    }

    /// Commit a retired handle once its tokens are gone.
    async fn flush(&self, key: &RepoBranchKey, handle: Arc<RwLock<TransactionHandle>>) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        tracing::info!(
            "Transaction limit of {} reached for {}, forcing a commit",
            self.limit,
            key
        );
        let handle = handle.write_owned().await;
        match handle.txn.commit().await {
            Ok(()) => {
                let changes = handle.change_list().await;
                self.pool.lock().await.committed.extend(changes);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Forced commit of {} failed: {}", key, e);
                let failure = CommitFailure {
                    key: key.to_string(),
                    message: e.to_string(),
                };
                self.pool.lock().await.failures.push(failure.clone());
                Err(Error::Commit {
                    failures: vec![failure],
                })
            }
        }
    }

    /// Route and stage a new file. Keep the token until the writer is shut
    /// down, then call [`TransactionHandle::finish_write`] on it (or
    /// [`TransactionHandle::abort_write`] when the write failed).
    pub async fn open_for_write(
        &self,
        store: &dyn RepoBackend,
        key: &RepoBranchKey,
        path: &str,
    ) -> Result<(AccessToken, ByteWriter)> {
        let token = self.route(store, key).await?;
        let writer = token.open_for_write(path).await?;
        Ok((token, writer))
    }

    pub async fn record_new_file(
        &self,
        store: &dyn RepoBackend,
        key: &RepoBranchKey,
        path: &str,
    ) -> Result<()> {
        let token = self.route(store, key).await?;
        token.record_new_file(path).await;
        Ok(())
    }

    pub async fn record_delete(
        &self,
        store: &dyn RepoBackend,
        key: &RepoBranchKey,
        path: &str,
    ) -> Result<()> {
        let token = self.route(store, key).await?;
        token.delete(path).await
    }

    pub async fn record_copy(
        &self,
        store: &dyn RepoBackend,
        key: &RepoBranchKey,
        src_branch: &str,
        src_path: &str,
        dst_path: &str,
    ) -> Result<()> {
        let token = self.route(store, key).await?;
        token.copy(src_branch, src_path, dst_path).await
    }

    pub async fn record_move(
        &self,
        store: &dyn RepoBackend,
        key: &RepoBranchKey,
        src_path: &str,
        dst_path: &str,
    ) -> Result<()> {
        let token = self.route(store, key).await?;
        token.mv(src_path, dst_path).await
    }

    /// Close the scope, committing or canceling every handle.
    ///
    /// Every handle is finalized even when some fail; failures (including
    /// forced flushes earlier in the scope) are returned together.
    pub async fn end(&self, commit: bool) -> Result<()> {
        let slots: Vec<Slot> = {
            let mut pool = self.pool.lock().await;
            if !pool.active {
                return Err(Error::validation("no active transaction scope"));
            }
            pool.active = false;
            pool.closing = true;
            pool.slots.drain().map(|(_, slot)| slot).collect()
        };

        // No new flush can start once the scope is inactive; wait for the
        // ones already running so their failures are reported here.
        drop(self.flush_gate.write().await);

        let outcomes = join_all(slots.into_iter().map(|slot| async move {
            let handle = slot.handle.write_owned().await;
            let result = if commit {
                handle.txn.commit().await
            } else {
                handle.txn.cancel().await
            };
            let changes = handle.change_list().await;
            (handle.key.to_string(), result, changes)
        }))
        .await;

        let total = outcomes.len();
        let mut pool = self.pool.lock().await;
        pool.closing = false;
        let mut failures = std::mem::take(&mut pool.failures);
        for (key, result, changes) in outcomes {
            match result {
                Ok(()) if commit => pool.committed.extend(changes),
                Ok(()) => {}
                Err(e) => {
                    tracing::error!("Failed to finalize {}: {}", key, e);
                    failures.push(CommitFailure {
                        key,
                        message: e.to_string(),
                    });
                }
            }
        }
        drop(pool);

        tracing::info!(
            "Transaction scope {} ({} branch(es), {} failure(s))",
            if commit { "committed" } else { "canceled" },
            total,
            failures.len()
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Commit { failures })
        }
    }
}

fn commit_message(message: &str) -> String {
    if message.trim().is_empty() {
        format!("Commit {}", Utc::now().to_rfc3339())
    } else {
        message.to_string()
    }
}
