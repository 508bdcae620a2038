//! One-way sync
//!
//! Copies every source file whose destination counterpart is missing or
//! differs according to a [`SyncComparator`]. Nothing is ever deleted at
//! the destination.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{self, EntryInfo, RepoBackend};
use crate::error::{Error, Result};
use crate::executor::{TransferExecutor, TransferStatus};
use crate::path;
use crate::planner::{IGNORED_FILE_NAME, TransferMode, TransferUnit};
use crate::transaction::TransactionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncDecision {
    pub should_copy: bool,
}

/// Decides whether a file present on both sides needs copying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncComparator {
    /// Copy when sizes differ.
    #[default]
    SizeOnly,
    /// Copy when sizes differ, or when both mtimes are known and the
    /// source is newer.
    SizeAndTime,
}

impl SyncComparator {
    pub fn decide(&self, src: &EntryInfo, dst: &EntryInfo) -> SyncDecision {
        let size_differs = src.size != dst.size;
        let should_copy = match self {
            SyncComparator::SizeOnly => size_differs,
            SyncComparator::SizeAndTime => {
                size_differs
                    || matches!((src.mtime, dst.mtime), (Some(s), Some(d)) if s > d)
            }
        };
        SyncDecision { should_copy }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub comparator: SyncComparator,
    /// Plan and count only.
    pub dryrun: bool,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct SyncPlan {
    pub units: Vec<TransferUnit>,
    /// Files already in sync.
    pub ignored: usize,
    /// Entries that could not be planned, such as kind mismatches.
    pub failures: Vec<Error>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub copied: usize,
    pub ignored: usize,
    pub failed: usize,
}

pub struct SyncCommand {
    src: Arc<dyn RepoBackend>,
    src_root: String,
    dst: Arc<dyn RepoBackend>,
    dst_root: String,
    options: SyncOptions,
}

impl SyncCommand {
    pub fn new(
        src: Arc<dyn RepoBackend>,
        source: &str,
        dst: Arc<dyn RepoBackend>,
        destination: &str,
        options: SyncOptions,
    ) -> Self {
        Self {
            src,
            src_root: path::strip_trailing_slash(source).to_string(),
            dst,
            dst_root: path::strip_trailing_slash(destination).to_string(),
            options,
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Cheap checks that catch bad requests before any listing.
    pub async fn validate(&self) -> Result<()> {
        if path::has_wildcard(&self.src_root) || path::has_wildcard(&self.dst_root) {
            return Err(Error::validation("wildcards are not supported by sync"));
        }

        if let Some(dst) = self.dst.resolve(&self.dst_root)? {
            let branch_root = format!(
                "{}/{}/{}",
                dst.key.remote.user, dst.key.remote.repo, dst.key.branch
            );
            if self.dst.stat(&branch_root).await?.is_none() {
                return Err(Error::NotFound(format!("branch {}", dst.key)));
            }
        }

        match self.src.stat(&self.src_root).await? {
            Some(info) if info.is_dir() => Ok(()),
            Some(_) => Err(Error::validation(format!(
                "source {} needs to be a directory",
                self.src_root
            ))),
            None => Err(Error::NotFound(self.src_root.clone())),
        }
    }

    /// Compare both trees and list the files that need copying.
    pub async fn plan(&self) -> Result<SyncPlan> {
        let existing: HashMap<String, EntryInfo> = match self.dst.stat(&self.dst_root).await? {
            Some(info) if info.is_dir() => backend::walk(self.dst.as_ref(), &self.dst_root)
                .await?
                .into_iter()
                .map(|e| (e.relative, e.info))
                .collect(),
            Some(_) => {
                return Err(Error::KindMismatch {
                    source_path: self.src_root.clone(),
                    destination_path: self.dst_root.clone(),
                });
            }
            None => HashMap::new(),
        };

        let mut plan = SyncPlan::default();
        // Source directories that clash with a destination file; their
        // contents are not planned.
        let mut blocked: Vec<String> = Vec::new();
        for entry in backend::walk(self.src.as_ref(), &self.src_root).await? {
            if blocked.iter().any(|b| path::relative_to(&entry.relative, b).is_some()) {
                continue;
            }
            let destination_path = path::join(&self.dst_root, &entry.relative);
            let decision = match existing.get(&entry.relative) {
                Some(found) if found.kind != entry.info.kind => {
                    tracing::warn!(
                        "{} and {} are not the same type of entry",
                        entry.path,
                        destination_path
                    );
                    if entry.info.is_dir() {
                        blocked.push(entry.relative.clone());
                    }
                    plan.failures.push(Error::KindMismatch {
                        source_path: entry.path,
                        destination_path,
                    });
                    continue;
                }
                _ if entry.info.is_dir() => continue,
                Some(found) => self.options.comparator.decide(&entry.info, found),
                None => SyncDecision { should_copy: true },
            };

            if !decision.should_copy || path::file_name(&entry.relative) == IGNORED_FILE_NAME {
                plan.ignored += 1;
                continue;
            }
            plan.units.push(TransferUnit {
                destination_dir: Some(path::parent(&destination_path).to_string()),
                destination_path,
                source_path: entry.path,
                size_hint: Some(entry.info.size),
                mode: TransferMode::Bytes,
            });
        }

        tracing::debug!(
            "Sync plan: {} to copy, {} in sync, {} failed",
            plan.units.len(),
            plan.ignored,
            plan.failures.len()
        );
        Ok(plan)
    }

    /// Plan and execute. Versioned destinations are written in one scope.
    pub async fn run(
        &self,
        manager: Arc<TransactionManager>,
        executor: &TransferExecutor,
    ) -> Result<SyncStats> {
        let plan = self.plan().await?;
        let mut stats = SyncStats {
            copied: 0,
            ignored: plan.ignored,
            failed: plan.failures.len(),
        };
        if self.options.dryrun {
            for unit in &plan.units {
                tracing::info!("Would copy {} to {}", unit.source_path, unit.destination_path);
            }
            stats.copied = plan.units.len();
            return Ok(stats);
        }

        let versioned = self.dst.is_versioned();
        if versioned {
            manager.begin(&self.options.message).await?;
        }
        let outcomes = executor
            .execute(
                plan.units,
                Arc::clone(&self.src),
                Arc::clone(&self.dst),
                Arc::clone(&manager),
            )
            .await;
        for outcome in &outcomes {
            match outcome.result {
                Ok(TransferStatus::Copied { .. }) | Ok(TransferStatus::Structural) => {
                    stats.copied += 1
                }
                Ok(TransferStatus::Skipped) => stats.ignored += 1,
                Ok(TransferStatus::Canceled) | Err(_) => stats.failed += 1,
            }
        }
        if versioned {
            manager.end(true).await?;
        }

        tracing::info!(
            "Sync complete: {} copied, {} ignored, {} failed",
            stats.copied,
            stats.ignored,
            stats.failed
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;

    fn file(size: u64, secs: Option<i64>) -> EntryInfo {
        let mtime: Option<DateTime<Utc>> = secs.and_then(|s| Utc.timestamp_opt(s, 0).single());
        EntryInfo::file(size, mtime)
    }

    #[test]
    fn test_size_only_ignores_time() {
        let cmp = SyncComparator::SizeOnly;
        assert!(!cmp.decide(&file(10, Some(200)), &file(10, Some(100))).should_copy);
        assert!(cmp.decide(&file(11, Some(100)), &file(10, Some(100))).should_copy);
    }

    #[test]
    fn test_size_and_time_needs_both_mtimes() {
        let cmp = SyncComparator::SizeAndTime;
        assert!(cmp.decide(&file(10, Some(200)), &file(10, Some(100))).should_copy);
        assert!(!cmp.decide(&file(10, Some(100)), &file(10, Some(200))).should_copy);
        assert!(!cmp.decide(&file(10, None), &file(10, Some(100))).should_copy);
        assert!(!cmp.decide(&file(10, Some(100)), &file(10, None)).should_copy);
    }

    proptest! {
        #[test]
        fn identical_entries_never_copy(size in 0u64..1 << 40, secs in proptest::option::of(0i64..4_000_000_000)) {
            let info = file(size, secs);
            prop_assert!(!SyncComparator::SizeOnly.decide(&info, &info).should_copy);
            prop_assert!(!SyncComparator::SizeAndTime.decide(&info, &info).should_copy);
        }

        #[test]
        fn size_change_always_copies(a in 0u64..1 << 40, b in 0u64..1 << 40, secs in 0i64..4_000_000_000) {
            prop_assume!(a != b);
            let src = file(a, Some(secs));
            let dst = file(b, Some(secs));
            prop_assert!(SyncComparator::SizeOnly.decide(&src, &dst).should_copy);
            prop_assert!(SyncComparator::SizeAndTime.decide(&src, &dst).should_copy);
        }

        #[test]
        fn newer_source_copies_only_with_time(size in 0u64..1 << 40, older in 0i64..2_000_000_000, delta in 1i64..1_000_000) {
            let src = file(size, Some(older + delta));
            let dst = file(size, Some(older));
            prop_assert!(SyncComparator::SizeAndTime.decide(&src, &dst).should_copy);
            prop_assert!(!SyncComparator::SizeOnly.decide(&src, &dst).should_copy);
        }
    }
}
