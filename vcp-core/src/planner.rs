//! Copy planning
//!
//! Turns a source/destination pair into a flat list of [`TransferUnit`]s.
//! Planning reads metadata only; nothing is written.

use globset::{GlobBuilder, GlobMatcher};
use std::sync::Arc;

use crate::backend::{self, EntryInfo, RepoBackend};
use crate::error::{Error, Result};
use crate::path;

/// File name never written to a destination.
pub const IGNORED_FILE_NAME: &str = ".gitattributes";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Stream the bytes of one file.
    Bytes,
    /// Copy within one store without moving bytes. The unit may stand for a
    /// whole subtree.
    Structural,
}

/// One copy job produced by the planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUnit {
    pub source_path: String,
    pub destination_path: String,
    /// Directory containing the destination, created first on plain filesystems.
    pub destination_dir: Option<String>,
    /// Best-effort size of the source.
    pub size_hint: Option<u64>,
    pub mode: TransferMode,
}

#[derive(Debug, Default)]
pub struct Plan {
    pub units: Vec<TransferUnit>,
    /// Directory sources left out because the copy was not recursive.
    pub skipped_directories: Vec<String>,
}

impl Plan {
    fn push(&mut self, unit: TransferUnit) {
        if path::file_name(&unit.destination_path) == IGNORED_FILE_NAME {
            tracing::debug!("Not planning {}", unit.destination_path);
            return;
        }
        self.units.push(unit);
    }

    fn append(&mut self, other: Plan) {
        self.units.extend(other.units);
        self.skipped_directories.extend(other.skipped_directories);
    }

    /// Sum of known size hints.
    pub fn total_bytes(&self) -> u64 {
        self.units.iter().filter_map(|u| u.size_hint).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DestKind {
    Directory,
    File,
    Missing,
}

pub struct Planner {
    src: Arc<dyn RepoBackend>,
    dst: Arc<dyn RepoBackend>,
}

impl Planner {
    pub fn new(src: Arc<dyn RepoBackend>, dst: Arc<dyn RepoBackend>) -> Self {
        Self { src, dst }
    }

    /// Plan several sources into one destination, which is then always a directory.
    pub async fn plan_many(
        &self,
        sources: &[String],
        destination: &str,
        recursive: bool,
    ) -> Result<Plan> {
        let destination = if sources.len() > 1 && !path::has_trailing_slash(destination) {
            format!("{}/", destination)
        } else {
            destination.to_string()
        };
        let mut plan = Plan::default();
        for source in sources {
            plan.append(self.plan(source, &destination, recursive).await?);
        }
        Ok(plan)
    }

    pub async fn plan(&self, source: &str, destination: &str, recursive: bool) -> Result<Plan> {
        let dest = path::strip_trailing_slash(destination);
        if dest.is_empty() {
            return Err(Error::validation("empty destination"));
        }

        if path::has_wildcard(source) {
            let (parent, pattern) = path::split(path::strip_trailing_slash(source));
            if path::has_wildcard(parent) {
                return Err(Error::validation(format!(
                    "invalid glob {}: wildcards may only appear in the last path segment",
                    source
                )));
            }
            return self.plan_glob(source, parent, pattern, dest, recursive).await;
        }

        let src_as_dir = path::has_trailing_slash(source);
        let src = path::strip_trailing_slash(source);
        let info = self
            .src
            .stat(src)
            .await?
            .ok_or_else(|| Error::NotFound(source.to_string()))?;
        if src_as_dir && !info.is_dir() {
            return Err(Error::validation(format!(
                "source {} is not an existing directory",
                src
            )));
        }

        let dest_kind = self.dest_kind(dest).await?;
        let mut plan = Plan::default();

        if info.is_dir() {
            if dest_kind == DestKind::File {
                return Err(Error::KindMismatch {
                    source_path: src.to_string(),
                    destination_path: dest.to_string(),
                });
            }
            if !recursive {
                tracing::warn!("Skipping directory {} (not recursive)", src);
                plan.skipped_directories.push(src.to_string());
                return Ok(plan);
            }
            let target = if !src_as_dir && dest_kind == DestKind::Directory {
                path::join(dest, path::file_name(src))
            } else {
                dest.to_string()
            };
            self.plan_dir(&mut plan, src, &target).await?;
        } else {
            let into_dir = dest_kind == DestKind::Directory
                || (dest_kind == DestKind::Missing && path::has_trailing_slash(destination));
            let target = if into_dir {
                path::join(dest, path::file_name(src))
            } else {
                dest.to_string()
            };
            self.plan_file(&mut plan, src, &target, &info)?;
        }

        tracing::debug!(
            "Planned {} unit(s) for {} -> {}",
            plan.units.len(),
            source,
            destination
        );
        Ok(plan)
    }

    async fn dest_kind(&self, dest: &str) -> Result<DestKind> {
        Ok(match self.dst.stat(dest).await? {
            Some(info) if info.is_dir() => DestKind::Directory,
            Some(_) => DestKind::File,
            None => DestKind::Missing,
        })
    }

    async fn plan_glob(
        &self,
        source: &str,
        parent: &str,
        pattern: &str,
        dest: &str,
        recursive: bool,
    ) -> Result<Plan> {
        let matcher = glob_matcher(pattern)?;
        if self.dest_kind(dest).await? == DestKind::File {
            return Err(Error::KindMismatch {
                source_path: source.to_string(),
                destination_path: dest.to_string(),
            });
        }

        let mut plan = Plan::default();
        for entry in self.src.list(parent).await? {
            if !matcher.is_match(&entry.name) {
                continue;
            }
            let target = path::join(dest, &entry.name);
            if entry.info.is_dir() {
                if recursive {
                    self.plan_dir(&mut plan, &entry.path, &target).await?;
                } else {
                    plan.skipped_directories.push(entry.path);
                }
            } else {
                self.plan_file(&mut plan, &entry.path, &target, &entry.info)?;
            }
        }
        tracing::debug!("Glob {} matched {} unit(s)", source, plan.units.len());
        Ok(plan)
    }

    /// Whether `src_path` can be copied to `dst_path` without moving bytes.
    fn structural(&self, src_path: &str, dst_path: &str) -> bool {
        if !Arc::ptr_eq(&self.src, &self.dst) || !self.src.supports_structural_copy() {
            return false;
        }
        match (self.src.resolve(src_path), self.dst.resolve(dst_path)) {
            (Ok(Some(s)), Ok(Some(d))) => s.key.remote == d.key.remote,
            _ => false,
        }
    }

    fn plan_file(&self, plan: &mut Plan, src: &str, target: &str, info: &EntryInfo) -> Result<()> {
        if path::file_name(target).is_empty() {
            return Err(Error::validation(format!("empty destination for {}", src)));
        }
        let mode = if self.structural(src, target) {
            TransferMode::Structural
        } else {
            TransferMode::Bytes
        };
        plan.push(TransferUnit {
            source_path: src.to_string(),
            destination_path: target.to_string(),
            destination_dir: Some(path::parent(target).to_string()),
            size_hint: Some(info.size),
            mode,
        });
        Ok(())
    }

    async fn plan_dir(&self, plan: &mut Plan, src_dir: &str, target: &str) -> Result<()> {
        if self.structural(src_dir, target) {
            plan.push(TransferUnit {
                source_path: src_dir.to_string(),
                destination_path: target.to_string(),
                destination_dir: Some(path::parent(target).to_string()),
                size_hint: None,
                mode: TransferMode::Structural,
            });
            return Ok(());
        }

        for entry in backend::walk(self.src.as_ref(), src_dir).await? {
            if entry.info.is_dir() {
                continue;
            }
            path::validate_relative(&entry.relative)?;
            let destination_path = path::join(target, &entry.relative);
            plan.push(TransferUnit {
                destination_dir: Some(path::parent(&destination_path).to_string()),
                destination_path,
                source_path: entry.path,
                size_hint: Some(entry.info.size),
                mode: TransferMode::Bytes,
            });
        }
        Ok(())
    }
}

fn glob_matcher(pattern: &str) -> Result<GlobMatcher> {
    let glob = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|e| Error::validation(format!("invalid glob {}: {}", pattern, e)))?;
    Ok(glob.compile_matcher())
}
