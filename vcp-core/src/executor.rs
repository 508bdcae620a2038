//! Transfer execution
//!
//! Runs planned units as one flat set of tasks, each gated by a permit from
//! a shared semaphore. Failures stay with their unit; every unit is
//! attempted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::backend::{ByteReader, ByteWriter, RepoBackend};
use crate::config::{CHUNK_SIZE, Config, LARGE_OBJECT_THRESHOLD};
use crate::error::{Error, Result};
use crate::path;
use crate::planner::{IGNORED_FILE_NAME, TransferMode, TransferUnit};
use crate::transaction::TransactionManager;

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Read size for streamed copies.
    pub chunk_size: usize,
    /// Versioned uploads at least this large preload dedup hints first.
    pub large_object_threshold: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            large_object_threshold: LARGE_OBJECT_THRESHOLD,
        }
    }
}

impl From<&Config> for ExecutorConfig {
    fn from(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            large_object_threshold: config.large_object_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Copied { bytes: u64 },
    Structural,
    Skipped,
    Canceled,
}

#[derive(Debug)]
pub struct UnitOutcome {
    pub unit: TransferUnit,
    pub result: Result<TransferStatus>,
}

/// Shared state handed to every unit task.
struct UnitContext {
    src: Arc<dyn RepoBackend>,
    dst: Arc<dyn RepoBackend>,
    manager: Arc<TransactionManager>,
    limiter: Arc<Semaphore>,
    canceled: Arc<AtomicBool>,
    config: ExecutorConfig,
}

pub struct TransferExecutor {
    limiter: Arc<Semaphore>,
    config: ExecutorConfig,
    canceled: Arc<AtomicBool>,
}

impl TransferExecutor {
    pub fn new(limiter: Arc<Semaphore>, config: ExecutorConfig) -> Self {
        Self {
            limiter,
            config,
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Units that have not started yet finish as [`TransferStatus::Canceled`].
    pub fn cancel(&self) {
        tracing::info!("Transfer canceled; in-flight units will complete");
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Run every unit and return one outcome per unit, in input order.
    pub async fn execute(
        &self,
        units: Vec<TransferUnit>,
        src: Arc<dyn RepoBackend>,
        dst: Arc<dyn RepoBackend>,
        manager: Arc<TransactionManager>,
    ) -> Vec<UnitOutcome> {
        let ctx = Arc::new(UnitContext {
            src,
            dst,
            manager,
            limiter: Arc::clone(&self.limiter),
            canceled: Arc::clone(&self.canceled),
            config: self.config,
        });

        let mut set = JoinSet::new();
        for (index, unit) in units.iter().cloned().enumerate() {
            let ctx = Arc::clone(&ctx);
            set.spawn(async move {
                let result = run_unit(&ctx, &unit).await;
                if let Err(e) = &result {
                    tracing::error!(
                        "Failed to copy {} to {}: {}",
                        unit.source_path,
                        unit.destination_path,
                        e
                    );
                }
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<TransferStatus>>> =
            std::iter::repeat_with(|| None).take(units.len()).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => tracing::error!("Transfer task aborted: {}", e),
            }
        }

        units
            .into_iter()
            .zip(results)
            .map(|(unit, result)| UnitOutcome {
                unit,
                result: result
                    .unwrap_or_else(|| Err(Error::Backend("transfer task aborted".into()))),
            })
            .collect()
    }
}

async fn run_unit(ctx: &UnitContext, unit: &TransferUnit) -> Result<TransferStatus> {
    if ctx.canceled.load(Ordering::SeqCst) {
        return Ok(TransferStatus::Canceled);
    }
    let _permit = Arc::clone(&ctx.limiter)
        .acquire_owned()
        .await
        .map_err(|_| Error::Backend("transfer limiter closed".into()))?;
    if ctx.canceled.load(Ordering::SeqCst) {
        return Ok(TransferStatus::Canceled);
    }

    if path::file_name(&unit.destination_path) == IGNORED_FILE_NAME {
        tracing::warn!("Skipping {}", unit.destination_path);
        return Ok(TransferStatus::Skipped);
    }

    match unit.mode {
        TransferMode::Structural => copy_structural(ctx, unit).await,
        TransferMode::Bytes => copy_bytes(ctx, unit).await,
    }
}

async fn copy_structural(ctx: &UnitContext, unit: &TransferUnit) -> Result<TransferStatus> {
    let src = ctx.src.resolve(&unit.source_path)?.ok_or_else(|| {
        Error::validation(format!("{} is not in a versioned store", unit.source_path))
    })?;
    let dst = ctx.dst.resolve(&unit.destination_path)?.ok_or_else(|| {
        Error::validation(format!("{} is not in a versioned store", unit.destination_path))
    })?;
    if src.key.remote != dst.key.remote {
        return Err(Error::validation(format!(
            "cannot copy across repositories without streaming: {} -> {}",
            src.key.remote, dst.key.remote
        )));
    }
    tracing::debug!("Copying {} to {} in place", unit.source_path, unit.destination_path);
    ctx.manager
        .record_copy(ctx.dst.as_ref(), &dst.key, &src.key.branch, &src.path, &dst.path)
        .await?;
    Ok(TransferStatus::Structural)
}

async fn copy_bytes(ctx: &UnitContext, unit: &TransferUnit) -> Result<TransferStatus> {
    let Some(dst) = ctx.dst.resolve(&unit.destination_path)? else {
        if let Some(dir) = &unit.destination_dir {
            ctx.dst.create_dir_all(dir).await?;
        }
        let reader = ctx.src.open_for_read(&unit.source_path).await?;
        let mut writer = ctx.dst.open_for_write(&unit.destination_path).await?;
        let bytes = stream(ctx, unit, reader, &mut writer).await?;
        return Ok(TransferStatus::Copied { bytes });
    };

    let size = match unit.size_hint {
        Some(size) => Some(size),
        None => ctx.src.stat(&unit.source_path).await?.map(|info| info.size),
    };
    let threshold = ctx.config.large_object_threshold;
    if size.is_some_and(|s| s >= threshold) {
        let hint = [(dst.key.branch.clone(), dst.path.clone())];
        if let Err(e) = ctx
            .dst
            .preload_dedup_hints(&dst.key.remote, &hint, threshold)
            .await
        {
            tracing::warn!("Dedup hints for {} unavailable: {}", unit.destination_path, e);
        }
    }

    // Open the source first so an unreadable source stages nothing.
    let reader = ctx.src.open_for_read(&unit.source_path).await?;
    let (token, mut writer) = ctx
        .manager
        .open_for_write(ctx.dst.as_ref(), &dst.key, &dst.path)
        .await?;
    match stream(ctx, unit, reader, &mut writer).await {
        Ok(bytes) => {
            token.finish_write(&dst.path).await;
            Ok(TransferStatus::Copied { bytes })
        }
        Err(e) => {
            drop(writer);
            if let Err(discard) = token.abort_write(&dst.path).await {
                tracing::warn!(
                    "Could not discard partial upload of {}: {}",
                    unit.destination_path,
                    discard
                );
            }
            Err(e)
        }
    }
}

/// Copy `reader` into `writer` in chunks and close the writer.
async fn stream(
    ctx: &UnitContext,
    unit: &TransferUnit,
    mut reader: ByteReader,
    writer: &mut ByteWriter,
) -> Result<u64> {
    // Small files do not need a full chunk buffer.
    let capacity = match unit.size_hint {
        Some(size) => ctx.config.chunk_size.min(size as usize + 1),
        None => ctx.config.chunk_size,
    };
    let mut buf = vec![0u8; capacity.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.shutdown().await?;
    Ok(total)
}

/// Counts over a set of outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub copied: usize,
    pub structural: usize,
    pub skipped: usize,
    pub canceled: usize,
    pub failed: usize,
    /// Bytes streamed by copied units.
    pub bytes: u64,
}

impl TransferSummary {
    pub fn from_outcomes(outcomes: &[UnitOutcome]) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match &outcome.result {
                Ok(TransferStatus::Copied { bytes }) => {
                    summary.copied += 1;
                    summary.bytes += bytes;
                }
                Ok(TransferStatus::Structural) => summary.structural += 1,
                Ok(TransferStatus::Skipped) => summary.skipped += 1,
                Ok(TransferStatus::Canceled) => summary.canceled += 1,
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.copied + self.structural + self.skipped + self.canceled + self.failed
    }

    /// Human-readable one-line summary.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "Copied {} file(s) ({})",
            self.copied + self.structural,
            format_size(self.bytes)
        );
        if self.skipped > 0 {
            line.push_str(&format!(", {} skipped", self.skipped));
        }
        if self.canceled > 0 {
            line.push_str(&format!(", {} canceled", self.canceled));
        }
        if self.failed > 0 {
            line.push_str(&format!(", {} failed", self.failed));
        }
        line
    }
}

/// The first failed outcome, as `(unit, error)`.
pub fn first_failure(outcomes: &[UnitOutcome]) -> Option<(&TransferUnit, &Error)> {
    outcomes
        .iter()
        .find_map(|o| o.result.as_ref().err().map(|e| (&o.unit, e)))
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
