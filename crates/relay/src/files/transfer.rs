//! Staging store for bulk transfers.
//!
//! An upload is streamed to a file under the staging directory, named by a
//! freshly generated opaque transfer id. The file is handed out to at most
//! one successful download and deleted as soon as that download completes.
//! Failed downloads leave the file in place so the recipient can retry.
//! Anything older than the retention window is swept regardless of state:
//! its file is deleted and the record turns `Cancelled`, staying queryable
//! for one more retention window. Every read and write on a transfer
//! stream must make progress within the idle timeout.

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use protocol::transfer::{copy_exact_within, write_download_header, DownloadHeader, UploadHeader};
use protocol::{ChatId, ProtocolError, TransferStatus, UserId};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Default retention for staged files (1 hour).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(3600);

/// Default time a transfer stream may sit without progress.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Extension of files the store writes into the staging directory.
const STAGED_EXTENSION: &str = "staged";

/// Errors that can occur during a bulk transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    /// No transfer with this id is known or downloadable.
    #[error("transfer not found: {0}")]
    NotFound(String),

    /// Upload exceeds the configured limit.
    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    /// File name is empty or refers to a path rather than a name.
    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    /// The sweep expired the transfer while bytes were still moving.
    #[error("transfer cancelled: {0}")]
    Cancelled(String),

    /// Wire or stream error, including short reads.
    #[error("transfer failed: {0}")]
    Protocol(#[from] ProtocolError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Lock poisoned during operation.
    #[error("lock poisoned: {context}")]
    LockPoisoned { context: String },
}

/// Bookkeeping for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub chat_id: Option<ChatId>,
    pub file_name: String,
    pub file_size: u64,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    /// True while the staged file exists on disk.
    pub staged: bool,
    pub(crate) created_at: SystemTime,
}

impl TransferRecord {
    /// Time since the upload started.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed().unwrap_or_default()
    }
}

/// Staging store for uploads awaiting download.
#[derive(Debug)]
pub struct TransferStore {
    records: RwLock<HashMap<String, TransferRecord>>,
    staging_dir: PathBuf,
    max_file_size: u64,
    retention: Duration,
    idle_timeout: Duration,
}

impl TransferStore {
    /// Create a store staging files under `staging_dir`.
    pub fn new(staging_dir: impl Into<PathBuf>, max_file_size: u64) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            staging_dir: staging_dir.into(),
            max_file_size,
            retention: DEFAULT_RETENTION,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Set how long a transfer stream may stall before it is abandoned.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Set how long staged files are kept.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn staged_path(&self, transfer_id: &str) -> PathBuf {
        self.staging_dir
            .join(format!("{}.{}", transfer_id, STAGED_EXTENSION))
    }

    fn write_records(
        &self,
        context: &str,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, TransferRecord>>, TransferError>
    {
        self.records.write().map_err(|_| TransferError::LockPoisoned {
            context: context.to_string(),
        })
    }

    fn update<F>(&self, transfer_id: &str, f: F)
    where
        F: FnOnce(&mut TransferRecord),
    {
        match self.records.write() {
            Ok(mut records) => {
                if let Some(record) = records.get_mut(transfer_id) {
                    f(record);
                }
            }
            Err(_) => warn!(transfer_id, "Transfer records lock poisoned"),
        }
    }

    /// Apply `f` only while the transfer is still `InProgress`.
    ///
    /// Returns false once the sweep has cancelled or removed the transfer.
    fn finish<F>(&self, transfer_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut TransferRecord),
    {
        let Ok(mut records) = self.records.write() else {
            warn!(transfer_id, "Transfer records lock poisoned");
            return false;
        };
        match records.get_mut(transfer_id) {
            Some(record) if record.status == TransferStatus::InProgress => {
                f(record);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of a transfer's bookkeeping.
    pub fn get(&self, transfer_id: &str) -> Option<TransferRecord> {
        self.records.read().ok()?.get(transfer_id).cloned()
    }

    /// Current status of a transfer.
    pub fn status(&self, transfer_id: &str) -> Option<TransferStatus> {
        self.get(transfer_id).map(|record| record.status)
    }

    /// Number of tracked transfers.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receive an upload body from `reader` and stage it.
    ///
    /// Reads exactly `header.file_size` bytes; a stream that ends early marks
    /// the transfer `Failed` and removes the partial file.
    pub async fn upload<R>(
        &self,
        header: &UploadHeader,
        reader: &mut R,
    ) -> Result<TransferRecord, TransferError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let file_name = sanitize_file_name(&header.file_name)?;
        let transfer_id = uuid::Uuid::new_v4().simple().to_string();

        let mut record = TransferRecord {
            transfer_id: transfer_id.clone(),
            sender_id: header.sender_id,
            receiver_id: header.target_user_id,
            chat_id: header.chat_id,
            file_name,
            file_size: header.file_size,
            status: TransferStatus::InProgress,
            bytes_transferred: 0,
            staged: false,
            created_at: SystemTime::now(),
        };

        if header.file_size > self.max_file_size {
            record.status = TransferStatus::Rejected;
            self.write_records("records lock during upload")?
                .insert(transfer_id.clone(), record);
            info!(
                transfer_id = %transfer_id,
                size = header.file_size,
                limit = self.max_file_size,
                "Upload rejected"
            );
            return Err(TransferError::FileTooLarge {
                size: header.file_size,
                limit: self.max_file_size,
            });
        }

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let path = self.staged_path(&transfer_id);
        self.write_records("records lock during upload")?
            .insert(transfer_id.clone(), record.clone());

        let result = async {
            let mut file = tokio::fs::File::create(&path).await?;
            let copied = copy_exact_within(
                reader,
                &mut file,
                header.file_size,
                self.idle_timeout,
                |n| self.update(&transfer_id, |r| r.bytes_transferred = n),
            )
            .await?;
            file.sync_all().await?;
            Ok::<u64, TransferError>(copied)
        }
        .await;

        let result = result.and_then(|copied| {
            let staged = self.finish(&transfer_id, |r| {
                r.status = TransferStatus::Pending;
                r.bytes_transferred = copied;
                r.staged = true;
            });
            if staged {
                Ok(copied)
            } else {
                Err(TransferError::Cancelled(transfer_id.clone()))
            }
        });

        match result {
            Ok(copied) => {
                record.status = TransferStatus::Pending;
                record.bytes_transferred = copied;
                record.staged = true;
                info!(
                    transfer_id = %transfer_id,
                    sender_id = header.sender_id,
                    size = copied,
                    "Upload staged"
                );
                Ok(record)
            }
            Err(e) => {
                self.finish(&transfer_id, |r| r.status = TransferStatus::Failed);
                if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = ?path, error = %remove_err, "Failed to cleanup partial upload");
                    }
                }
                warn!(transfer_id = %transfer_id, error = %e, "Upload failed");
                Err(e)
            }
        }
    }

    /// Claim a staged file for download, marking it `InProgress`.
    ///
    /// Returns None if the id is unknown, already downloaded, swept, or
    /// currently being downloaded by someone else.
    fn claim(&self, transfer_id: &str) -> Option<(DownloadHeader, PathBuf)> {
        let mut records = self.records.write().ok()?;
        let record = records.get_mut(transfer_id)?;
        let downloadable = record.staged
            && matches!(
                record.status,
                TransferStatus::Pending | TransferStatus::Failed
            );
        if !downloadable {
            return None;
        }
        record.status = TransferStatus::InProgress;
        record.bytes_transferred = 0;
        Some((
            DownloadHeader {
                file_name: record.file_name.clone(),
                file_size: record.file_size,
            },
            self.staged_path(transfer_id),
        ))
    }

    /// Stream a staged file to `writer`.
    ///
    /// Writes `found = 0` and returns `Ok(false)` if the transfer is not
    /// downloadable. After a complete write the staged file is deleted and
    /// later requests for the same id get `found = 0`.
    pub async fn download<W>(&self, transfer_id: &str, writer: &mut W) -> Result<bool, TransferError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let Some((header, path)) = self.claim(transfer_id) else {
            debug!(transfer_id, "Download requested for unavailable transfer");
            write_download_header(writer, None).await?;
            return Ok(false);
        };

        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                warn!(transfer_id, error = %e, "Staged file missing");
                self.update(transfer_id, |r| {
                    r.status = TransferStatus::Failed;
                    r.staged = false;
                });
                write_download_header(writer, None).await?;
                return Ok(false);
            }
        };

        let result = async {
            within(
                self.idle_timeout,
                write_download_header(writer, Some(&header)),
            )
            .await?;
            copy_exact_within(
                &mut file,
                writer,
                header.file_size,
                self.idle_timeout,
                |n| self.update(transfer_id, |r| r.bytes_transferred = n),
            )
            .await
            .map_err(TransferError::from)
        }
        .await;

        match result {
            Ok(sent) => {
                drop(file);
                self.finish(transfer_id, |r| {
                    r.status = TransferStatus::Completed;
                    r.bytes_transferred = sent;
                    r.staged = false;
                });
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = ?path, error = %e, "Failed to delete downloaded file");
                    }
                }
                info!(transfer_id, size = sent, "Download completed");
                Ok(true)
            }
            Err(e) => {
                self.finish(transfer_id, |r| r.status = TransferStatus::Failed);
                warn!(transfer_id, error = %e, "Download failed, file kept for retry");
                Err(e)
            }
        }
    }

    /// Expire transfers older than the retention window.
    ///
    /// Live transfers, including ones still streaming, lose their staged
    /// file and become `Cancelled`; a stream still running on them fails or
    /// completes without changing that status. Finished records are dropped
    /// once they are twice the retention window old. Orphaned staging files
    /// left by an earlier process are removed by modification time. Returns
    /// the number of records cancelled or dropped.
    pub fn sweep(&self) -> Result<usize, TransferError> {
        let (cancelled, dropped) = {
            let mut records = self.write_records("records lock during sweep")?;
            let mut cancelled = Vec::new();
            for record in records.values_mut() {
                if record.age() > self.retention && !record.status.is_terminal() {
                    record.status = TransferStatus::Cancelled;
                    cancelled.push((record.transfer_id.clone(), record.staged));
                    record.staged = false;
                }
            }
            let before = records.len();
            records.retain(|_, r| !(r.status.is_terminal() && r.age() > self.retention * 2));
            (cancelled, before - records.len())
        };

        for (transfer_id, staged) in &cancelled {
            let path = self.staged_path(transfer_id);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to remove expired staged file")
                }
            }
            info!(transfer_id = %transfer_id, staged, "Expired transfer cancelled");
        }

        self.remove_orphans()?;
        Ok(cancelled.len() + dropped)
    }

    fn remove_orphans(&self) -> Result<(), TransferError> {
        if !self.staging_dir.exists() {
            return Ok(());
        }

        for entry in fs::read_dir(&self.staging_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == STAGED_EXTENSION) != Some(true) {
                continue;
            }

            let tracked = path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|id| self.get(id).is_some());
            if tracked {
                continue;
            }

            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > self.retention);
            if expired {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = ?path, error = %e, "Failed to cleanup orphaned staged file");
                } else {
                    debug!(path = ?path, "Removed orphaned staged file");
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn backdate(&self, transfer_id: &str, by: Duration) {
        self.update(transfer_id, |r| r.created_at -= by);
    }
}

/// Run one transfer step that must finish within `idle`.
pub(crate) async fn within<T, E>(
    idle: Duration,
    step: impl Future<Output = Result<T, E>>,
) -> Result<T, TransferError>
where
    TransferError: From<E>,
{
    match tokio::time::timeout(idle, step).await {
        Ok(result) => Ok(result?),
        Err(_) => {
            let message = format!("no transfer progress for {:?}", idle);
            Err(ProtocolError::Timeout(message).into())
        }
    }
}

/// Reduce a client-supplied name to a bare file name.
pub fn sanitize_file_name(name: &str) -> Result<String, TransferError> {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." || base.chars().any(char::is_control) {
        return Err(TransferError::InvalidName(name.to_string()));
    }
    Ok(base.to_string())
}
