//! # Dead letter store
//!
//! Append-only JSON lines file holding events whose delivery failed terminally. Records leave
//! the store only through a successful replay or an explicit clear.
use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::event::{IntakeEvent, OutboundEvent};
use crate::metrics::{DLQ_ROTATIONS_TOTAL, DLQ_SIZE};

#[derive(Error, Debug)]
pub enum DlqError {
    #[error("dead letter file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("dead letter record could not be serialized: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("dead letter archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub event_id: Uuid,
    pub correlation_id: Uuid,
    pub original_event: IntakeEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformed_event: Option<OutboundEvent>,
    pub failure_reason: String,
    pub failure_timestamp: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

pub struct DeadLetterStore {
    path: PathBuf,
    max_file_bytes: u64,
    /// Records in the live file.
    size: AtomicU64,
    /// Serializes every read-modify-write of the live file.
    lock: Mutex<()>,
}

impl DeadLetterStore {
    /// Open the store at `directory/file_name`, creating the directory if needed. The size
    /// gauge is reconciled from the records already on disk.
    pub async fn open(
        directory: &Path,
        file_name: &str,
        max_file_bytes: u64,
    ) -> Result<Self, DlqError> {
        tokio::fs::create_dir_all(directory).await?;
        let path = directory.join(file_name);

        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => count_lines(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let store = Self {
            path,
            max_file_bytes,
            size: AtomicU64::new(existing),
            lock: Mutex::new(()),
        };
        store.publish_size();

        info!(
            path = %store.path.display(),
            records = existing,
            "dead letter store opened"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records in the live file.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    fn publish_size(&self) {
        metrics::gauge!(DLQ_SIZE).set(self.size() as f64);
    }

    /// Append a record, rotating the live file first if it has grown past the size limit.
    pub async fn write(&self, record: &DeadLetterRecord) -> Result<(), DlqError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;

        match tokio::fs::metadata(&self.path).await {
            Ok(metadata) if metadata.len() > self.max_file_bytes => self.rotate().await?,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;

        self.size.fetch_add(1, Ordering::SeqCst);
        self.publish_size();

        warn!(
            event_id = %record.event_id,
            correlation_id = %record.correlation_id,
            reason = %record.failure_reason,
            retry_count = record.retry_count,
            "event moved to dead letter store"
        );
        Ok(())
    }

    /// Must be called with the store lock held.
    async fn rotate(&self) -> Result<(), DlqError> {
        let stamp = Utc::now().timestamp_millis();
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dlq.jsonl".to_owned());
        let rotated = self.path.with_file_name(format!("{file_name}.{stamp}"));
        let archive = self.path.with_file_name(format!("{file_name}.{stamp}.gz"));

        tokio::fs::rename(&self.path, &rotated).await?;
        self.size.store(0, Ordering::SeqCst);
        self.publish_size();

        let source = rotated.clone();
        let target = archive.clone();
        tokio::task::spawn_blocking(move || compress(&source, &target)).await??;

        metrics::counter!(DLQ_ROTATIONS_TOTAL).increment(1);
        info!(archive = %archive.display(), "dead letter file rotated");
        Ok(())
    }

    /// A page of records in file order, oldest first. Lines that no longer parse are skipped.
    pub async fn read(&self, limit: usize, offset: usize) -> Result<Vec<DeadLetterRecord>, DlqError> {
        let contents = {
            let _guard = self.lock.lock().await;
            match tokio::fs::read_to_string(&self.path).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            }
        };

        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .skip(offset)
            .take(limit)
            .filter_map(parse_line)
            .collect())
    }

    /// Hand every record matching `predicate` to `handler`, then drop the records the handler
    /// accepted from the live file. Returns how many were accepted.
    ///
    /// Handlers run without the store lock so that they may write new dead letters. Only the
    /// exact lines that were replayed are removed afterwards; anything appended meanwhile stays.
    pub async fn replay<P, H, Fut, E>(&self, predicate: P, mut handler: H) -> Result<usize, DlqError>
    where
        P: Fn(&DeadLetterRecord) -> bool,
        H: FnMut(DeadLetterRecord) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let snapshot = {
            let _guard = self.lock.lock().await;
            match tokio::fs::read_to_string(&self.path).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
                Err(e) => return Err(e.into()),
            }
        };

        let mut replayed: HashMap<String, usize> = HashMap::new();
        let mut count = 0;

        for line in snapshot.lines().filter(|line| !line.trim().is_empty()) {
            let Some(record) = parse_line(line) else {
                continue;
            };
            if !predicate(&record) {
                continue;
            }

            let event_id = record.event_id;
            match handler(record).await {
                Ok(()) => {
                    *replayed.entry(line.to_owned()).or_default() += 1;
                    count += 1;
                }
                Err(e) => warn!(event_id = %event_id, "dead letter replay failed: {}", e),
            }
        }

        if count == 0 {
            return Ok(0);
        }

        let _guard = self.lock.lock().await;
        let current = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut kept = String::with_capacity(current.len());
        let mut remaining = 0;
        for line in current.lines().filter(|line| !line.trim().is_empty()) {
            if let Some(pending) = replayed.get_mut(line) {
                if *pending > 0 {
                    *pending -= 1;
                    continue;
                }
            }
            kept.push_str(line);
            kept.push('\n');
            remaining += 1;
        }

        self.rewrite(&kept).await?;
        self.size.store(remaining, Ordering::SeqCst);
        self.publish_size();

        info!(replayed = count, remaining, "dead letter replay finished");
        Ok(count)
    }

    /// Remove every record from the live file. Archives are left alone.
    pub async fn clear(&self) -> Result<(), DlqError> {
        let _guard = self.lock.lock().await;
        self.rewrite("").await?;
        self.size.store(0, Ordering::SeqCst);
        self.publish_size();
        info!(path = %self.path.display(), "dead letter store cleared");
        Ok(())
    }

    /// Replace the live file through a temporary file and a rename.
    async fn rewrite(&self, contents: &str) -> Result<(), DlqError> {
        let tmp = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn count_lines(contents: &str) -> u64 {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .fold(0, |count, _| count + 1)
}

fn parse_line(line: &str) -> Option<DeadLetterRecord> {
    match serde_json::from_str(line) {
        Ok(record) => Some(record),
        Err(e) => {
            error!("skipping unreadable dead letter line: {}", e);
            None
        }
    }
}

fn compress(source: &Path, target: &Path) -> std::io::Result<()> {
    let mut input = std::fs::File::open(source)?;
    let output = std::fs::File::create(target)?;

    let mut encoder = GzEncoder::new(output, Compression::default());
    std::io::copy(&mut input, &mut encoder)?;
    encoder.flush()?;
    encoder.finish()?.sync_all()?;

    std::fs::remove_file(source)
}
