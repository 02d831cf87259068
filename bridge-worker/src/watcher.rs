//! Polls the source directory for new or changed XML files and hands their decoded events
//! to the delivery side as batches.
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bridge_common::event::IntakeEvent;
use bridge_common::metrics::SOURCE_FILES_TOTAL;
use encoding_rs::Encoding;
use futures::FutureExt;
use globset::{Glob, GlobMatcher};
use health::HealthHandle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{RuntimeSettings, WatchSettings};
use crate::decoder::EventDecoder;
use crate::error::SourceError;
use crate::notify::Notifier;

pub const MAX_STABILITY_CHECKS: u32 = 10;

/// Decoded events of one source file.
#[derive(Debug, Clone)]
pub struct FileBatch {
    pub source_file: String,
    pub events: Vec<IntakeEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

/// Everything one file task needs, captured when the file is picked up.
#[derive(Clone)]
struct FileReader {
    encoding: &'static Encoding,
    decoder: EventDecoder,
    quiescence: Duration,
    max_file_bytes: u64,
}

impl FileReader {
    /// Wait until two consecutive samples taken `quiescence` apart agree.
    async fn wait_until_stable(&self, path: &Path) -> Result<FileStamp, SourceError> {
        let mut previous = None;

        for _ in 0..MAX_STABILITY_CHECKS {
            let metadata = tokio::fs::metadata(path)
                .await
                .map_err(|error| io_error(path, error))?;

            if metadata.len() > self.max_file_bytes {
                return Err(SourceError::TooLarge {
                    path: path.to_path_buf(),
                    size: metadata.len(),
                    limit: self.max_file_bytes,
                });
            }

            let stamp = FileStamp::of(&metadata);
            if previous == Some(stamp) {
                return Ok(stamp);
            }
            previous = Some(stamp);
            tokio::time::sleep(self.quiescence).await;
        }

        Err(SourceError::Unstable {
            path: path.to_path_buf(),
            checks: MAX_STABILITY_CHECKS,
        })
    }

    async fn load(&self, path: &Path) -> Result<(FileStamp, Vec<IntakeEvent>), SourceError> {
        let stamp = self.wait_until_stable(path).await?;

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|error| io_error(path, error))?;
        let (text, encoding, had_errors) = self.encoding.decode(&bytes);
        if had_errors {
            warn!(
                source_file = %path.display(),
                encoding = encoding.name(),
                "source file contains invalid sequences, replaced"
            );
        }

        let events = self
            .decoder
            .decode(&text, &path.display().to_string())
            .map_err(|error| SourceError::Decode {
                path: path.to_path_buf(),
                error,
            })?;

        Ok((stamp, events))
    }
}

fn io_error(path: &Path, error: std::io::Error) -> SourceError {
    SourceError::Io {
        path: path.to_path_buf(),
        error,
    }
}

fn outcome(error: &SourceError) -> &'static str {
    match error {
        SourceError::Io { .. } => "io_error",
        SourceError::TooLarge { .. } => "too_large",
        SourceError::Unstable { .. } => "unstable",
        SourceError::Decode { .. } => "decode_error",
        SourceError::Pattern { .. } => "pattern_error",
    }
}

pub fn compile_pattern(pattern: &str) -> Result<GlobMatcher, SourceError> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|e| SourceError::Pattern {
            pattern: pattern.to_owned(),
            message: e.to_string(),
        })
}

pub struct SourceWatcher {
    settings: watch::Receiver<RuntimeSettings>,
    encoding: &'static Encoding,
    record_tag: Option<String>,
    sender: mpsc::Sender<FileBatch>,
    notifier: Notifier,
    liveness: HealthHandle,
    seen: HashMap<PathBuf, FileStamp>,
    in_flight: HashSet<PathBuf>,
}

impl SourceWatcher {
    pub fn new(
        settings: watch::Receiver<RuntimeSettings>,
        encoding: &'static Encoding,
        record_tag: Option<String>,
        sender: mpsc::Sender<FileBatch>,
        notifier: Notifier,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            settings,
            encoding,
            record_tag,
            sender,
            notifier,
            liveness,
            seen: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    /// Poll until `shutdown` is cancelled. Files already being read when the watch is
    /// re-established or shut down are finished first.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), SourceError> {
        let mut current = self.settings.borrow_and_update().clone();
        let mut matcher = compile_pattern(&current.watch.file_pattern)?;
        let mut interval = polling_timer(current.watch.polling_interval);
        let mut tasks: JoinSet<(PathBuf, Option<FileStamp>)> = JoinSet::new();

        info!(
            directory = %current.watch.directory.display(),
            pattern = %current.watch.file_pattern,
            "source watcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                _ = interval.tick() => {
                    self.liveness.report_healthy().await;
                    self.scan(&current, &matcher, &mut tasks).await;
                }

                changed = self.settings.changed() => {
                    if changed.is_err() {
                        warn!("configuration provider is gone, stopping source watcher");
                        break;
                    }

                    let next = self.settings.borrow_and_update().clone();
                    if next.watch.directory != current.watch.directory
                        || next.watch.file_pattern != current.watch.file_pattern
                    {
                        match compile_pattern(&next.watch.file_pattern) {
                            Ok(next_matcher) => {
                                matcher = next_matcher;
                                self.seen.clear();
                                info!(
                                    directory = %next.watch.directory.display(),
                                    pattern = %next.watch.file_pattern,
                                    "source watch re-established"
                                );
                            }
                            Err(e) => {
                                error!("keeping the previous source watch: {}", e);
                                self.notifier.publish_error(e.to_string());
                                continue;
                            }
                        }
                    }
                    if next.watch.polling_interval != current.watch.polling_interval {
                        interval = polling_timer(next.watch.polling_interval);
                    }
                    current = next;
                }

                Some(joined) = tasks.join_next() => self.finish(joined),
            }
        }

        while let Some(joined) = tasks.join_next().await {
            self.finish(joined);
        }
        info!("source watcher stopped");
        Ok(())
    }

    async fn scan(
        &mut self,
        settings: &RuntimeSettings,
        matcher: &GlobMatcher,
        tasks: &mut JoinSet<(PathBuf, Option<FileStamp>)>,
    ) {
        let watch = &settings.watch;
        let mut entries = match tokio::fs::read_dir(&watch.directory).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    directory = %watch.directory.display(),
                    "failed to list source directory: {}",
                    e
                );
                return;
            }
        };

        let mut listed = HashSet::new();
        let complete = loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break true,
                Err(e) => {
                    warn!("failed to list source directory: {}", e);
                    break false;
                }
            };

            if !matcher.is_match(entry.file_name()) {
                continue;
            }
            let path = entry.path();
            listed.insert(path.clone());
            if self.in_flight.contains(&path) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() || self.seen.get(&path) == Some(&FileStamp::of(&metadata)) {
                continue;
            }

            debug!(source_file = %path.display(), "source file detected");
            self.in_flight.insert(path.clone());
            tasks.spawn(handle_file(
                self.reader(settings, watch),
                path,
                self.sender.clone(),
                self.notifier.clone(),
            ));
        };

        // Forget files that are gone; a partial listing cannot tell.
        if complete {
            self.seen.retain(|path, _| listed.contains(path));
        }
    }

    fn reader(&self, settings: &RuntimeSettings, watch: &WatchSettings) -> FileReader {
        FileReader {
            encoding: self.encoding,
            decoder: EventDecoder::new(self.record_tag.clone(), settings.max_events_per_file),
            quiescence: watch.polling_interval / 2,
            max_file_bytes: watch.max_file_bytes,
        }
    }

    fn finish(&mut self, joined: Result<(PathBuf, Option<FileStamp>), tokio::task::JoinError>) {
        match joined {
            Ok((path, stamp)) => {
                self.in_flight.remove(&path);
                if let Some(stamp) = stamp {
                    self.seen.insert(path, stamp);
                }
            }
            Err(e) => error!("source file task did not complete: {}", e),
        }
    }
}

fn polling_timer(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Read, decode and forward one file. Returns the path with the stamp it was handled at, so
/// the file is not picked up again until it changes.
async fn handle_file(
    reader: FileReader,
    path: PathBuf,
    sender: mpsc::Sender<FileBatch>,
    notifier: Notifier,
) -> (PathBuf, Option<FileStamp>) {
    let source_file = path.display().to_string();

    let loaded = match AssertUnwindSafe(reader.load(&path)).catch_unwind().await {
        Ok(loaded) => loaded,
        Err(_) => {
            error!(%source_file, "source file task panicked");
            metrics::counter!(SOURCE_FILES_TOTAL, &[("outcome", "panicked")]).increment(1);
            return (path, None);
        }
    };

    match loaded {
        Ok((stamp, events)) if events.is_empty() => {
            debug!(%source_file, "source file holds no events");
            metrics::counter!(SOURCE_FILES_TOTAL, &[("outcome", "empty")]).increment(1);
            (path, Some(stamp))
        }
        Ok((stamp, events)) => {
            info!(%source_file, events = events.len(), "source file decoded");
            metrics::counter!(SOURCE_FILES_TOTAL, &[("outcome", "decoded")]).increment(1);
            if sender.send(FileBatch { source_file, events }).await.is_err() {
                warn!(source_file = %path.display(), "batch receiver is gone, file dropped");
                return (path, None);
            }
            (path, Some(stamp))
        }
        Err(e) => {
            error!(%source_file, "failed to process source file: {}", e);
            metrics::counter!(SOURCE_FILES_TOTAL, &[("outcome", outcome(&e))]).increment(1);
            notifier.publish_error(e.to_string());

            let stamp = tokio::fs::metadata(&path)
                .await
                .ok()
                .map(|metadata| FileStamp::of(&metadata));
            (path, stamp)
        }
    }
}
