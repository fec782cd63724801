//! Inbox watcher: polling producer side of the pipeline.
//!
//! Polling instead of inotify keeps the behavior identical on network
//! mounts, where scanners and phones usually drop their files. A file is
//! only emitted once its (size, mtime) pair has survived one full poll
//! interval unchanged, so half-written uploads are never picked up.

use anyhow::{Context, Result};
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::config::WatcherConfig;
use crate::models::IntakeEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
struct SeenEntry {
    size: u64,
    mtime: SystemTime,
    emitted: bool,
}

pub struct Watcher {
    inbox: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    poll_interval: Duration,
    seen: HashMap<PathBuf, SeenEntry>,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

impl Watcher {
    pub fn new(inbox: impl Into<PathBuf>, cfg: &WatcherConfig) -> Result<Self> {
        Ok(Self {
            inbox: inbox.into(),
            include: build_globset(&cfg.include_globs)?,
            exclude: build_globset(&cfg.exclude_globs)?,
            poll_interval: Duration::from_secs(cfg.poll_interval_secs),
            seen: HashMap::new(),
        })
    }

    fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name() else {
            return false;
        };
        self.include.is_match(name) && !self.exclude.is_match(name)
    }

    /// One poll pass. Returns events for files that are new and stable
    /// since the previous pass; prunes entries whose files vanished
    /// (moved away by the processor, or deleted by hand) so a later file
    /// at the same path is treated as new.
    pub fn scan(&mut self) -> Result<Vec<IntakeEvent>> {
        let mut events = Vec::new();
        let mut present: Vec<PathBuf> = Vec::new();

        for entry in WalkDir::new(&self.inbox).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    tracing::warn!(error = %err, "inbox walk error");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path().to_path_buf();
            if !self.matches(&path) {
                continue;
            }

            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "stat failed");
                    continue;
                }
            };
            let size = meta.len();
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            present.push(path.clone());

            match self.seen.get_mut(&path) {
                None => {
                    // First sighting: remember it, emit on the next pass
                    // once it has stopped growing.
                    self.seen.insert(
                        path,
                        SeenEntry {
                            size,
                            mtime,
                            emitted: false,
                        },
                    );
                }
                Some(entry) if entry.size != size || entry.mtime != mtime => {
                    entry.size = size;
                    entry.mtime = mtime;
                    entry.emitted = false;
                }
                Some(entry) if !entry.emitted => {
                    entry.emitted = true;
                    events.push(IntakeEvent {
                        path,
                        discovered_at: Utc::now(),
                    });
                }
                Some(_) => {}
            }
        }

        self.seen.retain(|path, _| present.contains(path));
        Ok(events)
    }

    /// Producer loop: poll the inbox until the consumer side hangs up.
    pub async fn run(mut self, tx: mpsc::Sender<IntakeEvent>) -> Result<()> {
        tracing::info!(inbox = %self.inbox.display(), "watching inbox");
        loop {
            match self.scan() {
                Ok(events) => {
                    for event in events {
                        tracing::info!(path = %event.path.display(), "file discovered");
                        if tx.send(event).await.is_err() {
                            tracing::info!("intake channel closed, watcher stopping");
                            return Ok(());
                        }
                    }
                }
                Err(err) => tracing::error!(error = %err, "inbox scan failed"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn watcher(inbox: &Path) -> Watcher {
        Watcher::new(inbox, &WatcherConfig::default()).unwrap()
    }

    #[test]
    fn emits_stable_files_exactly_once() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.pdf"), b"bytes").unwrap();
        let mut w = watcher(tmp.path());

        // First pass observes, second pass emits, third is quiet.
        assert!(w.scan().unwrap().is_empty());
        let events = w.scan().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, tmp.path().join("a.pdf"));
        assert!(w.scan().unwrap().is_empty());
    }

    #[test]
    fn growing_file_is_held_back() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("upload.pdf");
        std::fs::write(&path, b"part").unwrap();
        let mut w = watcher(tmp.path());

        assert!(w.scan().unwrap().is_empty());
        // The file grows between polls; emission is postponed.
        std::fs::write(&path, b"part and the rest").unwrap();
        assert!(w.scan().unwrap().is_empty());
        assert_eq!(w.scan().unwrap().len(), 1);
    }

    #[test]
    fn non_matching_extensions_are_ignored() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"x").unwrap();
        std::fs::write(tmp.path().join("scan.tiff"), b"x").unwrap();
        let mut w = watcher(tmp.path());

        w.scan().unwrap();
        let events = w.scan().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].path.ends_with("scan.tiff"));
    }

    #[test]
    fn vanished_path_is_pruned_and_reusable() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.pdf");
        std::fs::write(&path, b"first").unwrap();
        let mut w = watcher(tmp.path());
        w.scan().unwrap();
        assert_eq!(w.scan().unwrap().len(), 1);

        // Processor moved the file away; a new upload under the same
        // name must go through the full cycle again.
        std::fs::remove_file(&path).unwrap();
        assert!(w.scan().unwrap().is_empty());
        std::fs::write(&path, b"second").unwrap();
        assert!(w.scan().unwrap().is_empty());
        assert_eq!(w.scan().unwrap().len(), 1);
    }
}
