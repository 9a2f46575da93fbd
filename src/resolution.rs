//! Resolution drop files and the ingestor that feeds them to the allow-list.
//!
//! The resolver writes one JSON file per answered query into a watched
//! directory, e.g. `[{"TTL": 86252, "A": "209.82.215.200", "AAAA": null}]`.
//! Each completed file is parsed, its A records are allowed in list order, and
//! the file is deleted whatever its content.

use anyhow::{anyhow, Context as _, Result};
use nix::fcntl::OFlag;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::net::Ipv6Addr;
use std::os::fd::BorrowedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::allowlist::{AllowListEngine, AllowOutcome};
use crate::error::MalformedRecord;
use crate::hub::{Component, Context};
use crate::watch::{DirWatch, WatchEvent};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    #[serde(rename = "TTL")]
    pub ttl: i64,
    #[serde(rename = "A", default)]
    pub a: Option<String>,
    #[serde(rename = "AAAA", default)]
    pub aaaa: Option<String>,
}

impl ResolutionRecord {
    pub fn v4(ttl: i64, address: &str) -> Self {
        Self {
            ttl,
            a: Some(address.to_string()),
            aaaa: None,
        }
    }

    pub fn v6(ttl: i64, address: &str) -> Self {
        Self {
            ttl,
            a: None,
            aaaa: Some(address.to_string()),
        }
    }
}

/// Parse a drop file.
///
/// The outer error means the file as a whole is unusable; otherwise every
/// array entry is parsed on its own so one bad entry does not hide the rest.
pub fn parse_drop_file(
    content: &str,
) -> Result<Vec<Result<ResolutionRecord, MalformedRecord>>, MalformedRecord> {
    let entries: Vec<serde_json::Value> =
        serde_json::from_str(content).map_err(|e| MalformedRecord {
            index: None,
            reason: e.to_string(),
        })?;
    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            serde_json::from_value(entry).map_err(|e| MalformedRecord {
                index: Some(index),
                reason: e.to_string(),
            })
        })
        .collect())
}

/// Write `records` into `dir` the way the resolver does: stage under a
/// temporary name, then rename into place so watchers never see a partial file.
pub fn write_drop_file(dir: &Path, records: &[ResolutionRecord]) -> Result<PathBuf> {
    let json = serde_json::to_vec(records)?;
    let mut staged = tempfile::Builder::new()
        .prefix(".staged-")
        .tempfile_in(dir)
        .with_context(|| format!("cannot stage drop file in {}", dir.display()))?;
    staged.write_all(&json)?;
    staged.flush()?;
    let staged_name = staged
        .path()
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("temporary file has no usable name"))?
        .to_string();
    let target = dir.join(format!(
        "resolved-{}",
        staged_name.trim_start_matches(".staged-")
    ));
    staged
        .persist(&target)
        .map_err(|e| anyhow!("cannot publish {}: {}", target.display(), e.error))?;
    Ok(target)
}

/// Outcome of ingesting one drop file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub records: usize,
    /// A records now permitted (installed, refreshed or already current).
    pub allowed: usize,
    /// A records the firewall refused.
    pub failed: usize,
    /// AAAA records recognised and left alone.
    pub ignored_v6: usize,
    pub malformed: usize,
    pub deleted: bool,
}

/// Watches the resolver's drop directory and feeds the allow-list.
pub struct ResolutionIngestor {
    watch: DirWatch,
    engine: AllowListEngine,
    stopped: bool,
}

impl ResolutionIngestor {
    /// Start watching `dir`. Failing to watch is fatal: the VM must not run
    /// without enforcement.
    ///
    /// Files already present are stale (their resolution time is unknown)
    /// and are deleted without being acted upon.
    pub fn new(engine: AllowListEngine, dir: &Path) -> Result<Self> {
        let watch = DirWatch::completed_files(dir)?;
        let mut ingestor = Self {
            watch,
            engine,
            stopped: false,
        };
        ingestor.purge_stale()?;
        log::info!(
            "watching {} for resolutions, allowing into {}",
            dir.display(),
            ingestor.engine.chain()
        );
        Ok(ingestor)
    }

    pub fn dir(&self) -> &Path {
        self.watch.dir()
    }

    pub fn engine(&self) -> &AllowListEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut AllowListEngine {
        &mut self.engine
    }

    /// Handle every queued directory event; returns the number of files ingested.
    pub fn process_pending(&mut self) -> usize {
        if self.stopped {
            return 0;
        }
        let events = match self.watch.read() {
            Ok(events) => events,
            Err(e) => {
                log::error!("{}", e);
                return 0;
            }
        };
        let mut ingested = 0;
        for event in events {
            match event {
                WatchEvent::File(path) => {
                    if self.ingest_if_present(&path) {
                        ingested += 1;
                    }
                }
                WatchEvent::Overflow => {
                    log::warn!("inotify queue overflow on {}, rescanning", self.dir().display());
                    ingested += self.rescan();
                }
                WatchEvent::Created(_) => {}
            }
        }
        ingested
    }

    /// Ingest every file currently in the directory, oldest first.
    pub fn rescan(&mut self) -> usize {
        let files = match list_files(self.dir()) {
            Ok(files) => files,
            Err(e) => {
                log::error!("cannot rescan {}: {:#}", self.dir().display(), e);
                return 0;
            }
        };
        files
            .into_iter()
            .filter(|path| self.ingest_if_present(path))
            .count()
    }

    /// Ingest one drop file and delete it.
    pub fn process_file(&mut self, path: &Path) -> IngestReport {
        log::info!("Detected new allowed IP info (file '{}')", path.display());
        let mut report = IngestReport::default();
        match read_regular_file(path) {
            Ok(content) => self.apply(&content, path, &mut report),
            Err(e) => {
                log::warn!("Error reading file '{}': {}", path.display(), e);
                report.malformed += 1;
            }
        }
        match std::fs::remove_file(path) {
            Ok(()) => report.deleted = true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => report.deleted = true,
            Err(e) => log::warn!("Error removing file '{}': {}", path.display(), e),
        }
        report
    }

    pub fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.engine.stop();
            log::info!("stopped watching {}", self.dir().display());
        }
    }

    fn ingest_if_present(&mut self, path: &Path) -> bool {
        // Close and rename events can both arrive for one file.
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => false,
            Ok(_) => {
                self.process_file(path);
                true
            }
            Err(_) => {
                log::debug!("'{}' already consumed", path.display());
                false
            }
        }
    }

    fn apply(&mut self, content: &str, path: &Path, report: &mut IngestReport) {
        let entries = match parse_drop_file(content) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Error treating file '{}': {}", path.display(), e);
                report.malformed += 1;
                return;
            }
        };
        report.records = entries.len();
        for entry in entries {
            let record = match entry {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("Error treating file '{}': {}", path.display(), e);
                    report.malformed += 1;
                    continue;
                }
            };
            if let Some(aaaa) = record.aaaa.as_deref() {
                match aaaa.trim().parse::<Ipv6Addr>() {
                    Ok(v6) => log::debug!("not acting on AAAA {} (TTL {})", v6, record.ttl),
                    Err(_) => log::warn!("ignoring invalid AAAA '{}'", aaaa),
                }
                report.ignored_v6 += 1;
            }
            if let Some(a) = record.a.as_deref() {
                match self.engine.allow(a, record.ttl) {
                    AllowOutcome::Installed { .. }
                    | AllowOutcome::Refreshed { .. }
                    | AllowOutcome::Unchanged => report.allowed += 1,
                    AllowOutcome::Rejected => report.malformed += 1,
                    AllowOutcome::Failed => report.failed += 1,
                    AllowOutcome::Stopped => {}
                }
            }
        }
    }

    fn purge_stale(&mut self) -> Result<()> {
        for path in list_files(self.dir())? {
            log::info!("removing stale resolution file '{}'", path.display());
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("cannot remove '{}': {}", path.display(), e);
            }
        }
        Ok(())
    }
}

/// Read a drop file without following a symlink or blocking on a FIFO.
fn read_regular_file(path: &Path) -> std::io::Result<String> {
    let mut file = OpenOptions::new()
        .read(true)
        .custom_flags((OFlag::O_NOFOLLOW | OFlag::O_NONBLOCK).bits())
        .open(path)?;
    if !file.metadata()?.is_file() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    Ok(content)
}

/// Non-directory entries of `dir` (symlinks not followed), oldest
/// modification first.
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("cannot list {}", dir.display()))? {
        let entry = entry?;
        let meta = std::fs::symlink_metadata(entry.path())?;
        if !meta.is_dir() {
            files.push((meta.modified().ok(), entry.path()));
        }
    }
    files.sort();
    Ok(files.into_iter().map(|(_, path)| path).collect())
}

impl Component for ResolutionIngestor {
    fn name(&self) -> String {
        format!("resolutions:{}", self.dir().display())
    }

    fn fd(&self) -> Option<BorrowedFd<'_>> {
        use std::os::fd::AsFd;
        Some(self.watch.as_fd())
    }

    fn on_readable(&mut self, _cx: &mut Context<'_>) {
        self.process_pending();
    }

    fn next_wakeup(&self) -> Option<u64> {
        self.engine.next_wakeup()
    }

    fn on_wakeup(&mut self, _cx: &mut Context<'_>) {
        self.engine.on_expiry();
    }

    fn on_unregistered(&mut self) {
        self.stop();
    }
}
