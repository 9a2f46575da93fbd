//! Non-blocking inotify watch on a directory, optionally extended to a few
//! more directories sharing the same mask.

use anyhow::{anyhow, Result};
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

use crate::error::WatchSetupError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file in a watched directory matched the watch mask.
    File(PathBuf),
    /// An entry was created (only reported when the mask asks for `IN_CREATE`).
    Created(PathBuf),
    /// The kernel queue overflowed; events were lost and the directory must be rescanned.
    Overflow,
}

pub struct DirWatch {
    inotify: Inotify,
    mask: AddWatchFlags,
    /// The first entry is the directory the watch was created for.
    dirs: Vec<(WatchDescriptor, PathBuf)>,
}

impl DirWatch {
    pub fn new(dir: &Path, mask: AddWatchFlags) -> Result<Self, WatchSetupError> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC).map_err(|e| {
            WatchSetupError {
                path: dir.to_path_buf(),
                reason: format!("inotify init failed: {}", e),
            }
        })?;
        let mut watch = Self {
            inotify,
            mask,
            dirs: Vec::new(),
        };
        watch.add_dir(dir)?;
        Ok(watch)
    }

    /// Watch for files that are complete: closed after writing or renamed into place.
    pub fn completed_files(dir: &Path) -> Result<Self, WatchSetupError> {
        Self::new(dir, AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO)
    }

    /// Also watch `dir` with the same mask. Returns false when the directory
    /// was already watched (possibly under another name).
    pub fn add_dir(&mut self, dir: &Path) -> Result<bool, WatchSetupError> {
        let wd = self
            .inotify
            .add_watch(dir, self.mask | AddWatchFlags::IN_ONLYDIR)
            .map_err(|e| WatchSetupError {
                path: dir.to_path_buf(),
                reason: format!("inotify add watch failed: {}", e),
            })?;
        if self.dirs.iter().any(|(known, _)| *known == wd) {
            return Ok(false);
        }
        self.dirs.push((wd, dir.to_path_buf()));
        Ok(true)
    }

    pub fn dir(&self) -> &Path {
        &self.dirs[0].1
    }

    /// Drain every queued event without blocking.
    pub fn read(&self) -> Result<Vec<WatchEvent>> {
        let mut out = Vec::new();
        loop {
            let events = match self.inotify.read_events() {
                Ok(events) => events,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(anyhow!("inotify read failed on {}: {}", self.dir().display(), e)),
            };
            if events.is_empty() {
                break;
            }
            for event in events {
                if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                    out.push(WatchEvent::Overflow);
                    continue;
                }
                if event.mask.contains(AddWatchFlags::IN_ISDIR) {
                    continue;
                }
                let Some(dir) = self
                    .dirs
                    .iter()
                    .find(|(wd, _)| *wd == event.wd)
                    .map(|(_, dir)| dir)
                else {
                    continue;
                };
                let Some(name) = event.name else {
                    continue;
                };
                let path = dir.join(name);
                if event.mask.contains(AddWatchFlags::IN_CREATE) {
                    out.push(WatchEvent::Created(path));
                } else {
                    out.push(WatchEvent::File(path));
                }
            }
        }
        Ok(out)
    }
}

impl AsFd for DirWatch {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inotify.as_fd()
    }
}
