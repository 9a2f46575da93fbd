//! Background jobs for blocking work (firewall setup and teardown).
//!
//! Each job runs on its own thread. The owning component polls
//! [`JobPool::poll_finished`] from the hub tick, so results are always
//! consumed on the loop thread.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Cooperative cancellation flag shared with a running job.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Running<T> {
    name: String,
    cancel: CancelToken,
    handle: JoinHandle<Result<T>>,
}

pub struct JobPool<T> {
    next_id: u64,
    running: BTreeMap<JobId, Running<T>>,
}

impl<T: Send + 'static> JobPool<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            running: BTreeMap::new(),
        }
    }

    pub fn submit<F>(&mut self, name: &str, work: F) -> Result<JobId>
    where
        F: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
    {
        self.next_id += 1;
        let id = JobId(self.next_id);
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-{}", name, id))
            .spawn(move || work(&token))
            .map_err(|e| anyhow!("failed to spawn {}: {}", name, e))?;
        log::debug!("started {} ({})", id, name);
        self.running.insert(
            id,
            Running {
                name: name.to_string(),
                cancel,
                handle,
            },
        );
        Ok(id)
    }

    /// Ask a job to stop; returns false for unknown or already collected jobs.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.running.get(&id) {
            Some(job) => {
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for job in self.running.values() {
            job.cancel.cancel();
        }
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.running.contains_key(&id)
    }

    /// Collect the results of every job whose thread has finished.
    pub fn poll_finished(&mut self) -> Vec<(JobId, Result<T>)> {
        let done: Vec<JobId> = self
            .running
            .iter()
            .filter(|(_, job)| job.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        let mut results = Vec::with_capacity(done.len());
        for id in done {
            let Some(job) = self.running.remove(&id) else {
                continue;
            };
            let result = job
                .handle
                .join()
                .unwrap_or_else(|_| Err(anyhow!("{} ({}) panicked", id, job.name)));
            log::debug!("finished {} ({})", id, job.name);
            results.push((id, result));
        }
        results
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}

impl<T: Send + 'static> Default for JobPool<T> {
    fn default() -> Self {
        Self::new()
    }
}
