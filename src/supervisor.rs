//! VM session supervision.
//!
//! A session owns one enforcement point: a firewall chain plus the directory
//! its resolver drops resolutions into. Bringing the point up or down is
//! blocking work, so it runs as a background job; once the start job
//! completes the supervisor registers a [`ResolutionIngestor`] on the hub, and
//! at shutdown it unregisters the ingestor before tearing the chain down.

use anyhow::{anyhow, Context as _, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::allowlist::{AllowListEngine, ExpiryPolicy};
use crate::clock::Clock;
use crate::firewall::{ChainRef, FirewallBackend};
use crate::hub::{Component, ComponentId, Context};
use crate::jobs::{CancelToken, JobId, JobPool};
use crate::resolution::ResolutionIngestor;

/// Where a running session enforces its allow-list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnforcementPoint {
    pub chain: ChainRef,
    pub watch_dir: PathBuf,
}

/// Boundary to whatever creates and destroys the VM's enforcement point.
///
/// Both calls run on worker threads.
pub trait VmLifecycle: Send + Sync {
    fn start(&self, cancel: &CancelToken) -> Result<EnforcementPoint>;
    fn stop(&self, point: &EnforcementPoint) -> Result<()>;
}

/// Standalone lifecycle: the daemon creates the chain and the drop directory
/// itself and deletes the chain when the session ends.
pub struct ChainLifecycle {
    backend: Arc<dyn FirewallBackend>,
    table: String,
    chain: String,
    watch_dir: PathBuf,
}

impl ChainLifecycle {
    pub fn new(
        backend: Arc<dyn FirewallBackend>,
        table: &str,
        chain: &str,
        watch_dir: PathBuf,
    ) -> Self {
        Self {
            backend,
            table: table.to_string(),
            chain: chain.to_string(),
            watch_dir,
        }
    }
}

impl VmLifecycle for ChainLifecycle {
    fn start(&self, cancel: &CancelToken) -> Result<EnforcementPoint> {
        fs::create_dir_all(&self.watch_dir)
            .with_context(|| format!("cannot create {}", self.watch_dir.display()))?;
        // The resolver runs as another user and must be able to drop files;
        // sticky, so it cannot remove or replace entries it does not own.
        fs::set_permissions(&self.watch_dir, fs::Permissions::from_mode(0o1777))
            .with_context(|| format!("cannot open up {}", self.watch_dir.display()))?;
        if cancel.is_cancelled() {
            return Err(anyhow!("start cancelled"));
        }
        let chain = self.backend.ensure_chain_exists(&self.table, &self.chain)?;
        Ok(EnforcementPoint {
            chain,
            watch_dir: self.watch_dir.clone(),
        })
    }

    fn stop(&self, point: &EnforcementPoint) -> Result<()> {
        self.backend.delete_chain(&point.chain)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Read-only view of a supervisor's state, usable after the supervisor was
/// handed to the hub.
#[derive(Clone, Debug)]
pub struct SessionMonitor(Arc<Mutex<SessionState>>);

impl SessionMonitor {
    pub fn state(&self) -> SessionState {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set(&self, state: SessionState) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }
}

enum Transition {
    Started(EnforcementPoint),
    Stopped,
}

pub struct Supervisor {
    name: String,
    lifecycle: Arc<dyn VmLifecycle>,
    backend: Arc<dyn FirewallBackend>,
    clock: Arc<dyn Clock>,
    policy: ExpiryPolicy,
    jobs: JobPool<Transition>,
    start_job: Option<JobId>,
    stop_job: Option<JobId>,
    point: Option<EnforcementPoint>,
    ingestor: Option<ComponentId>,
    state: SessionState,
    monitor: SessionMonitor,
}

impl Supervisor {
    pub fn new(
        name: &str,
        lifecycle: Arc<dyn VmLifecycle>,
        backend: Arc<dyn FirewallBackend>,
        clock: Arc<dyn Clock>,
        policy: ExpiryPolicy,
    ) -> Self {
        Self {
            name: name.to_string(),
            lifecycle,
            backend,
            clock,
            policy,
            jobs: JobPool::new(),
            start_job: None,
            stop_job: None,
            point: None,
            ingestor: None,
            state: SessionState::Stopped,
            monitor: SessionMonitor(Arc::new(Mutex::new(SessionState::Stopped))),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn monitor(&self) -> SessionMonitor {
        self.monitor.clone()
    }

    pub fn enforcement_point(&self) -> Option<&EnforcementPoint> {
        self.point.as_ref()
    }

    /// Submit the start job; the session runs once the hub tick sees it finish.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Stopped {
            return Err(anyhow!("session {} is {:?}", self.name, self.state));
        }
        let lifecycle = self.lifecycle.clone();
        let id = self.jobs.submit("session-start", move |cancel| {
            lifecycle.start(cancel).map(Transition::Started)
        })?;
        self.start_job = Some(id);
        self.transition(SessionState::Starting, "starting");
        Ok(())
    }

    fn transition(&mut self, state: SessionState, signal: &str) {
        self.state = state;
        self.monitor.set(state);
        log::info!("session {}: {}", self.name, signal);
    }

    /// Enter `Failed` and make the hub wind the process down.
    fn fail(&mut self, signal: &str, error: anyhow::Error, cx: &mut Context<'_>) {
        self.transition(SessionState::Failed, signal);
        cx.fail(format!("session {}: {}: {:#}", self.name, signal, error));
    }

    fn begin_stop(&mut self, point: EnforcementPoint, cx: &mut Context<'_>) {
        let lifecycle = self.lifecycle.clone();
        let job = self.jobs.submit("session-stop", move |_| {
            lifecycle.stop(&point).map(|()| Transition::Stopped)
        });
        match job {
            Ok(id) => self.stop_job = Some(id),
            Err(e) => self.fail("stop_error", e.context("cannot stop"), cx),
        }
    }

    fn attach(&mut self, point: EnforcementPoint, cx: &mut Context<'_>) {
        let engine = AllowListEngine::new(
            self.backend.clone(),
            point.chain.clone(),
            self.clock.clone(),
            self.policy,
        );
        match ResolutionIngestor::new(engine, &point.watch_dir) {
            Ok(ingestor) => {
                self.ingestor = Some(cx.register(Box::new(ingestor)));
                self.point = Some(point);
                self.transition(SessionState::Running, "started");
            }
            Err(e) => {
                // No enforcement without a watch: take the point down again.
                self.fail("start_error", e, cx);
                self.begin_stop(point, cx);
            }
        }
    }

    fn on_job_done(&mut self, id: JobId, result: Result<Transition>, cx: &mut Context<'_>) {
        let was_start = self.start_job == Some(id);
        if was_start {
            self.start_job = None;
        } else if self.stop_job == Some(id) {
            self.stop_job = None;
        }
        match result {
            Ok(Transition::Started(point)) => {
                if self.state == SessionState::Stopping {
                    // Shutdown arrived while starting.
                    self.begin_stop(point, cx);
                } else {
                    self.attach(point, cx);
                }
            }
            Ok(Transition::Stopped) => {
                self.point = None;
                if self.state != SessionState::Failed {
                    self.transition(SessionState::Stopped, "stopped");
                }
            }
            Err(e) if was_start => {
                if self.state == SessionState::Stopping {
                    log::warn!("session {}: {:#}", self.name, e);
                    self.transition(SessionState::Stopped, "stopped");
                } else {
                    self.fail("start_error", e, cx);
                }
            }
            Err(e) => self.fail("stop_error", e, cx),
        }
    }
}

impl Component for Supervisor {
    fn name(&self) -> String {
        format!("session:{}", self.name)
    }

    fn on_tick(&mut self, cx: &mut Context<'_>) {
        for (id, result) in self.jobs.poll_finished() {
            self.on_job_done(id, result, cx);
        }
    }

    fn shutdown(&mut self, cx: &mut Context<'_>) {
        match self.state {
            SessionState::Starting => {
                self.jobs.cancel_all();
                self.transition(SessionState::Stopping, "stopping");
            }
            SessionState::Running => {
                // Stop allowing before the chain goes away.
                if let Some(id) = self.ingestor.take() {
                    cx.unregister(id);
                }
                self.transition(SessionState::Stopping, "stopping");
                if let Some(point) = self.point.clone() {
                    self.begin_stop(point, cx);
                }
            }
            SessionState::Stopping | SessionState::Stopped | SessionState::Failed => {}
        }
    }

    fn is_idle(&self) -> bool {
        self.jobs.is_empty()
    }
}
