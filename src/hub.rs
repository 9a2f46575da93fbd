//! Single-threaded event loop.
//!
//! Components expose an optional pollable descriptor and an optional wakeup
//! deadline; the hub polls the descriptors, fires due wakeups and runs a
//! low-frequency tick. All component state is touched from the loop thread
//! only. Components may register or unregister components from inside a
//! callback through [`Context`]; those changes take effect once the callback
//! returns.

use anyhow::{anyhow, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::BorrowedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;

pub const DEFAULT_TICK: Duration = Duration::from_millis(500);
/// How long shutdown waits for components to become idle.
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentId(u64);

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub trait Component {
    fn name(&self) -> String;

    /// Descriptor to poll for readability.
    fn fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }

    fn on_readable(&mut self, _cx: &mut Context<'_>) {}

    /// Absolute UTC second at which `on_wakeup` should run.
    fn next_wakeup(&self) -> Option<u64> {
        None
    }

    fn on_wakeup(&mut self, _cx: &mut Context<'_>) {}

    /// Called every hub tick (500 ms by default).
    fn on_tick(&mut self, _cx: &mut Context<'_>) {}

    /// The process is shutting down; start releasing resources.
    fn shutdown(&mut self, _cx: &mut Context<'_>) {}

    /// Whether the component has nothing left in flight.
    fn is_idle(&self) -> bool {
        true
    }

    /// The component was removed from the hub and will not be called again.
    fn on_unregistered(&mut self) {}
}

enum Op {
    Register(ComponentId, Box<dyn Component>),
    Unregister(ComponentId),
    Fail(String),
}

/// Handed to every component callback.
pub struct Context<'a> {
    now: u64,
    next_id: &'a mut u64,
    ops: &'a mut Vec<Op>,
}

impl Context<'_> {
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn register(&mut self, component: Box<dyn Component>) -> ComponentId {
        *self.next_id += 1;
        let id = ComponentId(*self.next_id);
        self.ops.push(Op::Register(id, component));
        id
    }

    pub fn unregister(&mut self, id: ComponentId) {
        self.ops.push(Op::Unregister(id));
    }

    /// Report a failure the process cannot continue with: the hub drains as
    /// on shutdown and [`Hub::run`] returns the reason as an error.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.ops.push(Op::Fail(reason.into()));
    }
}

pub struct Hub {
    components: Vec<(ComponentId, Box<dyn Component>)>,
    next_id: u64,
    pending: Vec<Op>,
    clock: Arc<dyn Clock>,
    tick: Duration,
    last_tick: Instant,
    shutdown: Arc<AtomicBool>,
    failure: Option<String>,
}

impl Hub {
    pub fn new(clock: Arc<dyn Clock>, tick: Duration) -> Self {
        Self {
            components: Vec::new(),
            next_id: 0,
            pending: Vec::new(),
            clock,
            tick,
            last_tick: Instant::now(),
            shutdown: Arc::new(AtomicBool::new(false)),
            failure: None,
        }
    }

    /// Flag checked by [`Hub::run`]; setting it starts a graceful shutdown.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn register(&mut self, component: Box<dyn Component>) -> ComponentId {
        self.next_id += 1;
        let id = ComponentId(self.next_id);
        log::debug!("registering {} {}", component.name(), id);
        self.components.push((id, component));
        id
    }

    pub fn unregister(&mut self, id: ComponentId) -> bool {
        let Some(index) = self.index_of(id) else {
            return false;
        };
        let (_, mut component) = self.components.remove(index);
        log::debug!("unregistering {} {}", component.name(), id);
        component.on_unregistered();
        true
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.index_of(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// First failure reported through [`Context::fail`].
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// One loop iteration: wait for readiness (at most until the next tick or
    /// wakeup), then dispatch readable descriptors, due wakeups and the tick.
    pub fn run_once(&mut self) -> Result<()> {
        let now = self.clock.now();
        let until_tick = self.tick.saturating_sub(self.last_tick.elapsed());
        let until_wakeup = self
            .components
            .iter()
            .filter_map(|(_, c)| c.next_wakeup())
            .min()
            .map(|at| Duration::from_secs(at.saturating_sub(now)));
        let wait = until_wakeup.map_or(until_tick, |w| w.min(until_tick));

        for id in self.wait_readable(wait)? {
            self.dispatch(id, |component, cx| component.on_readable(cx));
        }

        let now = self.clock.now();
        let due: Vec<ComponentId> = self
            .components
            .iter()
            .filter(|(_, c)| c.next_wakeup().is_some_and(|at| at <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            self.dispatch(id, |component, cx| component.on_wakeup(cx));
        }

        if self.last_tick.elapsed() >= self.tick {
            self.last_tick = Instant::now();
            let ids: Vec<ComponentId> = self.components.iter().map(|(id, _)| *id).collect();
            for id in ids {
                self.dispatch(id, |component, cx| component.on_tick(cx));
            }
        }
        Ok(())
    }

    /// Run until the shutdown flag is set or a component fails, and every
    /// component is idle (or the drain limit passes), then unregister
    /// everything. A reported failure is returned as the error.
    pub fn run(&mut self) -> Result<()> {
        if self.components.is_empty() {
            return Err(anyhow!("no component to be run"));
        }
        let mut drain_deadline: Option<Instant> = None;
        loop {
            let stopping = self.shutdown.load(Ordering::SeqCst) || self.failure.is_some();
            if drain_deadline.is_none() && stopping {
                log::info!("shutdown requested, draining {} component(s)", self.len());
                let ids: Vec<ComponentId> = self.components.iter().map(|(id, _)| *id).collect();
                for id in ids {
                    self.dispatch(id, |component, cx| component.shutdown(cx));
                }
                drain_deadline = Some(Instant::now() + SHUTDOWN_DRAIN);
            }
            if let Some(deadline) = drain_deadline {
                let idle = self.components.iter().all(|(_, c)| c.is_idle());
                if idle || Instant::now() >= deadline {
                    if !idle {
                        log::warn!("shutdown drain limit reached with work in flight");
                    }
                    let ids: Vec<ComponentId> =
                        self.components.iter().map(|(id, _)| *id).collect();
                    for id in ids {
                        self.unregister(id);
                    }
                    return match self.failure.take() {
                        Some(reason) => Err(anyhow!(reason)),
                        None => Ok(()),
                    };
                }
            }
            self.run_once()?;
        }
    }

    fn index_of(&self, id: ComponentId) -> Option<usize> {
        self.components.iter().position(|(cid, _)| *cid == id)
    }

    fn wait_readable(&self, wait: Duration) -> Result<Vec<ComponentId>> {
        let mut owners = Vec::new();
        let mut fds = Vec::new();
        for (id, component) in &self.components {
            if let Some(fd) = component.fd() {
                owners.push(*id);
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
            }
        }
        if fds.is_empty() {
            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
            return Ok(Vec::new());
        }
        let millis = u16::try_from(wait.as_millis()).unwrap_or(u16::MAX);
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(anyhow!("poll failed: {}", e)),
        }
        let ready = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP;
        Ok(owners
            .into_iter()
            .zip(fds.iter())
            .filter(|(_, fd)| fd.revents().is_some_and(|r| r.intersects(ready)))
            .map(|(id, _)| id)
            .collect())
    }

    fn dispatch<F>(&mut self, id: ComponentId, f: F)
    where
        F: FnOnce(&mut dyn Component, &mut Context<'_>),
    {
        // The component may have been unregistered earlier in this iteration.
        if let Some(index) = self.index_of(id) {
            let mut cx = Context {
                now: self.clock.now(),
                next_id: &mut self.next_id,
                ops: &mut self.pending,
            };
            f(self.components[index].1.as_mut(), &mut cx);
        }
        self.apply_pending();
    }

    fn apply_pending(&mut self) {
        for op in std::mem::take(&mut self.pending) {
            match op {
                Op::Register(id, component) => {
                    log::debug!("registering {} {}", component.name(), id);
                    self.components.push((id, component));
                }
                Op::Unregister(id) => {
                    self.unregister(id);
                }
                Op::Fail(reason) => {
                    log::error!("{}", reason);
                    self.failure.get_or_insert(reason);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Journal = Rc<RefCell<Vec<String>>>;

    struct Recorder {
        label: &'static str,
        journal: Journal,
        wakeup: Option<u64>,
        spawn_on_tick: bool,
        busy_ticks: u32,
        fail_on_tick: bool,
    }

    impl Recorder {
        fn new(label: &'static str, journal: &Journal) -> Self {
            Self {
                label,
                journal: journal.clone(),
                wakeup: None,
                spawn_on_tick: false,
                busy_ticks: 0,
                fail_on_tick: false,
            }
        }

        fn log(&self, what: &str) {
            self.journal.borrow_mut().push(format!("{}:{}", self.label, what));
        }
    }

    impl Component for Recorder {
        fn name(&self) -> String {
            self.label.to_string()
        }

        fn next_wakeup(&self) -> Option<u64> {
            self.wakeup
        }

        fn on_wakeup(&mut self, cx: &mut Context<'_>) {
            self.log(&format!("wakeup@{}", cx.now()));
            self.wakeup = None;
        }

        fn on_tick(&mut self, cx: &mut Context<'_>) {
            if self.spawn_on_tick {
                self.spawn_on_tick = false;
                cx.register(Box::new(Recorder::new("child", &self.journal)));
                self.log("spawned");
            }
            if self.fail_on_tick {
                self.fail_on_tick = false;
                cx.fail(format!("{} gave up", self.label));
            }
            self.busy_ticks = self.busy_ticks.saturating_sub(1);
        }

        fn shutdown(&mut self, _cx: &mut Context<'_>) {
            self.log("shutdown");
        }

        fn is_idle(&self) -> bool {
            self.busy_ticks == 0
        }

        fn on_unregistered(&mut self) {
            self.log("unregistered");
        }
    }

    fn hub(clock: &Arc<ManualClock>) -> Hub {
        Hub::new(clock.clone(), Duration::from_millis(1))
    }

    #[test]
    fn wakeup_fires_once_deadline_passes() {
        let clock = Arc::new(ManualClock::new(100));
        let journal = Journal::default();
        let mut hub = hub(&clock);
        let mut rec = Recorder::new("p", &journal);
        rec.wakeup = Some(105);
        hub.register(Box::new(rec));

        hub.run_once().unwrap();
        assert!(journal.borrow().is_empty());
        clock.set(105);
        hub.run_once().unwrap();
        assert_eq!(*journal.borrow(), vec!["p:wakeup@105"]);
    }

    #[test]
    fn components_register_from_callbacks() {
        let clock = Arc::new(ManualClock::new(0));
        let journal = Journal::default();
        let mut hub = hub(&clock);
        let mut rec = Recorder::new("parent", &journal);
        rec.spawn_on_tick = true;
        hub.register(Box::new(rec));

        std::thread::sleep(Duration::from_millis(2));
        hub.run_once().unwrap();
        assert_eq!(hub.len(), 2);
        assert_eq!(*journal.borrow(), vec!["parent:spawned"]);
    }

    #[test]
    fn unregister_notifies_component() {
        let clock = Arc::new(ManualClock::new(0));
        let journal = Journal::default();
        let mut hub = hub(&clock);
        let id = hub.register(Box::new(Recorder::new("p", &journal)));
        assert!(hub.unregister(id));
        assert!(!hub.unregister(id));
        assert!(!hub.contains(id));
        assert_eq!(*journal.borrow(), vec!["p:unregistered"]);
    }

    #[test]
    fn run_drains_busy_components_before_returning() {
        let clock = Arc::new(ManualClock::new(0));
        let journal = Journal::default();
        let mut hub = hub(&clock);
        let mut rec = Recorder::new("p", &journal);
        rec.busy_ticks = 3;
        hub.register(Box::new(rec));
        hub.shutdown_flag().store(true, Ordering::SeqCst);

        hub.run().unwrap();
        assert!(hub.is_empty());
        assert_eq!(*journal.borrow(), vec!["p:shutdown", "p:unregistered"]);
    }

    #[test]
    fn reported_failure_drains_and_ends_run_with_error() {
        let clock = Arc::new(ManualClock::new(0));
        let journal = Journal::default();
        let mut hub = hub(&clock);
        let mut failing = Recorder::new("f", &journal);
        failing.fail_on_tick = true;
        hub.register(Box::new(failing));
        let mut busy = Recorder::new("b", &journal);
        busy.busy_ticks = 2;
        hub.register(Box::new(busy));

        let err = hub.run().unwrap_err();
        assert_eq!(err.to_string(), "f gave up");
        assert!(hub.is_empty());
        assert_eq!(
            *journal.borrow(),
            vec!["f:shutdown", "b:shutdown", "f:unregistered", "b:unregistered"]
        );
    }

    #[test]
    fn run_refuses_empty_hub() {
        let clock = Arc::new(ManualClock::new(0));
        assert!(hub(&clock).run().is_err());
    }
}
