//! TTL-bounded allow-list of destination addresses.
//!
//! Every tracked address owns exactly one firewall rule. Expiries are kept in
//! buckets keyed by their absolute deadline, and a single pending timer points
//! at the earliest bucket; when it fires the whole bucket is revoked at once.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::clock::Clock;
use crate::firewall::{ChainRef, FirewallBackend, RuleHandle};

/// Seconds added to every TTL before access is revoked.
pub const GRACE_SECS: u64 = 60;
/// Refreshes that move the expiry by less than this are ignored.
pub const COALESCE_WINDOW_SECS: u64 = 3;
/// Lower bound on any timer delay (protects against clock jumps after suspend).
pub const MIN_TIMER_DELAY_SECS: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub grace_secs: u64,
    pub coalesce_secs: u64,
    pub min_timer_delay_secs: u64,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            grace_secs: GRACE_SECS,
            coalesce_secs: COALESCE_WINDOW_SECS,
            min_timer_delay_secs: MIN_TIMER_DELAY_SECS,
        }
    }
}

impl ExpiryPolicy {
    /// `now + ttl + grace`; a zero or negative TTL leaves the grace period.
    pub fn expiry_for(&self, now: u64, ttl_secs: i64) -> u64 {
        let ttl = u64::try_from(ttl_secs).unwrap_or(0);
        now.saturating_add(ttl).saturating_add(self.grace_secs)
    }
}

#[derive(Clone, Debug)]
pub struct AllowedAddress {
    pub address: Ipv4Addr,
    /// UTC seconds after which the address is no longer permitted.
    pub expiry: u64,
    pub rule_handle: RuleHandle,
}

/// The one outstanding expiry timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiryTimer {
    /// Bucket revoked when the timer fires.
    pub target: u64,
    /// When the timer fires (never sooner than the minimum delay after scheduling).
    pub fire_at: u64,
}

/// What `allow` did with one resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllowOutcome {
    /// New address, rule installed.
    Installed { expiry: u64 },
    /// Known address, expiry moved; the rule was left alone.
    Refreshed { expiry: u64 },
    /// Known address, expiry within the coalescing window.
    Unchanged,
    /// Not an IPv4 address.
    Rejected,
    /// The firewall refused the rule; the address is not tracked.
    Failed,
    /// The engine has been stopped.
    Stopped,
}

pub struct AllowListEngine {
    backend: Arc<dyn FirewallBackend>,
    chain: ChainRef,
    clock: Arc<dyn Clock>,
    policy: ExpiryPolicy,
    by_address: HashMap<Ipv4Addr, AllowedAddress>,
    by_expiry: BTreeMap<u64, BTreeSet<Ipv4Addr>>,
    timer: Option<ExpiryTimer>,
    stopped: bool,
}

/// Parse and canonicalise a dotted-quad address.
///
/// Octets with leading zeros are rejected rather than guessed at.
pub fn normalize_ipv4(address: &str) -> Option<Ipv4Addr> {
    address.trim().parse().ok()
}

impl AllowListEngine {
    /// Manage rules in `chain`, which the caller guarantees exists.
    pub fn new(
        backend: Arc<dyn FirewallBackend>,
        chain: ChainRef,
        clock: Arc<dyn Clock>,
        policy: ExpiryPolicy,
    ) -> Self {
        Self {
            backend,
            chain,
            clock,
            policy,
            by_address: HashMap::new(),
            by_expiry: BTreeMap::new(),
            timer: None,
            stopped: false,
        }
    }

    pub fn chain(&self) -> &ChainRef {
        &self.chain
    }

    pub fn policy(&self) -> ExpiryPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn tracked(&self, address: Ipv4Addr) -> Option<&AllowedAddress> {
        self.by_address.get(&address)
    }

    pub fn pending_timer(&self) -> Option<ExpiryTimer> {
        self.timer
    }

    pub fn next_wakeup(&self) -> Option<u64> {
        self.timer.map(|timer| timer.fire_at)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Permit `address` for `ttl_secs` plus the grace period.
    ///
    /// Never fails: bad input and firewall errors are logged and reported in
    /// the outcome so one record cannot abort a batch.
    pub fn allow(&mut self, address: &str, ttl_secs: i64) -> AllowOutcome {
        if self.stopped {
            log::debug!("ignoring {} (TTL {}): allow-list stopped", address, ttl_secs);
            return AllowOutcome::Stopped;
        }
        let Some(ip) = normalize_ipv4(address) else {
            log::warn!("rejecting invalid IPv4 address '{}'", address);
            return AllowOutcome::Rejected;
        };

        let now = self.clock.now();
        let expiry = self.policy.expiry_for(now, ttl_secs);

        if let Some(existing) = self.by_address.get_mut(&ip) {
            let previous = existing.expiry;
            if previous.abs_diff(expiry) < self.policy.coalesce_secs {
                log::debug!("{} already allowed until {}", ip, previous);
                return AllowOutcome::Unchanged;
            }
            existing.expiry = expiry;
            self.unindex(ip, previous);
            self.by_expiry.entry(expiry).or_default().insert(ip);
            log::info!(
                "ALLOWING IP address {} (TTL {}): expiry moved {} -> {}",
                ip,
                ttl_secs,
                previous,
                expiry
            );
            self.reschedule(now);
            return AllowOutcome::Refreshed { expiry };
        }

        let rule_handle = match self.backend.add_accept_rule(&self.chain, ip) {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("could not allow {}: {}", ip, e);
                return AllowOutcome::Failed;
            }
        };
        log::info!(
            "ALLOWING IP address {} (TTL {}) until {} via {}",
            ip,
            ttl_secs,
            expiry,
            rule_handle
        );
        self.by_address.insert(
            ip,
            AllowedAddress {
                address: ip,
                expiry,
                rule_handle,
            },
        );
        self.by_expiry.entry(expiry).or_default().insert(ip);
        self.reschedule(now);
        AllowOutcome::Installed { expiry }
    }

    /// Revoke the bucket the pending timer points at.
    ///
    /// Returns the addresses revoked; nothing happens if no timer is pending.
    /// An address whose rule could not be removed stays tracked and is retried
    /// after the minimum timer delay.
    pub fn on_expiry(&mut self) -> Vec<Ipv4Addr> {
        let Some(timer) = self.timer.take() else {
            return Vec::new();
        };
        let now = self.clock.now();
        let retry_at = now + self.policy.min_timer_delay_secs;
        let expired = self.by_expiry.remove(&timer.target).unwrap_or_default();
        let mut revoked = Vec::with_capacity(expired.len());
        for ip in expired {
            let Some(entry) = self.by_address.get_mut(&ip) else {
                continue;
            };
            log::info!("Denying access to {} (expired)", ip);
            if let Err(e) = self.backend.remove_rule(&entry.rule_handle) {
                // Still installed: keep the handle and retry on a later timer.
                log::error!("could not remove rule for {}, retrying: {}", ip, e);
                entry.expiry = retry_at;
                self.by_expiry.entry(retry_at).or_default().insert(ip);
                continue;
            }
            self.by_address.remove(&ip);
            revoked.push(ip);
        }
        self.reschedule(now);
        revoked
    }

    /// Stop processing. Bookkeeping is dropped; installed rules are left to
    /// the owner of the chain, which tears it down wholesale.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.timer = None;
        if !self.by_address.is_empty() {
            log::info!(
                "allow-list for {} stopped with {} tracked address(es)",
                self.chain,
                self.by_address.len()
            );
        }
        self.by_address.clear();
        self.by_expiry.clear();
    }

    fn unindex(&mut self, ip: Ipv4Addr, expiry: u64) {
        if let Some(bucket) = self.by_expiry.get_mut(&expiry) {
            bucket.remove(&ip);
            if bucket.is_empty() {
                self.by_expiry.remove(&expiry);
            }
        }
    }

    /// Point the timer at the earliest bucket, leaving it untouched when the
    /// earliest bucket did not change.
    fn reschedule(&mut self, now: u64) {
        let Some(&target) = self.by_expiry.keys().next() else {
            self.timer = None;
            return;
        };
        if self.timer.map(|timer| timer.target) == Some(target) {
            return;
        }
        let delay = target
            .saturating_sub(now)
            .max(self.policy.min_timer_delay_secs);
        self.timer = Some(ExpiryTimer {
            target,
            fire_at: now + delay,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::firewall::MemoryBackend;

    const T0: u64 = 1_700_000_000;

    struct Fixture {
        fw: Arc<MemoryBackend>,
        clock: Arc<ManualClock>,
        engine: AllowListEngine,
    }

    fn fixture() -> Fixture {
        let fw = Arc::new(MemoryBackend::new());
        let chain = fw.ensure_chain_exists("vm", "allow").unwrap();
        let clock = Arc::new(ManualClock::new(T0));
        let engine = AllowListEngine::new(fw.clone(), chain, clock.clone(), ExpiryPolicy::default());
        Fixture { fw, clock, engine }
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn new_address_installs_rule_and_schedules_timer() {
        let mut f = fixture();
        let outcome = f.engine.allow("93.184.216.34", 300);
        assert_eq!(outcome, AllowOutcome::Installed { expiry: T0 + 360 });
        assert_eq!(f.fw.rules(f.engine.chain()), vec![ip("93.184.216.34")]);
        assert_eq!(
            f.engine.pending_timer(),
            Some(ExpiryTimer {
                target: T0 + 360,
                fire_at: T0 + 360
            })
        );
    }

    #[test]
    fn refresh_inside_window_is_coalesced() {
        let mut f = fixture();
        f.engine.allow("1.2.3.4", 120);
        f.clock.advance(2);
        assert_eq!(f.engine.allow("1.2.3.4", 120), AllowOutcome::Unchanged);
        assert_eq!(f.fw.add_calls(), vec![ip("1.2.3.4")]);
        assert_eq!(f.engine.tracked(ip("1.2.3.4")).unwrap().expiry, T0 + 180);
    }

    #[test]
    fn refresh_outside_window_moves_expiry_without_touching_rule() {
        let mut f = fixture();
        f.engine.allow("1.2.3.4", 120);
        f.clock.advance(10);
        assert_eq!(
            f.engine.allow("1.2.3.4", 120),
            AllowOutcome::Refreshed {
                expiry: T0 + 190
            }
        );
        assert_eq!(f.fw.add_calls().len(), 1);
        assert!(f.fw.remove_calls().is_empty());
        assert_eq!(f.engine.pending_timer().unwrap().target, T0 + 190);
    }

    #[test]
    fn shorter_ttl_wins_on_refresh() {
        let mut f = fixture();
        f.engine.allow("1.2.3.4", 300);
        f.clock.advance(10);
        f.engine.allow("1.2.3.4", 30);
        let entry = f.engine.tracked(ip("1.2.3.4")).unwrap();
        assert_eq!(entry.expiry, T0 + 10 + 30 + GRACE_SECS);
        assert_eq!(f.engine.pending_timer().unwrap().target, entry.expiry);
    }

    #[test]
    fn invalid_addresses_are_rejected() {
        let mut f = fixture();
        for bad in ["", "1.2.3", "01.2.3.4", "256.1.1.1", "::1", "example.com"] {
            assert_eq!(f.engine.allow(bad, 60), AllowOutcome::Rejected, "{bad}");
        }
        assert!(f.engine.is_empty());
        assert!(f.fw.add_calls().is_empty());
    }

    #[test]
    fn whitespace_is_trimmed() {
        let mut f = fixture();
        f.engine.allow(" 8.8.8.8\n", 60);
        assert!(f.engine.tracked(ip("8.8.8.8")).is_some());
    }

    #[test]
    fn backend_failure_leaves_address_untracked() {
        let mut f = fixture();
        f.fw.fail_on(ip("6.6.6.6"));
        assert_eq!(f.engine.allow("6.6.6.6", 60), AllowOutcome::Failed);
        assert!(f.engine.tracked(ip("6.6.6.6")).is_none());
        assert_eq!(f.engine.pending_timer(), None);
        assert!(matches!(
            f.engine.allow("7.7.7.7", 60),
            AllowOutcome::Installed { .. }
        ));
    }

    #[test]
    fn expiry_revokes_whole_bucket() {
        let mut f = fixture();
        f.engine.allow("1.1.1.1", 100);
        f.engine.allow("2.2.2.2", 100);
        f.engine.allow("3.3.3.3", 500);
        f.clock.advance(160);
        let mut revoked = f.engine.on_expiry();
        revoked.sort();
        assert_eq!(revoked, vec![ip("1.1.1.1"), ip("2.2.2.2")]);
        assert_eq!(f.fw.rules(f.engine.chain()), vec![ip("3.3.3.3")]);
        assert_eq!(
            f.engine.pending_timer(),
            Some(ExpiryTimer {
                target: T0 + 560,
                fire_at: T0 + 560
            })
        );
    }

    #[test]
    fn zero_ttl_still_installs_and_expires_after_grace() {
        let mut f = fixture();
        assert_eq!(
            f.engine.allow("10.0.0.5", 0),
            AllowOutcome::Installed {
                expiry: T0 + GRACE_SECS
            }
        );
        assert_eq!(f.engine.next_wakeup(), Some(T0 + GRACE_SECS));
        f.clock.advance(GRACE_SECS);
        assert_eq!(f.engine.on_expiry(), vec![ip("10.0.0.5")]);
        assert!(f.fw.rules(f.engine.chain()).is_empty());
        assert_eq!(f.engine.pending_timer(), None);
    }

    #[test]
    fn negative_ttl_is_treated_as_zero() {
        assert_eq!(ExpiryPolicy::default().expiry_for(T0, -5), T0 + GRACE_SECS);
    }

    #[test]
    fn timer_delay_has_a_floor_after_clock_jump() {
        let mut f = fixture();
        f.engine.allow("1.1.1.1", 0);
        f.engine.allow("2.2.2.2", 100);
        // Host suspended well past both deadlines.
        f.clock.advance(10_000);
        f.engine.on_expiry();
        let timer = f.engine.pending_timer().unwrap();
        assert_eq!(timer.target, T0 + 160);
        assert_eq!(timer.fire_at, T0 + 10_000 + MIN_TIMER_DELAY_SECS);
    }

    #[test]
    fn timer_is_kept_when_minimum_does_not_change() {
        let mut f = fixture();
        f.engine.allow("1.1.1.1", 100);
        let before = f.engine.pending_timer();
        f.clock.advance(5);
        f.engine.allow("2.2.2.2", 1_000);
        assert_eq!(f.engine.pending_timer(), before);
    }

    #[test]
    fn earlier_refresh_pulls_timer_forward() {
        let mut f = fixture();
        f.engine.allow("1.1.1.1", 1_000);
        f.engine.allow("2.2.2.2", 500);
        f.clock.advance(20);
        f.engine.allow("1.1.1.1", 10);
        assert_eq!(f.engine.pending_timer().unwrap().target, T0 + 20 + 10 + GRACE_SECS);
    }

    #[test]
    fn removal_after_chain_teardown_is_tolerated() {
        let mut f = fixture();
        f.engine.allow("1.1.1.1", 0);
        let chain = f.engine.chain().clone();
        f.fw.delete_chain(&chain).unwrap();
        f.clock.advance(GRACE_SECS);
        assert_eq!(f.engine.on_expiry(), vec![ip("1.1.1.1")]);
        assert!(f.engine.is_empty());
        assert_eq!(f.engine.pending_timer(), None);
    }

    #[test]
    fn failed_removal_is_retried_after_min_delay() {
        let mut f = fixture();
        f.engine.allow("1.2.3.4", 0);
        f.fw.fail_next_removes(1);
        f.clock.advance(GRACE_SECS);
        assert!(f.engine.on_expiry().is_empty());
        assert_eq!(f.fw.rules(f.engine.chain()), vec![ip("1.2.3.4")]);
        let retry = T0 + GRACE_SECS + MIN_TIMER_DELAY_SECS;
        assert_eq!(f.engine.tracked(ip("1.2.3.4")).unwrap().expiry, retry);
        assert_eq!(
            f.engine.pending_timer(),
            Some(ExpiryTimer {
                target: retry,
                fire_at: retry
            })
        );

        f.clock.advance(MIN_TIMER_DELAY_SECS);
        assert_eq!(f.engine.on_expiry(), vec![ip("1.2.3.4")]);
        assert!(f.fw.rules(f.engine.chain()).is_empty());
        assert_eq!(f.engine.pending_timer(), None);

        f.engine.allow("1.2.3.4", 60);
        assert_eq!(f.fw.rule_count(f.engine.chain(), ip("1.2.3.4")), 1);
    }

    #[test]
    fn at_most_one_rule_per_address() {
        let mut f = fixture();
        for (step, ttl) in [300, 30, 300, 0, 5, 3600].into_iter().enumerate() {
            f.clock.advance(step as u64 * 7);
            f.engine.allow("4.4.4.4", ttl);
            assert!(f.fw.rule_count(f.engine.chain(), ip("4.4.4.4")) <= 1);
        }
        assert_eq!(f.fw.add_calls().len(), 1);
    }

    #[test]
    fn stop_is_idempotent_and_final() {
        let mut f = fixture();
        f.engine.allow("1.1.1.1", 60);
        f.engine.stop();
        f.engine.stop();
        assert!(f.engine.is_stopped());
        assert_eq!(f.engine.next_wakeup(), None);
        assert_eq!(f.engine.allow("2.2.2.2", 60), AllowOutcome::Stopped);
        assert_eq!(f.fw.add_calls(), vec![ip("1.1.1.1")]);
    }
}
