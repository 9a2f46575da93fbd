//! In-process firewall, used by the tests and by the `memory` dry-run mode.
//!
//! Behaves like the nftables backend: rules get numeric handles, and
//! operations on a chain that was torn down are tolerated.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

use super::{BackendError, ChainRef, FirewallBackend, HandleToken, RuleHandle};

#[derive(Debug, Default)]
struct State {
    chains: BTreeMap<ChainRef, BTreeMap<u64, Ipv4Addr>>,
    next_handle: u64,
    adds: Vec<Ipv4Addr>,
    removes: Vec<Ipv4Addr>,
    failing: BTreeSet<Ipv4Addr>,
    failing_removes: usize,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave State half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Destinations currently accepted by `chain`, in handle order.
    pub fn rules(&self, chain: &ChainRef) -> Vec<Ipv4Addr> {
        self.state()
            .chains
            .get(chain)
            .map(|rules| rules.values().copied().collect())
            .unwrap_or_default()
    }

    /// Number of installed rules for `destination` in `chain`.
    pub fn rule_count(&self, chain: &ChainRef, destination: Ipv4Addr) -> usize {
        self.rules(chain)
            .into_iter()
            .filter(|addr| *addr == destination)
            .count()
    }

    /// Every successful `add_accept_rule`, in call order.
    pub fn add_calls(&self) -> Vec<Ipv4Addr> {
        self.state().adds.clone()
    }

    /// Every `remove_rule` that deleted something, in call order.
    pub fn remove_calls(&self) -> Vec<Ipv4Addr> {
        self.state().removes.clone()
    }

    /// Make `add_accept_rule` fail for `destination`.
    pub fn fail_on(&self, destination: Ipv4Addr) {
        self.state().failing.insert(destination);
    }

    /// Make the next `count` calls to `remove_rule` fail.
    pub fn fail_next_removes(&self, count: usize) {
        self.state().failing_removes = count;
    }

    pub fn chain_exists(&self, chain: &ChainRef) -> bool {
        self.state().chains.contains_key(chain)
    }
}

impl FirewallBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn ensure_chain_exists(&self, table: &str, chain: &str) -> Result<ChainRef, BackendError> {
        let chain_ref = ChainRef::new(table, chain);
        self.state().chains.entry(chain_ref.clone()).or_default();
        Ok(chain_ref)
    }

    fn add_accept_rule(
        &self,
        chain: &ChainRef,
        destination: Ipv4Addr,
    ) -> Result<RuleHandle, BackendError> {
        let context = format!("allowing {} in chain '{}'", destination, chain);
        let mut state = self.state();
        if state.failing.contains(&destination) {
            return Err(BackendError::new(context, "injected failure"));
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        let Some(rules) = state.chains.get_mut(chain) else {
            return Err(BackendError::new(context, "No such file or directory"));
        };
        rules.insert(handle, destination);
        state.adds.push(destination);
        Ok(RuleHandle::numeric(chain.clone(), handle))
    }

    fn remove_rule(&self, handle: &RuleHandle) -> Result<(), BackendError> {
        let HandleToken::Numeric(number) = handle.token() else {
            return Err(BackendError::new(
                format!("removing rule {}", handle),
                "handle was not issued by the memory backend",
            ));
        };
        let mut state = self.state();
        if state.failing_removes > 0 {
            state.failing_removes -= 1;
            return Err(BackendError::new(
                format!("removing rule {}", handle),
                "injected failure",
            ));
        }
        let removed = state
            .chains
            .get_mut(handle.chain())
            .and_then(|rules| rules.remove(number));
        if let Some(destination) = removed {
            state.removes.push(destination);
        }
        Ok(())
    }

    fn rule_exists(&self, chain: &ChainRef, destination: Ipv4Addr) -> Result<bool, BackendError> {
        Ok(self.rule_count(chain, destination) > 0)
    }

    fn delete_chain(&self, chain: &ChainRef) -> Result<(), BackendError> {
        self.state().chains.remove(chain);
        Ok(())
    }
}
