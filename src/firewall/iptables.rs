//! Legacy `iptables` backend.
//!
//! Rules carry no server-side identity, so a [`RuleHandle`] is the rule's own
//! specification and removal replays it with `-D`.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use super::exec::{args, CommandOutput, CommandRunner};
use super::{BackendError, ChainRef, FirewallBackend, HandleToken, RuleHandle};

/// Seconds to wait for the xtables lock.
const LOCK_WAIT_SECS: &str = "20";
const FILTER_TABLE: &str = "filter";

const NO_SUCH_CHAIN: &str = "No chain/target/match by that name";
const CHAIN_EXISTS: &str = "Chain already exists";
const BAD_RULE: &str = "Bad rule";
const NO_MATCHING_RULE: &str = "does a matching rule exist";

pub struct IptablesBackend {
    program: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl IptablesBackend {
    pub fn new(program: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self { program, runner }
    }

    fn exec(&self, tail: Vec<String>, context: &str) -> Result<CommandOutput, BackendError> {
        let mut argv = args(["-w", LOCK_WAIT_SECS, "-t", FILTER_TABLE]);
        argv.extend(tail);
        self.runner
            .run(&self.program, &argv)
            .map_err(|e| BackendError::new(context, e.to_string()))
    }

    fn rule_spec(chain: &ChainRef, destination: Ipv4Addr) -> Vec<String> {
        vec![
            chain.chain.clone(),
            "-d".to_string(),
            format!("{}/32", destination),
            "-j".to_string(),
            "ACCEPT".to_string(),
        ]
    }

    fn with_verb(verb: &str, spec: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(spec.len() + 1);
        argv.push(verb.to_string());
        argv.extend_from_slice(spec);
        argv
    }
}

fn is_absent(stderr: &str) -> bool {
    stderr.contains(NO_SUCH_CHAIN) || stderr.contains(BAD_RULE) || stderr.contains(NO_MATCHING_RULE)
}

impl FirewallBackend for IptablesBackend {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn ensure_chain_exists(&self, _table: &str, chain: &str) -> Result<ChainRef, BackendError> {
        let context = format!("creating chain '{}'", chain);
        let chain_ref = ChainRef::new(FILTER_TABLE, chain);
        let listed = self.exec(args(["-S", chain]), &context)?;
        if listed.success() {
            return Ok(chain_ref);
        }
        if !listed.stderr.contains(NO_SUCH_CHAIN) {
            return Err(BackendError::new(context, listed.stderr));
        }
        let created = self.exec(args(["-N", chain]), &context)?;
        if created.success() || created.stderr.contains(CHAIN_EXISTS) {
            log::info!("iptables chain '{}' installed", chain);
            Ok(chain_ref)
        } else {
            Err(BackendError::new(context, created.stderr))
        }
    }

    fn add_accept_rule(
        &self,
        chain: &ChainRef,
        destination: Ipv4Addr,
    ) -> Result<RuleHandle, BackendError> {
        let context = format!("allowing {} in chain '{}'", destination, chain.chain);
        let spec = Self::rule_spec(chain, destination);
        let out = self.exec(Self::with_verb("-I", &spec), &context)?;
        if !out.success() {
            return Err(BackendError::new(context, out.stderr));
        }
        Ok(RuleHandle::spec(chain.clone(), spec))
    }

    fn remove_rule(&self, handle: &RuleHandle) -> Result<(), BackendError> {
        let HandleToken::Spec(spec) = handle.token() else {
            return Err(BackendError::new(
                format!("removing rule {}", handle),
                "handle was not issued by the iptables backend",
            ));
        };
        let context = format!("removing rule {}", handle);
        let out = self.exec(Self::with_verb("-D", spec), &context)?;
        if out.success() || is_absent(&out.stderr) {
            Ok(())
        } else {
            Err(BackendError::new(context, out.stderr))
        }
    }

    fn rule_exists(&self, chain: &ChainRef, destination: Ipv4Addr) -> Result<bool, BackendError> {
        let context = format!("checking rule for {} in chain '{}'", destination, chain.chain);
        let spec = Self::rule_spec(chain, destination);
        let out = self.exec(Self::with_verb("-C", &spec), &context)?;
        if out.success() {
            Ok(true)
        } else if is_absent(&out.stderr) {
            Ok(false)
        } else {
            Err(BackendError::new(context, out.stderr))
        }
    }

    fn delete_chain(&self, chain: &ChainRef) -> Result<(), BackendError> {
        let context = format!("uninstalling chain '{}'", chain.chain);
        for verb in ["-F", "-X"] {
            let out = self.exec(args([verb, chain.chain.as_str()]), &context)?;
            if out.stderr.contains(NO_SUCH_CHAIN) {
                return Ok(());
            }
            if !out.success() {
                return Err(BackendError::new(context, out.stderr));
            }
        }
        log::info!("iptables chain '{}' uninstalled", chain.chain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::exec::scripted::ScriptedRunner;
    use super::*;

    fn backend(runner: ScriptedRunner) -> (IptablesBackend, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let backend = IptablesBackend::new(PathBuf::from("/sbin/iptables"), runner.clone());
        (backend, runner)
    }

    #[test]
    fn add_inserts_host_rule_and_remove_replays_it() {
        let (fw, runner) = backend(ScriptedRunner::default());
        let chain = ChainRef::new("filter", "VM-ALLOW");
        let handle = fw
            .add_accept_rule(&chain, Ipv4Addr::new(93, 184, 216, 34))
            .unwrap();
        fw.remove_rule(&handle).unwrap();

        let calls = runner.calls();
        assert_eq!(
            calls[0],
            args(["-w", "20", "-t", "filter", "-I", "VM-ALLOW", "-d", "93.184.216.34/32", "-j", "ACCEPT"])
        );
        assert_eq!(
            calls[1],
            args(["-w", "20", "-t", "filter", "-D", "VM-ALLOW", "-d", "93.184.216.34/32", "-j", "ACCEPT"])
        );
    }

    #[test]
    fn remove_tolerates_deleted_chain() {
        let (fw, _) = backend(ScriptedRunner::default().reply(
            1,
            "",
            "iptables: No chain/target/match by that name.\n",
        ));
        let handle = RuleHandle::spec(
            ChainRef::new("filter", "GONE"),
            IptablesBackend::rule_spec(&ChainRef::new("filter", "GONE"), Ipv4Addr::new(1, 2, 3, 4)),
        );
        fw.remove_rule(&handle).expect("absent chain is success");
    }

    #[test]
    fn add_failure_carries_diagnostic() {
        let (fw, _) = backend(ScriptedRunner::default().reply(4, "", "Another app holds the lock"));
        let err = fw
            .add_accept_rule(&ChainRef::new("filter", "X"), Ipv4Addr::new(1, 2, 3, 4))
            .unwrap_err();
        assert!(err.diagnostic.contains("holds the lock"));
    }

    #[test]
    fn ensure_chain_creates_missing_chain() {
        let (fw, runner) = backend(
            ScriptedRunner::default()
                .reply(1, "", "iptables: No chain/target/match by that name.")
                .reply(0, "", ""),
        );
        let chain = fw.ensure_chain_exists("ignored", "VM-ALLOW").unwrap();
        assert_eq!(chain, ChainRef::new("filter", "VM-ALLOW"));
        assert_eq!(runner.calls()[1], args(["-w", "20", "-t", "filter", "-N", "VM-ALLOW"]));
    }

    #[test]
    fn ensure_chain_accepts_existing_chain() {
        let (fw, runner) = backend(ScriptedRunner::default().reply(0, "-N VM-ALLOW\n", ""));
        fw.ensure_chain_exists("filter", "VM-ALLOW").unwrap();
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn rule_exists_maps_bad_rule_to_false() {
        let (fw, _) = backend(ScriptedRunner::default().reply(
            1,
            "",
            "iptables: Bad rule (does a matching rule exist in that chain?).",
        ));
        assert!(!fw
            .rule_exists(&ChainRef::new("filter", "X"), Ipv4Addr::new(1, 2, 3, 4))
            .unwrap());
    }

    #[test]
    fn foreign_handle_is_rejected() {
        let (fw, _) = backend(ScriptedRunner::default());
        let handle = RuleHandle::numeric(ChainRef::new("filter", "X"), 3);
        assert!(fw.remove_rule(&handle).is_err());
    }
}
