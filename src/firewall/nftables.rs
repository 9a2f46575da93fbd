//! `nft` backend.
//!
//! Rules are added with `--echo --handle` so the kernel-assigned handle can be
//! kept; nftables cannot delete a rule by matching its expression.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use super::exec::{args, CommandOutput, CommandRunner};
use super::{BackendError, ChainRef, FirewallBackend, HandleToken, RuleHandle};

const FAMILY: &str = "ip";

const NO_SUCH_OBJECT: &str = "No such file or directory";
const ALREADY_EXISTS: &str = "File exists";

pub struct NftablesBackend {
    program: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl NftablesBackend {
    pub fn new(program: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self { program, runner }
    }

    fn exec(&self, argv: Vec<String>, context: &str) -> Result<CommandOutput, BackendError> {
        self.runner
            .run(&self.program, &argv)
            .map_err(|e| BackendError::new(context, e.to_string()))
    }

    /// Run `argv`, treating "already exists" as success.
    fn exec_create(&self, argv: Vec<String>, context: &str) -> Result<(), BackendError> {
        let out = self.exec(argv, context)?;
        if out.success() || out.stderr.contains(ALREADY_EXISTS) {
            Ok(())
        } else {
            Err(BackendError::new(context, out.stderr))
        }
    }

    /// Run `argv`, treating "no such table/chain/rule" as success.
    fn exec_delete(&self, argv: Vec<String>, context: &str) -> Result<bool, BackendError> {
        let out = self.exec(argv, context)?;
        if out.success() {
            Ok(true)
        } else if out.stderr.contains(NO_SUCH_OBJECT) {
            Ok(false)
        } else {
            Err(BackendError::new(context, out.stderr))
        }
    }

    fn object(kind: &str, chain: &ChainRef) -> Vec<String> {
        vec![
            kind.to_string(),
            FAMILY.to_string(),
            chain.table.clone(),
            chain.chain.clone(),
        ]
    }
}

/// Extract the handle from `nft --echo --handle` output, e.g.
/// `add rule ip vm t ip daddr 1.2.3.4 accept # handle 12`.
fn parse_handle(stdout: &str) -> Option<u64> {
    stdout.lines().find_map(|line| {
        let (_, tail) = line.split_once("# handle ")?;
        tail.split_whitespace().next()?.parse().ok()
    })
}

impl FirewallBackend for NftablesBackend {
    fn name(&self) -> &'static str {
        "nftables"
    }

    fn ensure_chain_exists(&self, table: &str, chain: &str) -> Result<ChainRef, BackendError> {
        let chain_ref = ChainRef::new(table, chain);
        self.exec_create(
            args(["add", "table", FAMILY, table]),
            &format!("creating table '{}'", table),
        )?;
        let mut argv = args(["add"]);
        argv.extend(Self::object("chain", &chain_ref));
        self.exec_create(argv, &format!("creating chain '{}'", chain_ref))?;
        Ok(chain_ref)
    }

    fn add_accept_rule(
        &self,
        chain: &ChainRef,
        destination: Ipv4Addr,
    ) -> Result<RuleHandle, BackendError> {
        let context = format!("allowing {} in chain '{}'", destination, chain);
        let mut argv = args(["-a", "-e", "add"]);
        argv.extend(Self::object("rule", chain));
        argv.extend(args(["ip", "daddr"]));
        argv.push(format!("{}/32", destination));
        argv.push("accept".to_string());
        let out = self.exec(argv, &context)?;
        if !out.success() {
            return Err(BackendError::new(context, out.stderr));
        }
        let handle = parse_handle(&out.stdout).ok_or_else(|| {
            BackendError::new(
                context.as_str(),
                format!("no rule handle in output: {}", out.stdout.trim()),
            )
        })?;
        Ok(RuleHandle::numeric(chain.clone(), handle))
    }

    fn remove_rule(&self, handle: &RuleHandle) -> Result<(), BackendError> {
        let context = format!("removing rule {}", handle);
        let HandleToken::Numeric(number) = handle.token() else {
            return Err(BackendError::new(
                context,
                "handle was not issued by the nftables backend",
            ));
        };
        let mut argv = args(["delete"]);
        argv.extend(Self::object("rule", handle.chain()));
        argv.push("handle".to_string());
        argv.push(number.to_string());
        self.exec_delete(argv, &context).map(|_| ())
    }

    fn rule_exists(&self, chain: &ChainRef, destination: Ipv4Addr) -> Result<bool, BackendError> {
        let context = format!("listing chain '{}'", chain);
        let mut argv = args(["-a", "list"]);
        argv.extend(Self::object("chain", chain));
        let out = self.exec(argv, &context)?;
        if !out.success() {
            return if out.stderr.contains(NO_SUCH_OBJECT) {
                Ok(false)
            } else {
                Err(BackendError::new(context, out.stderr))
            };
        }
        // nft prints host prefixes without the /32.
        let needle = format!("ip daddr {} accept", destination);
        Ok(out.stdout.lines().any(|line| line.trim_start().starts_with(&needle)))
    }

    fn delete_chain(&self, chain: &ChainRef) -> Result<(), BackendError> {
        let context = format!("deleting chain '{}'", chain);
        let mut flush = args(["flush"]);
        flush.extend(Self::object("chain", chain));
        if !self.exec_delete(flush, &context)? {
            return Ok(());
        }
        let mut delete = args(["delete"]);
        delete.extend(Self::object("chain", chain));
        if self.exec_delete(delete, &context)? {
            log::info!("nftables chain '{}' deleted", chain);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::exec::scripted::ScriptedRunner;
    use super::*;

    fn backend(runner: ScriptedRunner) -> (NftablesBackend, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let backend = NftablesBackend::new(PathBuf::from("/sbin/nft"), runner.clone());
        (backend, runner)
    }

    #[test]
    fn parses_echoed_handle() {
        assert_eq!(
            parse_handle("add rule ip vm allow ip daddr 1.2.3.4 accept # handle 42\n"),
            Some(42)
        );
        assert_eq!(parse_handle("add rule ip vm allow accept\n"), None);
    }

    #[test]
    fn add_keeps_handle_for_removal() {
        let (fw, runner) = backend(ScriptedRunner::default().reply(
            0,
            "add rule ip vm allow ip daddr 10.0.0.5 accept # handle 17\n",
            "",
        ));
        let chain = ChainRef::new("vm", "allow");
        let handle = fw.add_accept_rule(&chain, Ipv4Addr::new(10, 0, 0, 5)).unwrap();
        assert_eq!(handle, RuleHandle::numeric(chain, 17));
        fw.remove_rule(&handle).unwrap();

        let calls = runner.calls();
        assert_eq!(
            calls[0],
            args(["-a", "-e", "add", "rule", "ip", "vm", "allow", "ip", "daddr", "10.0.0.5/32", "accept"])
        );
        assert_eq!(calls[1], args(["delete", "rule", "ip", "vm", "allow", "handle", "17"]));
    }

    #[test]
    fn add_without_handle_is_an_error() {
        let (fw, _) = backend(ScriptedRunner::default().reply(0, "", ""));
        let err = fw
            .add_accept_rule(&ChainRef::new("vm", "allow"), Ipv4Addr::new(1, 1, 1, 1))
            .unwrap_err();
        assert!(err.to_string().contains("no rule handle"), "{err}");
    }

    #[test]
    fn remove_after_table_teardown_is_success() {
        let (fw, _) = backend(ScriptedRunner::default().reply(
            1,
            "",
            "Error: Could not process rule: No such file or directory\n",
        ));
        fw.remove_rule(&RuleHandle::numeric(ChainRef::new("vm", "allow"), 3))
            .expect("absent table tolerated");
    }

    #[test]
    fn remove_reports_other_failures() {
        let (fw, _) = backend(ScriptedRunner::default().reply(
            1,
            "",
            "Error: Could not process rule: Operation not permitted\n",
        ));
        let err = fw
            .remove_rule(&RuleHandle::numeric(ChainRef::new("vm", "allow"), 3))
            .unwrap_err();
        assert!(err.diagnostic.contains("Operation not permitted"));
    }

    #[test]
    fn rule_exists_scans_listing() {
        let listing = "table ip vm {\n\tchain allow {\n\t\tip daddr 1.2.3.4 accept # handle 4\n\t}\n}\n";
        let (fw, _) = backend(
            ScriptedRunner::default()
                .reply(0, listing, "")
                .reply(0, listing, ""),
        );
        let chain = ChainRef::new("vm", "allow");
        assert!(fw.rule_exists(&chain, Ipv4Addr::new(1, 2, 3, 4)).unwrap());
        assert!(!fw.rule_exists(&chain, Ipv4Addr::new(1, 2, 3, 40)).unwrap());
    }

    #[test]
    fn ensure_chain_is_idempotent() {
        let (fw, runner) = backend(ScriptedRunner::default());
        let chain = fw.ensure_chain_exists("vm", "allow").unwrap();
        assert_eq!(chain, ChainRef::new("vm", "allow"));
        assert_eq!(
            runner.calls(),
            vec![
                args(["add", "table", "ip", "vm"]),
                args(["add", "chain", "ip", "vm", "allow"])
            ]
        );
    }

    #[test]
    fn delete_chain_stops_when_chain_is_gone() {
        let (fw, runner) = backend(ScriptedRunner::default().reply(
            1,
            "",
            "Error: No such file or directory; did you mean table 'vm'?",
        ));
        fw.delete_chain(&ChainRef::new("vm", "allow")).unwrap();
        assert_eq!(runner.calls().len(), 1);
    }
}
