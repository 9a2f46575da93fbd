//! Firewall capability used by the allow-list engine.
//!
//! Two command-line families are supported behind one trait:
//! - `iptables`: rules are removed by re-specifying them (match-and-delete)
//! - `nftables`: `add` returns a numeric handle that deletion requires
//!
//! A third, in-process backend backs the tests and the `memory` dry-run mode.
//! The backend is chosen once at startup; there is no switching afterwards.

pub mod exec;
pub mod iptables;
pub mod memory;
pub mod nftables;

use anyhow::{anyhow, Result};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

pub use crate::error::BackendError;
pub use exec::{CommandOutput, CommandRunner, SystemRunner};
pub use iptables::IptablesBackend;
pub use memory::MemoryBackend;
pub use nftables::NftablesBackend;

/// A chain inside a table. For the legacy backend the table is the
/// built-in `filter` table and is not created or deleted.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainRef {
    pub table: String,
    pub chain: String,
}

impl ChainRef {
    pub fn new(table: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            chain: chain.into(),
        }
    }
}

impl std::fmt::Display for ChainRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.table, self.chain)
    }
}

/// Opaque token naming exactly one installed rule.
///
/// Handles are only meaningful to the backend that produced them and do not
/// survive a process restart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleHandle {
    chain: ChainRef,
    token: HandleToken,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum HandleToken {
    /// The rule specification, replayed with the delete verb.
    Spec(Vec<String>),
    /// Server-assigned rule handle.
    Numeric(u64),
}

impl RuleHandle {
    pub(crate) fn spec(chain: ChainRef, spec: Vec<String>) -> Self {
        Self {
            chain,
            token: HandleToken::Spec(spec),
        }
    }

    pub(crate) fn numeric(chain: ChainRef, handle: u64) -> Self {
        Self {
            chain,
            token: HandleToken::Numeric(handle),
        }
    }

    pub fn chain(&self) -> &ChainRef {
        &self.chain
    }

    pub(crate) fn token(&self) -> &HandleToken {
        &self.token
    }
}

impl std::fmt::Display for RuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.token {
            HandleToken::Spec(spec) => write!(f, "{} [{}]", self.chain, spec.join(" ")),
            HandleToken::Numeric(handle) => write!(f, "{} handle {}", self.chain, handle),
        }
    }
}

/// Rule management on a single chain.
///
/// Implementations must be callable from worker threads (the lifecycle jobs)
/// as well as from the event loop.
pub trait FirewallBackend: Send + Sync {
    /// Backend identifier, for logs.
    fn name(&self) -> &'static str;

    /// Create the chain (and its table, where the backend owns tables) if absent.
    fn ensure_chain_exists(&self, table: &str, chain: &str) -> Result<ChainRef, BackendError>;

    /// Insert a rule accepting traffic to `destination/32`.
    ///
    /// Other rules of the chain are neither removed nor reordered.
    fn add_accept_rule(
        &self,
        chain: &ChainRef,
        destination: Ipv4Addr,
    ) -> Result<RuleHandle, BackendError>;

    /// Delete exactly the rule named by `handle`.
    ///
    /// A rule or chain that no longer exists is success.
    fn remove_rule(&self, handle: &RuleHandle) -> Result<(), BackendError>;

    /// Whether an accept rule for `destination` is currently installed.
    fn rule_exists(&self, chain: &ChainRef, destination: Ipv4Addr) -> Result<bool, BackendError>;

    /// Flush and delete the chain. An absent chain is success.
    fn delete_chain(&self, chain: &ChainRef) -> Result<(), BackendError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Nftables,
    Iptables,
    Memory,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackendKind::Nftables => "nftables",
            BackendKind::Iptables => "iptables",
            BackendKind::Memory => "memory",
        })
    }
}

/// Configured backend: a fixed kind, or probe the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendChoice {
    Auto,
    Fixed(BackendKind),
}

impl std::str::FromStr for BackendChoice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendChoice::Auto),
            "nftables" | "nft" => Ok(BackendChoice::Fixed(BackendKind::Nftables)),
            "iptables" => Ok(BackendChoice::Fixed(BackendKind::Iptables)),
            "memory" => Ok(BackendChoice::Fixed(BackendKind::Memory)),
            other => Err(anyhow!(
                "unknown firewall backend '{}' (expected auto, nftables, iptables or memory)",
                other
            )),
        }
    }
}

/// Locations of the packet-filter tools.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolPaths {
    pub iptables: PathBuf,
    pub nft: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            iptables: PathBuf::from("/sbin/iptables"),
            nft: PathBuf::from("/sbin/nft"),
        }
    }
}

/// Decide which command-line family the host uses.
///
/// The legacy backend wins when `iptables` reports a legacy build or `nft`
/// is not installed; a missing `iptables` means nftables.
pub fn probe(runner: &dyn CommandRunner, paths: &ToolPaths) -> Result<BackendKind> {
    let out = match runner.run(&paths.iptables, &exec::args(["--version"])) {
        Ok(out) => out,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(BackendKind::Nftables);
        }
        Err(e) => {
            return Err(anyhow!(
                "could not execute {}: {}",
                paths.iptables.display(),
                e
            ))
        }
    };
    if !out.success() {
        return Err(anyhow!(
            "could not execute {}: {}",
            paths.iptables.display(),
            out.stderr.trim()
        ));
    }
    if out.stdout.contains("legacy") || !paths.nft.exists() {
        Ok(BackendKind::Iptables)
    } else {
        Ok(BackendKind::Nftables)
    }
}

/// Build the backend for `choice`, probing the host for [`BackendChoice::Auto`].
pub fn select_backend(
    choice: BackendChoice,
    paths: &ToolPaths,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn FirewallBackend>> {
    let kind = match choice {
        BackendChoice::Fixed(kind) => kind,
        BackendChoice::Auto => probe(runner.as_ref(), paths)?,
    };
    log::info!("using {} firewall backend", kind);
    let backend: Arc<dyn FirewallBackend> = match kind {
        BackendKind::Nftables => Arc::new(NftablesBackend::new(paths.nft.clone(), runner)),
        BackendKind::Iptables => Arc::new(IptablesBackend::new(paths.iptables.clone(), runner)),
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
    };
    Ok(backend)
}
