//! dnsgate
//!
//! Egress filtering for confined virtual machines: a VM may only reach IPv4
//! addresses its own resolver has recently returned.
//!
//! # Architecture
//!
//! The resolver plugin drops one JSON file per answered query into a watched
//! directory. The [`resolution::ResolutionIngestor`] parses each file and
//! feeds the A records to the [`allowlist::AllowListEngine`], which installs a
//! firewall accept rule per new address and revokes it once the TTL plus a
//! grace period has passed.
//!
//! # Module Structure
//!
//! - `firewall`: rule management capability and its nftables/iptables/in-memory backends
//! - `allowlist`: per-VM allow-list with coalesced expiry
//! - `resolution`: drop-file format and ingestion
//! - `resolvers`: host nameserver tracking
//! - `hub`, `jobs`: single-threaded event loop and background jobs
//! - `supervisor`: session lifecycle (chain and drop directory)

use anyhow::{anyhow, Result};
use std::sync::OnceLock;

pub mod allowlist;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod firewall;
pub mod hub;
pub mod jobs;
pub mod resolution;
pub mod resolvers;
pub mod supervisor;
pub mod watch;

pub use allowlist::{normalize_ipv4, AllowListEngine, AllowOutcome, ExpiryPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BackendError, MalformedRecord, WatchSetupError};
pub use firewall::{ChainRef, FirewallBackend, RuleHandle};
pub use resolution::{ResolutionIngestor, ResolutionRecord};

/// Table and chain names end up as packet-filter tool arguments.
///
/// Strict allowlist: 1..64 of `[A-Za-z0-9_-]`.
pub fn validate_rule_name(kind: &str, name: &str) -> Result<()> {
    static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = match NAME_RE.get() {
        Some(re) => re,
        None => {
            let compiled = regex::Regex::new(r"^[A-Za-z0-9_-]{1,64}$")?;
            NAME_RE.get_or_init(|| compiled)
        }
    };
    if !re.is_match(name) {
        return Err(anyhow!(
            "{} name '{}' must match ^[A-Za-z0-9_-]{{1,64}}$",
            kind,
            name
        ));
    }
    Ok(())
}
