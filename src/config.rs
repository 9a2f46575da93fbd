use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::allowlist::{ExpiryPolicy, COALESCE_WINDOW_SECS, GRACE_SECS, MIN_TIMER_DELAY_SECS};
use crate::firewall::{BackendChoice, ToolPaths};

const DEFAULT_TABLE: &str = "dnsgate";
const DEFAULT_CHAIN: &str = "dnsgate-allow";
const DEFAULT_RESOLVED_DIR: &str = "/run/dnsgate/resolved";
const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";
const DEFAULT_RESOLVERS_FILE: &str = "/run/dnsgate/resolv.json";
const DEFAULT_TICK_MS: u64 = 500;

#[derive(Debug, Deserialize, Default)]
struct DaemonConfigFile {
    firewall: Option<FirewallConfigFile>,
    resolved_dir: Option<PathBuf>,
    dns: Option<DnsConfigFile>,
    expiry: Option<ExpiryConfigFile>,
    hub: Option<HubConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct FirewallConfigFile {
    backend: Option<String>,
    table: Option<String>,
    chain: Option<String>,
    iptables_path: Option<PathBuf>,
    nft_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DnsConfigFile {
    resolv_conf: Option<PathBuf>,
    resolvers_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ExpiryConfigFile {
    grace_secs: Option<u64>,
    coalesce_secs: Option<u64>,
    min_timer_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct HubConfigFile {
    tick_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub firewall: FirewallSettings,
    pub resolved_dir: PathBuf,
    pub dns: DnsSettings,
    pub expiry: ExpiryPolicy,
    pub tick: Duration,
}

#[derive(Debug, Clone)]
pub struct FirewallSettings {
    pub backend: BackendChoice,
    pub table: String,
    pub chain: String,
    pub tools: ToolPaths,
}

#[derive(Debug, Clone)]
pub struct DnsSettings {
    pub resolv_conf: PathBuf,
    pub resolvers_file: PathBuf,
}

impl DaemonConfig {
    /// Load from `DNSGATE_CONFIG` (if set), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("DNSGATE_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like [`DaemonConfig::load`] with an explicit file.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DaemonConfigFile) -> Result<Self> {
        let fw = file.firewall.unwrap_or_default();
        let backend = match fw.backend.as_deref() {
            Some(name) => name.parse()?,
            None => BackendChoice::Auto,
        };
        let defaults = ToolPaths::default();
        let firewall = FirewallSettings {
            backend,
            table: fw.table.unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            chain: fw.chain.unwrap_or_else(|| DEFAULT_CHAIN.to_string()),
            tools: ToolPaths {
                iptables: fw.iptables_path.unwrap_or(defaults.iptables),
                nft: fw.nft_path.unwrap_or(defaults.nft),
            },
        };
        let resolved_dir = file
            .resolved_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESOLVED_DIR));
        let dns = DnsSettings {
            resolv_conf: file
                .dns
                .as_ref()
                .and_then(|dns| dns.resolv_conf.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RESOLV_CONF)),
            resolvers_file: file
                .dns
                .and_then(|dns| dns.resolvers_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RESOLVERS_FILE)),
        };
        let expiry = ExpiryPolicy {
            grace_secs: file
                .expiry
                .as_ref()
                .and_then(|expiry| expiry.grace_secs)
                .unwrap_or(GRACE_SECS),
            coalesce_secs: file
                .expiry
                .as_ref()
                .and_then(|expiry| expiry.coalesce_secs)
                .unwrap_or(COALESCE_WINDOW_SECS),
            min_timer_delay_secs: file
                .expiry
                .and_then(|expiry| expiry.min_timer_delay_secs)
                .unwrap_or(MIN_TIMER_DELAY_SECS),
        };
        let tick = Duration::from_millis(
            file.hub
                .and_then(|hub| hub.tick_ms)
                .unwrap_or(DEFAULT_TICK_MS),
        );
        Ok(Self {
            firewall,
            resolved_dir,
            dns,
            expiry,
            tick,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(backend) = std::env::var("DNSGATE_BACKEND") {
            if !backend.trim().is_empty() {
                self.firewall.backend = backend.parse()?;
            }
        }
        if let Ok(table) = std::env::var("DNSGATE_TABLE") {
            if !table.trim().is_empty() {
                self.firewall.table = table;
            }
        }
        if let Ok(chain) = std::env::var("DNSGATE_CHAIN") {
            if !chain.trim().is_empty() {
                self.firewall.chain = chain;
            }
        }
        if let Ok(dir) = std::env::var("DNSGATE_RESOLVED_DIR") {
            if !dir.trim().is_empty() {
                self.resolved_dir = PathBuf::from(dir);
            }
        }
        if let Ok(path) = std::env::var("DNSGATE_RESOLV_CONF") {
            if !path.trim().is_empty() {
                self.dns.resolv_conf = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("DNSGATE_RESOLVERS_FILE") {
            if !path.trim().is_empty() {
                self.dns.resolvers_file = PathBuf::from(path);
            }
        }
        if let Ok(grace) = std::env::var("DNSGATE_GRACE_SECS") {
            self.expiry.grace_secs = grace.parse().map_err(|_| {
                anyhow!("DNSGATE_GRACE_SECS must be an integer number of seconds")
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        crate::validate_rule_name("table", &self.firewall.table)?;
        crate::validate_rule_name("chain", &self.firewall.chain)?;
        if self.expiry.min_timer_delay_secs == 0 {
            return Err(anyhow!("min_timer_delay_secs must be greater than zero"));
        }
        if self.tick.is_zero() {
            return Err(anyhow!("tick_ms must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<DaemonConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
