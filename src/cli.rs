//! dnsgated - DNS-driven egress allow-list daemon

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::clock::SystemClock;
use crate::config::DaemonConfig;
use crate::firewall::{self, SystemRunner, ToolPaths};
use crate::hub::Hub;
use crate::resolution::{write_drop_file, ResolutionRecord};
use crate::resolvers::{write_resolvers_file, DnsSourceWatcher};
use crate::supervisor::{ChainLifecycle, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "dnsgated", about = "Allow VM egress only to addresses its resolver returned")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon until interrupted
    Run {
        #[arg(long, env = "DNSGATE_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Print which firewall backend this host would use
    Probe {
        #[arg(long, default_value = "/sbin/iptables")]
        iptables: PathBuf,
        #[arg(long, default_value = "/sbin/nft")]
        nft: PathBuf,
    },

    /// Drop a resolution file the way the resolver plugin does
    Emit {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        ttl: i64,
        #[arg(long = "a")]
        a: Vec<String>,
        #[arg(long = "aaaa")]
        aaaa: Vec<String>,
    },
}

pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Run { config } => run_daemon(DaemonConfig::load_from(config.as_deref())?),
        Command::Probe { iptables, nft } => {
            let kind = firewall::probe(&SystemRunner, &ToolPaths { iptables, nft })?;
            println!("{}", kind);
            Ok(())
        }
        Command::Emit { dir, ttl, a, aaaa } => {
            if a.is_empty() && aaaa.is_empty() {
                return Err(anyhow!("nothing to emit: pass --a and/or --aaaa"));
            }
            let records: Vec<ResolutionRecord> = a
                .iter()
                .map(|addr| ResolutionRecord::v4(ttl, addr))
                .chain(aaaa.iter().map(|addr| ResolutionRecord::v6(ttl, addr)))
                .collect();
            let path = write_drop_file(&dir, &records)?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

fn run_daemon(cfg: DaemonConfig) -> Result<()> {
    log::info!("dnsgated starting");
    let backend = firewall::select_backend(
        cfg.firewall.backend,
        &cfg.firewall.tools,
        Arc::new(SystemRunner),
    )?;
    let clock = Arc::new(SystemClock);
    let mut hub = Hub::new(clock.clone(), cfg.tick);

    let lifecycle = Arc::new(ChainLifecycle::new(
        backend.clone(),
        &cfg.firewall.table,
        &cfg.firewall.chain,
        cfg.resolved_dir.clone(),
    ));
    let session_name = format!("{}/{}", cfg.firewall.table, cfg.firewall.chain);
    let mut supervisor = Supervisor::new(&session_name, lifecycle, backend, clock, cfg.expiry);
    supervisor.start()?;
    hub.register(Box::new(supervisor));

    if let Some(parent) = cfg.dns.resolvers_file.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            log::warn!("cannot create {}: {}", parent.display(), e);
        }
    }
    let resolvers_file = cfg.dns.resolvers_file.clone();
    let publish = Box::new(move |servers: &[std::net::Ipv4Addr]| {
        if let Err(e) = write_resolvers_file(&resolvers_file, servers) {
            log::error!("{:#}", e);
        }
    });
    match DnsSourceWatcher::new(&cfg.dns.resolv_conf, publish) {
        Ok(watcher) => {
            hub.register(Box::new(watcher));
        }
        Err(e) => log::warn!("not following host DNS servers: {:#}", e),
    }

    let shutdown = hub.shutdown_flag();
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("dnsgated waiting for shutdown signal (Ctrl-C)...");
    hub.run()?;
    log::info!("dnsgated stopped");
    Ok(())
}
