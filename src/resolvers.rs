//! Host DNS servers: follow the host's nameserver configuration and
//! republish its IPv4 nameservers for the VM-side resolver.
//!
//! Two sources are supported. NetworkManager's `DnsManager` object is used
//! when it is reachable on the system bus; otherwise the resolver file is
//! watched. A resolver file that is a symlink (as with systemd-resolved) is
//! followed, and the directory of its target is watched as well.

use anyhow::{anyhow, Context as _, Result};
use nix::sys::inotify::AddWatchFlags;
use std::collections::HashMap;
use std::io::Write;
use std::net::Ipv4Addr;
use std::os::fd::BorrowedFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zbus::blocking::fdo::PropertiesProxy;
use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::OwnedValue;

use crate::hub::{Component, Context};
use crate::watch::{DirWatch, WatchEvent};

pub type ResolversCallback = Box<dyn FnMut(&[Ipv4Addr])>;

const NM_SERVICE: &str = "org.freedesktop.NetworkManager";
const NM_DNS_PATH: &str = "/org/freedesktop/NetworkManager/DnsManager";
const NM_DNS_INTERFACE: &str = "org.freedesktop.NetworkManager.DnsManager";

/// IPv4 addresses among `values`, deduplicated, in order.
pub fn merge_nameservers<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<Ipv4Addr> {
    let mut servers = Vec::new();
    for value in values {
        match value.trim().parse::<Ipv4Addr>() {
            Ok(addr) if !servers.contains(&addr) => servers.push(addr),
            Ok(_) => {}
            Err(_) => log::debug!("skipping non-IPv4 nameserver '{}'", value),
        }
    }
    servers
}

/// IPv4 `nameserver` entries of a resolv.conf, deduplicated, in file order.
/// IPv6 and malformed lines are skipped.
pub fn parse_resolv_conf(content: &str) -> Vec<Ipv4Addr> {
    let values = content.lines().filter_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            return None;
        }
        match (fields.next(), fields.next()) {
            (Some(value), None) => Some(value),
            _ => {
                log::debug!("skipping malformed resolver line '{}'", line);
                None
            }
        }
    });
    merge_nameservers(values)
}

/// Atomically replace `path` with the JSON list `["1.1.1.1", ...]`.
pub fn write_resolvers_file(path: &Path, servers: &[Ipv4Addr]) -> Result<()> {
    let dir = parent_dir(path);
    let list: Vec<String> = servers.iter().map(Ipv4Addr::to_string).collect();
    let mut staged = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("cannot stage resolvers file in {}", dir.display()))?;
    serde_json::to_writer(&mut staged, &list)?;
    staged.flush()?;
    staged
        .persist(path)
        .map_err(|e| anyhow!("cannot write {}: {}", path.display(), e.error))?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// The resolver file, watched through its parent directory so replacement
/// by rename is seen, plus the directory of its symlink target.
struct FileSource {
    path: PathBuf,
    target: Option<PathBuf>,
    watch: DirWatch,
}

impl FileSource {
    fn open(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .ok_or_else(|| anyhow!("{} does not name a file", path.display()))?;
        let parent = parent_dir(path);
        let mask =
            AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO | AddWatchFlags::IN_CREATE;
        let watch = DirWatch::new(parent, mask)?;
        let mut source = Self {
            path: parent.join(name),
            target: None,
            watch,
        };
        source.follow_target();
        Ok(source)
    }

    /// Re-resolve the symlink chain and watch the directory it ends in.
    fn follow_target(&mut self) {
        let target = std::fs::canonicalize(&self.path)
            .ok()
            .filter(|target| *target != self.path);
        if let Some(dir) = target.as_deref().and_then(Path::parent) {
            match self.watch.add_dir(dir) {
                Ok(true) => log::info!("{} points into {}, watching it too", self.path.display(), dir.display()),
                Ok(false) => {}
                Err(e) => log::warn!("{}", e),
            }
        }
        self.target = target;
    }

    /// Drain events; true when the file or its target may have changed.
    fn take_change(&mut self) -> bool {
        let events = match self.watch.read() {
            Ok(events) => events,
            Err(e) => {
                log::error!("{}", e);
                return false;
            }
        };
        let touched = events.iter().any(|event| match event {
            WatchEvent::File(path) => *path == self.path || Some(path) == self.target.as_ref(),
            // A new symlink is complete once created; a new regular file is
            // reported again when closed.
            WatchEvent::Created(path) => *path == self.path && path.is_symlink(),
            WatchEvent::Overflow => true,
        });
        if touched {
            self.follow_target();
        }
        touched
    }

    fn nameservers(&self) -> Vec<Ipv4Addr> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => parse_resolv_conf(&content),
            Err(e) => {
                log::warn!("cannot read {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }
}

/// NetworkManager's DNS configuration, re-read whenever its `Configuration`
/// property changes.
struct NetworkManagerSource {
    proxy: Proxy<'static>,
    changed: Arc<AtomicBool>,
}

impl NetworkManagerSource {
    fn connect() -> Result<Self> {
        let conn = Connection::system().context("cannot connect to the system bus")?;
        let proxy = Proxy::new(&conn, NM_SERVICE, NM_DNS_PATH, NM_DNS_INTERFACE)
            .context("cannot create DnsManager proxy")?;
        let source = Self {
            proxy,
            changed: Arc::new(AtomicBool::new(false)),
        };
        // Fails when NetworkManager does not run or does not manage DNS.
        source.nameservers()?;

        let properties = PropertiesProxy::builder(&conn)
            .destination(NM_SERVICE)?
            .path(NM_DNS_PATH)?
            .build()
            .context("cannot create properties proxy")?;
        let changed = source.changed.clone();
        std::thread::Builder::new()
            .name("nm-dns-signals".to_string())
            .spawn(move || {
                let signals = match properties.receive_properties_changed() {
                    Ok(signals) => signals,
                    Err(e) => {
                        log::error!("cannot subscribe to DnsManager changes: {}", e);
                        return;
                    }
                };
                for signal in signals {
                    let Ok(args) = signal.args() else {
                        continue;
                    };
                    if args.changed_properties().contains_key("Configuration") {
                        changed.store(true, Ordering::SeqCst);
                    }
                }
            })
            .context("cannot spawn DnsManager listener")?;
        Ok(source)
    }

    fn take_change(&self) -> bool {
        self.changed.swap(false, Ordering::SeqCst)
    }

    fn nameservers(&self) -> Result<Vec<Ipv4Addr>> {
        let config: Vec<HashMap<String, OwnedValue>> = self
            .proxy
            .get_property("Configuration")
            .context("cannot read DnsManager configuration")?;
        let mut values = Vec::new();
        for mut entry in config {
            if let Some(list) = entry.remove("nameservers") {
                values.extend(Vec::<String>::try_from(list)?);
            }
        }
        Ok(merge_nameservers(values.iter().map(String::as_str)))
    }
}

enum Source {
    File(FileSource),
    NetworkManager(NetworkManagerSource),
}

impl Source {
    fn describe(&self) -> String {
        match self {
            Source::File(file) => file.path.display().to_string(),
            Source::NetworkManager(_) => NM_DNS_PATH.to_string(),
        }
    }

    fn nameservers(&self) -> Result<Vec<Ipv4Addr>> {
        match self {
            Source::File(file) => Ok(file.nameservers()),
            Source::NetworkManager(nm) => nm.nameservers(),
        }
    }
}

/// Republishes the host's nameserver list whenever its source changes.
pub struct DnsSourceWatcher {
    source: Source,
    servers: Vec<Ipv4Addr>,
    callback: ResolversCallback,
}

impl DnsSourceWatcher {
    /// Use NetworkManager when it is available, the resolver file at `path`
    /// otherwise.
    pub fn new(path: &Path, callback: ResolversCallback) -> Result<Self> {
        match NetworkManagerSource::connect() {
            Ok(nm) => Self::with_source(Source::NetworkManager(nm), callback),
            Err(e) => {
                log::debug!("NetworkManager DNS source unavailable: {:#}", e);
                Self::from_file(path, callback)
            }
        }
    }

    /// Watch the resolver file at `path` and call `callback` with the
    /// current list right away.
    pub fn from_file(path: &Path, callback: ResolversCallback) -> Result<Self> {
        Self::with_source(Source::File(FileSource::open(path)?), callback)
    }

    pub fn from_network_manager(callback: ResolversCallback) -> Result<Self> {
        Self::with_source(
            Source::NetworkManager(NetworkManagerSource::connect()?),
            callback,
        )
    }

    fn with_source(source: Source, mut callback: ResolversCallback) -> Result<Self> {
        let servers = source.nameservers()?;
        log::info!("Using {} as DNS source", source.describe());
        log::info!("DNS servers: {}", format_list(&servers));
        callback(&servers);
        Ok(Self {
            source,
            servers,
            callback,
        })
    }

    pub fn servers(&self) -> &[Ipv4Addr] {
        &self.servers
    }

    /// Re-read the source; returns true when the list changed and the
    /// callback ran. A source that cannot be read keeps the last list.
    pub fn refresh(&mut self) -> bool {
        let servers = match self.source.nameservers() {
            Ok(servers) => servers,
            Err(e) => {
                log::warn!("cannot refresh DNS servers: {:#}", e);
                return false;
            }
        };
        if servers == self.servers {
            return false;
        }
        log::info!("Updated list of DNS servers: {}", format_list(&servers));
        self.servers = servers;
        (self.callback)(&self.servers);
        true
    }

    /// Consume pending change notifications and refresh if any arrived.
    pub fn process_pending(&mut self) -> bool {
        let changed = match &mut self.source {
            Source::File(file) => file.take_change(),
            Source::NetworkManager(nm) => nm.take_change(),
        };
        changed && self.refresh()
    }
}

fn format_list(servers: &[Ipv4Addr]) -> String {
    servers
        .iter()
        .map(Ipv4Addr::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Component for DnsSourceWatcher {
    fn name(&self) -> String {
        format!("dns-source:{}", self.source.describe())
    }

    fn fd(&self) -> Option<BorrowedFd<'_>> {
        use std::os::fd::AsFd;
        match &self.source {
            Source::File(file) => Some(file.watch.as_fd()),
            Source::NetworkManager(_) => None,
        }
    }

    fn on_readable(&mut self, _cx: &mut Context<'_>) {
        self.process_pending();
    }

    // Bus signals arrive on the listener thread and are picked up here.
    fn on_tick(&mut self, _cx: &mut Context<'_>) {
        if matches!(self.source, Source::NetworkManager(_)) {
            self.process_pending();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Seen = Rc<RefCell<Vec<Vec<Ipv4Addr>>>>;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn recorder(seen: &Seen) -> ResolversCallback {
        let sink = seen.clone();
        Box::new(move |servers: &[Ipv4Addr]| sink.borrow_mut().push(servers.to_vec()))
    }

    #[test]
    fn keeps_ipv4_nameservers_once() {
        let conf = "# generated\nsearch lan\nnameserver 192.168.1.1\nnameserver ::1\n\
                    nameserver 192.168.1.1\nnameserver\nnameserver 8.8.8.8 extra\nnameserver 9.9.9.9\n";
        assert_eq!(parse_resolv_conf(conf), vec![ip("192.168.1.1"), ip("9.9.9.9")]);
    }

    #[test]
    fn merged_service_lists_drop_v6_and_repeats() {
        let lists = [vec!["10.0.0.1", "fe80::1"], vec!["10.0.0.1", "10.0.0.2", "junk"]];
        let merged = merge_nameservers(lists.iter().flatten().copied());
        assert_eq!(merged, vec![ip("10.0.0.1"), ip("10.0.0.2")]);
    }

    #[test]
    fn resolvers_file_is_a_json_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.json");
        write_resolvers_file(&path, &[ip("1.1.1.1"), ip("8.8.8.8")]).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            r#"["1.1.1.1","8.8.8.8"]"#
        );
    }

    #[test]
    fn callback_runs_initially_and_on_change_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 10.0.0.1\n").unwrap();

        let seen = Seen::default();
        let mut watcher = DnsSourceWatcher::from_file(&path, recorder(&seen)).unwrap();
        assert_eq!(*seen.borrow(), vec![vec![ip("10.0.0.1")]]);

        std::fs::write(dir.path().join("unrelated"), "nameserver 1.2.3.4\n").unwrap();
        assert!(!watcher.process_pending());

        std::fs::write(&path, "nameserver 10.0.0.1\n").unwrap();
        assert!(!watcher.process_pending());

        let staged = dir.path().join("resolv.conf.new");
        std::fs::write(&staged, "nameserver 10.0.0.2\nnameserver 10.0.0.1\n").unwrap();
        std::fs::rename(&staged, &path).unwrap();
        assert!(watcher.process_pending());
        assert_eq!(watcher.servers(), &[ip("10.0.0.2"), ip("10.0.0.1")]);
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn symlinked_resolver_file_follows_its_target() {
        let root = tempfile::tempdir().unwrap();
        let etc = root.path().join("etc");
        let run = root.path().join("run");
        let other = root.path().join("other");
        for dir in [&etc, &run, &other] {
            std::fs::create_dir(dir).unwrap();
        }
        std::fs::write(run.join("resolv.conf"), "nameserver 10.0.0.1\n").unwrap();
        let link = etc.join("resolv.conf");
        std::os::unix::fs::symlink(run.join("resolv.conf"), &link).unwrap();

        let seen = Seen::default();
        let mut watcher = DnsSourceWatcher::from_file(&link, recorder(&seen)).unwrap();
        assert_eq!(watcher.servers(), &[ip("10.0.0.1")]);

        // The daemon owning the target rewrites it in place.
        std::fs::write(run.join("resolv.conf"), "nameserver 10.0.0.2\n").unwrap();
        assert!(watcher.process_pending());
        assert_eq!(watcher.servers(), &[ip("10.0.0.2")]);

        // Repointing the link switches to the new target's directory.
        std::fs::write(other.join("resolv.conf"), "nameserver 10.0.0.3\n").unwrap();
        let staged = etc.join(".resolv.conf.new");
        std::os::unix::fs::symlink(other.join("resolv.conf"), &staged).unwrap();
        std::fs::rename(&staged, &link).unwrap();
        assert!(watcher.process_pending());
        assert_eq!(watcher.servers(), &[ip("10.0.0.3")]);

        std::fs::write(other.join("resolv.conf"), "nameserver 10.0.0.4\n").unwrap();
        assert!(watcher.process_pending());
        assert_eq!(watcher.servers(), &[ip("10.0.0.4")]);
        assert_eq!(seen.borrow().len(), 4);
    }
}
