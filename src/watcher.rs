//! Volume watching: disk appear/change/disappear handling, per-path change
//! tokens, settle-delay coalescing, and the decision to fire rebuilds.
//!
//! Everything stateful runs on the daemon thread inside [`Daemon::run`];
//! the notify backend, the mount poller, and the IPC acceptor only forward
//! [`Event`]s into its channel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use crate::arbiter::{self, ConnId, IpcEvent};
use crate::bootcaches::{self, BootCaches};
use crate::builder;
use crate::disks::DiskService;

/// Quiet period between a change notification and the rebuild check.
pub(crate) const WATCH_SETTLE: Duration = Duration::from_secs(5);
/// A volume that failed this many consecutive updates stops blocking
/// reboot (it is still retried on later notifications).
pub(crate) const GIVEUP_THRESHOLD: u32 = 5;

pub(crate) enum Event {
    Disk(DiskEvent),
    FsChanged(PathBuf),
    Ipc(IpcEvent),
}

#[derive(Debug)]
pub(crate) enum DiskEvent {
    Appeared(String),
    Changed(String),
    Disappeared(String),
}

/// Per-device runtime state.
pub(crate) struct WatchedVol {
    pub(crate) caches: BootCaches,
    /// Pending settle deadline, if a change notification is cooking.
    pub(crate) settle: Option<Instant>,
    /// Connection holding this volume's lock.
    pub(crate) lock: Option<ConnId>,
    pub(crate) err_count: u32,
    /// Owners were force-enabled for the locker and must be restored.
    pub(crate) disable_owners: bool,
    /// Paths registered with the change-notification backend.
    pub(crate) paths: Vec<PathBuf>,
}

/// The daemon's service context: every callback receives this instead of
/// reaching for globals.
pub(crate) struct Daemon {
    pub(crate) disks: Arc<dyn DiskService>,
    pub(crate) vols: BTreeMap<String, WatchedVol>,
    pub(crate) reboot_lock: Option<ConnId>,
    pub(crate) settle_delay: Duration,
    watcher: RecommendedWatcher,
    tx: mpsc::Sender<Event>,
    rx: mpsc::Receiver<Event>,
}

impl Daemon {
    pub(crate) fn new(disks: Arc<dyn DiskService>) -> Result<Daemon> {
        let (tx, rx) = mpsc::channel();
        let wtx = tx.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(ev) => {
                    for p in ev.paths {
                        let _ = wtx.send(Event::FsChanged(p));
                    }
                }
                Err(e) => log::warn!("change notification error: {e}"),
            }
        })
        .context("setting up the filesystem watcher")?;
        Ok(Daemon {
            disks,
            vols: BTreeMap::new(),
            reboot_lock: None,
            settle_delay: WATCH_SETTLE,
            watcher,
            tx,
            rx,
        })
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }

    /// Pick up whatever is already mounted.  The mount poller does this on
    /// its first pass in production; tests call it directly.
    #[cfg(test)]
    pub(crate) fn prime(&mut self) -> Result<()> {
        for (dev, _) in self.disks.local_mounts()? {
            self.vol_appeared(&dev);
        }
        Ok(())
    }

    pub(crate) fn run(&mut self) -> Result<()> {
        loop {
            let timeout = self
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_secs(3600));
            self.step(timeout);
        }
    }

    /// One turn of the event loop: wait up to `timeout` for an event,
    /// dispatch it, then fire any settle timers that came due.
    pub(crate) fn step(&mut self, timeout: Duration) {
        match self.rx.recv_timeout(timeout) {
            Ok(ev) => self.dispatch(ev),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                unreachable!("the daemon holds its own event sender")
            }
        }
        self.fire_due_settles();
    }

    fn dispatch(&mut self, ev: Event) {
        match ev {
            Event::Disk(DiskEvent::Appeared(dev)) => self.vol_appeared(&dev),
            Event::Disk(DiskEvent::Changed(dev)) => self.vol_changed(&dev),
            Event::Disk(DiskEvent::Disappeared(dev)) => self.vol_disappeared(&dev),
            Event::FsChanged(p) => self.fsys_changed(&p),
            Event::Ipc(ev) => arbiter::handle_ipc(self, ev),
        }
    }

    pub(crate) fn vol_appeared(&mut self, dev: &str) {
        if self.vols.contains_key(dev) {
            log::warn!("refreshing watch of volume already in watch table?");
            self.vol_disappeared(dev);
        }
        match self.try_watch(dev) {
            Ok(true) => {}
            Ok(false) => log::debug!("skipping uninteresting volume {dev}"),
            Err(e) => log::error!("trouble setting up watch of {dev}: {e:#}"),
        }
    }

    fn try_watch(&mut self, dev: &str) -> Result<bool> {
        let Some(desc) = self.disks.describe(dev)? else {
            return Ok(false);
        };
        if !desc.writable || desc.network {
            return Ok(false);
        }
        let Some(root) = desc.mountpoint else {
            return Ok(false);
        };
        // only helper-partitioned volumes are interesting
        if !self.disks.booter_partitions(dev)?.is_boot_root() {
            return Ok(false);
        }

        // the descriptor is unreadable while owners are ignored, so honor
        // them for the duration of the read
        let ignored = self.disks.owners_ignored(&root).unwrap_or(false);
        if ignored {
            if let Err(e) = self.disks.set_owners(dev, true) {
                log::warn!("couldn't enable owners on {dev}: {e:#}");
            }
        }
        let caches = bootcaches::read_caches(&root, &*self.disks);
        if ignored {
            if let Err(e) = self.disks.set_owners(dev, false) {
                log::warn!("couldn't restore owners on {dev}: {e:#}");
            }
        }
        let Some(caches) = caches? else {
            return Ok(false);
        };

        let mut vol = WatchedVol {
            caches,
            settle: None,
            lock: None,
            err_count: 0,
            disable_owners: false,
            paths: Vec::new(),
        };
        if let Err(e) = self.register_watches(&mut vol) {
            // cancel whatever did register before giving up on the volume
            for p in &vol.paths {
                let _ = self.watcher.unwatch(p);
            }
            return Err(e);
        }
        self.vols.insert(dev.to_string(), vol);
        self.check_rebuild(dev, false);
        Ok(true)
    }

    fn register_watches(&mut self, vol: &mut WatchedVol) -> Result<()> {
        let caches = &vol.caches;
        let mut paths: Vec<Utf8PathBuf> = Vec::new();
        if let Some(exts) = &caches.exts {
            paths.push(caches.root.join(exts));
        }
        for cp in caches.rpspaths.iter().chain(caches.miscpaths.iter()) {
            paths.push(caches.root.join(&cp.rpath));
        }
        for cp in [caches.efibooter.as_ref(), caches.ofbooter.as_ref()]
            .into_iter()
            .flatten()
        {
            paths.push(caches.root.join(&cp.rpath));
        }

        for p in paths {
            let p = p.into_std_path_buf();
            match self.watcher.watch(&p, RecursiveMode::NonRecursive) {
                Ok(()) => vol.paths.push(p),
                Err(notify::Error {
                    kind: notify::ErrorKind::PathNotFound,
                    ..
                }) => {
                    // a missing optional source has nothing to watch yet
                    log::trace!("not watching absent {}", p.display());
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("watching {}", p.display()));
                }
            }
        }
        Ok(())
    }

    /// A mountpoint change is a disappearance followed by an appearance.
    fn vol_changed(&mut self, dev: &str) {
        if self.vols.contains_key(dev) {
            self.vol_disappeared(dev);
        }
        let mounted = self
            .disks
            .describe(dev)
            .ok()
            .flatten()
            .map(|d| d.mountpoint.is_some())
            .unwrap_or(false);
        if mounted {
            self.vol_appeared(dev);
        }
    }

    pub(crate) fn vol_disappeared(&mut self, dev: &str) {
        let Some(vol) = self.vols.remove(dev) else {
            return;
        };
        // pending timers die with the volume, and perm/noperm no longer
        // matters on an unmounted device
        if vol.lock.is_some() {
            log::warn!("{dev} disappeared while locked");
        }
        for p in &vol.paths {
            let _ = self.watcher.unwatch(p);
        }
    }

    /// A change token fired: re-arm the settle timer so notification bursts
    /// coalesce into one check.
    fn fsys_changed(&mut self, path: &Path) {
        let mut hit = None;
        for (dev, vol) in &self.vols {
            if vol.paths.iter().any(|w| path == w || path.starts_with(w)) {
                hit = Some(dev.clone());
                break;
            }
        }
        let Some(dev) = hit else {
            log::trace!("change notification for untracked {}", path.display());
            return;
        };
        let deadline = Instant::now() + self.settle_delay;
        if let Some(vol) = self.vols.get_mut(&dev) {
            vol.settle = Some(deadline);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.vols.values().filter_map(|v| v.settle).min()
    }

    pub(crate) fn fire_due_settles(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .vols
            .iter()
            .filter(|(_, v)| v.settle.map(|t| t <= now).unwrap_or(false))
            .map(|(d, _)| d.clone())
            .collect();
        for dev in due {
            if let Some(vol) = self.vols.get_mut(&dev) {
                vol.settle = None;
            }
            self.check_rebuild(&dev, false);
        }
    }

    /// Decide whether anything needs rebuilding and fire the right builder
    /// detached.  Returns true iff a builder was launched.
    pub(crate) fn check_rebuild(&mut self, dev: &str, force: bool) -> bool {
        let disks = self.disks.clone();
        let Some(vol) = self.vols.get_mut(dev) else {
            return false;
        };
        // direct calls supersede any pending settle timer
        vol.settle = None;

        let mut launched = false;
        if bootcaches::kernel_cache_stale(&vol.caches) {
            // success makes the cache file change, which fires a token and
            // brings us back here for the helper pass
            match builder::rebuild_kernel_cache(&vol.caches, false) {
                Ok(launch) => {
                    log::debug!("kernel-cache rebuild for {dev}: {launch:?}");
                    launched = true;
                }
                Err(e) => {
                    log::error!("couldn't launch kernel-cache rebuild for {dev}: {e:#}");
                    vol.err_count += 1;
                }
            }
        } else {
            let eligible = (|| -> Result<bool> {
                let st = rustix::fs::fstat(&vol.caches.cachefd)?;
                let Some(d) = disks.device_for(st.st_dev as u64)? else {
                    return Ok(false);
                };
                Ok(disks.booter_partitions(&d)?.is_boot_root())
            })()
            .unwrap_or(false);

            if eligible {
                let any = match bootcaches::need_updates(&mut vol.caches) {
                    Ok(n) => n.any,
                    // a stat error reads as "needs an update"; the builder
                    // will log specifics
                    Err(_) => true,
                };
                if any || force {
                    match builder::rebuild_helpers(&vol.caches.root, force) {
                        Ok(launch) => {
                            log::debug!("helper update for {dev}: {launch:?}");
                            launched = true;
                        }
                        Err(e) => {
                            log::error!("couldn't launch helper update for {dev}: {e:#}");
                            vol.err_count += 1;
                        }
                    }
                }
            }
        }
        launched
    }
}

/// Appear/change/disappear events come from diffing the mount table; the
/// first pass reports everything as appeared.
pub(crate) fn spawn_mount_poller(
    disks: Arc<dyn DiskService>,
    tx: mpsc::Sender<Event>,
    interval: Duration,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut known: BTreeMap<String, Utf8PathBuf> = BTreeMap::new();
        loop {
            match disks.local_mounts() {
                Ok(mounts) => {
                    let next: BTreeMap<String, Utf8PathBuf> = mounts.into_iter().collect();
                    for (dev, mnt) in &next {
                        let ev = match known.get(dev) {
                            None => Some(DiskEvent::Appeared(dev.clone())),
                            Some(old) if old != mnt => Some(DiskEvent::Changed(dev.clone())),
                            _ => None,
                        };
                        if let Some(ev) = ev {
                            if tx.send(Event::Disk(ev)).is_err() {
                                return;
                            }
                        }
                    }
                    for dev in known.keys() {
                        if !next.contains_key(dev)
                            && tx
                                .send(Event::Disk(DiskEvent::Disappeared(dev.clone())))
                                .is_err()
                        {
                            return;
                        }
                    }
                    known = next;
                }
                Err(e) => log::warn!("couldn't list local mounts: {e:#}"),
            }
            std::thread::sleep(interval);
        }
    })
}


#[cfg(test)]
mod tests {
    use super::testsupport::daemon_with_fixture;
    use super::*;
    use crate::bootcaches::testutil::*;

    fn stub_updater(dir: &Path) -> (PathBuf, PathBuf) {
        use std::os::unix::fs::PermissionsExt;
        let log = dir.join("updates.log");
        let stub = dir.join("updater.sh");
        std::fs::write(
            &stub,
            format!("#!/bin/sh\necho \"$@\" >> {}\n", log.display()),
        )
        .unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();
        (stub, log)
    }

    fn wait_for_lines(log: &Path, want: usize) -> usize {
        for _ in 0..100 {
            let n = std::fs::read_to_string(log)
                .map(|s| s.lines().count())
                .unwrap_or(0);
            if n >= want {
                return n;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        std::fs::read_to_string(log)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[test]
    fn test_prime_watches_fixture_volume() {
        let _env = env_lock();
        std::env::set_var("BOOTSTAMPD_UPDATER", "/bin/true");
        let td = tempfile::tempdir().unwrap();
        let (root, _helper, disks) = fixture_volume(td.path());
        settle_kernel_cache(&root);
        let mut d = Daemon::new(disks).unwrap();
        d.prime().unwrap();
        assert!(d.vols.contains_key("disk0s2"));
        assert!(!d.vols["disk0s2"].paths.is_empty());

        d.vol_disappeared("disk0s2");
        assert!(d.vols.is_empty());
        std::env::remove_var("BOOTSTAMPD_UPDATER");
    }

    #[test]
    fn test_settle_timer_coalesces_bursts() {
        let _env = env_lock();
        let td = tempfile::tempdir().unwrap();
        let (stub, log) = stub_updater(td.path());
        std::env::set_var("BOOTSTAMPD_UPDATER", &stub);

        let (mut d, dev, root, _disks) = daemon_with_fixture(td.path());
        let kernel = root.join("mach_kernel").into_std_path_buf();

        // first token arms the timer
        d.fsys_changed(&kernel);
        let first = d.vols[&dev].settle.expect("settle armed");
        std::thread::sleep(Duration::from_millis(10));
        // a second token invalidates and re-arms it
        d.fsys_changed(&kernel);
        let second = d.vols[&dev].settle.expect("settle re-armed");
        assert!(second > first);

        // nothing fires before the deadline
        d.fire_due_settles();
        assert_eq!(wait_for_lines(&log, 0), 0);

        // expiry fires exactly one rebuild for the burst
        d.vols.get_mut(&dev).unwrap().settle = Some(Instant::now() - Duration::from_millis(1));
        d.fire_due_settles();
        assert_eq!(wait_for_lines(&log, 1), 1);
        let line = std::fs::read_to_string(&log).unwrap();
        assert_eq!(line.trim(), format!("update {root}"));
        assert!(d.vols[&dev].settle.is_none());

        std::env::remove_var("BOOTSTAMPD_UPDATER");
    }

    #[test]
    fn test_check_rebuild_skips_current_volume() {
        let _env = env_lock();
        std::env::set_var("BOOTSTAMPD_UPDATER", "/bin/false-but-unused");
        let td = tempfile::tempdir().unwrap();
        let (mut d, dev, _root, _disks) = daemon_with_fixture(td.path());

        // everything stamped means nothing to do
        bootcaches::need_updates(&mut d.vols.get_mut(&dev).unwrap().caches).unwrap();
        bootcaches::apply_stamps(&d.vols[&dev].caches).unwrap();
        assert!(!d.check_rebuild(&dev, false));

        std::env::remove_var("BOOTSTAMPD_UPDATER");
    }

    #[test]
    fn test_change_notification_maps_through_watched_dirs() {
        let _env = env_lock();
        std::env::set_var("BOOTSTAMPD_UPDATER", "/bin/true");
        let td = tempfile::tempdir().unwrap();
        let (mut d, dev, root, _disks) = daemon_with_fixture(td.path());

        // a path under a watched directory (the exts dir case) still
        // resolves to its volume
        let nested = root
            .join("System/Library/CoreServices/.disk_label")
            .into_std_path_buf();
        d.fsys_changed(&nested);
        assert!(d.vols[&dev].settle.is_some());

        // unrelated paths are ignored
        d.vols.get_mut(&dev).unwrap().settle = None;
        d.fsys_changed(Path::new("/somewhere/unrelated"));
        assert!(d.vols[&dev].settle.is_none());

        std::env::remove_var("BOOTSTAMPD_UPDATER");
    }
}
