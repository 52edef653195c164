use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use log::LevelFilter;

use crate::arbiter::{self, VolumeLock};
use crate::disks::{DiskService, HostDisks};
use crate::publisher;
use crate::watcher::{self, Daemon};

/// `bootstampd` sub-commands.
#[derive(Debug, Parser)]
#[clap(name = "bootstampd", about = "Boot helper partition updater", version)]
pub(crate) struct DCommand {
    /// Verbosity level (higher is more verbose).
    #[clap(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbosity: u8,

    /// CLI sub-command.
    #[clap(subcommand)]
    pub(crate) cmd: DVerb,
}

#[derive(Debug, Parser)]
pub(crate) enum DVerb {
    #[clap(name = "daemon", about = "Watch volumes and arbitrate locks")]
    Daemon,
    #[clap(
        name = "update",
        about = "Publish boot artifacts to a volume's helper partitions"
    )]
    Update(UpdateOpts),
}

#[derive(Debug, Parser)]
pub(crate) struct UpdateOpts {
    /// Republish even if nothing appears out of date
    #[clap(long, short = 'f')]
    force: bool,

    /// Root of the volume to update
    #[clap(value_parser)]
    root: String,
}

impl DCommand {
    /// Return the log-level set via command-line flags.
    pub(crate) fn loglevel(&self) -> LevelFilter {
        match self.verbosity {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    pub(crate) fn run(self) -> Result<()> {
        match self.cmd {
            DVerb::Daemon => run_daemon(),
            DVerb::Update(opts) => run_update(opts),
        }
    }
}

const DAEMON_LOCK: &str = "/run/bootstampd.lock";
const MOUNT_POLL: Duration = Duration::from_secs(5);

fn run_daemon() -> Result<()> {
    use fs2::FileExt;

    // systemd units are the usual single-instance guarantee; this is the
    // backstop for manual invocations
    let lockfile = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(DAEMON_LOCK)
        .with_context(|| format!("opening {DAEMON_LOCK}"))?;
    lockfile
        .try_lock_exclusive()
        .context("another bootstampd instance is running")?;

    let listener = arbiter::bind_listener()?;
    let disks: Arc<dyn DiskService> = Arc::new(HostDisks::new());
    let mut daemon = Daemon::new(disks.clone())?;
    arbiter::spawn_acceptor(listener, daemon.sender());
    watcher::spawn_mount_poller(disks, daemon.sender(), MOUNT_POLL);

    if let Err(e) = libsystemd::daemon::notify(false, &[libsystemd::daemon::NotifyState::Ready]) {
        log::debug!("no systemd notification socket: {e}");
    }
    log::info!("watching volumes");
    daemon.run()
}

/// Runner for the `update` verb; this is what the watcher re-invokes.
fn run_update(opts: UpdateOpts) -> Result<()> {
    let root = Utf8PathBuf::from(opts.root);
    let disks = HostDisks::new();
    let dev = rustix::fs::stat(root.as_std_path())
        .ok()
        .and_then(|st| disks.device_for(st.st_dev as u64).ok().flatten());
    let mut lock = VolumeLock::acquire(dev)?;
    let r = publisher::update_boots(&root, opts.force, &disks, &mut lock);
    lock.finish(if r.is_ok() { 0 } else { 1 });
    r.context("boot partition update failed")
}
