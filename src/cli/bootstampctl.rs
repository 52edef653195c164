use std::io::BufRead;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::LevelFilter;

use crate::arbiter::{self, ArbiterClient, Request, EX_TEMPFAIL};

/// `bootstampctl` sub-commands: thin clients for the daemon's lock port,
/// used by the external cache builder and the shutdown tooling.
#[derive(Debug, Parser)]
#[clap(name = "bootstampctl", about = "Lock client for bootstampd", version)]
pub(crate) struct CtlCommand {
    /// Verbosity level (higher is more verbose).
    #[clap(short = 'v', action = clap::ArgAction::Count, global = true)]
    verbosity: u8,

    /// CLI sub-command.
    #[clap(subcommand)]
    pub(crate) cmd: CtlVerb,
}

#[derive(Debug, Parser)]
pub(crate) enum CtlVerb {
    #[clap(
        name = "lock-volume",
        about = "Hold a volume's update lock; the final exit status arrives on stdin"
    )]
    LockVolume(LockOpts),
    #[clap(name = "lock-reboot", about = "Take the reboot lock and hold it")]
    LockReboot,
}

#[derive(Debug, Parser)]
pub(crate) struct LockOpts {
    /// Device name of the volume, e.g. disk0s2
    #[clap(value_parser)]
    dev: String,
}

impl CtlCommand {
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
            CtlVerb::LockVolume(opts) => run_lock_volume(opts),
            CtlVerb::LockReboot => run_lock_reboot(),
        }
    }
}

fn connect() -> Result<ArbiterClient> {
    let path = arbiter::socket_path();
    ArbiterClient::connect(&path)
        .with_context(|| format!("connecting to bootstampd at {}", path.display()))
}

fn run_lock_volume(opts: LockOpts) -> Result<()> {
    let mut client = connect()?;
    let reply = client.request(&Request::LockVolume {
        dev: opts.dev.clone(),
    })?;
    if reply.status != 0 {
        bail!("lock of {} denied: status {}", opts.dev, reply.status);
    }
    println!("locked {}", opts.dev);

    // the caller reports its outcome as one line on stdin; EOF without a
    // status is "still in progress"
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let status: i32 = line.trim().parse().unwrap_or(EX_TEMPFAIL);
    client.request(&Request::UnlockVolume {
        dev: opts.dev,
        status,
    })?;
    Ok(())
}

fn run_lock_reboot() -> Result<()> {
    let mut client = connect()?;
    let reply = arbiter::request_reboot_lock(&mut client)?;
    match reply.status {
        0 => {
            println!("reboot lock held");
            // the lock lives as long as this process; reboot follows
            loop {
                std::thread::park();
            }
        }
        s if s == libc::EBUSY => {
            bail!("busy: {}", reply.busy_dev.unwrap_or_default())
        }
        s => bail!("reboot lock denied: status {s}"),
    }
}
