/*!
Boot helper partition updater.

Keeps the helper boot partitions of a volume consistent with the artifacts
its descriptor file declares: kernel caches, booters, boot configuration,
and labels.  One binary carries the long-lived watcher daemon, the
transactional publisher it re-invokes, and the lock clients used by the
external cache builder and the shutdown tooling.
!*/

#![deny(unused_must_use)]
// The style lints are more annoying than useful
#![allow(clippy::style)]

mod arbiter;
mod bootcaches;
mod builder;
mod cli;
mod disks;
mod failpoints;
mod publisher;
mod rps;
mod safedir;
mod util;
mod watcher;

use clap::crate_name;

/// Entrypoint shared by the daemon, the publisher re-entry, and the lock
/// clients; which one runs is decided by our invoked name and subcommand.
fn main() {
    let _scenario = fail::FailScenario::setup();
    std::process::exit(run_cli());
}

fn run_cli() -> i32 {
    let argv: Vec<String> = std::env::args().collect();
    let cmd = cli::MultiCall::from_args(argv);

    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .format_module_path(false)
        .filter(Some(crate_name!()), cmd.loglevel())
        .init();

    match cmd.run() {
        Ok(()) => libc::EXIT_SUCCESS,
        Err(e) => {
            // one line per failure, with the context chain flattened
            eprintln!("error: {e:#}");
            libc::EXIT_FAILURE
        }
    }
}
