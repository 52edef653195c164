//! Launching the external kernel-cache builder and our own helper-update
//! re-entry, foreground or detached.

use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use camino::Utf8Path;

use crate::bootcaches::{BootCaches, STAMPS_DIR};

/// The external kernel-cache builder.
const KEXTCACHE: &str = "/usr/sbin/kextcache";

pub(crate) fn kextcache_path() -> PathBuf {
    std::env::var_os("BOOTSTAMPD_KEXTCACHE")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(KEXTCACHE))
}

fn updater_path() -> Result<PathBuf> {
    if let Some(p) = std::env::var_os("BOOTSTAMPD_UPDATER") {
        return Ok(PathBuf::from(p));
    }
    std::env::current_exe().context("locating our own binary")
}

#[derive(Debug)]
pub(crate) enum Launch {
    /// Exit status of a waited-for child.
    Waited(i32),
    /// Pid of the reaped intermediate; the worker runs detached.
    Detached(u32),
}

/// Launch a builder with `TMPDIR` pointed at the volume's shadow directory,
/// so anything it stages is rename-adjacent to its destination (a rename
/// across devices would break both atomicity and the trust chain).
///
/// With `wait` unset this uses the double-fork idiom: the spawned child
/// detaches itself before exec, we reap it immediately, and the real worker
/// is re-parented to the system.
pub(crate) fn fork_builder(
    cache_root: &Utf8Path,
    program: &Path,
    args: &[OsString],
    wait: bool,
) -> Result<Launch> {
    let tmpdir = cache_root.join(STAMPS_DIR);
    let mut cmd = Command::new(program);
    cmd.args(args).env("TMPDIR", tmpdir.as_std_path());

    if wait {
        let status = cmd
            .status()
            .with_context(|| format!("couldn't launch {}", program.display()))?;
        Ok(Launch::Waited(status.code().unwrap_or(-1)))
    } else {
        unsafe {
            cmd.pre_exec(|| {
                if libc::daemon(0, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("couldn't launch {}", program.display()))?;
        let pid = child.id();
        let status = child.wait()?;
        if !status.success() {
            bail!("builder intermediate for {} exited: {status}", program.display());
        }
        Ok(Launch::Detached(pid))
    }
}

/// `kextcache -a <arch>… -l -m <mkext> <exts>`.  Archs come from the
/// retained descriptor document and are passed as arguments, never spliced
/// into paths.
pub(crate) fn rebuild_kernel_cache(caches: &BootCaches, wait: bool) -> Result<Launch> {
    let Some(mkidx) = caches.mkext else {
        bail!("no kernel cache declared for {}", caches.root);
    };
    let Some(exts) = &caches.exts else {
        bail!("no extensions directory declared for {}", caches.root);
    };

    let mut args: Vec<OsString> = Vec::new();
    for arch in caches.archs() {
        args.push("-a".into());
        args.push(arch.into());
    }
    args.push("-l".into());
    args.push("-m".into());
    args.push(
        caches
            .root
            .join(&caches.rpspaths[mkidx].rpath)
            .into_string()
            .into(),
    );
    args.push(caches.root.join(exts).into_string().into());

    fork_builder(&caches.root, &kextcache_path(), &args, wait)
}

/// Re-enter this binary to republish helper partitions: `update [--force]
/// <root>`, always detached.
pub(crate) fn rebuild_helpers(root: &Utf8Path, force: bool) -> Result<Launch> {
    let mut args: Vec<OsString> = vec!["update".into()];
    if force {
        args.push("--force".into());
    }
    args.push(root.as_str().into());
    fork_builder(root, &updater_path()?, &args, false)
}
