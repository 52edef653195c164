use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use rustix::fd::BorrowedFd;

pub(crate) trait CommandRunExt {
    fn run(&mut self) -> Result<()>;
}

impl CommandRunExt for Command {
    fn run(&mut self) -> Result<()> {
        let status = self
            .status()
            .with_context(|| format!("spawning {:?}", self))?;
        if !status.success() {
            bail!("{:?} failed: {status}", self);
        }
        Ok(())
    }
}

/// Run a command and hand back its stdout as UTF-8.  Its stderr is passed
/// through only on failure, so callers stay quiet on the happy path.
pub(crate) fn cmd_output(cmd: &mut Command) -> Result<String> {
    let out = cmd
        .output()
        .with_context(|| format!("spawning {:?}", cmd))?;
    if !out.status.success() {
        std::io::stderr().write_all(&out.stderr).ok();
        bail!("{:?} failed: {}", cmd, out.status);
    }
    String::from_utf8(out.stdout).with_context(|| format!("non-UTF-8 output from {:?}", cmd))
}

/// Over-length paths are a data error, never a silent truncation.
pub(crate) fn check_path_len(p: impl AsRef<Path>) -> Result<()> {
    let p = p.as_ref();
    if p.as_os_str().len() >= libc::PATH_MAX as usize {
        bail!("path too long: {:?}", p);
    }
    Ok(())
}

/// Flush a file (or directory handle) all the way to stable storage.
pub(crate) fn full_fsync(fd: &impl AsRawFd) -> std::io::Result<()> {
    let fd = unsafe { BorrowedFd::borrow_raw(fd.as_raw_fd()) };
    #[cfg(target_os = "macos")]
    rustix::fs::fcntl_fullfsync(fd)?;
    #[cfg(not(target_os = "macos"))]
    rustix::fs::fsync(fd)?;
    Ok(())
}

/// Append a literal extension like `.old` to the final component.
pub(crate) fn append_ext(p: &camino::Utf8Path, ext: &str) -> camino::Utf8PathBuf {
    camino::Utf8PathBuf::from(format!("{p}{ext}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_ext() {
        let p = camino::Utf8Path::new("/Volumes/foo/boot.efi");
        assert_eq!(append_ext(p, ".old").as_str(), "/Volumes/foo/boot.efi.old");
    }

    #[test]
    fn test_path_len_guard() {
        assert!(check_path_len("/ok").is_ok());
        let long = format!("/{}", "x".repeat(libc::PATH_MAX as usize));
        assert!(check_path_len(long).is_err());
    }

    #[test]
    fn test_cmd_output_captures_stdout() {
        let out = cmd_output(Command::new("echo").arg("hello")).unwrap();
        assert_eq!(out.trim(), "hello");
        assert!(cmd_output(&mut Command::new("false")).is_err());
    }
}
