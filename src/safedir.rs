/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Device-scoped filesystem primitives.
//!
//! Every mutating call takes a [`Scope`], an open handle on the volume being
//! updated whose device id bounds the operation.  A primitive resolves the
//! *parent* directory of its target, verifies that the parent sits on the
//! scoped device, and then acts on the basename alone through that parent
//! handle.  Concurrent mount games or symlink substitution therefore cannot
//! redirect a write onto another volume: the worst a racing rename can do is
//! make the operation fail.

use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::path::{Path, PathBuf};

use rustix::fd::BorrowedFd;
use rustix::fs::{AtFlags, Mode, OFlags};

/// Copy chunk size for [`scopyfile`].
const COPY_CHUNK: usize = 1 << 20;

/// An open handle whose device id defines the reach of every primitive.
/// Any handle on the volume works; the descriptor file itself is the usual
/// anchor on the root side, the mountpoint directory on the helper side.
pub(crate) struct Scope {
    anchor: File,
    dev: u64,
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

fn borrowed(fd: &impl AsRawFd) -> BorrowedFd<'_> {
    unsafe { BorrowedFd::borrow_raw(fd.as_raw_fd()) }
}

impl Scope {
    pub(crate) fn new(anchor: File) -> io::Result<Scope> {
        let st = rustix::fs::fstat(&anchor)?;
        Ok(Scope {
            anchor,
            dev: st.st_dev as u64,
        })
    }

    pub(crate) fn open(root: impl AsRef<Path>) -> io::Result<Scope> {
        Scope::new(File::open(root)?)
    }

    pub(crate) fn dev(&self) -> u64 {
        self.dev
    }

    pub(crate) fn anchor(&self) -> &File {
        &self.anchor
    }

    /// Re-stat the anchor, confirming the volume it identifies is still the
    /// one we opened.  Called after anything that hands control to another
    /// process.
    pub(crate) fn revalidate(&self) -> io::Result<()> {
        let st = rustix::fs::fstat(&self.anchor)?;
        if st.st_dev as u64 != self.dev {
            return Err(errno(libc::EPERM));
        }
        Ok(())
    }

    /// The st_dev policy: the candidate handle must live on the scoped
    /// device, and the anchor must still be stat-able.
    fn check(&self, candidate: BorrowedFd) -> io::Result<()> {
        let cand = rustix::fs::fstat(candidate)?;
        rustix::fs::fstat(&self.anchor)?;
        if cand.st_dev as u64 != self.dev {
            log::error!("scope policy: device id mismatch");
            return Err(errno(libc::EPERM));
        }
        Ok(())
    }

    /// Open the parent of `path`, verify it against the scope, and return it
    /// together with the basename to operate on.
    fn parent_of(&self, path: &Path) -> io::Result<(openat::Dir, OsString)> {
        let base = path.file_name().ok_or_else(|| errno(libc::EINVAL))?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let dir = openat::Dir::open(parent)?;
        self.check(borrowed(&dir))?;
        Ok((dir, base.to_os_string()))
    }
}

/// Scoped open.  `O_CREAT` always gains `O_EXCL` so an existing file (or a
/// symlink parked at the target name) can never be opened by accident.
pub(crate) fn sopen(
    scope: &Scope,
    path: impl AsRef<Path>,
    mut flags: OFlags,
    mode: u32,
) -> io::Result<File> {
    if flags.contains(OFlags::CREATE) {
        flags |= OFlags::EXCL;
    }
    let (dir, base) = scope.parent_of(path.as_ref())?;
    let fd = rustix::fs::openat(
        borrowed(&dir),
        base.as_os_str(),
        flags | OFlags::CLOEXEC,
        Mode::from_raw_mode(mode as rustix::fs::RawMode),
    )?;
    Ok(File::from(fd))
}

pub(crate) fn smkdir(scope: &Scope, path: impl AsRef<Path>, mode: u32) -> io::Result<()> {
    let (dir, base) = scope.parent_of(path.as_ref())?;
    rustix::fs::mkdirat(
        borrowed(&dir),
        base.as_os_str(),
        Mode::from_raw_mode(mode as rustix::fs::RawMode),
    )?;
    Ok(())
}

pub(crate) fn srmdir(scope: &Scope, path: impl AsRef<Path>) -> io::Result<()> {
    let (dir, base) = scope.parent_of(path.as_ref())?;
    rustix::fs::unlinkat(borrowed(&dir), base.as_os_str(), AtFlags::REMOVEDIR)?;
    Ok(())
}

pub(crate) fn sunlink(scope: &Scope, path: impl AsRef<Path>) -> io::Result<()> {
    let (dir, base) = scope.parent_of(path.as_ref())?;
    rustix::fs::unlinkat(borrowed(&dir), base.as_os_str(), AtFlags::empty())?;
    Ok(())
}

/// Scoped rename.  Any directory part of `newpath` is stripped: the rename
/// happens inside `oldpath`'s parent, so entries can never migrate across
/// directories (let alone devices) through this call.
pub(crate) fn srename(
    scope: &Scope,
    oldpath: impl AsRef<Path>,
    newpath: impl AsRef<Path>,
) -> io::Result<()> {
    let newbase = newpath
        .as_ref()
        .file_name()
        .ok_or_else(|| errno(libc::EINVAL))?
        .to_os_string();
    let (dir, oldbase) = scope.parent_of(oldpath.as_ref())?;
    rustix::fs::renameat(
        borrowed(&dir),
        oldbase.as_os_str(),
        borrowed(&dir),
        newbase.as_os_str(),
    )?;
    Ok(())
}

fn open_subdir(dir: &openat::Dir, name: &Path) -> io::Result<openat::Dir> {
    let fd = rustix::fs::openat(
        borrowed(dir),
        name.as_os_str(),
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    )?;
    Ok(unsafe { openat::Dir::from_raw_fd(fd.into_raw_fd()) })
}

fn remember(err: &mut Option<io::Error>, e: io::Error) {
    if err.is_none() {
        *err = Some(e);
    }
}

/// Post-order recursive unlink.  Directories are entered through
/// `O_NOFOLLOW` handles only, symlinks are unlinked rather than followed,
/// and a directory on a different device is left alone.
pub(crate) fn sdeepunlink(scope: &Scope, path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    let (parent, base) = scope.parent_of(path)?;
    let dir = open_subdir(&parent, Path::new(&base))?;
    scope.check(borrowed(&dir))?;
    let mut err = None;
    deepunlink_contents(scope, &dir, &mut err);
    drop(dir);
    if let Err(e) = srmdir(scope, path) {
        remember(&mut err, e);
    }
    match err {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

fn deepunlink_contents(scope: &Scope, dir: &openat::Dir, err: &mut Option<io::Error>) {
    use openat_ext::OpenatDirExt;

    let entries = match dir.list_dir(".") {
        Ok(it) => it,
        Err(e) => {
            remember(err, e);
            return;
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                remember(err, e);
                continue;
            }
        };
        let name = PathBuf::from(entry.file_name());
        let ftype = match dir.get_file_type(&entry) {
            Ok(t) => t,
            Err(e) => {
                remember(err, e);
                continue;
            }
        };
        if ftype == openat::SimpleType::Dir {
            let child = match open_subdir(dir, &name) {
                Ok(c) => c,
                Err(e) => {
                    remember(err, e);
                    continue;
                }
            };
            if scope.check(borrowed(&child)).is_err() {
                // mounted-over directory; never cross devices
                remember(err, errno(libc::EPERM));
                continue;
            }
            deepunlink_contents(scope, &child, err);
            if let Err(e) =
                rustix::fs::unlinkat(borrowed(dir), name.as_os_str(), AtFlags::REMOVEDIR)
            {
                remember(err, e.into());
            }
        } else if let Err(e) = rustix::fs::unlinkat(borrowed(dir), name.as_os_str(), AtFlags::empty())
        {
            remember(err, e.into());
        }
    }
}

/// Ensure every ancestor of `path` exists, each created through the scope.
pub(crate) fn sdeepmkdir(scope: &Scope, path: impl AsRef<Path>, mode: u32) -> io::Result<()> {
    let path = path.as_ref();
    if path.as_os_str().is_empty() {
        return Err(errno(libc::EINVAL));
    }
    match rustix::fs::stat(path) {
        Ok(st) => {
            if rustix::fs::FileType::from_raw_mode(st.st_mode as rustix::fs::RawMode)
                == rustix::fs::FileType::Directory
            {
                Ok(())
            } else {
                Err(errno(libc::ENOTDIR))
            }
        }
        Err(e) if e == rustix::io::Errno::NOENT => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    sdeepmkdir(scope, parent, mode)?;
                }
            }
            smkdir(scope, path, mode)
        }
        Err(e) => Err(e.into()),
    }
}

/// The directory mode used when a copy has to create intermediate
/// directories: the source file's mode plus owner rwx, with group/other
/// execute following their read bits.
pub(crate) fn copy_dirmode(filemode: u32) -> u32 {
    let mut dirmode = (filemode & 0o7777) | 0o300;
    if dirmode & 0o040 != 0 {
        dirmode |= 0o010;
    }
    if dirmode & 0o004 != 0 {
        dirmode |= 0o001;
    }
    dirmode
}

/// Scoped file copy: creates intermediate directories on the destination,
/// writes in fixed-size chunks, and applies the source mode at the end.
pub(crate) fn scopyfile(
    srcscope: &Scope,
    srcpath: impl AsRef<Path>,
    dstscope: &Scope,
    dstpath: impl AsRef<Path>,
) -> io::Result<()> {
    let srcpath = srcpath.as_ref();
    let dstpath = dstpath.as_ref();

    let mut src = sopen(srcscope, srcpath, OFlags::RDONLY, 0)?;
    let srcst = rustix::fs::fstat(&src)?;
    let filemode = srcst.st_mode as u32 & 0o7777;

    let dstparent = dstpath.parent().ok_or_else(|| errno(libc::EINVAL))?;
    sdeepmkdir(dstscope, dstparent, copy_dirmode(filemode))?;

    // nuke/open the destination; sopen insists on O_EXCL
    let _ = sunlink(dstscope, dstpath);
    let mut dst = sopen(
        dstscope,
        dstpath,
        OFlags::CREATE | OFlags::WRONLY,
        filemode | 0o200,
    )?;

    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        dst.write_all(&buf[..n])?;
    }

    rustix::fs::fchmod(&dst, Mode::from_raw_mode(filemode as rustix::fs::RawMode))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{symlink, PermissionsExt};

    fn tempscope() -> (tempfile::TempDir, Scope) {
        let td = tempfile::tempdir().expect("tempdir");
        let scope = Scope::open(td.path()).expect("scope");
        (td, scope)
    }

    #[test]
    fn test_sopen_creat_is_exclusive() {
        let (td, scope) = tempscope();
        let p = td.path().join("f");
        sopen(&scope, &p, OFlags::CREATE | OFlags::WRONLY, 0o644).unwrap();
        let again = sopen(&scope, &p, OFlags::CREATE | OFlags::WRONLY, 0o644);
        assert_eq!(
            again.err().and_then(|e| e.raw_os_error()),
            Some(libc::EEXIST)
        );
    }

    #[test]
    fn test_foreign_device_parent_is_eperm() {
        // /proc sits on its own device essentially everywhere
        let (_td, scope) = tempscope();
        let r = smkdir(&scope, "/proc/no-such-dir", 0o755);
        assert_eq!(r.err().and_then(|e| e.raw_os_error()), Some(libc::EPERM));
    }

    #[test]
    fn test_rename_strips_directory_from_newpath() {
        let (td, scope) = tempscope();
        let old = td.path().join("a");
        std::fs::write(&old, b"x").unwrap();
        srename(&scope, &old, "/somewhere/else/b").unwrap();
        assert!(!old.exists());
        assert!(td.path().join("b").exists());
    }

    #[test]
    fn test_deepunlink_does_not_follow_symlinks() {
        let (td, scope) = tempscope();
        let outside = td.path().join("outside.txt");
        std::fs::write(&outside, b"survivor").unwrap();
        let tree = td.path().join("tree");
        std::fs::create_dir_all(tree.join("sub")).unwrap();
        std::fs::write(tree.join("sub/file"), b"doomed").unwrap();
        symlink(&outside, tree.join("sub/link")).unwrap();

        sdeepunlink(&scope, &tree).unwrap();
        assert!(!tree.exists());
        assert!(outside.exists());
    }

    #[test]
    fn test_deepmkdir_and_copy_modes() {
        let (td, scope) = tempscope();
        let src = td.path().join("src/data.bin");
        std::fs::create_dir_all(src.parent().unwrap()).unwrap();
        std::fs::write(&src, vec![7u8; 4096]).unwrap();
        std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o640)).unwrap();

        let dst = td.path().join("deep/ly/nested/data.bin");
        scopyfile(&scope, &src, &scope, &dst).unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), vec![7u8; 4096]);
        let mode = std::fs::metadata(&dst).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o640);
        let dirmode = std::fs::metadata(dst.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o7777;
        // 0o640 + owner wx + group x (group had read)
        assert_eq!(dirmode, 0o750);
    }

    #[test]
    fn test_copy_dirmode_table() {
        assert_eq!(copy_dirmode(0o644), 0o755);
        assert_eq!(copy_dirmode(0o600), 0o700);
        assert_eq!(copy_dirmode(0o640), 0o750);
    }

    #[test]
    fn test_revalidate() {
        let (_td, scope) = tempscope();
        scope.revalidate().unwrap();
    }
}
