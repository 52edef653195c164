/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! The per-volume boot-caches model: the on-disk descriptor, the freshness
//! oracle comparing sources against shadow timestamp files, and the stamp
//! writer that records a successful publication.

use std::fs::File;
use std::io::Read;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use rustix::fs::{OFlags, Timespec, Timestamps};
use serde::Deserialize;

use crate::disks::DiskService;
use crate::safedir::{self, Scope};
use crate::util;

/// Relative path of the per-volume descriptor.
pub(crate) const DESCRIPTOR_PATH: &str = "usr/standalone/bootcaches.json";
/// Shadow-timestamp tree kept on the root filesystem.
pub(crate) const STAMPS_DIR: &str = "System/Library/Caches/com.apple.bootstamps";
pub(crate) const STAMPS_MODE: u32 = 0o755;

/// On-disk descriptor schema.  The key set is small and closed; anything
/// unrecognized is assumed required and rejects the document.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct DescriptorDoc {
    #[serde(rename = "PreBootPaths")]
    pub(crate) pre_boot: Option<PreBootPaths>,
    #[serde(rename = "BooterPaths")]
    pub(crate) booters: Option<BooterPaths>,
    #[serde(rename = "PostBootPaths")]
    pub(crate) post_boot: Option<PostBootPaths>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct PreBootPaths {
    #[serde(rename = "DiskLabel")]
    pub(crate) disk_label: Option<String>,
    #[serde(rename = "AdditionalPaths")]
    pub(crate) additional_paths: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct BooterPaths {
    #[serde(rename = "EFIBooter")]
    pub(crate) efi_booter: Option<String>,
    // reserved; handled like the EFI booter when present
    #[serde(rename = "OFBooter")]
    pub(crate) of_booter: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct PostBootPaths {
    #[serde(rename = "BootConfig")]
    pub(crate) boot_config: Option<String>,
    #[serde(rename = "MKext")]
    pub(crate) mkext: Option<MkextInfo>,
    #[serde(rename = "AdditionalPaths")]
    pub(crate) additional_paths: Option<Vec<String>>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct MkextInfo {
    #[serde(rename = "Path")]
    pub(crate) path: String,
    #[serde(rename = "ExtensionsDir")]
    pub(crate) extensions_dir: Option<String>,
    #[serde(rename = "Archs")]
    pub(crate) archs: Option<Vec<String>>,
}

/// Nanosecond-precise (seconds, nanoseconds) pair from stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileTime {
    pub(crate) sec: i64,
    pub(crate) nsec: i64,
}

impl FileTime {
    fn atime_of(st: &rustix::fs::Stat) -> FileTime {
        FileTime {
            sec: st.st_atime as i64,
            nsec: st.st_atime_nsec as i64,
        }
    }

    fn mtime_of(st: &rustix::fs::Stat) -> FileTime {
        FileTime {
            sec: st.st_mtime as i64,
            nsec: st.st_mtime_nsec as i64,
        }
    }

    pub(crate) fn timespec(self) -> Timespec {
        Timespec {
            tv_sec: self.sec as _,
            tv_nsec: self.nsec as _,
        }
    }
}

/// A tracked source path and its shadow stamp, plus the source times
/// captured at the last staleness check.
#[derive(Debug, Clone)]
pub(crate) struct CachedPath {
    /// Source path relative to the volume root.
    pub(crate) rpath: Utf8PathBuf,
    /// Shadow path relative to the volume root.
    pub(crate) tspath: Utf8PathBuf,
    /// Captured (atime, mtime); `None` until the source has been stat-ed.
    pub(crate) tstamps: Option<(FileTime, FileTime)>,
}

fn cached_path(root: &Utf8Path, uuid: &str, relstr: &str) -> Result<CachedPath> {
    let rel = relstr.trim_start_matches('/');
    if rel.is_empty() {
        bail!("empty path in descriptor");
    }
    let rpath = Utf8PathBuf::from(rel);
    let tspath = Utf8PathBuf::from(STAMPS_DIR)
        .join(uuid)
        .join(rel.replace('/', ":"));
    util::check_path_len(root.join(&rpath).as_std_path())?;
    util::check_path_len(root.join(&tspath).as_std_path())?;
    Ok(CachedPath {
        rpath,
        tspath,
        tstamps: None,
    })
}

/// Everything the updater needs to know about one volume.  The descriptor
/// handle stays open for the record's lifetime so its device id can be
/// re-validated after every call that leaves the process.
#[derive(Debug)]
pub(crate) struct BootCaches {
    pub(crate) cachefd: File,
    pub(crate) uuid: String,
    pub(crate) volname: String,
    pub(crate) root: Utf8PathBuf,
    /// Retained descriptor document (arch list and friends).
    pub(crate) doc: DescriptorDoc,

    /// Kernel-extensions directory, relative to root; watched, never
    /// republished.
    pub(crate) exts: Option<Utf8PathBuf>,
    /// Paths republished as a set into the rotating directory.
    pub(crate) rpspaths: Vec<CachedPath>,
    /// Paths republished individually with `.new` shadowing.
    pub(crate) miscpaths: Vec<CachedPath>,
    pub(crate) efibooter: Option<CachedPath>,
    pub(crate) ofbooter: Option<CachedPath>,

    // indices of the entries needing special handling
    pub(crate) mkext: Option<usize>,      // into rpspaths
    pub(crate) bootconfig: Option<usize>, // into rpspaths
    pub(crate) label: Option<usize>,      // into miscpaths
}

impl BootCaches {
    pub(crate) fn scope(&self) -> std::io::Result<Scope> {
        Scope::new(self.cachefd.try_clone()?)
    }

    pub(crate) fn archs(&self) -> Vec<String> {
        self.doc
            .post_boot
            .as_ref()
            .and_then(|p| p.mkext.as_ref())
            .and_then(|m| m.archs.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Trust {
    Trusted,
    /// uid 99 marks an owners-ignored volume; skipped without log spam.
    IgnoredOwner,
    ForeignOwner,
    LooseMode,
}

pub(crate) fn descriptor_trust(uid: u32, mode: u32) -> Trust {
    let me = rustix::process::geteuid().as_raw();
    if uid != 0 && uid != me {
        return if uid == 99 {
            Trust::IgnoredOwner
        } else {
            Trust::ForeignOwner
        };
    }
    if mode & 0o022 != 0 {
        return Trust::LooseMode;
    }
    Trust::Trusted
}

/// Load the descriptor for `root`.  `Ok(None)` means the volume is not
/// managed here (no descriptor, or one we must not trust); a malformed
/// document is an error.
#[context("Reading boot caches for {root}")]
pub(crate) fn read_caches(root: &Utf8Path, disks: &dyn DiskService) -> Result<Option<BootCaches>> {
    let bcpath = root.join(DESCRIPTOR_PATH);
    util::check_path_len(bcpath.as_std_path())?;
    let cachefd = match File::open(&bcpath) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("error reading {bcpath}")),
    };
    let st = rustix::fs::fstat(&cachefd)?;
    match descriptor_trust(st.st_uid as u32, st.st_mode as u32) {
        Trust::Trusted => {}
        Trust::IgnoredOwner => return Ok(None),
        Trust::ForeignOwner => {
            log::info!("{bcpath} not owned by root; no rebuilds");
            return Ok(None);
        }
        Trust::LooseMode => {
            log::info!("{bcpath} writable by non-root");
            return Ok(None);
        }
    }

    let mut contents = String::new();
    (&cachefd)
        .read_to_string(&mut contents)
        .with_context(|| format!("error reading {bcpath}"))?;
    let doc: DescriptorDoc = serde_json::from_str(&contents)
        .with_context(|| format!("unsupported boot caches data in {bcpath}"))?;

    build_caches(root, cachefd, st.st_dev as u64, doc, disks).map(Some)
}

fn build_caches(
    root: &Utf8Path,
    cachefd: File,
    dev: u64,
    doc: DescriptorDoc,
    disks: &dyn DiskService,
) -> Result<BootCaches> {
    let device = disks
        .device_for(dev)?
        .ok_or_else(|| anyhow!("no device name for the volume at {root}"))?;
    let desc = disks
        .describe(&device)?
        .ok_or_else(|| anyhow!("couldn't get volume description for {device}"))?;
    if desc.uuid.is_empty() {
        bail!("couldn't get volume UUID for {device}");
    }
    let uuid = desc.uuid;
    let volname = desc.name;

    // the bootstamp directory lives on the volume itself
    let stampdir = root.join(STAMPS_DIR).join(&uuid);
    util::check_path_len(stampdir.as_std_path())?;
    if !stampdir.exists() {
        let scope = Scope::new(cachefd.try_clone()?)?;
        safedir::sdeepmkdir(&scope, stampdir.as_std_path(), STAMPS_MODE)
            .with_context(|| format!("bootstamps cache problem under {root}"))?;
    }

    let mut miscpaths = Vec::new();
    let mut label = None;
    if let Some(pre) = &doc.pre_boot {
        if let Some(paths) = &pre.additional_paths {
            for p in paths {
                miscpaths.push(cached_path(root, &uuid, p)?);
            }
        }
        if let Some(l) = &pre.disk_label {
            label = Some(miscpaths.len());
            miscpaths.push(cached_path(root, &uuid, l)?);
        }
    }

    let mut efibooter = None;
    let mut ofbooter = None;
    if let Some(booters) = &doc.booters {
        if let Some(p) = &booters.efi_booter {
            efibooter = Some(cached_path(root, &uuid, p)?);
        }
        if let Some(p) = &booters.of_booter {
            ofbooter = Some(cached_path(root, &uuid, p)?);
        }
    }

    let mut rpspaths = Vec::new();
    let mut bootconfig = None;
    let mut mkext = None;
    let mut exts = None;
    if let Some(post) = &doc.post_boot {
        if let Some(paths) = &post.additional_paths {
            for p in paths {
                rpspaths.push(cached_path(root, &uuid, p)?);
            }
        }
        if let Some(cfg) = &post.boot_config {
            bootconfig = Some(rpspaths.len());
            rpspaths.push(cached_path(root, &uuid, cfg)?);
        }
        if let Some(mk) = &post.mkext {
            mkext = Some(rpspaths.len());
            rpspaths.push(cached_path(root, &uuid, &mk.path)?);
            if let Some(dir) = &mk.extensions_dir {
                let rel = dir.trim_start_matches('/');
                util::check_path_len(root.join(rel).as_std_path())?;
                exts = Some(Utf8PathBuf::from(rel));
            }
        }
    }

    Ok(BootCaches {
        cachefd,
        uuid,
        volname,
        root: root.to_owned(),
        doc,
        exts,
        rpspaths,
        miscpaths,
        efibooter,
        ofbooter,
        mkext,
        bootconfig,
        label,
    })
}

/// Stat one cached path, capturing its times and comparing the shadow.
/// A missing source is *not* out of date; optional files come and go.
pub(crate) fn needs_update(root: &Utf8Path, cpath: &mut CachedPath) -> Result<bool> {
    let full_rp = root.join(&cpath.rpath);
    let full_tsp = root.join(&cpath.tspath);

    cpath.tstamps = None;
    let rsb = match rustix::fs::stat(full_rp.as_std_path()) {
        Ok(st) => st,
        Err(e) if e == rustix::io::Errno::NOENT => return Ok(false),
        Err(e) => return Err(anyhow!("cached file {full_rp}: {e}")),
    };
    cpath.tstamps = Some((FileTime::atime_of(&rsb), FileTime::mtime_of(&rsb)));

    match rustix::fs::stat(full_tsp.as_std_path()) {
        Ok(tsb) => Ok(FileTime::mtime_of(&tsb) != FileTime::mtime_of(&rsb)),
        Err(e) if e == rustix::io::Errno::NOENT => Ok(true), // nothing to compare with
        Err(e) => Err(anyhow!("bootstamp {full_tsp}: {e}")),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct NeedsUpdate {
    pub(crate) any: bool,
    pub(crate) rps: bool,
    pub(crate) booters: bool,
    pub(crate) misc: bool,
}

/// Run the staleness oracle over every tracked path.  This also populates
/// the captured times the stamper applies later, so it must run even when
/// the caller only wants the booleans.
pub(crate) fn need_updates(caches: &mut BootCaches) -> Result<NeedsUpdate> {
    let root = caches.root.clone();
    let mut need = NeedsUpdate::default();

    for cp in caches.rpspaths.iter_mut() {
        if needs_update(&root, cp)? {
            need.any = true;
            need.rps = true;
        }
    }
    for cp in [caches.efibooter.as_mut(), caches.ofbooter.as_mut()]
        .into_iter()
        .flatten()
    {
        if needs_update(&root, cp)? {
            need.any = true;
            need.booters = true;
        }
    }
    for cp in caches.miscpaths.iter_mut() {
        // no one cares if an icon is missing, so errors don't abort here
        if needs_update(&root, cp).unwrap_or(false) {
            need.any = true;
            need.misc = true;
        }
    }
    Ok(need)
}

fn apply_stamp(root: &Utf8Path, cpath: &CachedPath, scope: &Scope) -> std::io::Result<()> {
    let Some((atime, mtime)) = cpath.tstamps else {
        return Ok(()); // source was missing; nothing to record
    };
    let tspath = root.join(&cpath.tspath);
    let _ = safedir::sunlink(scope, tspath.as_std_path());
    let fd = safedir::sopen(
        scope,
        tspath.as_std_path(),
        OFlags::WRONLY | OFlags::CREATE,
        STAMPS_MODE,
    )?;
    rustix::fs::futimens(
        &fd,
        &Timestamps {
            last_access: atime.timespec(),
            last_modification: mtime.timespec(),
        },
    )?;
    Ok(())
}

/// After a fully successful publication, mirror the captured source times
/// onto the shadow files.  Failures accumulate; the composite is surfaced so
/// the next change notification retries.
#[context("Applying bootstamps for {}", caches.root)]
pub(crate) fn apply_stamps(caches: &BootCaches) -> Result<()> {
    let scope = caches.scope()?;
    let mut failed = 0u32;
    let all = caches
        .rpspaths
        .iter()
        .chain(caches.efibooter.iter())
        .chain(caches.ofbooter.iter())
        .chain(caches.miscpaths.iter());
    for cp in all {
        if let Err(e) = apply_stamp(&caches.root, cp, &scope) {
            log::error!("couldn't stamp {}: {}", cp.tspath, e);
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{failed} bootstamp(s) could not be written");
    }
    Ok(())
}

/// The kernel cache is current only when its mtime is exactly one second
/// past the extensions directory's; the external builder writes that offset
/// as its up-to-date marker.
pub(crate) fn kernel_cache_stale(caches: &BootCaches) -> bool {
    let Some(mkidx) = caches.mkext else {
        return false;
    };
    let Some(exts) = &caches.exts else {
        log::warn!("{}: kernel cache declared without an extensions directory", caches.root);
        return false; // nothing to build from
    };
    let fullexts = caches.root.join(exts);
    let extsb = match rustix::fs::stat(fullexts.as_std_path()) {
        Ok(st) => st,
        Err(e) => {
            log::warn!("couldn't stat {fullexts}: {e}");
            return false; // can't build without the extensions directory
        }
    };
    let fullmk = caches.root.join(&caches.rpspaths[mkidx].rpath);
    match rustix::fs::stat(fullmk.as_std_path()) {
        Err(_) => true, // no cache at all
        Ok(sb) => (sb.st_mtime as i64) != (extsb.st_mtime as i64) + 1,
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::disks::mock::MockDisks;
    use std::sync::Arc;

    pub(crate) const FIXTURE: &str = include_str!("../tests/fixtures/example-bootcaches.json");

    /// Serializes tests that reach for process-wide state (environment
    /// overrides, failpoints).
    pub(crate) fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
        LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lay out a root volume in `root` with the fixture descriptor and the
    /// source files it names, plus an empty helper directory, and wire both
    /// into a mock disk service.
    pub(crate) fn fixture_volume(td: &std::path::Path) -> (Utf8PathBuf, Utf8PathBuf, Arc<MockDisks>) {
        let root = Utf8PathBuf::from_path_buf(td.join("root")).unwrap();
        let helper = Utf8PathBuf::from_path_buf(td.join("helper")).unwrap();
        std::fs::create_dir_all(root.join("usr/standalone")).unwrap();
        std::fs::create_dir_all(&helper).unwrap();
        std::fs::write(root.join(DESCRIPTOR_PATH), FIXTURE).unwrap();

        for rel in [
            "System/Library/CoreServices/.disk_label",
            "System/Library/CoreServices/SystemVersion.plist",
            "System/Library/CoreServices/boot.efi",
            "System/Library/Extensions.mkext",
            "mach_kernel",
        ] {
            let p = root.join(rel);
            std::fs::create_dir_all(p.parent().unwrap()).unwrap();
            std::fs::write(&p, format!("contents of {rel}")).unwrap();
        }
        std::fs::create_dir_all(root.join("Library/Preferences/SystemConfiguration")).unwrap();
        std::fs::write(
            root.join("Library/Preferences/SystemConfiguration/com.apple.Boot.plist"),
            "{}",
        )
        .unwrap();
        std::fs::create_dir_all(root.join("System/Library/Extensions")).unwrap();

        let disks =
            Arc::new(MockDisks::new().with_volume("disk0s2", &root, "disk0s3", &helper));
        (root, helper, disks)
    }

    pub(crate) fn read_fixture(root: &Utf8Path, disks: &MockDisks) -> BootCaches {
        read_caches(root, disks)
            .expect("read_caches")
            .expect("descriptor present")
    }

    /// Make the kernel cache look current so the publisher skips rebuilds.
    pub(crate) fn settle_kernel_cache(root: &Utf8Path) {
        let exts = root.join("System/Library/Extensions");
        let mk = root.join("System/Library/Extensions.mkext");
        set_times(&exts, 1_000_000, 0);
        set_times(&mk, 1_000_001, 0);
    }

    pub(crate) fn set_times(p: &Utf8Path, sec: i64, nsec: i64) {
        let t = FileTime { sec, nsec };
        rustix::fs::utimensat(
            rustix::fs::CWD,
            p.as_std_path(),
            &Timestamps {
                last_access: t.timespec(),
                last_modification: t.timespec(),
            },
            rustix::fs::AtFlags::empty(),
        )
        .expect("utimensat");
    }
}
