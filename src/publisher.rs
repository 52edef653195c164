/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! Transactional publication of boot artifacts onto helper partitions.
//!
//! Ordering within one helper: rotating content first (it has no overwrite
//! window), then `.new` staging for the misc files, then the fragile part:
//! labels down, booters copied with `.old` fallbacks, bless, rotation flip,
//! misc renames and a fresh label.  [`ChangeState`] records how far we got;
//! [`revert_state`] undoes everything at or below the recorded state.

use std::fs::File;
use std::io::Write;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use rustix::fs::OFlags;

use crate::bootcaches::{self, BootCaches};
use crate::builder::{self, Launch};
use crate::disks::{DiskService, MountError};
use crate::rps;
use crate::safedir::{self, Scope};
use crate::util;

pub(crate) const OLD_EXT: &str = ".old";
pub(crate) const NEW_EXT: &str = ".new";
pub(crate) const CONTENT_EXT: &str = ".contentDetails";
/// Key injected into the published boot-config document.
const ROOT_UUID_KEY: &str = "Root UUID";
/// Helper partitions below this size are not usable.
const MIN_HELPER_BYTES: u64 = 128 * (1 << 20);
const RPS_DIR_MODE: u32 = 0o755;

/// First eight bytes of the 32-byte finder-info value on booters / labels.
const BOOTER_MAGIC: &[u8; 8] = b"tbxichrp";
const LABEL_MAGIC: &[u8; 8] = b"tbxjchrp";
#[cfg(target_os = "macos")]
const FINDERINFO_XATTR: &str = "com.apple.FinderInfo";
#[cfg(not(target_os = "macos"))]
const FINDERINFO_XATTR: &str = "user.com.apple.FinderInfo";

const SYSTEM_FOLDER_IDX: usize = 0;
const EFI_BOOTER_IDX: usize = 1;

/// Reversible progress through one helper update, in strictly increasing
/// order of commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ChangeState {
    Clean,
    NukedLabels,
    CopyingOfBooter,
    CopyingEfiBooter,
    CopiedBooters,
    ActivatingOfBooter,
    ActivatingEfiBooter,
    ActivatedBooters,
}

/// The caller holds the per-volume lock; the kernel-cache rebuild needs it
/// released so the builder child can take it, and retaken afterwards.
pub(crate) trait UpdateLock {
    fn put(&mut self, status: i32) -> Result<()>;
    fn retake(&mut self) -> Result<()>;
}

/// Stand-in when no lock arbiter is reachable.
pub(crate) struct NoLock;

impl UpdateLock for NoLock {
    fn put(&mut self, _status: i32) -> Result<()> {
        Ok(())
    }
    fn retake(&mut self) -> Result<()> {
        Ok(())
    }
}

/// State for the helper currently being updated.
struct UpdatingVol<'a> {
    caches: &'a mut BootCaches,
    disks: &'a dyn DiskService,

    do_rps: bool,
    do_misc: bool,
    do_booters: bool,
    boots: Vec<String>,

    cur_device: Option<String>,
    cur_mount: Option<Utf8PathBuf>,
    boot_scope: Option<Scope>,
    cur_rps: Option<Utf8PathBuf>,
    efi_dst: Option<Utf8PathBuf>,
    of_dst: Option<Utf8PathBuf>,
    changestate: ChangeState,
}

impl<'a> UpdatingVol<'a> {
    fn mount(&self) -> Result<Utf8PathBuf> {
        self.cur_mount
            .clone()
            .ok_or_else(|| anyhow!("no helper mounted"))
    }

    fn scope(&self) -> Result<&Scope> {
        self.boot_scope
            .as_ref()
            .ok_or_else(|| anyhow!("no helper mounted"))
    }

    fn src_scope(&self) -> Result<Scope> {
        Ok(self.caches.scope()?)
    }
}

fn keep_first(rval: &mut Result<()>, r: Result<()>) {
    if rval.is_ok() {
        *rval = r;
    }
}

/// Update every helper partition of the volume rooted at `root`.
/// Preconditions: the volume lock is held (see [`UpdateLock`]).
#[context("Updating boot partitions for {root}")]
pub(crate) fn update_boots(
    root: &Utf8Path,
    force: bool,
    disks: &dyn DiskService,
    lock: &mut dyn UpdateLock,
) -> Result<()> {
    // no descriptor means the volume is not ours to manage
    let Some(mut caches) = bootcaches::read_caches(root, disks)? else {
        return Ok(());
    };

    if bootcaches::kernel_cache_stale(&caches) {
        // give up the lock so the builder can take it, then reclaim
        lock.put(crate::arbiter::EX_TEMPFAIL)?;
        match builder::rebuild_kernel_cache(&caches, true)
            .context("couldn't rebuild stale kernel cache")?
        {
            Launch::Waited(0) => {}
            Launch::Waited(code) => bail!("kernel cache rebuild exited with status {code}"),
            Launch::Detached(_) => bail!("waited launch came back detached"),
        }
        lock.retake()?;
    }

    // booter info comes from the descriptor's device id; the handle is
    // re-validated after the platform call before we trust the answer
    let scope = caches.scope().context("couldn't get helper information")?;
    let device = disks
        .device_for(scope.dev())?
        .ok_or_else(|| anyhow!("no device name for {root}"))?;
    let binfo = disks
        .booter_partitions(&device)
        .context("couldn't get helper information")?;
    scope
        .revalidate()
        .context("volume changed during helper query")?;
    if binfo.auxiliary.is_empty() {
        log::info!("no helper partitions; skipping update");
        return Ok(());
    }

    // needUpdates also captures the times applyStamps writes later
    let need =
        bootcaches::need_updates(&mut caches).context("trouble analyzing what needs updating")?;
    if !need.any && !force {
        log::debug!("helper partitions appear up to date");
        return Ok(());
    }

    let mut up = UpdatingVol {
        do_rps: need.rps || force,
        do_misc: need.misc || force,
        do_booters: need.booters || force,
        boots: binfo.auxiliary,
        caches: &mut caches,
        disks,
        cur_device: None,
        cur_mount: None,
        boot_scope: None,
        cur_rps: None,
        efi_dst: None,
        of_dst: None,
        changestate: ChangeState::Clean,
    };

    for idx in 0..up.boots.len() {
        up.changestate = ChangeState::Clean;
        let r = update_one_boot(&mut up, idx);
        if let Err(e) = &r {
            if up.changestate != ChangeState::Clean {
                log::error!(
                    "error updating helper partition {} (state {:?}): {e:#}",
                    up.boots[idx],
                    up.changestate
                );
            }
            if let Err(re) = revert_state(&mut up) {
                log::error!("trouble reverting helper partition {}: {re:#}", up.boots[idx]);
            }
            if nuke_fallbacks(&mut up).is_err() {
                log::error!("helper partition {} may be untidy", up.boots[idx]);
            }
        }
        unmount_boot(&mut up);
        // a failed helper aborts the transaction; stamps stay untouched
        r?;
        log::info!("successfully updated helper partition {}", up.boots[idx]);
    }

    bootcaches::apply_stamps(up.caches).context("trouble updating bootstamps")?;
    Ok(())
}

fn update_one_boot(up: &mut UpdatingVol, idx: usize) -> Result<()> {
    mount_boot(up, idx)?;
    if up.do_rps {
        ucopy_rps(up)?;
    }
    if up.do_misc {
        // .new staging; per-file trouble was already logged
        let _ = ucopy_misc(up);
    }
    nuke_labels(up)?;
    if up.do_booters {
        ucopy_booters(up)?;
        activate_booters(up)?;
    }
    if up.do_rps {
        activate_rps(up)?;
    }
    activate_misc(up, idx)?;
    up.changestate = ChangeState::Clean;
    Ok(())
}

/// Mount helper `idx`.  A busy mount gets exactly one forced unmount and one
/// retry.  Undersized helpers are rejected before anything touches them.
fn mount_boot(up: &mut UpdatingVol, idx: usize) -> Result<()> {
    let device = up.boots[idx].clone();
    let mnt = match up.disks.mount_helper(&device) {
        Ok(m) => m,
        Err(MountError::Busy) => {
            log::warn!("trouble mounting helper {device}; forcing unmount");
            up.disks.unmount_helper(&device, true)?;
            up.disks
                .mount_helper(&device)
                .map_err(|e| anyhow!("couldn't mount helper {device}: {e}"))?
        }
        Err(e) => return Err(anyhow!("couldn't mount helper {device}: {e}")),
    };

    // non-spoofable handle to the freshly mounted helper
    let scope = Scope::open(mnt.as_std_path())
        .with_context(|| format!("opening helper mountpoint {mnt}"))?;
    up.cur_device = Some(device);
    up.cur_mount = Some(mnt);

    // the root volume must still be there before we trust anything
    rustix::fs::fstat(&up.caches.cachefd).context("root volume went away")?;

    let stv = rustix::fs::fstatvfs(scope.anchor())?;
    if stv.f_blocks.saturating_mul(stv.f_frsize) < MIN_HELPER_BYTES {
        bail!("Apple_Boot < 128 MB; skipping");
    }
    up.boot_scope = Some(scope);
    Ok(())
}

fn unmount_boot(up: &mut UpdatingVol) {
    let Some(device) = up.cur_device.take() else {
        return;
    };
    // drop our handles before asking for the unmount
    up.boot_scope = None;
    up.cur_mount = None;
    up.cur_rps = None;
    up.efi_dst = None;
    up.of_dst = None;
    if let Err(e) = up.disks.unmount_helper(&device, false) {
        log::warn!("trouble unmounting helper {device}; forcing: {e:#}");
        if let Err(e) = up.disks.unmount_helper(&device, true) {
            log::error!("couldn't unmount helper {device}: {e:#}");
        }
    }
}

/// Copy the whole rotating set into the inactive slot.  Only a complete
/// directory makes sense, so any error aborts the helper.
#[context("Copying rotating boot artifacts")]
fn ucopy_rps(up: &mut UpdatingVol) -> Result<()> {
    let mnt = up.mount()?;
    let target = rps::find_rps_dirs(&mnt).publish_target().to_owned();
    up.cur_rps = Some(target.clone());

    let scope = up.scope()?;
    let src_scope = up.src_scope()?;

    // start from scratch in the staging slot
    if target.exists() {
        safedir::sdeepunlink(scope, target.as_std_path())
            .with_context(|| format!("clearing {target}"))?;
    }
    safedir::smkdir(scope, target.as_std_path(), RPS_DIR_MODE)
        .with_context(|| format!("creating {target}"))?;

    for (i, cp) in up.caches.rpspaths.iter().enumerate() {
        let srcpath = up.caches.root.join(&cp.rpath);
        let dstpath = target.join(&cp.rpath);
        util::check_path_len(dstpath.as_std_path())?;

        if Some(i) == up.caches.bootconfig {
            if let Err(e) = insert_uuid(&up.caches.uuid, &src_scope, &srcpath, scope, &dstpath) {
                log::error!("error populating config file {dstpath}: {e:#}");
                continue;
            }
        } else {
            if let Ok(sb) = rustix::fs::stat(srcpath.as_std_path()) {
                if sb.st_size == 0 {
                    bail!("zero-size file {srcpath}");
                }
            }
            safedir::scopyfile(
                &src_scope,
                srcpath.as_std_path(),
                scope,
                dstpath.as_std_path(),
            )
            .with_context(|| format!("error copying {srcpath}"))?;
        }
    }
    Ok(())
}

/// Publish the boot-config document with the volume's UUID inserted, so the
/// booter can find its root without a device path.
fn insert_uuid(
    uuid: &str,
    src_scope: &Scope,
    srcpath: &Utf8Path,
    dst_scope: &Scope,
    dstpath: &Utf8Path,
) -> Result<()> {
    use std::io::Read;

    let mut src = safedir::sopen(src_scope, srcpath.as_std_path(), OFlags::RDONLY, 0)?;
    let srcst = rustix::fs::fstat(&src)?;
    let mut contents = String::new();
    src.read_to_string(&mut contents)?;

    // an empty or unparsable config degrades to an empty document
    let mut doc = serde_json::from_str::<serde_json::Value>(&contents)
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    doc.insert(
        ROOT_UUID_KEY.to_string(),
        serde_json::Value::String(uuid.to_string()),
    );

    let filemode = srcst.st_mode as u32 & 0o7777;
    let dstparent = dstpath
        .parent()
        .ok_or_else(|| anyhow!("config path {dstpath} has no parent"))?;
    safedir::sdeepmkdir(
        dst_scope,
        dstparent.as_std_path(),
        safedir::copy_dirmode(filemode),
    )?;

    let _ = safedir::sunlink(dst_scope, dstpath.as_std_path());
    let mut dst = safedir::sopen(
        dst_scope,
        dstpath.as_std_path(),
        OFlags::CREATE | OFlags::WRONLY,
        filemode,
    )?;
    serde_json::to_writer(&mut dst, &serde_json::Value::Object(doc))?;
    Ok(())
}

/// Stage every misc file next to its destination as `<name>.new`.  Misc
/// content is non-critical: per-file errors are logged, never fatal.
fn ucopy_misc(up: &mut UpdatingVol) -> Result<()> {
    let mnt = up.mount()?;
    let scope = up.scope()?;
    let src_scope = up.src_scope()?;

    for cp in &up.caches.miscpaths {
        let srcpath = up.caches.root.join(&cp.rpath);
        if !srcpath.exists() {
            continue;
        }
        let dstpath = util::append_ext(&mnt.join(&cp.rpath), NEW_EXT);
        if let Err(e) = safedir::scopyfile(
            &src_scope,
            srcpath.as_std_path(),
            scope,
            dstpath.as_std_path(),
        ) {
            log::error!("error copying {srcpath} to {dstpath}: {e}");
        }
    }
    Ok(())
}

/// A missing label is the hint that the helper is mid-update, so the labels
/// go first.
fn nuke_labels(up: &mut UpdatingVol) -> Result<()> {
    let mnt = up.mount()?;
    let scope = up.scope()?;
    let mut rval = Ok(());

    if let Some(idx) = up.caches.label {
        let labelp = mnt.join(&up.caches.miscpaths[idx].rpath);
        if labelp.exists() {
            keep_first(
                &mut rval,
                safedir::sunlink(scope, labelp.as_std_path()).map_err(Into::into),
            );
        }
        let contentp = util::append_ext(&labelp, CONTENT_EXT);
        if contentp.exists() {
            keep_first(
                &mut rval,
                safedir::sunlink(scope, contentp.as_std_path()).map_err(Into::into),
            );
        }
    }

    up.changestate = ChangeState::NukedLabels;
    crate::try_fail_point!("publish::nuked-labels");
    rval
}

/// Copy fresh booters into place, parking the live ones at `.old`.  Nothing
/// is blessed yet; the `.old` names stay active until activation.
fn ucopy_booters(up: &mut UpdatingVol) -> Result<()> {
    let mnt = up.mount()?;

    up.changestate = ChangeState::CopyingOfBooter;
    crate::try_fail_point!("publish::copying-ofbooter");
    if let Some(cp) = up.caches.ofbooter.clone() {
        let dst = mnt.join(&cp.rpath);
        up.of_dst = Some(dst.clone());
        copy_one_booter(up, &cp.rpath, &dst)?;
    }

    up.changestate = ChangeState::CopyingEfiBooter;
    crate::try_fail_point!("publish::copying-efibooter");
    if let Some(cp) = up.caches.efibooter.clone() {
        let dst = mnt.join(&cp.rpath);
        up.efi_dst = Some(dst.clone());
        copy_one_booter(up, &cp.rpath, &dst)?;
    }

    up.changestate = ChangeState::CopiedBooters;
    crate::try_fail_point!("publish::copied-booters");
    Ok(())
}

fn copy_one_booter(up: &UpdatingVol, rpath: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    let scope = up.scope()?;
    let src_scope = up.src_scope()?;
    let srcpath = up.caches.root.join(rpath);
    let oldpath = util::append_ext(dst, OLD_EXT);

    let _ = safedir::sunlink(scope, oldpath.as_std_path());
    match safedir::srename(scope, dst.as_std_path(), oldpath.as_std_path()) {
        Ok(()) => {}
        // first publication: no booter to park
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
        Err(e) => return Err(e).with_context(|| format!("parking {dst}")),
    }
    safedir::scopyfile(&src_scope, srcpath.as_std_path(), scope, dst.as_std_path())
        .with_context(|| format!("failure copying booter {srcpath}"))
}

fn set_finderinfo(f: &File, magic: &[u8; 8]) -> std::io::Result<()> {
    let mut value = [0u8; 32];
    value[..8].copy_from_slice(magic);
    rustix::fs::fsetxattr(f, FINDERINFO_XATTR, &value, rustix::fs::XattrFlags::empty())?;
    Ok(())
}

/// Bless the new booters: flush them to disk, apply the type/creator magic,
/// and hand the firmware the inode pair (enclosing directory, EFI booter).
fn activate_booters(up: &mut UpdatingVol) -> Result<()> {
    let mnt = up.mount()?;
    let mut vinfo = [0u64; 8];

    up.changestate = ChangeState::ActivatingOfBooter;
    crate::try_fail_point!("publish::activating-ofbooter");
    if let Some(dst) = up.of_dst.clone() {
        let scope = up.scope()?;
        let f = safedir::sopen(scope, dst.as_std_path(), OFlags::RDWR, 0)?;
        util::full_fsync(&f)?;
        set_finderinfo(&f, BOOTER_MAGIC)
            .with_context(|| format!("applying type/creator to {dst}"))?;
        drop(f);

        let parent = dst
            .parent()
            .ok_or_else(|| anyhow!("booter {dst} has no parent"))?;
        let pf = safedir::sopen(
            scope,
            parent.as_std_path(),
            OFlags::RDONLY | OFlags::DIRECTORY,
            0,
        )?;
        vinfo[SYSTEM_FOLDER_IDX] = rustix::fs::fstat(&pf)?.st_ino as u64;
    }

    up.changestate = ChangeState::ActivatingEfiBooter;
    crate::try_fail_point!("publish::activating-efibooter");
    if let Some(dst) = up.efi_dst.clone() {
        let scope = up.scope()?;
        let f = safedir::sopen(scope, dst.as_std_path(), OFlags::RDONLY, 0)?;
        util::full_fsync(&f)?;
        set_finderinfo(&f, BOOTER_MAGIC)
            .with_context(|| format!("applying type/creator to {dst}"))?;
        vinfo[EFI_BOOTER_IDX] = rustix::fs::fstat(&f)?.st_ino as u64;
        drop(f);

        if vinfo[SYSTEM_FOLDER_IDX] == 0 {
            let parent = dst
                .parent()
                .ok_or_else(|| anyhow!("booter {dst} has no parent"))?;
            let pf = safedir::sopen(
                scope,
                parent.as_std_path(),
                OFlags::RDONLY | OFlags::DIRECTORY,
                0,
            )?;
            vinfo[SYSTEM_FOLDER_IDX] = rustix::fs::fstat(&pf)?.st_ino as u64;
        }
    }

    up.disks
        .bless(&mnt, &vinfo)
        .with_context(|| format!("blessing {mnt}"))?;

    up.changestate = ChangeState::ActivatedBooters;
    crate::try_fail_point!("publish::activated-booters");
    Ok(())
}

/// Make the just-written rotating directory the one the firmware picks,
/// with a single rename; then flush the helper.
fn activate_rps(up: &mut UpdatingVol) -> Result<()> {
    let mnt = up.mount()?;
    let scope = up.scope()?;
    let Some(written) = up.cur_rps.clone() else {
        return Ok(());
    };

    let dirs = rps::find_rps_dirs(&mnt);
    if dirs.current != written {
        // leap-frog: the slot we wrote takes the name the table picks next
        safedir::srename(scope, dirs.prev.as_std_path(), dirs.next.as_std_path())
            .with_context(|| format!("rotating {} into place", dirs.prev))?;
    }
    util::full_fsync(scope.anchor())?;
    Ok(())
}

/// Rename `.new` misc files into place and write a fresh label; an intact
/// label marks the helper as consistent again.
fn activate_misc(up: &mut UpdatingVol, bidx: usize) -> Result<()> {
    let mnt = up.mount()?;
    let scope = up.scope()?;

    if up.do_misc {
        for cp in &up.caches.miscpaths {
            let path = mnt.join(&cp.rpath);
            let newp = util::append_ext(&path, NEW_EXT);
            if newp.exists() {
                if let Err(e) = safedir::srename(scope, newp.as_std_path(), path.as_std_path()) {
                    log::warn!("couldn't activate {newp}: {e}");
                }
            }
        }
    }

    if let Some(idx) = up.caches.label {
        let labelp = mnt.join(&up.caches.miscpaths[idx].rpath);
        let _ = safedir::sunlink(scope, labelp.as_std_path());
        write_labels(up, &labelp, bidx)?;

        let scope = up.scope()?;
        if labelp.exists() {
            let f = safedir::sopen(scope, labelp.as_std_path(), OFlags::RDWR, 0)?;
            set_finderinfo(&f, LABEL_MAGIC)
                .with_context(|| format!("applying type/creator to {labelp}"))?;
        }
    }
    Ok(())
}

/// Render and write the label plus its `.contentDetails` sibling (the raw
/// volume name, no terminator).
fn write_labels(up: &UpdatingVol, labelp: &Utf8Path, bidx: usize) -> Result<()> {
    let scope = up.scope()?;
    let bootname = format!("{} {}", up.caches.volname, bidx + 1);
    let data = up.disks.render_label(&bootname)?;

    if let Some(parent) = labelp.parent() {
        safedir::sdeepmkdir(scope, parent.as_std_path(), RPS_DIR_MODE)?;
    }
    let mut f = safedir::sopen(
        scope,
        labelp.as_std_path(),
        OFlags::CREATE | OFlags::WRONLY,
        0o644,
    )?;
    f.write_all(&data)?;

    let contentp = util::append_ext(labelp, CONTENT_EXT);
    let _ = safedir::sunlink(scope, contentp.as_std_path());
    let mut f = safedir::sopen(
        scope,
        contentp.as_std_path(),
        OFlags::CREATE | OFlags::WRONLY,
        0o644,
    )?;
    f.write_all(up.caches.volname.as_bytes())?;
    Ok(())
}

/// Put the old booter back at its live name.  Without an `.old` shadow
/// there is nothing to roll back, and the live file stays untouched.
fn restore_booter(up: &UpdatingVol, rpath: &Utf8Path) -> Result<()> {
    let mnt = up.mount()?;
    let scope = up.scope()?;
    let path = mnt.join(rpath);
    let oldpath = util::append_ext(&path, OLD_EXT);
    if !oldpath.exists() {
        return Ok(());
    }
    let _ = safedir::sunlink(scope, path.as_std_path());
    safedir::srename(scope, oldpath.as_std_path(), path.as_std_path())
        .with_context(|| format!("restoring {path}"))
}

/// Unwind a partial update.  Every step at or below the recorded state is
/// undone; the function accumulates trouble but keeps unwinding.
fn revert_state(up: &mut UpdatingVol) -> Result<()> {
    use ChangeState::*;
    let st = up.changestate;
    let mut rval = Ok(());

    if st >= ActivatedBooters {
        // the new booters are blessed; bless the old ones again
        if let Some(d) = up.of_dst.clone() {
            up.of_dst = Some(util::append_ext(&d, OLD_EXT));
        }
        if let Some(d) = up.efi_dst.clone() {
            up.efi_dst = Some(util::append_ext(&d, OLD_EXT));
        }
        keep_first(&mut rval, activate_booters(up));
    }
    if st >= CopyingEfiBooter {
        if let Some(cp) = up.caches.efibooter.clone() {
            keep_first(&mut rval, restore_booter(up, &cp.rpath));
        }
    }
    if st >= CopyingOfBooter {
        if let Some(cp) = up.caches.ofbooter.clone() {
            keep_first(&mut rval, restore_booter(up, &cp.rpath));
        }
    }
    if st >= NukedLabels {
        // write a fresh label so the helper no longer looks mid-update
        let do_misc = up.do_misc;
        up.do_misc = false;
        keep_first(&mut rval, activate_misc(up, 0));
        up.do_misc = do_misc;
    }
    rval
}

/// Failure-path tidying: drop `.old` booters and the stale rotating
/// directory, accumulating errors.
fn nuke_fallbacks(up: &mut UpdatingVol) -> Result<()> {
    // mount may have failed, in which case there are no fallbacks
    if up.cur_mount.is_none() || up.boot_scope.is_none() {
        return Ok(());
    }
    let mnt = up.mount()?;
    let scope = up.scope()?;
    let mut rval = Ok(());

    if up.do_booters {
        for cp in [up.caches.ofbooter.as_ref(), up.caches.efibooter.as_ref()]
            .into_iter()
            .flatten()
        {
            let delpath = util::append_ext(&mnt.join(&cp.rpath), OLD_EXT);
            match safedir::sunlink(scope, delpath.as_std_path()) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                Err(e) => keep_first(&mut rval, Err(e.into())),
            }
        }
    }

    if up.do_rps {
        let dirs = rps::find_rps_dirs(&mnt);
        if dirs.prev.exists() {
            keep_first(
                &mut rval,
                safedir::sdeepunlink(scope, dirs.prev.as_std_path()).map_err(Into::into),
            );
        }
    }
    rval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootcaches::testutil::*;
    use crate::bootcaches::STAMPS_DIR;
    use crate::disks::mock::MockDisks;
    use crate::disks::BooterInfo;
    use crate::rps::{find_rps_dirs, BOOT_DIR_P, BOOT_DIR_R, BOOT_DIR_S};
    use std::sync::Arc;

    const UUID: &str = "4D5B38AD-0000-11AA-AA11-00306543ECAC";
    const BOOTER: &str = "System/Library/CoreServices/boot.efi";
    const LABEL: &str = "System/Library/CoreServices/.disk_label";
    const BOOTCFG: &str = "Library/Preferences/SystemConfiguration/com.apple.Boot.plist";

    fn setup(td: &std::path::Path) -> (Utf8PathBuf, Utf8PathBuf, Arc<MockDisks>) {
        let (root, helper, disks) = fixture_volume(td);
        settle_kernel_cache(&root);
        (root, helper, disks)
    }

    fn publish(root: &Utf8Path, disks: &MockDisks) -> Result<()> {
        update_boots(root, false, disks, &mut NoLock)
    }

    fn read(p: &Utf8Path) -> String {
        std::fs::read_to_string(p.as_std_path()).unwrap_or_else(|e| panic!("reading {p}: {e}"))
    }

    fn rps_present(helper: &Utf8Path) -> Vec<&'static str> {
        [BOOT_DIR_R, BOOT_DIR_P, BOOT_DIR_S]
            .into_iter()
            .filter(|n| helper.join(n).exists())
            .collect()
    }

    fn booter_shadow(root: &Utf8Path) -> Utf8PathBuf {
        root.join(STAMPS_DIR)
            .join(UUID)
            .join("System:Library:CoreServices:boot.efi")
    }

    #[test]
    fn test_fresh_publish() {
        let _env = env_lock();
        let td = tempfile::tempdir().unwrap();
        let (root, helper, disks) = setup(td.path());

        publish(&root, &disks).unwrap();

        // a virgin helper gets its content under the R name
        let rdir = helper.join(BOOT_DIR_R);
        assert_eq!(rps_present(&helper), vec![BOOT_DIR_R]);
        assert!(rdir.join("mach_kernel").is_file());
        assert!(rdir.join("System/Library/Extensions.mkext").is_file());

        // the boot config was republished with the volume UUID inserted
        let cfg: serde_json::Value = serde_json::from_str(&read(&rdir.join(BOOTCFG))).unwrap();
        assert_eq!(cfg["Root UUID"].as_str(), Some(UUID));

        // fresh booter, no fallback from a previous generation
        assert_eq!(read(&helper.join(BOOTER)), format!("contents of {BOOTER}"));
        assert!(!helper.join(format!("{BOOTER}{OLD_EXT}")).exists());

        // label plus contentDetails carrying the volume name
        assert_eq!(read(&helper.join(LABEL)), "label:Macintosh HD 1");
        assert_eq!(
            read(&util::append_ext(&helper.join(LABEL), CONTENT_EXT)),
            "Macintosh HD"
        );

        // misc staging was activated
        assert!(helper
            .join("System/Library/CoreServices/SystemVersion.plist")
            .is_file());
        assert!(!helper
            .join("System/Library/CoreServices/SystemVersion.plist.new")
            .exists());

        // blessed once, with the booter inode recorded
        let blessed = disks.blessed.lock().unwrap();
        assert_eq!(blessed.len(), 1);
        assert_eq!(blessed[0].0, helper);
        assert_ne!(blessed[0].1[EFI_BOOTER_IDX], 0);
        assert_ne!(blessed[0].1[SYSTEM_FOLDER_IDX], 0);
        drop(blessed);

        // stamps mirror the source mtimes exactly
        let src = rustix::fs::stat(root.join(BOOTER).as_std_path()).unwrap();
        let ts = rustix::fs::stat(booter_shadow(&root).as_std_path()).unwrap();
        assert_eq!(src.st_mtime, ts.st_mtime);
        assert_eq!(src.st_mtime_nsec, ts.st_mtime_nsec);
    }

    #[test]
    fn test_republish_is_idempotent() {
        let _env = env_lock();
        let td = tempfile::tempdir().unwrap();
        let (root, helper, disks) = setup(td.path());

        publish(&root, &disks).unwrap();
        publish(&root, &disks).unwrap();

        // nothing was stale, so the second call never touched the helper
        assert_eq!(disks.blessed.lock().unwrap().len(), 1);
        assert_eq!(rps_present(&helper), vec![BOOT_DIR_R]);
    }

    #[test]
    fn test_rotation_keeps_previous_generation() {
        let _env = env_lock();
        let td = tempfile::tempdir().unwrap();
        let (root, helper, disks) = setup(td.path());

        publish(&root, &disks).unwrap();

        std::fs::write(root.join("mach_kernel").as_std_path(), "kernel v2").unwrap();
        publish(&root, &disks).unwrap();
        assert_eq!(rps_present(&helper), vec![BOOT_DIR_R, BOOT_DIR_P]);
        let cur = find_rps_dirs(&helper).current;
        assert_eq!(cur, helper.join(BOOT_DIR_P));
        assert_eq!(read(&cur.join("mach_kernel")), "kernel v2");

        std::fs::write(root.join("mach_kernel").as_std_path(), "kernel v3").unwrap();
        publish(&root, &disks).unwrap();
        assert_eq!(rps_present(&helper), vec![BOOT_DIR_P, BOOT_DIR_S]);
        let cur = find_rps_dirs(&helper).current;
        assert_eq!(cur, helper.join(BOOT_DIR_S));
        assert_eq!(read(&cur.join("mach_kernel")), "kernel v3");
        // the previous generation rides along as fallback
        assert_eq!(
            read(&helper.join(BOOT_DIR_P).join("mach_kernel")),
            "kernel v2"
        );
    }

    #[test]
    fn test_descriptor_without_booter() {
        let _env = env_lock();
        let td = tempfile::tempdir().unwrap();
        let (root, helper, disks) = setup(td.path());

        // drop the BooterPaths key entirely
        let mut doc: serde_json::Value = serde_json::from_str(FIXTURE).unwrap();
        doc.as_object_mut().unwrap().remove("BooterPaths");
        std::fs::write(
            root.join(crate::bootcaches::DESCRIPTOR_PATH).as_std_path(),
            serde_json::to_string(&doc).unwrap(),
        )
        .unwrap();

        // a booter from some earlier era lives on the helper
        let ancient = helper.join(BOOTER);
        std::fs::create_dir_all(ancient.parent().unwrap().as_std_path()).unwrap();
        std::fs::write(ancient.as_std_path(), "ancient booter").unwrap();

        publish(&root, &disks).unwrap();

        // rotating content and label went out; the booter was left alone
        assert_eq!(rps_present(&helper), vec![BOOT_DIR_R]);
        assert_eq!(read(&helper.join(LABEL)), "label:Macintosh HD 1");
        assert_eq!(read(&ancient), "ancient booter");
        assert!(disks.blessed.lock().unwrap().is_empty());

        // stamps still recorded for what was published
        assert!(root
            .join(STAMPS_DIR)
            .join(UUID)
            .join("mach_kernel")
            .exists());
    }

    #[test]
    fn test_zero_size_source_aborts() {
        let _env = env_lock();
        let td = tempfile::tempdir().unwrap();
        let (root, helper, disks) = setup(td.path());

        std::fs::write(root.join("mach_kernel").as_std_path(), "").unwrap();
        let err = publish(&root, &disks).unwrap_err();
        assert!(format!("{err:#}").contains("zero-size"));

        // the transaction died before anything was activated
        assert!(!helper.join(LABEL).exists());
        assert!(!booter_shadow(&root).exists());
    }

    #[test]
    fn test_no_helpers_is_nothing_to_do() {
        let _env = env_lock();
        let td = tempfile::tempdir().unwrap();
        let (root, helper, disks) = setup(td.path());
        disks.booters.lock().unwrap().insert(
            "disk0s2".to_string(),
            BooterInfo {
                auxiliary: vec![],
                system: vec!["disk0s1".to_string()],
            },
        );

        publish(&root, &disks).unwrap();
        assert_eq!(rps_present(&helper), Vec::<&str>::new());
        // no helpers were updated, so nothing was stamped either
        assert!(!booter_shadow(&root).exists());
    }

    #[test]
    fn test_failure_atomicity_at_every_state() {
        let _env = env_lock();
        let scenario = fail::FailScenario::setup();

        // (failpoint, expected bless calls over both publishes)
        let table: &[(&str, usize)] = &[
            ("publish::nuked-labels", 1),
            ("publish::copying-ofbooter", 1),
            ("publish::copying-efibooter", 1),
            ("publish::copied-booters", 1),
            ("publish::activating-ofbooter", 1),
            ("publish::activating-efibooter", 1),
            // failing after activation forces a re-bless of the fallback
            ("publish::activated-booters", 3),
        ];

        for (fp, expect_bless) in table {
            let td = tempfile::tempdir().unwrap();
            let (root, helper, disks) = setup(td.path());
            publish(&root, &disks).unwrap();

            // make every group stale, with distinguishable new content
            std::fs::write(root.join("mach_kernel").as_std_path(), "kernel v2").unwrap();
            std::fs::write(root.join(BOOTER).as_std_path(), "booter v2").unwrap();
            std::fs::write(root.join(LABEL).as_std_path(), "label seed v2").unwrap();
            let pre_booter = read(&helper.join(BOOTER));

            fail::cfg(*fp, "1*return").unwrap();
            let r = publish(&root, &disks);
            fail::remove(*fp);
            assert!(r.is_err(), "{fp} should abort the transaction");

            // the helper still boots: old booter at its live name, no .old
            // remnant, and the old rotation is the current one
            assert_eq!(read(&helper.join(BOOTER)), pre_booter, "{fp}");
            assert!(
                !helper.join(format!("{BOOTER}{OLD_EXT}")).exists(),
                "{fp} left a .old behind"
            );
            assert_eq!(rps_present(&helper), vec![BOOT_DIR_R], "{fp}");
            assert_eq!(
                read(&helper.join(BOOT_DIR_R).join("mach_kernel")),
                "contents of mach_kernel",
                "{fp}"
            );

            // the label came back so the helper doesn't look mid-update
            assert!(helper.join(LABEL).exists(), "{fp}");

            // stamps were not advanced; the next notification retries
            let src = rustix::fs::stat(root.join(BOOTER).as_std_path()).unwrap();
            let ts = rustix::fs::stat(booter_shadow(&root).as_std_path()).unwrap();
            assert!(
                src.st_mtime != ts.st_mtime || src.st_mtime_nsec != ts.st_mtime_nsec,
                "{fp} advanced the stamps"
            );

            assert_eq!(disks.blessed.lock().unwrap().len(), *expect_bless, "{fp}");
        }
        scenario.teardown();
    }
}

