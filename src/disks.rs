//! Seam to the platform's disk-description and firmware services: volume
//! descriptions, booter-partition topology, helper mounts, owners toggling,
//! and the bless call.  Everything behind [`DiskService`] is an external
//! collaborator; the daemon and publisher only consume the trait.

use std::fmt;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::util::{self, CommandRunExt};

/// GPT partition type of helper ("auxiliary") boot partitions.
pub(crate) const APPLE_BOOT_GUID: &str = "426f6f74-0000-11aa-aa11-00306543ecac";
/// GPT partition type of the system (EFI) partition.
pub(crate) const ESP_GUID: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";

#[derive(Debug, Clone)]
pub(crate) struct VolumeDesc {
    pub(crate) uuid: String,
    pub(crate) name: String,
    pub(crate) mountpoint: Option<Utf8PathBuf>,
    pub(crate) writable: bool,
    pub(crate) network: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct BooterInfo {
    pub(crate) auxiliary: Vec<String>,
    pub(crate) system: Vec<String>,
}

impl BooterInfo {
    /// A volume is helper-partitioned iff it has both auxiliary and system
    /// partitions.
    pub(crate) fn is_boot_root(&self) -> bool {
        !self.auxiliary.is_empty() && !self.system.is_empty()
    }
}

/// Mount requests distinguish "try again after a forced unmount" from
/// everything else.
#[derive(Debug)]
pub(crate) enum MountError {
    Busy,
    Other(anyhow::Error),
}

impl fmt::Display for MountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountError::Busy => write!(f, "resource busy"),
            MountError::Other(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for MountError {}

pub(crate) trait DiskService: Send + Sync {
    /// Device name for a device id, as stat reports it.
    fn device_for(&self, dev: u64) -> Result<Option<String>>;

    fn describe(&self, device: &str) -> Result<Option<VolumeDesc>>;

    fn booter_partitions(&self, device: &str) -> Result<BooterInfo>;

    /// Mount a helper partition "perm, nobrowse"; returns the mountpoint.
    fn mount_helper(&self, device: &str) -> std::result::Result<Utf8PathBuf, MountError>;

    fn unmount_helper(&self, device: &str, force: bool) -> Result<()>;

    /// The "update" mount with perm/noperm.
    fn set_owners(&self, device: &str, enable: bool) -> Result<()>;

    fn owners_ignored(&self, mountpoint: &Utf8Path) -> Result<bool>;

    /// Record on the volume which booter the firmware loads next.  vinfo[0]
    /// is the enclosing directory's inode, vinfo[1] the EFI booter's.
    fn bless(&self, helper_root: &Utf8Path, vinfo: &[u64; 8]) -> Result<()>;

    /// Render the label image shown in the firmware boot picker.
    fn render_label(&self, text: &str) -> Result<Vec<u8>>;

    /// Locally mounted volumes as (device, mountpoint) pairs.
    fn local_mounts(&self) -> Result<Vec<(String, Utf8PathBuf)>>;
}

// lsblk output model; see `lsblk --json`.
#[derive(Deserialize, Debug)]
struct LsblkDevice {
    name: String,
    #[serde(rename = "maj:min")]
    majmin: Option<String>,
    uuid: Option<String>,
    label: Option<String>,
    mountpoint: Option<String>,
    parttype: Option<String>,
    pkname: Option<String>,
    fstype: Option<String>,
    // util-linux emits booleans in current releases, "0"/"1" in older ones
    ro: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug)]
struct LsblkReport {
    blockdevices: Vec<LsblkDevice>,
}

impl LsblkDevice {
    fn readonly(&self) -> bool {
        match &self.ro {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s == "1",
            Some(serde_json::Value::Number(n)) => n.as_i64() == Some(1),
            _ => false,
        }
    }
}

const LSBLK_COLUMNS: &str = "NAME,MAJ:MIN,UUID,LABEL,MOUNTPOINT,PARTTYPE,PKNAME,FSTYPE,RO";

/// Production implementation backed by the platform's disk utilities.
pub(crate) struct HostDisks {
    /// Where helper partitions get mounted.
    mount_base: Utf8PathBuf,
}

impl HostDisks {
    pub(crate) fn new() -> HostDisks {
        HostDisks {
            mount_base: Utf8PathBuf::from("/run/bootstampd/helpers"),
        }
    }

    fn lsblk(&self, device: Option<&str>) -> Result<Vec<LsblkDevice>> {
        let mut cmd = Command::new("lsblk");
        cmd.args(["--json", "--list", "--output", LSBLK_COLUMNS]);
        if let Some(dev) = device {
            cmd.arg(format!("/dev/{dev}"));
        }
        let out = util::cmd_output(&mut cmd)?;
        let report: LsblkReport =
            serde_json::from_str(&out).context("could not deserialize JSON output from lsblk")?;
        Ok(report.blockdevices)
    }

    fn bless_path() -> String {
        std::env::var("BOOTSTAMPD_BLESS").unwrap_or_else(|_| "/usr/sbin/bless".to_string())
    }
}

impl DiskService for HostDisks {
    fn device_for(&self, dev: u64) -> Result<Option<String>> {
        let majmin = format!("{}:{}", rustix::fs::major(dev), rustix::fs::minor(dev));
        let devices = self.lsblk(None)?;
        Ok(devices
            .into_iter()
            .find(|d| d.majmin.as_deref() == Some(majmin.as_str()))
            .map(|d| d.name))
    }

    fn describe(&self, device: &str) -> Result<Option<VolumeDesc>> {
        let mut devices = self.lsblk(Some(device))?;
        let Some(d) = devices.drain(..).find(|d| d.name == device) else {
            return Ok(None);
        };
        let writable = !d.readonly();
        Ok(Some(VolumeDesc {
            uuid: d.uuid.unwrap_or_default(),
            name: d.label.unwrap_or_else(|| device.to_string()),
            writable,
            mountpoint: d.mountpoint.map(Utf8PathBuf::from),
            // everything lsblk reports is a local block device
            network: false,
        }))
    }

    fn booter_partitions(&self, device: &str) -> Result<BooterInfo> {
        let devices = self.lsblk(None)?;
        let parent = devices
            .iter()
            .find(|d| d.name == device)
            .and_then(|d| d.pkname.clone());
        let Some(parent) = parent else {
            return Ok(BooterInfo::default());
        };
        let mut info = BooterInfo::default();
        for d in devices {
            if d.pkname.as_deref() != Some(parent.as_str()) {
                continue;
            }
            match d.parttype.as_deref() {
                Some(APPLE_BOOT_GUID) => info.auxiliary.push(d.name),
                Some(ESP_GUID) => info.system.push(d.name),
                _ => {}
            }
        }
        Ok(info)
    }

    fn mount_helper(&self, device: &str) -> std::result::Result<Utf8PathBuf, MountError> {
        let mnt = self.mount_base.join(device);
        std::fs::create_dir_all(&mnt)
            .with_context(|| format!("creating mountpoint {mnt}"))
            .map_err(MountError::Other)?;
        let out = Command::new("mount")
            .args(["-o", "perm,nobrowse"])
            .arg(format!("/dev/{device}"))
            .arg(mnt.as_str())
            .output()
            .map_err(|e| MountError::Other(e.into()))?;
        if out.status.success() {
            return Ok(mnt);
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.to_ascii_lowercase().contains("busy") {
            Err(MountError::Busy)
        } else {
            Err(MountError::Other(anyhow!(
                "mount of {device} failed: {}",
                stderr.trim()
            )))
        }
    }

    fn unmount_helper(&self, device: &str, force: bool) -> Result<()> {
        let mut cmd = Command::new("umount");
        if force {
            cmd.arg("-f");
        }
        cmd.arg(format!("/dev/{device}"))
            .run()
            .with_context(|| format!("unmounting {device}"))?;
        let _ = std::fs::remove_dir(self.mount_base.join(device));
        Ok(())
    }

    fn set_owners(&self, device: &str, enable: bool) -> Result<()> {
        let Some(desc) = self.describe(device)? else {
            anyhow::bail!("no description for {device}");
        };
        let Some(mnt) = desc.mountpoint else {
            anyhow::bail!("{device} is not mounted");
        };
        Command::new("mount")
            .args(["-u", "-o", if enable { "perm" } else { "noperm" }])
            .arg(mnt.as_str())
            .run()
            .with_context(|| format!("toggling owners on {device}"))
    }

    fn owners_ignored(&self, mountpoint: &Utf8Path) -> Result<bool> {
        let out = util::cmd_output(&mut Command::new("mount"))?;
        let needle = format!(" on {mountpoint} ");
        Ok(out
            .lines()
            .find(|l| l.contains(&needle))
            .map(|l| l.contains("noowners") || l.contains("noperm"))
            .unwrap_or(false))
    }

    fn bless(&self, helper_root: &Utf8Path, vinfo: &[u64; 8]) -> Result<()> {
        // the bless tool re-derives the inode vector from the mount; we log
        // ours so mismatches are diagnosable
        log::debug!("blessing {helper_root} with volume info {vinfo:?}");
        Command::new(Self::bless_path())
            .args(["--mount", helper_root.as_str(), "--setBoot"])
            .run()
            .with_context(|| format!("blessing {helper_root}"))
    }

    fn render_label(&self, text: &str) -> Result<Vec<u8>> {
        // the firmware only needs *a* label file; image rendering is the
        // label helper's job when one is installed
        Ok(text.as_bytes().to_vec())
    }

    fn local_mounts(&self) -> Result<Vec<(String, Utf8PathBuf)>> {
        let devices = self.lsblk(None)?;
        Ok(devices
            .into_iter()
            .filter(|d| d.fstype.is_some())
            .filter_map(|d| d.mountpoint.map(|m| (d.name, Utf8PathBuf::from(m))))
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory disk service for tests.  Helper "mounts" are plain
    /// directories prepared by the test.
    pub(crate) struct MockDisks {
        pub(crate) volumes: Mutex<BTreeMap<String, VolumeDesc>>,
        pub(crate) booters: Mutex<BTreeMap<String, BooterInfo>>,
        pub(crate) helper_mounts: Mutex<BTreeMap<String, Utf8PathBuf>>,
        pub(crate) dev_names: Mutex<BTreeMap<u64, String>>,
        pub(crate) blessed: Mutex<Vec<(Utf8PathBuf, [u64; 8])>>,
        pub(crate) owner_toggles: Mutex<Vec<(String, bool)>>,
        pub(crate) owners_ignored: Mutex<bool>,
    }

    impl MockDisks {
        pub(crate) fn new() -> MockDisks {
            MockDisks {
                volumes: Mutex::new(BTreeMap::new()),
                booters: Mutex::new(BTreeMap::new()),
                helper_mounts: Mutex::new(BTreeMap::new()),
                dev_names: Mutex::new(BTreeMap::new()),
                blessed: Mutex::new(Vec::new()),
                owner_toggles: Mutex::new(Vec::new()),
                owners_ignored: Mutex::new(false),
            }
        }

        /// Register a root volume whose descriptor lives under `root`,
        /// together with one helper "partition" directory.
        pub(crate) fn with_volume(
            self,
            device: &str,
            root: &Utf8Path,
            helper_dev: &str,
            helper_mount: &Utf8Path,
        ) -> MockDisks {
            let dev = rustix::fs::stat(root.as_std_path())
                .map(|st| st.st_dev as u64)
                .unwrap_or(0);
            self.dev_names.lock().unwrap().insert(dev, device.to_string());
            self.volumes.lock().unwrap().insert(
                device.to_string(),
                VolumeDesc {
                    uuid: "4D5B38AD-0000-11AA-AA11-00306543ECAC".to_string(),
                    name: "Macintosh HD".to_string(),
                    mountpoint: Some(root.to_owned()),
                    writable: true,
                    network: false,
                },
            );
            self.booters.lock().unwrap().insert(
                device.to_string(),
                BooterInfo {
                    auxiliary: vec![helper_dev.to_string()],
                    system: vec!["disk0s1".to_string()],
                },
            );
            self.helper_mounts
                .lock()
                .unwrap()
                .insert(helper_dev.to_string(), helper_mount.to_owned());
            self
        }
    }

    impl DiskService for MockDisks {
        fn device_for(&self, dev: u64) -> Result<Option<String>> {
            Ok(self.dev_names.lock().unwrap().get(&dev).cloned())
        }

        fn describe(&self, device: &str) -> Result<Option<VolumeDesc>> {
            Ok(self.volumes.lock().unwrap().get(device).cloned())
        }

        fn booter_partitions(&self, device: &str) -> Result<BooterInfo> {
            Ok(self
                .booters
                .lock()
                .unwrap()
                .get(device)
                .cloned()
                .unwrap_or_default())
        }

        fn mount_helper(&self, device: &str) -> std::result::Result<Utf8PathBuf, MountError> {
            self.helper_mounts
                .lock()
                .unwrap()
                .get(device)
                .cloned()
                .ok_or_else(|| MountError::Other(anyhow!("unknown helper {device}")))
        }

        fn unmount_helper(&self, _device: &str, _force: bool) -> Result<()> {
            Ok(())
        }

        fn set_owners(&self, device: &str, enable: bool) -> Result<()> {
            self.owner_toggles
                .lock()
                .unwrap()
                .push((device.to_string(), enable));
            Ok(())
        }

        fn owners_ignored(&self, _mountpoint: &Utf8Path) -> Result<bool> {
            Ok(*self.owners_ignored.lock().unwrap())
        }

        fn bless(&self, helper_root: &Utf8Path, vinfo: &[u64; 8]) -> Result<()> {
            self.blessed
                .lock()
                .unwrap()
                .push((helper_root.to_owned(), *vinfo));
            Ok(())
        }

        fn render_label(&self, text: &str) -> Result<Vec<u8>> {
            Ok(format!("label:{text}").into_bytes())
        }

        fn local_mounts(&self) -> Result<Vec<(String, Utf8PathBuf)>> {
            Ok(self
                .volumes
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(d, v)| v.mountpoint.clone().map(|m| (d.clone(), m)))
                .collect())
        }
    }
}
