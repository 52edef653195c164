//! The rock/paper/scissors rotation among the three fixed helper
//! directories.  Exactly one of them is the one the firmware will read; the
//! table below decides which, for every combination that can exist on disk.

use camino::{Utf8Path, Utf8PathBuf};

pub(crate) const BOOT_DIR_R: &str = "com.apple.boot.R";
pub(crate) const BOOT_DIR_P: &str = "com.apple.boot.P";
pub(crate) const BOOT_DIR_S: &str = "com.apple.boot.S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RpsDirs {
    /// The directory the firmware reads.
    pub(crate) current: Utf8PathBuf,
    /// Where a rename of freshly published content lands.
    pub(crate) next: Utf8PathBuf,
    /// The older slot; publication overwrites it, activation renames it.
    pub(crate) prev: Utf8PathBuf,
    /// True if none of the three exist yet (brand-new helper).
    pub(crate) empty: bool,
}

impl RpsDirs {
    /// The slot new content is copied into.  On a virgin helper that is the
    /// `current` name itself; otherwise it is the older slot, so the
    /// firmware's choice never changes until the activation rename.
    pub(crate) fn publish_target(&self) -> &Utf8Path {
        if self.empty {
            &self.current
        } else {
            &self.prev
        }
    }
}

pub(crate) fn find_rps_dirs(helper_root: &Utf8Path) -> RpsDirs {
    let r = helper_root.join(BOOT_DIR_R);
    let p = helper_root.join(BOOT_DIR_P);
    let s = helper_root.join(BOOT_DIR_S);

    let have = (r.exists(), p.exists(), s.exists());
    let (current, next, prev) = match have {
        (true, true, true) => {
            log::warn!("all of R, P and S exist: picking R");
            (r, p, s)
        }
        (true, true, false) => (p, s, r),
        (true, false, true) => (r, p, s),
        (false, true, true) => (s, r, p),
        (true, false, false) => (r, p, s),
        (false, true, false) => (p, s, r),
        (false, false, true) => (s, r, p),
        (false, false, false) => (r, p, s),
    };
    RpsDirs {
        current,
        next,
        prev,
        empty: have == (false, false, false),
    }
}
