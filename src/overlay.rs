//! Overlay composer: stacks a per-container writable layer on top of a
//! mounted read-only root, producing the final rootfs handed to a
//! container runtime.
//!
//! Layout, per container id `cid` under a base state directory:
//!
//! ```text
//! <mount_base_dir>/<image_key>/ro   -- the read-only root from fs.rs
//! <rootfs_base_dir>/upper/<cid>     -- overlay upper dir
//! <rootfs_base_dir>/work/<cid>      -- overlay work dir
//! <rootfs_base_dir>/<cid>/rootfs    -- merged root handed to the runtime
//! ```
use std::fs;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::error::{ClipError, Result};

pub struct OverlayComposer {
    rootfs_base_dir: PathBuf,
}

impl OverlayComposer {
    pub fn new(rootfs_base_dir: PathBuf) -> Self {
        Self { rootfs_base_dir }
    }

    fn upper_dir(&self, cid: &str) -> PathBuf {
        self.rootfs_base_dir.join("upper").join(cid)
    }

    fn work_dir(&self, cid: &str) -> PathBuf {
        self.rootfs_base_dir.join("work").join(cid)
    }

    fn rootfs_dir(&self, cid: &str) -> PathBuf {
        self.rootfs_base_dir.join(cid).join("rootfs")
    }

    /// Mount the merged overlay for `cid` on top of `read_only_root`,
    /// returning the path the container runtime should chroot/pivot into.
    ///
    /// Tries kernel overlayfs first; on `EINVAL`/`ENOSYS` (unsupported on
    /// this host, e.g. inside a nested container without the module) falls
    /// back to... nothing yet -- there is no user-space overlay fallback in
    /// this build, so that case surfaces as `OverlayUnsupported`.
    pub fn mount(&self, cid: &str, read_only_root: &Path) -> Result<PathBuf> {
        fs::read_dir(read_only_root).map_err(|e| {
            ClipError::OverlayUnsupported(format!(
                "lower root {} not accessible: {e}",
                read_only_root.display()
            ))
        })?;

        let upper = self.upper_dir(cid);
        let work = self.work_dir(cid);
        let rootfs = self.rootfs_dir(cid);
        fs::create_dir_all(&upper)?;
        fs::create_dir_all(&work)?;
        fs::create_dir_all(&rootfs)?;

        let options = format!(
            "lowerdir={},upperdir={},workdir={},index=off,metacopy=off",
            read_only_root.display(),
            upper.display(),
            work.display(),
        );

        let result = mount(
            Some("overlay"),
            &rootfs,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        );

        match result {
            Ok(()) => {
                log::info!("mounted overlay for container {cid} at {}", rootfs.display());
                Ok(rootfs)
            }
            Err(errno) => {
                log::warn!("kernel overlayfs mount failed for {cid}: {errno}");
                Err(ClipError::OverlayUnsupported(errno.to_string()))
            }
        }
    }

    /// Unmount and clean up the overlay for `cid`. Always attempted, even
    /// if a prior `mount` failed partway -- a lazy detach is used if the
    /// graceful unmount fails so teardown never blocks on a busy mount.
    pub fn unmount(&self, cid: &str) -> Result<()> {
        let rootfs = self.rootfs_dir(cid);
        if rootfs.exists() {
            if let Err(errno) = umount2(&rootfs, MntFlags::empty()) {
                log::warn!("graceful unmount of {} failed ({errno}), forcing detach", rootfs.display());
                umount2(&rootfs, MntFlags::MNT_DETACH).map_err(|e| {
                    ClipError::OverlayUnsupported(format!("detach unmount failed: {e}"))
                })?;
            }
        }

        let upper = self.upper_dir(cid);
        let work = self.work_dir(cid);
        let container_dir = self.rootfs_base_dir.join(cid);
        for dir in [&upper, &work, &container_dir] {
            if dir.exists() {
                fs::remove_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_the_documented_layout() {
        let composer = OverlayComposer::new(PathBuf::from("/state/rootfs"));
        assert_eq!(composer.upper_dir("c1"), PathBuf::from("/state/rootfs/upper/c1"));
        assert_eq!(composer.work_dir("c1"), PathBuf::from("/state/rootfs/work/c1"));
        assert_eq!(composer.rootfs_dir("c1"), PathBuf::from("/state/rootfs/c1/rootfs"));
    }

    #[test]
    fn mount_rejects_an_inaccessible_lower_root() {
        let base = tempfile::tempdir().unwrap();
        let composer = OverlayComposer::new(base.path().to_path_buf());
        let missing_lower = base.path().join("does-not-exist");
        let err = composer.mount("c1", &missing_lower).unwrap_err();
        assert!(matches!(err, ClipError::OverlayUnsupported(_)));
    }
}
