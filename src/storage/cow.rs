//! Copy-on-write subvolume backend.
//!
//! Each rootfs is a subvolume under the roots directory; snapshot and
//! restore are native subvolume operations, shelled out to the filesystem's
//! own tooling. Snapshots are created read-only, so restore re-marks the
//! target writable and delete clears the read-only bit recursively first.
//! A `syncfs` precedes snapshot and delete so ordering is durable.
//!
//! When the roots directory does not sit on a subvolume-capable filesystem,
//! a file-backed pool is provisioned, attached to a loop device and mounted
//! over it.

use crate::config::StackerConfig;
use crate::error::{Result, StackerError};
use crate::oci::{repack, unpack, LayerType, OciLayout};
use crate::storage::{Storage, TempSnapshot};
use nix::mount::{umount2, MntFlags};
use oci_spec::image::{Descriptor, ImageManifest};
use std::collections::HashSet;
use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

const POOL_SIZE: u64 = 100 * 1024 * 1024 * 1024;

/// Whether `path` sits on a filesystem with native subvolume support.
pub fn is_cow_filesystem(path: &Path) -> Result<bool> {
    let stat = nix::sys::statfs::statfs(path)
        .map_err(|e| StackerError::io(path, std::io::Error::from(e)))?;
    Ok(stat.filesystem_type() == nix::sys::statfs::BTRFS_SUPER_MAGIC)
}

pub struct CowStorage {
    config: StackerConfig,
    needs_umount: bool,
}

impl CowStorage {
    pub fn new(config: StackerConfig, needs_umount: bool) -> CowStorage {
        CowStorage { config, needs_umount }
    }

    /// Provision the loopback pool and mount it over the roots directory.
    pub fn setup_loopback_pool(&self) -> Result<()> {
        fs::create_dir_all(&self.config.stacker_dir)
            .map_err(|e| StackerError::io(&self.config.stacker_dir, e))?;

        let pool = self.config.stacker_dir.join("cow.pool");
        if !pool.exists() {
            let f = fs::File::create(&pool).map_err(|e| StackerError::io(&pool, e))?;
            f.set_len(POOL_SIZE).map_err(|e| StackerError::io(&pool, e))?;
            drop(f);
            run_checked("mkfs.btrfs", &[pool.as_os_str().to_string_lossy().as_ref()])?;
        }

        let output = Command::new("losetup")
            .arg("--find")
            .arg("--show")
            .arg(&pool)
            .output()
            .map_err(|e| StackerError::io(&pool, e))?;
        if !output.status.success() {
            return Err(StackerError::FilesystemCapability {
                reason: format!(
                    "couldn't attach loop device: {}",
                    String::from_utf8_lossy(&output.stderr)
                ),
                remedy: "check loop device availability (modprobe loop)".to_string(),
            });
        }
        let dev = String::from_utf8_lossy(&output.stdout).trim().to_string();

        nix::mount::mount(
            Some(Path::new(&dev)),
            &self.config.rootfs_dir,
            Some("btrfs"),
            nix::mount::MsFlags::empty(),
            Some("user_subvol_rm_allowed"),
        )
        .map_err(|e| StackerError::FilesystemCapability {
            reason: format!("couldn't mount pool {}: {}", dev, e),
            remedy: "run with privileges sufficient to mount, or use a subvolume-capable roots dir"
                .to_string(),
        })?;

        info!(dev, "mounted loopback pool");
        Ok(())
    }

    fn subvol_path(&self, name: &str) -> PathBuf {
        self.config.rootfs_path(name)
    }

    fn sync(&self, name: &str) -> Result<()> {
        let p = self.subvol_path(name);
        let f = fs::File::open(&p).map_err(|e| StackerError::io(&p, e))?;
        nix::unistd::syncfs(f.as_raw_fd())
            .map_err(|e| StackerError::io(&p, std::io::Error::from(e)))
    }

    fn btrfs(&self, args: &[&str]) -> Result<()> {
        run_checked("btrfs", args)
    }

    fn set_readonly(&self, path: &Path, ro: bool) -> Result<()> {
        self.btrfs(&[
            "property",
            "set",
            "-ts",
            path.to_string_lossy().as_ref(),
            "ro",
            if ro { "true" } else { "false" },
        ])
    }

    /// Subvolumes nested under `path`, deepest first, for recursive delete.
    fn nested_subvolumes(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for item in walkdir::WalkDir::new(path).min_depth(1).follow_links(false) {
            let Ok(item) = item else {
                continue;
            };
            if !item.file_type().is_dir() {
                continue;
            }
            // subvolume roots have the filesystem's first free object id
            if let Ok(meta) = item.path().symlink_metadata() {
                use std::os::unix::fs::MetadataExt;
                if meta.ino() == 256 {
                    found.push(item.path().to_path_buf());
                }
            }
        }
        found.sort();
        found.reverse();
        Ok(found)
    }
}

fn run_checked(cmd: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .map_err(|e| StackerError::io(cmd, e))?;
    if !output.status.success() {
        return Err(StackerError::Storage {
            name: cmd.to_string(),
            reason: format!(
                "{} {}: {}",
                cmd,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            ),
        });
    }
    Ok(())
}

impl Storage for CowStorage {
    fn name(&self) -> &'static str {
        "cow"
    }

    fn create(&self, name: &str) -> Result<()> {
        let p = self.subvol_path(name);
        if p.exists() {
            return Err(StackerError::Storage {
                name: name.to_string(),
                reason: "already exists".to_string(),
            });
        }
        self.btrfs(&["subvolume", "create", p.to_string_lossy().as_ref()])?;
        let rootfs = p.join("rootfs");
        fs::create_dir(&rootfs).map_err(|e| StackerError::io(&rootfs, e))
    }

    fn snapshot(&self, source: &str, target: &str) -> Result<()> {
        self.sync(source)?;
        self.btrfs(&[
            "subvolume",
            "snapshot",
            "-r",
            self.subvol_path(source).to_string_lossy().as_ref(),
            self.subvol_path(target).to_string_lossy().as_ref(),
        ])
    }

    fn restore(&self, source: &str, target: &str) -> Result<()> {
        self.btrfs(&[
            "subvolume",
            "snapshot",
            self.subvol_path(source).to_string_lossy().as_ref(),
            self.subvol_path(target).to_string_lossy().as_ref(),
        ])?;
        // snapshots are created read-only; the restored tree must be writable
        self.set_readonly(&self.subvol_path(target), false)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let p = self.subvol_path(name);
        if !p.exists() {
            return Ok(());
        }
        let _ = self.sync(name);

        for nested in self.nested_subvolumes(&p)? {
            self.set_readonly(&nested, false)?;
            self.btrfs(&["subvolume", "delete", "-c", nested.to_string_lossy().as_ref()])?;
        }

        self.set_readonly(&p, false)?;
        self.btrfs(&["subvolume", "delete", "-c", p.to_string_lossy().as_ref()])?;
        if p.exists() {
            fs::remove_dir_all(&p).map_err(|e| StackerError::io(&p, e))?;
        }
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.subvol_path(name).exists()
    }

    fn finalize(&self, name: &str) -> Result<()> {
        self.sync(name)?;
        self.set_readonly(&self.subvol_path(name), true)
    }

    fn temporary_writable(&self, source: &str) -> Result<TempSnapshot<'_>> {
        let name = format!("temp-snapshot-{}", uuid::Uuid::new_v4());
        self.restore(source, &name)?;
        Ok(TempSnapshot::new(name, self))
    }

    fn detach(&self) -> Result<()> {
        if self.needs_umount {
            umount2(&self.config.rootfs_dir, MntFlags::MNT_DETACH).map_err(|e| {
                StackerError::io(&self.config.rootfs_dir, std::io::Error::from(e))
            })?;
        }
        Ok(())
    }

    fn gc(&self, output: &OciLayout, base: &OciLayout) -> Result<()> {
        let mut keep: HashSet<String> = HashSet::new();
        keep.insert(".working".to_string());

        for layout in [output, base] {
            for tag in layout.tags()? {
                keep.insert(tag.clone());
                let Ok(manifest) = layout.lookup_manifest(&tag) else {
                    continue;
                };
                for j in 0..=manifest.layers().len() {
                    keep.insert(crate::oci::aggregate_hash(&manifest, j));
                }
            }
        }

        for entry in fs::read_dir(&self.config.rootfs_dir)
            .map_err(|e| StackerError::io(&self.config.rootfs_dir, e))?
        {
            let entry = entry.map_err(|e| StackerError::io(&self.config.rootfs_dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !keep.contains(&name) {
                debug!(name, "removing unreferenced rootfs");
                self.delete(&name)?;
            }
        }

        Ok(())
    }

    fn unpack(&self, layout: &OciLayout, tag: &str, name: &str) -> Result<()> {
        unpack::unpack_with(self, layout, tag, name)
    }

    fn repack(
        &self,
        layout: &OciLayout,
        tag: &str,
        name: &str,
        layer_type: LayerType,
    ) -> Result<Descriptor> {
        repack::repack(layout, tag, &self.bundle_path(name), &self.rootfs_path(name), layer_type)
    }

    fn update_fs_metadata(
        &self,
        name: &str,
        desc: &Descriptor,
        _manifest: &ImageManifest,
    ) -> Result<()> {
        repack::update_bundle_mtree(&self.bundle_path(name), desc)
    }

    fn rootfs_path(&self, name: &str) -> PathBuf {
        self.subvol_path(name).join("rootfs")
    }

    fn bundle_path(&self, name: &str) -> PathBuf {
        self.subvol_path(name)
    }
}
