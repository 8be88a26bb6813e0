//! Storage backends for rootfs trees.
//!
//! Every backend owns the on-disk layout under the configured roots
//! directory; consumers address rootfs state by name only. Two
//! implementations exist: copy-on-write subvolumes on a native filesystem
//! ([`cow`]) and stacked union mounts over content-addressed layer
//! directories ([`overlay`]).

pub mod cow;
pub mod overlay;

use crate::config::StackerConfig;
use crate::error::{Result, StackerError};
use crate::oci::{LayerType, OciLayout};
use oci_spec::image::{Descriptor, ImageManifest};
use std::path::PathBuf;
use tracing::info;

/// The capability set every storage backend provides.
pub trait Storage {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Create a fresh empty rootfs. Fails if the name exists.
    fn create(&self, name: &str) -> Result<()>;

    /// Copy-on-write clone `source` into `target`; `source` stays usable.
    fn snapshot(&self, source: &str, target: &str) -> Result<()>;

    /// Like snapshot, but `target` is writable regardless of `source`.
    fn restore(&self, source: &str, target: &str) -> Result<()>;

    /// Unmount if mounted and remove recursively. Absent names are fine.
    fn delete(&self, name: &str) -> Result<()>;

    fn exists(&self, name: &str) -> bool;

    /// Mark a finished rootfs read-only / commit its upper state.
    fn finalize(&self, name: &str) -> Result<()>;

    /// A writable throwaway clone of `source` for side scripts. Dropping
    /// the returned guard deletes it.
    fn temporary_writable(&self, source: &str) -> Result<TempSnapshot<'_>>;

    /// Unmount everything this backend controls.
    fn detach(&self) -> Result<()>;

    /// Remove rootfs state no longer referenced by either OCI layout.
    fn gc(&self, output: &OciLayout, base: &OciLayout) -> Result<()>;

    /// Extract `tag` from `layout` into rootfs `name`, reusing previously
    /// extracted layer prefixes where possible.
    fn unpack(&self, layout: &OciLayout, tag: &str, name: &str) -> Result<()>;

    /// Produce a new layer blob reflecting `name`'s current state, update
    /// `tag` in `layout`, and return the new manifest descriptor.
    fn repack(&self, layout: &OciLayout, tag: &str, name: &str, layer_type: LayerType)
        -> Result<Descriptor>;

    /// Record that `name` now corresponds to the given manifest.
    fn update_fs_metadata(
        &self,
        name: &str,
        desc: &Descriptor,
        manifest: &ImageManifest,
    ) -> Result<()>;

    /// The directory container processes see as `/` for this name.
    fn rootfs_path(&self, name: &str) -> PathBuf;

    /// The directory holding rootfs-adjacent metadata for this name.
    fn bundle_path(&self, name: &str) -> PathBuf;
}

/// A temporary writable snapshot, deleted on drop.
pub struct TempSnapshot<'a> {
    pub name: String,
    storage: &'a dyn Storage,
}

impl<'a> TempSnapshot<'a> {
    pub fn new(name: String, storage: &'a dyn Storage) -> TempSnapshot<'a> {
        TempSnapshot { name, storage }
    }
}

impl Drop for TempSnapshot<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.storage.delete(&self.name) {
            info!(name = %self.name, error = %e, "problem deleting temporary snapshot");
        }
    }
}

/// Pick a backend for the configured roots directory: the CoW backend when
/// the directory sits on (or can be given) a subvolume-capable filesystem,
/// otherwise stacked union mounts, gated on the kernel capability probe.
pub fn new_storage(config: &StackerConfig) -> Result<Box<dyn Storage>> {
    std::fs::create_dir_all(&config.rootfs_dir)
        .map_err(|e| StackerError::io(&config.rootfs_dir, e))?;

    if cow::is_cow_filesystem(&config.rootfs_dir)? {
        info!(backend = "cow", "selected storage backend");
        return Ok(Box::new(cow::CowStorage::new(config.clone(), false)));
    }

    if overlay::can_do_overlay()? {
        info!(backend = "overlay", "selected storage backend");
        return Ok(Box::new(overlay::OverlayStorage::new(config.clone())));
    }

    // last resort: provision a loopback-backed CoW pool under the roots dir
    let storage = cow::CowStorage::new(config.clone(), true);
    storage.setup_loopback_pool()?;
    info!(backend = "cow", pool = "loopback", "selected storage backend");
    Ok(Box::new(storage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct RecordingStorage {
        deleted: RefCell<Vec<String>>,
    }

    macro_rules! unsupported {
        () => {
            unimplemented!("not exercised by this test")
        };
    }

    impl Storage for RecordingStorage {
        fn name(&self) -> &'static str {
            "recording"
        }
        fn create(&self, _name: &str) -> Result<()> {
            unsupported!()
        }
        fn snapshot(&self, _source: &str, _target: &str) -> Result<()> {
            unsupported!()
        }
        fn restore(&self, _source: &str, _target: &str) -> Result<()> {
            unsupported!()
        }
        fn delete(&self, name: &str) -> Result<()> {
            self.deleted.borrow_mut().push(name.to_string());
            Ok(())
        }
        fn exists(&self, _name: &str) -> bool {
            false
        }
        fn finalize(&self, _name: &str) -> Result<()> {
            unsupported!()
        }
        fn temporary_writable(&self, _source: &str) -> Result<TempSnapshot<'_>> {
            unsupported!()
        }
        fn detach(&self) -> Result<()> {
            unsupported!()
        }
        fn gc(&self, _output: &OciLayout, _base: &OciLayout) -> Result<()> {
            unsupported!()
        }
        fn unpack(&self, _layout: &OciLayout, _tag: &str, _name: &str) -> Result<()> {
            unsupported!()
        }
        fn repack(
            &self,
            _layout: &OciLayout,
            _tag: &str,
            _name: &str,
            _layer_type: LayerType,
        ) -> Result<Descriptor> {
            unsupported!()
        }
        fn update_fs_metadata(
            &self,
            _name: &str,
            _desc: &Descriptor,
            _manifest: &ImageManifest,
        ) -> Result<()> {
            unsupported!()
        }
        fn rootfs_path(&self, name: &str) -> PathBuf {
            PathBuf::from("/roots").join(name).join("rootfs")
        }
        fn bundle_path(&self, name: &str) -> PathBuf {
            PathBuf::from("/roots").join(name)
        }
    }

    #[test]
    fn test_temp_snapshot_deletes_on_drop() {
        let storage = RecordingStorage { deleted: RefCell::new(vec![]) };
        {
            let _snap = TempSnapshot::new("temp-snapshot-x".to_string(), &storage);
        }
        assert_eq!(*storage.deleted.borrow(), vec!["temp-snapshot-x"]);
    }
}
