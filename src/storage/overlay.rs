//! Stacked union mount backend.
//!
//! Every layer digest has a content directory under `layers/` populated
//! once by unpack; a named rootfs is a union mount whose lowers are the
//! base manifest's layer directories plus the upper directories of any
//! still-unrendered built ancestors, with a private `upper/` and `work/`
//! per name. A sidecar file records the manifest and the ancestor uppers
//! so the mount can be replayed. Whiteouts are 0,0 character devices, so
//! the kernel must allow unprivileged whiteout creation for this backend
//! to be selected at all. The index feature is disabled on every mount so
//! lower directories may be renamed between mounts.

use crate::config::StackerConfig;
use crate::error::{Result, StackerError};
use crate::oci::mtree::{EntryKind, FsManifest};
use crate::oci::repack::{commit_layer, generate_squashfs_layer, generate_tar_layer, LayerBlob};
use crate::oci::{unpack, LayerType, OciLayout};
use crate::storage::{Storage, TempSnapshot};
use nix::mount::{umount2, MntFlags};
use oci_spec::image::{Descriptor, ImageManifest};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const METADATA_FILE: &str = "overlay_metadata.json";

/// Sidecar state for a mounted name: which manifest's layers sit below it
/// and which built ancestors' uppers stack on top of those.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlayMetadata {
    pub manifest: Option<ImageManifest>,
    /// Names whose upper dirs are stacked as lowers, oldest first.
    #[serde(default)]
    pub built_layers: Vec<String>,
}

impl OverlayMetadata {
    pub fn read(config: &StackerConfig, name: &str) -> Result<OverlayMetadata> {
        let p = config.rootfs_path(name).join(METADATA_FILE);
        let content = fs::read(&p).map_err(|e| StackerError::io(&p, e))?;
        serde_json::from_slice(&content).map_err(|e| StackerError::Storage {
            name: name.to_string(),
            reason: format!("bad overlay metadata: {}", e),
        })
    }

    pub fn write(&self, config: &StackerConfig, name: &str) -> Result<()> {
        let p = config.rootfs_path(name).join(METADATA_FILE);
        let content = serde_json::to_vec(self).map_err(|e| StackerError::Storage {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        fs::write(&p, content).map_err(|e| StackerError::io(&p, e))
    }

    /// The ordered lower directories for this metadata: manifest layer
    /// content first, then built ancestor uppers, padded to the two lowers
    /// union mounts insist on.
    pub fn lower_dirs(&self, config: &StackerConfig, name: &str) -> Vec<PathBuf> {
        let mut lowers = Vec::new();

        if let Some(manifest) = &self.manifest {
            for layer in manifest.layers() {
                lowers.push(layer_content_dir(config, layer.digest()));
            }
        }

        for built in &self.built_layers {
            lowers.push(config.rootfs_path(built).join("upper"));
        }

        let mut pad = 0;
        while lowers.len() < 2 {
            lowers.push(config.rootfs_path(name).join(format!("workaround{}", pad)));
            pad += 1;
        }

        lowers
    }
}

/// Filesystem-safe directory name for a digest.
pub fn safe_name(digest: &str) -> String {
    digest.replace(':', "_")
}

/// Content directory for a layer digest.
pub fn layer_content_dir(config: &StackerConfig, digest: &str) -> PathBuf {
    config.rootfs_dir.join("layers").join(safe_name(digest)).join("overlay")
}

/// Whether a union mount with our option set can be created at all.
fn can_mount_overlay() -> Result<bool> {
    let dir = tempfile::TempDir::new().map_err(|e| StackerError::io("/tmp", e))?;
    // one lowerdir is rejected, so probe with two
    let lower1 = dir.path().join("lower1");
    let lower2 = dir.path().join("lower2");
    let upper = dir.path().join("upper");
    let work = dir.path().join("work");
    let mountpoint = dir.path().join("mountpoint");
    for p in [&lower1, &lower2, &upper, &work, &mountpoint] {
        fs::create_dir(p).map_err(|e| StackerError::io(p, e))?;
    }

    let opts = format!(
        "index=off,lowerdir={}:{},upperdir={},workdir={}",
        lower1.display(),
        lower2.display(),
        upper.display(),
        work.display()
    );
    let ok = nix::mount::mount(
        Some("overlay"),
        &mountpoint,
        Some("overlay"),
        nix::mount::MsFlags::empty(),
        Some(opts.as_str()),
    )
    .is_ok();
    if ok {
        let _ = umount2(&mountpoint, MntFlags::MNT_DETACH);
    } else {
        debug!("can't mount overlayfs");
    }
    Ok(ok)
}

/// Whether this task can create whiteout device nodes. Upstream kernels
/// allow it unprivileged from v5.8 on.
fn can_write_whiteouts() -> Result<bool> {
    let dir = tempfile::TempDir::new().map_err(|e| StackerError::io("/tmp", e))?;
    let p = dir.path().join("test");
    match nix::sys::stat::mknod(
        &p,
        nix::sys::stat::SFlag::S_IFCHR,
        nix::sys::stat::Mode::from_bits_truncate(0o666),
        nix::sys::stat::makedev(0, 0),
    ) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::EPERM) | Err(nix::errno::Errno::EACCES) => Ok(false),
        Err(e) => Err(StackerError::io(&p, std::io::Error::from(e))),
    }
}

/// The capability probe gating this backend's selection.
pub fn can_do_overlay() -> Result<bool> {
    Ok(can_mount_overlay()? && can_write_whiteouts()?)
}

fn is_mountpoint(path: &Path) -> Result<bool> {
    let mountinfo = fs::read_to_string("/proc/self/mountinfo")
        .map_err(|e| StackerError::io("/proc/self/mountinfo", e))?;
    let needle = path.to_string_lossy();
    Ok(mountinfo
        .lines()
        .filter_map(|line| line.split(' ').nth(4))
        .any(|target| target == needle))
}

pub struct OverlayStorage {
    config: StackerConfig,
}

impl OverlayStorage {
    pub fn new(config: StackerConfig) -> OverlayStorage {
        OverlayStorage { config }
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.config.rootfs_path(name)
    }

    fn make_dirs(&self, name: &str) -> Result<()> {
        for sub in ["upper", "work", "rootfs"] {
            let p = self.dir(name).join(sub);
            fs::create_dir_all(&p).map_err(|e| StackerError::io(&p, e))?;
        }
        Ok(())
    }

    fn mount(&self, name: &str, ovl: &OverlayMetadata) -> Result<()> {
        let lowers = ovl.lower_dirs(&self.config, name);
        for lower in &lowers {
            if !lower.exists() {
                // workaround padding dirs are ours to create
                if lower.starts_with(self.dir(name)) {
                    fs::create_dir_all(lower).map_err(|e| StackerError::io(lower, e))?;
                } else {
                    return Err(StackerError::Storage {
                        name: name.to_string(),
                        reason: format!("{} does not exist", lower.display()),
                    });
                }
            }
        }

        let lowerdir = lowers
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");
        let opts = format!(
            "index=off,lowerdir={},upperdir={},workdir={}",
            lowerdir,
            self.dir(name).join("upper").display(),
            self.dir(name).join("work").display()
        );

        debug!(name, opts = %opts, "mounting overlay");
        nix::mount::mount(
            Some("overlay"),
            &self.rootfs_path(name),
            Some("overlay"),
            nix::mount::MsFlags::empty(),
            Some(opts.as_str()),
        )
        .map_err(|e| StackerError::Storage {
            name: name.to_string(),
            reason: format!("failed to mount overlay: {}", e),
        })
    }

    fn clone_into(&self, source: &str, target: &str) -> Result<()> {
        self.make_dirs(target)?;

        let mut ovl = OverlayMetadata::read(&self.config, source)?;
        ovl.built_layers.push(source.to_string());
        ovl.write(&self.config, target)?;
        self.mount(target, &ovl)
    }

    /// Populate the content dir for a layer if it isn't there yet.
    fn materialize_layer(&self, layout: &OciLayout, desc: &Descriptor) -> Result<()> {
        let content = layer_content_dir(&self.config, desc.digest());
        if content.exists() {
            debug!(digest = %desc.digest(), "layer content already extracted");
            return Ok(());
        }

        // extract to a temporary sibling so a partial extraction is never
        // taken for a complete one
        let parent = content.parent().expect("content dir has a parent").to_path_buf();
        fs::create_dir_all(&parent).map_err(|e| StackerError::io(&parent, e))?;
        let staging = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        fs::create_dir(&staging).map_err(|e| StackerError::io(&staging, e))?;

        match unpack::extract_layer(layout, desc, &staging) {
            Ok(()) => fs::rename(&staging, &content).map_err(|e| StackerError::io(&content, e)),
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                Err(e)
            }
        }
    }

    /// A manifest truncated to its first `prefix` layers, used to name
    /// reusable extracted prefixes.
    fn prefix_metadata(manifest: &ImageManifest, prefix: usize) -> OverlayMetadata {
        let mut truncated = manifest.clone();
        truncated.set_layers(manifest.layers().iter().take(prefix).cloned().collect::<Vec<_>>());
        OverlayMetadata { manifest: Some(truncated), built_layers: vec![] }
    }
}

impl Storage for OverlayStorage {
    fn name(&self) -> &'static str {
        "overlay"
    }

    fn create(&self, name: &str) -> Result<()> {
        if self.dir(name).exists() {
            return Err(StackerError::Storage {
                name: name.to_string(),
                reason: "already exists".to_string(),
            });
        }
        self.make_dirs(name)?;
        let ovl = OverlayMetadata::default();
        ovl.write(&self.config, name)?;
        self.mount(name, &ovl)
    }

    fn snapshot(&self, source: &str, target: &str) -> Result<()> {
        self.clone_into(source, target)
    }

    fn restore(&self, source: &str, target: &str) -> Result<()> {
        // union rootfs trees are always writable through their upper
        self.clone_into(source, target)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let rootfs = self.rootfs_path(name);
        if rootfs.exists() && is_mountpoint(&rootfs)? {
            umount2(&rootfs, MntFlags::MNT_DETACH).map_err(|e| StackerError::Storage {
                name: name.to_string(),
                reason: format!("couldn't unmount: {}", e),
            })?;
        }
        if self.dir(name).exists() {
            fs::remove_dir_all(self.dir(name))
                .map_err(|e| StackerError::io(self.dir(name), e))?;
        }
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.dir(name).exists()
    }

    fn finalize(&self, _name: &str) -> Result<()> {
        // uppers are committed by update_fs_metadata, once the layer digest
        // they will live under is known
        Ok(())
    }

    fn temporary_writable(&self, source: &str) -> Result<TempSnapshot<'_>> {
        let name = format!("temp-snapshot-{}", uuid::Uuid::new_v4());
        self.snapshot(source, &name)?;
        Ok(TempSnapshot::new(name, self))
    }

    fn detach(&self) -> Result<()> {
        let mountinfo = fs::read_to_string("/proc/self/mountinfo")
            .map_err(|e| StackerError::io("/proc/self/mountinfo", e))?;
        let root = self.config.rootfs_dir.to_string_lossy().into_owned();

        for line in mountinfo.lines() {
            let Some(target) = line.split(' ').nth(4) else {
                continue;
            };
            if target.starts_with(&root) {
                umount2(Path::new(target), MntFlags::MNT_DETACH).map_err(|e| {
                    StackerError::Storage {
                        name: target.to_string(),
                        reason: format!("failed to unmount: {}", e),
                    }
                })?;
            }
        }
        Ok(())
    }

    fn gc(&self, output: &OciLayout, base: &OciLayout) -> Result<()> {
        let mut keep_names: HashSet<String> = HashSet::new();
        let mut keep_digests: HashSet<String> = HashSet::new();
        keep_names.insert(".working".to_string());
        keep_names.insert("layers".to_string());

        for layout in [output, base] {
            for tag in layout.tags()? {
                keep_names.insert(tag.clone());
                let Ok(manifest) = layout.lookup_manifest(&tag) else {
                    continue;
                };
                for j in 0..=manifest.layers().len() {
                    keep_names.insert(crate::oci::aggregate_hash(&manifest, j));
                }
                for layer in manifest.layers() {
                    keep_digests.insert(safe_name(layer.digest()));
                }
            }
        }

        for entry in fs::read_dir(&self.config.rootfs_dir)
            .map_err(|e| StackerError::io(&self.config.rootfs_dir, e))?
        {
            let entry = entry.map_err(|e| StackerError::io(&self.config.rootfs_dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !keep_names.contains(&name) {
                debug!(name, "removing unreferenced rootfs");
                self.delete(&name)?;
            }
        }

        let layers = self.config.rootfs_dir.join("layers");
        if layers.exists() {
            for entry in fs::read_dir(&layers).map_err(|e| StackerError::io(&layers, e))? {
                let entry = entry.map_err(|e| StackerError::io(&layers, e))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if !keep_digests.contains(&name) {
                    debug!(name, "removing unreferenced layer content");
                    fs::remove_dir_all(entry.path())
                        .map_err(|e| StackerError::io(entry.path(), e))?;
                }
            }
        }

        Ok(())
    }

    fn unpack(&self, layout: &OciLayout, tag: &str, name: &str) -> Result<()> {
        let desc = layout.resolve_reference(tag)?;
        let manifest = layout.lookup_manifest_by_descriptor(&desc)?;

        for layer in manifest.layers() {
            self.materialize_layer(layout, layer)?;
        }

        // register every extracted prefix under its aggregate hash, so
        // exists() answers reuse queries without a mount
        for j in 0..=manifest.layers().len() {
            let key = crate::oci::aggregate_hash(&manifest, j);
            if !self.exists(&key) {
                self.make_dirs(&key)?;
                Self::prefix_metadata(&manifest, j).write(&self.config, &key)?;
            }
        }

        if !self.exists(name) {
            self.make_dirs(name)?;
        }
        // create() mounts an empty union; replace it rather than stacking
        let rootfs = self.rootfs_path(name);
        if is_mountpoint(&rootfs)? {
            umount2(&rootfs, MntFlags::MNT_DETACH).map_err(|e| StackerError::Storage {
                name: name.to_string(),
                reason: format!("couldn't unmount: {}", e),
            })?;
        }
        let ovl =
            OverlayMetadata { manifest: Some(manifest.clone()), built_layers: vec![] };
        ovl.write(&self.config, name)?;
        self.mount(name, &ovl)?;

        info!(tag, name, layers = manifest.layers().len(), "unpacked manifest");
        Ok(())
    }

    fn repack(
        &self,
        layout: &OciLayout,
        tag: &str,
        name: &str,
        layer_type: LayerType,
    ) -> Result<Descriptor> {
        let upper = self.dir(name).join("upper");

        if FsManifest::walk(&upper)?.entries.is_empty() {
            // nothing changed: no layer to add, the tag stays as it is
            info!(tag, "upper dir empty, skipping layer generation");
            return layout.resolve_reference(tag);
        }

        let blob = match layer_type {
            LayerType::Tar => generate_upper_tar(layout, &upper)?,
            LayerType::Squashfs => generate_squashfs_layer(layout, &upper, &[], &[])?,
        };

        commit_layer(layout, tag, &blob, format!("stacker build of {}", tag))
    }

    fn update_fs_metadata(
        &self,
        name: &str,
        _desc: &Descriptor,
        manifest: &ImageManifest,
    ) -> Result<()> {
        let ovl = OverlayMetadata { manifest: Some(manifest.clone()), built_layers: vec![] };
        ovl.write(&self.config, name)?;

        let Some(last) = manifest.layers().last() else {
            // scratch layers with nothing added during the build
            return Ok(());
        };

        let content = layer_content_dir(&self.config, last.digest());
        if content.exists() {
            return Ok(());
        }

        let rootfs = self.rootfs_path(name);
        let upper = self.dir(name).join("upper");
        let parent = content.parent().expect("content dir has a parent").to_path_buf();
        fs::create_dir_all(&parent).map_err(|e| StackerError::io(&parent, e))?;

        if FsManifest::walk(&upper)?.entries.is_empty() {
            // a layer-type regeneration: the layer's content is the whole
            // merged view, which only exists while the mount is up
            crate::imports::copy_tree(&rootfs, &content)?;
        }

        if is_mountpoint(&rootfs)? {
            umount2(&rootfs, MntFlags::MNT_DETACH).map_err(|e| StackerError::Storage {
                name: name.to_string(),
                reason: format!("couldn't unmount rootfs: {}", e),
            })?;
        }

        if !content.exists() {
            // the usual case after a build: the upper dir is exactly the
            // new layer's content; move it into place and start a fresh one
            fs::rename(&upper, &content).map_err(|e| StackerError::io(&content, e))?;
            fs::create_dir(&upper).map_err(|e| StackerError::io(&upper, e))?;
        }

        self.mount(name, &ovl)
    }

    fn rootfs_path(&self, name: &str) -> PathBuf {
        self.dir(name).join("rootfs")
    }

    fn bundle_path(&self, name: &str) -> PathBuf {
        self.dir(name)
    }
}

/// Turn an upper directory into a tar layer: union-mount whiteouts (0,0
/// character devices) become `.wh.` entries, opaque-marked directories get
/// an `.wh..wh..opq` marker, everything else is archived as-is.
fn generate_upper_tar(layout: &OciLayout, upper: &Path) -> Result<LayerBlob> {
    let manifest = FsManifest::walk(upper)?;

    let mut whiteouts: Vec<String> = Vec::new();
    let mut keep = FsManifest::default();
    for (path, entry) in &manifest.entries {
        if entry.kind == EntryKind::Char && entry.device == Some((0, 0)) {
            whiteouts.push(path.clone());
        } else {
            keep.entries.insert(path.clone(), entry.clone());
        }
    }

    // a delta from empty containing exactly the kept entries, with the
    // whiteouts recorded as removals
    let mut old = FsManifest::default();
    for path in &whiteouts {
        // synthesize a removed entry so the generator emits the whiteout
        old.entries.insert(
            path.clone(),
            crate::oci::mtree::FsEntry {
                path: path.clone(),
                kind: EntryKind::File,
                uid: 0,
                gid: 0,
                mode: 0,
                xattrs: Default::default(),
                sha256: None,
                link: None,
                device: None,
            },
        );
    }

    generate_tar_layer(layout, upper, &old, &keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::{DescriptorBuilder, ImageManifestBuilder, MediaType};
    use tempfile::TempDir;

    fn config(root: &Path) -> StackerConfig {
        StackerConfig {
            stacker_dir: root.join(".stacker"),
            oci_dir: root.join("oci"),
            rootfs_dir: root.join("roots"),
        }
    }

    fn manifest_with_layers(digests: &[&str]) -> ImageManifest {
        let layers: Vec<Descriptor> = digests
            .iter()
            .map(|d| {
                DescriptorBuilder::default()
                    .media_type(MediaType::ImageLayerGzip)
                    .digest(d.to_string())
                    .size(0i64)
                    .build()
                    .unwrap()
            })
            .collect();
        ImageManifestBuilder::default()
            .schema_version(2u32)
            .config(
                DescriptorBuilder::default()
                    .media_type(MediaType::ImageConfig)
                    .digest("sha256:cfg".to_string())
                    .size(2i64)
                    .build()
                    .unwrap(),
            )
            .layers(layers)
            .build()
            .unwrap()
    }

    #[test]
    fn test_safe_name() {
        assert_eq!(safe_name("sha256:abcd"), "sha256_abcd");
    }

    #[test]
    fn test_metadata_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());
        fs::create_dir_all(cfg.rootfs_path("web")).unwrap();

        let ovl = OverlayMetadata {
            manifest: Some(manifest_with_layers(&["sha256:l1"])),
            built_layers: vec!["base".to_string()],
        };
        ovl.write(&cfg, "web").unwrap();

        let read = OverlayMetadata::read(&cfg, "web").unwrap();
        assert_eq!(read.built_layers, vec!["base"]);
        assert_eq!(read.manifest.unwrap().layers().len(), 1);
    }

    #[test]
    fn test_lower_dirs_order_and_padding() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path());

        // manifest layers first, then built uppers
        let ovl = OverlayMetadata {
            manifest: Some(manifest_with_layers(&["sha256:l1", "sha256:l2"])),
            built_layers: vec!["ancestor".to_string()],
        };
        let lowers = ovl.lower_dirs(&cfg, "web");
        assert_eq!(lowers.len(), 3);
        assert_eq!(lowers[0], cfg.rootfs_dir.join("layers/sha256_l1/overlay"));
        assert_eq!(lowers[1], cfg.rootfs_dir.join("layers/sha256_l2/overlay"));
        assert_eq!(lowers[2], cfg.rootfs_path("ancestor").join("upper"));

        // fewer than two lowers pads with workaround dirs
        let empty = OverlayMetadata::default();
        let lowers = empty.lower_dirs(&cfg, "web");
        assert_eq!(lowers.len(), 2);
        assert!(lowers[0].starts_with(cfg.rootfs_path("web")));
    }

    #[test]
    fn test_prefix_metadata_truncates() {
        let manifest = manifest_with_layers(&["sha256:l1", "sha256:l2", "sha256:l3"]);
        let prefix = OverlayStorage::prefix_metadata(&manifest, 2);
        assert_eq!(prefix.manifest.unwrap().layers().len(), 2);
    }

    #[test]
    fn test_upper_tar_converts_whiteouts() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path().join("oci")).unwrap();
        let upper = tmp.path().join("upper");
        fs::create_dir_all(upper.join("etc")).unwrap();
        fs::write(upper.join("etc/new"), "added").unwrap();

        // a real whiteout device requires privileges; exercise the plain
        // content path and assert the round trip
        let blob = generate_upper_tar(&layout, &upper).unwrap();
        let dest = tmp.path().join("dest");
        fs::create_dir(&dest).unwrap();
        unpack::extract_layer(&layout, &blob.descriptor().unwrap(), &dest).unwrap();
        assert_eq!(fs::read_to_string(dest.join("etc/new")).unwrap(), "added");
    }

    #[test]
    fn test_delete_absent_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let storage = OverlayStorage::new(config(tmp.path()));
        storage.delete("never-created").unwrap();
    }
}
