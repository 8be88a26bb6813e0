//! Incremental manifest extraction.
//!
//! Unpacking walks a manifest's layers onto a rootfs, snapshotting the
//! result under the aggregate hash after every layer so the next build that
//! shares a layer prefix restores instead of re-extracting. The bundle
//! directory next to the rootfs carries a filesystem manifest named after
//! the manifest descriptor digest plus a `umoci.json` pointing at it; a
//! reused prefix recorded under an older manifest digest is reconciled
//! rather than regenerated, because matching aggregate hashes guarantee the
//! layer bits are equal even when configs or history diverged.

use crate::error::{Result, StackerError};
use crate::oci::mtree::FsManifest;
use crate::oci::{aggregate_hash, OciLayout, MEDIA_TYPE_LAYER_SQUASHFS};
use crate::storage::Storage;
use oci_spec::image::{Descriptor, MediaType};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info, instrument};

const BUNDLE_META_FILE: &str = "umoci.json";
const BUNDLE_META_VERSION: u32 = 2;

/// Sidecar recording which manifest a bundle's rootfs corresponds to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMeta {
    pub version: u32,
    pub from: Descriptor,
}

/// The filesystem-manifest file name for a manifest descriptor.
pub fn mtree_name(desc: &Descriptor) -> String {
    format!("{}.mtree", desc.digest().replace(':', "_"))
}

pub fn read_bundle_meta(bundle: &Path) -> Result<BundleMeta> {
    let p = bundle.join(BUNDLE_META_FILE);
    let content = fs::read(&p).map_err(|e| StackerError::io(&p, e))?;
    serde_json::from_slice(&content).map_err(|e| StackerError::LayerAssembly {
        reason: format!("bad bundle metadata {}: {}", p.display(), e),
    })
}

pub fn write_bundle_meta(bundle: &Path, desc: &Descriptor) -> Result<()> {
    let meta = BundleMeta { version: BUNDLE_META_VERSION, from: desc.clone() };
    let p = bundle.join(BUNDLE_META_FILE);
    let content = serde_json::to_vec(&meta)
        .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })?;
    fs::write(&p, content).map_err(|e| StackerError::io(&p, e))
}

/// Walk the rootfs and record its manifest + metadata for `desc`.
pub fn write_bundle_metadata(bundle: &Path, rootfs: &Path, desc: &Descriptor) -> Result<()> {
    let manifest = FsManifest::walk(rootfs)?;
    let p = bundle.join(mtree_name(desc));
    fs::write(&p, manifest.encode()).map_err(|e| StackerError::io(&p, e))?;
    write_bundle_meta(bundle, desc)
}

/// Load the stored filesystem manifest for `desc`.
pub fn read_bundle_mtree(bundle: &Path, desc: &Descriptor) -> Result<FsManifest> {
    let p = bundle.join(mtree_name(desc));
    let content = fs::read_to_string(&p).map_err(|e| StackerError::io(&p, e))?;
    FsManifest::parse(&content)
}

/// Drop every filesystem-manifest file and the bundle metadata, leaving the
/// rootfs (and any backend-owned files) alone.
pub fn clean_bundle_metadata(bundle: &Path) -> Result<()> {
    for entry in fs::read_dir(bundle).map_err(|e| StackerError::io(bundle, e))? {
        let entry = entry.map_err(|e| StackerError::io(bundle, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == BUNDLE_META_FILE || name.ends_with(".mtree") {
            fs::remove_file(entry.path()).map_err(|e| StackerError::io(entry.path(), e))?;
        }
    }
    Ok(())
}

/// Bring a restored prefix's metadata in line with the manifest we are
/// currently extracting.
///
/// The reused snapshot may have been recorded under a different manifest
/// digest: configs and history diverge without changing layer bits, and the
/// aggregate hash only covers the bits. Three cases:
/// regenerate when no metadata exists, done when the expected manifest file
/// exists, otherwise rename the old manifest file into place.
pub fn reconcile_metadata(bundle: &Path, rootfs: &Path, desc: &Descriptor) -> Result<()> {
    if !bundle.join(BUNDLE_META_FILE).exists() {
        info!("generating filesystem manifest for snapshot (this may take a bit)...");
        return write_bundle_metadata(bundle, rootfs, desc);
    }

    let expected = bundle.join(mtree_name(desc));
    if expected.exists() {
        return Ok(());
    }

    let old = fs::read_dir(bundle)
        .map_err(|e| StackerError::io(bundle, e))?
        .filter_map(|e| e.ok())
        .find(|e| e.file_name().to_string_lossy().ends_with(".mtree"))
        .ok_or_else(|| StackerError::LayerAssembly {
            reason: format!("couldn't find old bundle metadata in {}", bundle.display()),
        })?;

    fs::rename(old.path(), &expected).map_err(|e| StackerError::io(&expected, e))?;
    write_bundle_meta(bundle, desc)
}

/// Extract one layer blob onto `dest`, honoring whiteouts.
pub fn extract_layer(layout: &OciLayout, desc: &Descriptor, dest: &Path) -> Result<()> {
    debug!(digest = %desc.digest(), dest = %dest.display(), "extracting layer");

    match desc.media_type() {
        MediaType::ImageLayerGzip => {
            let reader = layout.blob_reader(desc.digest())?;
            extract_tar(flate2::read::GzDecoder::new(reader), dest)
        }
        MediaType::ImageLayer => {
            let reader = layout.blob_reader(desc.digest())?;
            extract_tar(reader, dest)
        }
        MediaType::Other(t) if t == MEDIA_TYPE_LAYER_SQUASHFS => {
            extract_squashfs(&layout.blob_path(desc.digest()), dest)
        }
        other => Err(StackerError::LayerAssembly {
            reason: format!("unknown layer media type {}", other),
        }),
    }
}

pub(crate) fn extract_tar(reader: impl std::io::Read, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);

    let entries = archive
        .entries()
        .map_err(|e| StackerError::LayerAssembly { reason: format!("reading tar: {}", e) })?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| StackerError::LayerAssembly { reason: format!("tar entry: {}", e) })?;
        let path = entry
            .path()
            .map_err(|e| StackerError::LayerAssembly { reason: format!("tar path: {}", e) })?
            .into_owned();

        // the root directory's permissions depend on how the rootfs is
        // mounted; skip it
        if path == Path::new(".") || path == Path::new("") {
            continue;
        }

        let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        if let Some(file_name) = file_name {
            if file_name == ".wh..wh..opq" {
                if let Some(parent) = path.parent() {
                    clear_dir(&dest.join(parent))?;
                }
                continue;
            }
            if let Some(victim) = file_name.strip_prefix(".wh.") {
                let victim_path =
                    dest.join(path.parent().unwrap_or_else(|| Path::new(""))).join(victim);
                remove_any(&victim_path)?;
                continue;
            }
        }

        entry
            .unpack_in(dest)
            .map_err(|e| StackerError::LayerAssembly {
                reason: format!("unpacking {}: {}", path.display(), e),
            })?;
    }

    Ok(())
}

fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir).map_err(|e| StackerError::io(dir, e))? {
        let entry = entry.map_err(|e| StackerError::io(dir, e))?;
        remove_any(&entry.path())?;
    }
    Ok(())
}

fn remove_any(path: &Path) -> Result<()> {
    match path.symlink_metadata() {
        Err(_) => Ok(()),
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(path).map_err(|e| StackerError::io(path, e))
        }
        Ok(_) => fs::remove_file(path).map_err(|e| StackerError::io(path, e)),
    }
}

fn extract_squashfs(blob: &Path, dest: &Path) -> Result<()> {
    let output = Command::new("unsquashfs")
        .arg("-f")
        .arg("-d")
        .arg(dest)
        .arg(blob)
        .output()
        .map_err(|e| StackerError::io(blob, e))?;
    if !output.status.success() {
        return Err(StackerError::LayerAssembly {
            reason: format!("unsquashfs failed: {}", String::from_utf8_lossy(&output.stderr)),
        });
    }
    Ok(())
}

/// The incremental unpack protocol, shared by backends whose snapshots are
/// whole-tree clones.
///
/// The destination rootfs must already exist when no prefix is reusable;
/// when one is, the destination is re-created from the best snapshot.
#[instrument(skip(storage, layout))]
pub fn unpack_with(
    storage: &dyn Storage,
    layout: &OciLayout,
    tag: &str,
    name: &str,
) -> Result<()> {
    let desc = layout.resolve_reference(tag)?;
    let manifest = layout.lookup_manifest_by_descriptor(&desc)?;
    let layers = manifest.layers();

    // keys[j] names the extracted state of layers 0..=j
    let keys: Vec<String> =
        (0..layers.len()).map(|j| aggregate_hash(&manifest, j + 1)).collect();

    let reusable = keys.iter().take_while(|k| storage.exists(k)).count();

    let bundle = storage.bundle_path(name);
    let rootfs = storage.rootfs_path(name);

    if reusable > 0 {
        info!(prefix = reusable, total = layers.len(), "reusing extracted layer prefix");
        storage.delete(name)?;
        storage.restore(&keys[reusable - 1], name)?;
        reconcile_metadata(&storage.bundle_path(name), &storage.rootfs_path(name), &desc)?;

        if reusable == layers.len() {
            return Ok(());
        }

        // stale metadata must not describe a rootfs we're about to change
        clean_bundle_metadata(&bundle)?;
    }

    for (j, layer) in layers.iter().enumerate().skip(reusable) {
        extract_layer(layout, layer, &rootfs)?;

        if j == layers.len() - 1 {
            write_bundle_metadata(&bundle, &rootfs, &desc)?;
        }

        storage.delete(&keys[j])?;
        storage.snapshot(name, &keys[j])?;
    }

    if layers.is_empty() {
        // even an empty image names its (config-only) extracted state
        write_bundle_metadata(&bundle, &rootfs, &desc)?;
        let key = aggregate_hash(&manifest, 0);
        if !storage.exists(&key) {
            storage.snapshot(name, &key)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::OciLayout;
    use oci_spec::image::DescriptorBuilder;
    use tempfile::TempDir;

    fn desc(digest: &str) -> Descriptor {
        DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(digest.to_string())
            .size(0i64)
            .build()
            .unwrap()
    }

    #[test]
    fn test_mtree_name_replaces_colon() {
        let d = desc("sha256:abc123");
        assert_eq!(mtree_name(&d), "sha256_abc123.mtree");
    }

    #[test]
    fn test_bundle_meta_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let d = desc("sha256:abc123");
        write_bundle_meta(tmp.path(), &d).unwrap();
        let meta = read_bundle_meta(tmp.path()).unwrap();
        assert_eq!(meta.version, BUNDLE_META_VERSION);
        assert_eq!(meta.from.digest(), "sha256:abc123");
    }

    #[test]
    fn test_reconcile_regenerates_when_meta_absent() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path();
        let rootfs = bundle.join("rootfs");
        std::fs::create_dir(&rootfs).unwrap();
        std::fs::write(rootfs.join("f"), "x").unwrap();

        let d = desc("sha256:abc123");
        reconcile_metadata(bundle, &rootfs, &d).unwrap();

        assert!(bundle.join("sha256_abc123.mtree").exists());
        assert!(bundle.join(BUNDLE_META_FILE).exists());
        let manifest = read_bundle_mtree(bundle, &d).unwrap();
        assert!(manifest.entries.contains_key("f"));
    }

    #[test]
    fn test_reconcile_renames_old_mtree() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path();
        let rootfs = bundle.join("rootfs");
        std::fs::create_dir(&rootfs).unwrap();

        // metadata recorded under an older manifest digest
        let old = desc("sha256:old");
        write_bundle_metadata(bundle, &rootfs, &old).unwrap();

        let new = desc("sha256:new");
        reconcile_metadata(bundle, &rootfs, &new).unwrap();

        assert!(bundle.join("sha256_new.mtree").exists());
        assert!(!bundle.join("sha256_old.mtree").exists());
        assert_eq!(read_bundle_meta(bundle).unwrap().from.digest(), "sha256:new");
    }

    #[test]
    fn test_reconcile_noop_when_current() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path();
        let rootfs = bundle.join("rootfs");
        std::fs::create_dir(&rootfs).unwrap();

        let d = desc("sha256:abc");
        write_bundle_metadata(bundle, &rootfs, &d).unwrap();
        let before = std::fs::read(bundle.join("sha256_abc.mtree")).unwrap();

        reconcile_metadata(bundle, &rootfs, &d).unwrap();
        let after = std::fs::read(bundle.join("sha256_abc.mtree")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_clean_bundle_metadata_spares_rootfs() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path();
        std::fs::create_dir(bundle.join("rootfs")).unwrap();
        std::fs::write(bundle.join("rootfs/keep"), "x").unwrap();
        std::fs::write(bundle.join("sha256_a.mtree"), "").unwrap();
        std::fs::write(bundle.join(BUNDLE_META_FILE), "{}").unwrap();
        std::fs::write(bundle.join("overlay_metadata.json"), "{}").unwrap();

        clean_bundle_metadata(bundle).unwrap();

        assert!(bundle.join("rootfs/keep").exists());
        assert!(bundle.join("overlay_metadata.json").exists());
        assert!(!bundle.join("sha256_a.mtree").exists());
        assert!(!bundle.join(BUNDLE_META_FILE).exists());
    }

    #[test]
    fn test_extract_tar_layer_with_whiteout() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("rootfs");
        std::fs::create_dir_all(dest.join("etc")).unwrap();
        std::fs::write(dest.join("etc/gone"), "remove me").unwrap();

        // build a layer containing one file and one whiteout
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "etc/hosts", &b"hello"[..]).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "etc/.wh.gone", &b""[..]).unwrap();
        let data = builder.into_inner().unwrap();

        extract_tar(data.as_slice(), &dest).unwrap();

        assert_eq!(std::fs::read(dest.join("etc/hosts")).unwrap(), b"hello");
        assert!(!dest.join("etc/gone").exists());
    }

    #[test]
    fn test_unknown_media_type_rejected() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path().join("oci")).unwrap();
        let bad = DescriptorBuilder::default()
            .media_type(MediaType::Other("application/x-nonsense".to_string()))
            .digest("sha256:0".to_string())
            .size(0i64)
            .build()
            .unwrap();
        assert!(extract_layer(&layout, &bad, tmp.path()).is_err());
    }
}
