//! Layer generation and repacking.
//!
//! Repack walks the rootfs against the bundle's stored filesystem manifest
//! to compute a delta, packs the delta into the requested layer media type,
//! and rewrites config + manifest + tag. Conversion between media types
//! regenerates the whole rootfs as a single synthetic layer instead.

use crate::error::{Result, StackerError};
use crate::oci::mtree::{DiffKind, EntryKind, FsEntry, FsManifest};
use crate::oci::unpack::{
    mtree_name, read_bundle_meta, read_bundle_mtree, write_bundle_meta,
};
use crate::oci::{LayerType, OciLayout};
use flate2::write::GzEncoder;
use flate2::Compression;
use oci_spec::image::{
    Descriptor, DescriptorBuilder, History, HistoryBuilder, ImageConfiguration, ImageManifest,
    MediaType,
};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::process::Command;
use tracing::{debug, info, instrument};

/// A generated layer blob, already in the store.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    pub digest: String,
    pub size: i64,
    /// Digest of the uncompressed content, as recorded in
    /// `config.rootfs.diff_ids`.
    pub diff_id: String,
    pub media_type: MediaType,
}

impl LayerBlob {
    pub fn descriptor(&self) -> Result<Descriptor> {
        DescriptorBuilder::default()
            .media_type(self.media_type.clone())
            .digest(self.digest.clone())
            .size(self.size)
            .build()
            .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })
    }
}

/// Counts bytes through a hasher so the uncompressed digest of a layer can
/// be computed while the compressed blob is written.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        HashingWriter { inner, hasher: Sha256::new() }
    }

    fn finish(self) -> (W, String) {
        (self.inner, format!("sha256:{:x}", self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn append_whiteout<W: Write>(builder: &mut tar::Builder<W>, path: &str) -> Result<()> {
    let p = Path::new(path);
    let name = p
        .file_name()
        .ok_or_else(|| StackerError::LayerAssembly { reason: format!("bad whiteout {}", path) })?
        .to_string_lossy();
    let whiteout = p
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(format!(".wh.{}", name));

    let mut header = tar::Header::new_gnu();
    header.set_size(0);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder
        .append_data(&mut header, whiteout, &b""[..])
        .map_err(|e| StackerError::LayerAssembly { reason: format!("whiteout {}: {}", path, e) })
}

fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    rootfs: &Path,
    entry: &FsEntry,
) -> Result<()> {
    let full = rootfs.join(&entry.path);
    let meta = full
        .symlink_metadata()
        .map_err(|e| StackerError::io(&full, e))?;

    let wrap = |e: std::io::Error| StackerError::LayerAssembly {
        reason: format!("archiving {}: {}", entry.path, e),
    };

    let mut header = tar::Header::new_gnu();
    header.set_metadata(&meta);

    match entry.kind {
        EntryKind::File => {
            let f = File::open(&full).map_err(|e| StackerError::io(&full, e))?;
            header.set_cksum();
            builder.append_data(&mut header, &entry.path, f).map_err(wrap)?;
        }
        EntryKind::Dir => {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{}/", entry.path), &b""[..])
                .map_err(wrap)?;
        }
        EntryKind::Symlink => {
            let target = entry.link.clone().unwrap_or_default();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_link_name(&target).map_err(wrap)?;
            header.set_cksum();
            builder.append_data(&mut header, &entry.path, &b""[..]).map_err(wrap)?;
        }
        EntryKind::Char | EntryKind::Block => {
            header.set_entry_type(if entry.kind == EntryKind::Char {
                tar::EntryType::Char
            } else {
                tar::EntryType::Block
            });
            header.set_size(0);
            let (major, minor) = entry.device.unwrap_or((0, 0));
            header.set_device_major(major as u32).map_err(wrap)?;
            header.set_device_minor(minor as u32).map_err(wrap)?;
            header.set_cksum();
            builder.append_data(&mut header, &entry.path, &b""[..]).map_err(wrap)?;
        }
        EntryKind::Fifo => {
            header.set_entry_type(tar::EntryType::Fifo);
            header.set_size(0);
            header.set_cksum();
            builder.append_data(&mut header, &entry.path, &b""[..]).map_err(wrap)?;
        }
        // sockets are not representable in a tar stream; they carry no data
        EntryKind::Socket => {}
    }

    Ok(())
}

/// Generate a gzipped-tar layer of the changes from `old` to `current`,
/// store it, and return the blob. Passing an empty `old` produces a full
/// layer of the rootfs.
pub fn generate_tar_layer(
    layout: &OciLayout,
    rootfs: &Path,
    old: &FsManifest,
    current: &FsManifest,
) -> Result<LayerBlob> {
    let mut tmp = tempfile::tempfile().map_err(|e| StackerError::io(layout.path(), e))?;

    let gz = GzEncoder::new(&mut tmp, Compression::default());
    let mut hashing = HashingWriter::new(gz);
    {
        let mut builder = tar::Builder::new(&mut hashing);
        builder.follow_symlinks(false);

        for diff in old.diff(current) {
            match diff.kind {
                DiffKind::Added | DiffKind::Modified => {
                    let entry = current
                        .entries
                        .get(&diff.path)
                        .expect("diff path came from current manifest");
                    append_entry(&mut builder, rootfs, entry)?;
                }
                DiffKind::Removed => append_whiteout(&mut builder, &diff.path)?,
            }
        }

        builder
            .finish()
            .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })?;
    }

    let (gz, diff_id) = hashing.finish();
    gz.finish()
        .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })?;

    tmp.seek(SeekFrom::Start(0)).map_err(|e| StackerError::io(layout.path(), e))?;
    let (digest, size) = layout.put_blob(&tmp)?;

    debug!(digest = %digest, size, "generated tar layer");
    Ok(LayerBlob { digest, size, diff_id, media_type: LayerType::Tar.media_type() })
}

/// Generate a squashfs layer of the rootfs, excluding `unchanged` paths and
/// marking `removed` paths with whiteout device nodes, then store it.
pub fn generate_squashfs_layer(
    layout: &OciLayout,
    rootfs: &Path,
    unchanged: &[String],
    removed: &[String],
) -> Result<LayerBlob> {
    // whiteouts are union-mount style: character devices 0,0 written into
    // the tree for the duration of the pack
    let mut written: Vec<std::path::PathBuf> = Vec::new();
    let result: Result<LayerBlob> = (|| {
        for path in removed {
            let p = rootfs.join(path);
            match nix::sys::stat::mknod(
                &p,
                nix::sys::stat::SFlag::S_IFCHR,
                nix::sys::stat::Mode::empty(),
                nix::sys::stat::makedev(0, 0),
            ) {
                Ok(()) => written.push(p),
                // the parent itself was deleted; the parent's whiteout covers us
                Err(nix::errno::Errno::ENOENT) | Err(nix::errno::Errno::ENOTDIR) => {}
                Err(e) => {
                    return Err(StackerError::LayerAssembly {
                        reason: format!("couldn't mknod whiteout for {}: {}", path, e),
                    })
                }
            }
        }

        let mut excludes = tempfile::NamedTempFile::new()
            .map_err(|e| StackerError::io(rootfs, e))?;
        for path in unchanged {
            writeln!(excludes, "{}", path).map_err(|e| StackerError::io(rootfs, e))?;
        }
        excludes.flush().map_err(|e| StackerError::io(rootfs, e))?;

        let img = tempfile::NamedTempFile::new_in(layout.path())
            .map_err(|e| StackerError::io(layout.path(), e))?;
        let mut cmd = Command::new("mksquashfs");
        cmd.arg(rootfs).arg(img.path()).arg("-noappend");
        if !unchanged.is_empty() {
            cmd.arg("-ef").arg(excludes.path());
        }
        let output = cmd.output().map_err(|e| StackerError::io(rootfs, e))?;
        if !output.status.success() {
            return Err(StackerError::LayerAssembly {
                reason: format!(
                    "couldn't build squashfs: {}",
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }

        let f = File::open(img.path()).map_err(|e| StackerError::io(img.path(), e))?;
        let (digest, size) = layout.put_blob(f)?;

        // squashfs blobs are stored uncompressed-as-is, so the diff ID is
        // the blob digest
        Ok(LayerBlob {
            diff_id: digest.clone(),
            digest,
            size,
            media_type: LayerType::Squashfs.media_type(),
        })
    })();

    for p in written {
        let _ = fs::remove_file(p);
    }

    result
}

fn now_history(created_by: String, empty_layer: bool) -> Result<History> {
    HistoryBuilder::default()
        .created(chrono::Utc::now().to_rfc3339())
        .created_by(created_by)
        .empty_layer(empty_layer)
        .build()
        .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })
}

/// Append a layer blob to `tag`'s manifest: layer list, diff ID, history,
/// fresh config and manifest blobs, tag update. Returns the new manifest
/// descriptor.
pub fn commit_layer(
    layout: &OciLayout,
    tag: &str,
    blob: &LayerBlob,
    created_by: String,
) -> Result<Descriptor> {
    let mut manifest = layout.lookup_manifest(tag)?;
    let mut config = layout.lookup_config(&manifest)?;

    manifest.layers_mut().push(blob.descriptor()?);
    config.rootfs_mut().diff_ids_mut().push(blob.diff_id.clone());
    config.history_mut().push(now_history(created_by, false)?);

    let config_desc = layout.put_config(&config)?;
    manifest.set_config(config_desc);

    let desc = layout.put_manifest(&manifest)?;
    layout.update_reference(tag, &desc)?;
    Ok(desc)
}

/// Repack `name`'s rootfs against its stored manifest, producing a delta
/// layer of the requested type and updating `tag`.
#[instrument(skip(layout, bundle, rootfs))]
pub fn repack(
    layout: &OciLayout,
    tag: &str,
    bundle: &Path,
    rootfs: &Path,
    layer_type: LayerType,
) -> Result<Descriptor> {
    let meta = read_bundle_meta(bundle)?;
    let old = read_bundle_mtree(bundle, &meta.from)?;
    let current = FsManifest::walk(rootfs)?;

    if old.diff(&current).is_empty() {
        // nothing changed: no layer to add, the tag stays as it is
        info!(tag, "rootfs unchanged, skipping layer generation");
        return layout.resolve_reference(tag);
    }

    let blob = match layer_type {
        LayerType::Tar => generate_tar_layer(layout, rootfs, &old, &current)?,
        LayerType::Squashfs => {
            let removed: Vec<String> = old
                .diff(&current)
                .into_iter()
                .filter(|d| d.kind == DiffKind::Removed)
                .map(|d| d.path)
                .collect();
            let unchanged = old.unchanged(&current);
            generate_squashfs_layer(layout, rootfs, &unchanged, &removed)?
        }
    };

    let desc = commit_layer(layout, tag, &blob, format!("stacker build of {}", tag))?;
    info!(tag, digest = %desc.digest(), "repacked layer");

    // the rootfs now corresponds to the new manifest
    let p = bundle.join(mtree_name(&desc));
    fs::write(&p, current.encode()).map_err(|e| StackerError::io(&p, e))?;
    for entry in fs::read_dir(bundle).map_err(|e| StackerError::io(bundle, e))? {
        let entry = entry.map_err(|e| StackerError::io(bundle, e))?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name.ends_with(".mtree") && entry.path() != p {
            fs::remove_file(entry.path()).map_err(|e| StackerError::io(entry.path(), e))?;
        }
    }
    write_bundle_meta(bundle, &desc)?;

    Ok(desc)
}

/// Rename the bundle's stored manifest to follow a config-only manifest
/// change: the rootfs bits didn't move, only the descriptor naming them.
pub fn update_bundle_mtree(bundle: &Path, desc: &Descriptor) -> Result<()> {
    let expected = bundle.join(mtree_name(desc));
    if !expected.exists() {
        let old = fs::read_dir(bundle)
            .map_err(|e| StackerError::io(bundle, e))?
            .filter_map(|e| e.ok())
            .find(|e| e.file_name().to_string_lossy().ends_with(".mtree"));
        if let Some(old) = old {
            fs::rename(old.path(), &expected).map_err(|e| StackerError::io(&expected, e))?;
        }
    }
    write_bundle_meta(bundle, desc)
}

/// Regenerate `tag` as a single layer of `layer_type` from the current
/// rootfs, carrying the source image's config forward with one new history
/// entry. Used when the source manifest's layer media type differs from the
/// requested output type.
#[instrument(skip(layout, source_manifest, source_config, rootfs))]
pub fn convert_layer_type(
    layout: &OciLayout,
    source_manifest: &ImageManifest,
    source_config: &ImageConfiguration,
    tag: &str,
    rootfs: &Path,
    layer_type: LayerType,
) -> Result<Descriptor> {
    // old-type blobs referenced only by the tag we're about to rewrite
    // would otherwise linger forever
    layout.gc()?;

    info!(tag, to = %layer_type, "translating layer type");

    let blob = match layer_type {
        LayerType::Tar => {
            let current = FsManifest::walk(rootfs)?;
            generate_tar_layer(layout, rootfs, &FsManifest::default(), &current)?
        }
        LayerType::Squashfs => generate_squashfs_layer(layout, rootfs, &[], &[])?,
    };

    let mut config = source_config.clone();
    config.rootfs_mut().diff_ids_mut().clear();
    config.rootfs_mut().diff_ids_mut().push(blob.diff_id.clone());
    config.set_history(vec![now_history(
        format!("stacker layer-type mismatch repack of {}", tag),
        false,
    )?]);

    let config_desc = layout.put_config(&config)?;

    let mut manifest = source_manifest.clone();
    manifest.set_config(config_desc);
    manifest.set_layers(vec![blob.descriptor()?]);

    let desc = layout.put_manifest(&manifest)?;
    layout.update_reference(tag, &desc)?;
    Ok(desc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::unpack::{extract_layer, write_bundle_metadata};
    use tempfile::TempDir;

    fn setup() -> (TempDir, OciLayout) {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path().join("oci")).unwrap();
        (tmp, layout)
    }

    #[test]
    fn test_full_tar_layer_roundtrips() {
        let (tmp, layout) = setup();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(rootfs.join("etc")).unwrap();
        fs::write(rootfs.join("etc/hosts"), "127.0.0.1 localhost\n").unwrap();
        std::os::unix::fs::symlink("hosts", rootfs.join("etc/alias")).unwrap();

        let current = FsManifest::walk(&rootfs).unwrap();
        let blob =
            generate_tar_layer(&layout, &rootfs, &FsManifest::default(), &current).unwrap();
        assert_eq!(blob.media_type, MediaType::ImageLayerGzip);
        assert_ne!(blob.digest, blob.diff_id);

        let dest = tmp.path().join("extracted");
        fs::create_dir(&dest).unwrap();
        extract_layer(&layout, &blob.descriptor().unwrap(), &dest).unwrap();

        assert_eq!(
            fs::read_to_string(dest.join("etc/hosts")).unwrap(),
            "127.0.0.1 localhost\n"
        );
        assert_eq!(
            fs::read_link(dest.join("etc/alias")).unwrap(),
            Path::new("hosts")
        );
    }

    #[test]
    fn test_delta_layer_contains_only_changes() {
        let (tmp, layout) = setup();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        fs::write(rootfs.join("stays"), "unchanged").unwrap();
        let old = FsManifest::walk(&rootfs).unwrap();

        fs::write(rootfs.join("added"), "new file").unwrap();
        fs::remove_file(rootfs.join("stays")).unwrap();
        fs::write(rootfs.join("stays"), "unchanged").unwrap(); // same bytes
        let current = FsManifest::walk(&rootfs).unwrap();

        let blob = generate_tar_layer(&layout, &rootfs, &old, &current).unwrap();

        let dest = tmp.path().join("extracted");
        fs::create_dir(&dest).unwrap();
        extract_layer(&layout, &blob.descriptor().unwrap(), &dest).unwrap();

        assert!(dest.join("added").exists());
        assert!(!dest.join("stays").exists());
    }

    #[test]
    fn test_delta_layer_whiteout_applies() {
        let (tmp, layout) = setup();
        let rootfs = tmp.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        fs::write(rootfs.join("doomed"), "x").unwrap();
        let old = FsManifest::walk(&rootfs).unwrap();

        fs::remove_file(rootfs.join("doomed")).unwrap();
        let current = FsManifest::walk(&rootfs).unwrap();
        let blob = generate_tar_layer(&layout, &rootfs, &old, &current).unwrap();

        // extracting the delta onto a copy of the old state removes the file
        let dest = tmp.path().join("extracted");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("doomed"), "x").unwrap();
        extract_layer(&layout, &blob.descriptor().unwrap(), &dest).unwrap();
        assert!(!dest.join("doomed").exists());
    }

    #[test]
    fn test_repack_appends_layer_and_diff_id() {
        let (tmp, layout) = setup();
        layout.init_empty("img").unwrap();

        let bundle = tmp.path().join("bundle");
        let rootfs = bundle.join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();

        let desc = layout.resolve_reference("img").unwrap();
        write_bundle_metadata(&bundle, &rootfs, &desc).unwrap();

        fs::write(rootfs.join("hi"), "hello").unwrap();
        let new_desc = repack(&layout, "img", &bundle, &rootfs, LayerType::Tar).unwrap();
        assert_ne!(new_desc.digest(), desc.digest());

        let manifest = layout.lookup_manifest("img").unwrap();
        assert_eq!(manifest.layers().len(), 1);
        let config = layout.lookup_config(&manifest).unwrap();
        assert_eq!(config.rootfs().diff_ids().len(), 1);

        // bundle metadata follows the new manifest
        assert!(bundle.join(mtree_name(&new_desc)).exists());
        assert_eq!(read_bundle_meta(&bundle).unwrap().from.digest(), new_desc.digest());
    }

    #[test]
    fn test_convert_to_tar_single_layer_manifest() {
        let (tmp, layout) = setup();
        layout.init_empty("img").unwrap();
        // seed with two delta layers
        let bundle = tmp.path().join("bundle");
        let rootfs = bundle.join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        let desc = layout.resolve_reference("img").unwrap();
        write_bundle_metadata(&bundle, &rootfs, &desc).unwrap();
        fs::write(rootfs.join("one"), "1").unwrap();
        repack(&layout, "img", &bundle, &rootfs, LayerType::Tar).unwrap();
        fs::write(rootfs.join("two"), "2").unwrap();
        repack(&layout, "img", &bundle, &rootfs, LayerType::Tar).unwrap();

        let manifest = layout.lookup_manifest("img").unwrap();
        assert_eq!(manifest.layers().len(), 2);
        let config = layout.lookup_config(&manifest).unwrap();

        convert_layer_type(&layout, &manifest, &config, "img", &rootfs, LayerType::Tar).unwrap();

        let converted = layout.lookup_manifest("img").unwrap();
        assert_eq!(converted.layers().len(), 1);
        let config = layout.lookup_config(&converted).unwrap();
        assert_eq!(config.rootfs().diff_ids().len(), 1);
        assert_eq!(config.history().len(), 1);
    }
}
