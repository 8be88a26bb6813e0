//! Apply engine: file-level merging of foreign OCI layers onto an
//! in-progress rootfs.
//!
//! Apply is distinct from base extraction: the incoming layers land on top
//! of content that may already disagree with them. Every tar entry is
//! compared attribute-by-attribute against what's on disk; additions unpack
//! normally, agreements are no-ops, and regular-file content divergence is
//! resolved by a three-way textual merge against the pre-apply snapshot.
//! Anything else is a typed conflict naming the path.

use crate::config::StackerConfig;
use crate::error::{ApplyConflict, Result, StackerError};
use crate::exec::ImageCopier;
use crate::oci::{OciLayout, MEDIA_TYPE_LAYER_SQUASHFS};
use crate::recipe::{ImageSource, LayerDefinition, RecipeSet};
use crate::storage::Storage;
use oci_spec::image::{Descriptor, MediaType};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

/// The rootfs name the pre-apply state is parked under while apply runs.
const APPLY_BASE: &str = "stacker-apply-base";

/// Binary files regenerated by ldconfig; never mergeable, always safe to
/// skip and regenerate afterwards.
const LD_CACHE_FILES: &[&str] = &["etc/ld.so.cache", "var/cache/ldconfig/aux-cache"];

/// What the apply pass wants the caller to do afterwards.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApplyOutcome {
    /// An ld cache file was skipped; run `ldconfig` in the container.
    pub needs_ld_cache_regen: bool,
}

pub struct Apply<'a> {
    config: &'a StackerConfig,
    storage: &'a dyn Storage,
    /// The rootfs being built.
    target: &'a str,
    consider_timestamps: bool,
    /// Digests already present in the rootfs: the base image's layers plus
    /// everything applied so far.
    layers: Vec<String>,
}

impl<'a> Apply<'a> {
    /// Set up an apply pass for `target`, seeding the known-layer set from
    /// the layer's base image.
    pub fn new(
        config: &'a StackerConfig,
        storage: &'a dyn Storage,
        recipe_set: &RecipeSet,
        layer: &LayerDefinition,
        target: &'a str,
        output: &OciLayout,
        consider_timestamps: bool,
    ) -> Result<Apply<'a>> {
        let mut layers = Vec::new();

        let source = layer.from_source()?;
        let manifest = match source {
            ImageSource::Docker { .. } | ImageSource::Oci { .. } | ImageSource::Zot { .. } => {
                let base = OciLayout::open(config.base_oci_dir())?;
                Some(base.lookup_manifest(&source.parse_tag()?)?)
            }
            ImageSource::Built { tag } => {
                let base_def = recipe_set.lookup_layer_definition(tag);
                match base_def {
                    Some(def) if def.build_only => {
                        // no OCI layers exist for build-only bases, so
                        // layer sharing can't be detected
                        if !layer.apply.is_empty() {
                            warn!("build-only base layers with apply statements may re-merge shared content");
                        }
                        None
                    }
                    _ => Some(output.lookup_manifest(tag)?),
                }
            }
            ImageSource::Tar { .. } | ImageSource::Scratch => None,
        };

        if let Some(manifest) = manifest {
            layers.extend(manifest.layers().iter().map(|l| l.digest().clone()));
        }

        Ok(Apply { config, storage, target, consider_timestamps, layers })
    }

    /// Merge each image in order. The pre-apply rootfs is snapshotted first
    /// so regular-file merges have a common ancestor to diff against.
    pub fn apply(&mut self, images: &[String], copier: &dyn ImageCopier) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        if images.is_empty() {
            return Ok(outcome);
        }

        self.storage.delete(APPLY_BASE)?;
        self.storage.snapshot(self.target, APPLY_BASE)?;

        let result: Result<ApplyOutcome> = (|| {
            for image in images {
                info!(image, "merging in layers");
                self.apply_image(image, copier, &mut outcome)?;
            }
            Ok(outcome)
        })();

        // the snapshot is working state, not a build artifact
        let _ = self.storage.delete(APPLY_BASE);
        result
    }

    fn apply_image(
        &mut self,
        image: &str,
        copier: &dyn ImageCopier,
        outcome: &mut ApplyOutcome,
    ) -> Result<()> {
        let source = ImageSource::from_image_string(image)?;
        let tag = source.parse_tag()?;

        let url = source.copier_url().ok_or_else(|| StackerError::RecipeSyntax {
            path: image.to_string(),
            reason: "apply image is not copier-fetchable".to_string(),
        })?;
        copier.copy(
            &url,
            &format!("oci:{}:{}", self.config.base_oci_dir().display(), tag),
            source.insecure(),
        )?;

        let layout = OciLayout::open(self.config.base_oci_dir())?;
        let manifest = layout.lookup_manifest(&tag)?;

        for (i, layer) in manifest.layers().iter().enumerate() {
            if self.layers.iter().any(|have| have == layer.digest()) {
                debug!(digest = %layer.digest(), "layer already present, skipping");
                continue;
            }

            if i == 0 {
                warn!(image = %tag, "image does not share any layers with the base");
            }

            info!(digest = %layer.digest(), "applying layer");
            self.apply_layer(&layout, layer, outcome)?;
            self.layers.push(layer.digest().clone());
        }

        Ok(())
    }

    fn apply_layer(
        &self,
        layout: &OciLayout,
        desc: &Descriptor,
        outcome: &mut ApplyOutcome,
    ) -> Result<()> {
        let rootfs = self.storage.rootfs_path(self.target);

        let reader: Box<dyn Read> = match desc.media_type() {
            MediaType::ImageLayer => Box::new(layout.blob_reader(desc.digest())?),
            MediaType::ImageLayerGzip => {
                Box::new(flate2::read::GzDecoder::new(layout.blob_reader(desc.digest())?))
            }
            MediaType::Other(t) if t == MEDIA_TYPE_LAYER_SQUASHFS => {
                return Err(StackerError::LayerAssembly {
                    reason: "apply of filesystem-image layers is not supported".to_string(),
                })
            }
            other => {
                return Err(StackerError::LayerAssembly {
                    reason: format!("unknown layer type {}", other),
                })
            }
        };

        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_unpack_xattrs(true);
        archive.set_overwrite(true);

        let entries = archive
            .entries()
            .map_err(|e| StackerError::LayerAssembly { reason: format!("reading layer: {}", e) })?;

        for entry in entries {
            let entry = entry.map_err(|e| StackerError::LayerAssembly {
                reason: format!("layer entry: {}", e),
            })?;

            let name = entry
                .path()
                .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })?
                .to_string_lossy()
                .into_owned();

            // the rootfs root can be mounted with any permissions; skip it
            if name == "." || name == "./" || name.is_empty() {
                continue;
            }

            self.insert_one_file(entry, &name, &rootfs, outcome)?;
        }

        Ok(())
    }

    fn insert_one_file(
        &self,
        mut entry: tar::Entry<'_, Box<dyn Read>>,
        name: &str,
        rootfs: &Path,
        outcome: &mut ApplyOutcome,
    ) -> Result<()> {
        let clean = name.trim_start_matches('/').trim_end_matches('/');
        let on_disk = rootfs.join(clean);

        let existing = match on_disk.symlink_metadata() {
            // new path: unpack it normally, this apply is additive here
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                entry.unpack_in(rootfs).map_err(|e| StackerError::LayerAssembly {
                    reason: format!("unpacking {}: {}", name, e),
                })?;
                return Ok(());
            }
            Err(e) => return Err(StackerError::io(&on_disk, e)),
            Ok(meta) => meta,
        };

        let header = entry.header();
        let etype = header.entry_type();

        if !types_match(&existing, etype) {
            return Err(ApplyConflict::IncompatibleType { path: clean.to_string() }.into());
        }

        use std::os::unix::fs::MetadataExt;
        let header_mode = header.mode().unwrap_or(0) & 0o7777;
        let disk_mode = existing.mode() & 0o7777;
        if header_mode != disk_mode {
            return Err(ApplyConflict::AttrMismatch {
                path: clean.to_string(),
                attr: "mode",
                ours: format!("{:o}", disk_mode),
                theirs: format!("{:o}", header_mode),
            }
            .into());
        }

        if self.consider_timestamps && !etype.is_file() {
            let header_mtime = header.mtime().unwrap_or(0);
            // zero passes: the packer may not have recorded a time at all
            if header_mtime != 0 && header_mtime != existing.mtime() as u64 {
                // build runtimes bind init helpers into /tmp and
                // resolv.conf into /etc, dirtying those mtimes with no
                // content behind them
                if clean != "tmp" && clean != "etc" {
                    return Err(ApplyConflict::AttrMismatch {
                        path: clean.to_string(),
                        attr: "mtime",
                        ours: existing.mtime().to_string(),
                        theirs: header_mtime.to_string(),
                    }
                    .into());
                }
            }
        }

        let header_uid = header.uid().unwrap_or(0);
        let header_gid = header.gid().unwrap_or(0);
        if header_uid != existing.uid() as u64 {
            return Err(ApplyConflict::AttrMismatch {
                path: clean.to_string(),
                attr: "uid",
                ours: existing.uid().to_string(),
                theirs: header_uid.to_string(),
            }
            .into());
        }
        if header_gid != existing.gid() as u64 {
            return Err(ApplyConflict::AttrMismatch {
                path: clean.to_string(),
                attr: "gid",
                ours: existing.gid().to_string(),
                theirs: header_gid.to_string(),
            }
            .into());
        }

        let theirs_xattrs = entry_xattrs(&mut entry)?;
        let ours_xattrs = disk_xattrs(&on_disk);
        if theirs_xattrs != ours_xattrs {
            return Err(ApplyConflict::AttrMismatch {
                path: clean.to_string(),
                attr: "xattrs",
                ours: format!("{:?}", ours_xattrs.keys().collect::<Vec<_>>()),
                theirs: format!("{:?}", theirs_xattrs.keys().collect::<Vec<_>>()),
            }
            .into());
        }

        match etype {
            tar::EntryType::Directory | tar::EntryType::Fifo => Ok(()),
            tar::EntryType::Char | tar::EntryType::Block => {
                let theirs = (
                    entry.header().device_major().unwrap_or(None).unwrap_or(0) as u64,
                    entry.header().device_minor().unwrap_or(None).unwrap_or(0) as u64,
                );
                let rdev = existing.rdev();
                let ours = (nix::sys::stat::major(rdev), nix::sys::stat::minor(rdev));
                if ours != theirs {
                    return Err(ApplyConflict::AttrMismatch {
                        path: clean.to_string(),
                        attr: "device",
                        ours: format!("{},{}", ours.0, ours.1),
                        theirs: format!("{},{}", theirs.0, theirs.1),
                    }
                    .into());
                }
                Ok(())
            }
            tar::EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })?
                    .ok_or_else(|| StackerError::LayerAssembly {
                        reason: format!("hard link {} without target", clean),
                    })?
                    .into_owned();
                let target_meta = rootfs
                    .join(link.to_string_lossy().trim_start_matches('/'))
                    .symlink_metadata()
                    .map_err(|e| StackerError::io(rootfs.join(&link), e))?;
                if target_meta.ino() != existing.ino() {
                    return Err(ApplyConflict::AttrMismatch {
                        path: clean.to_string(),
                        attr: "hard link target",
                        ours: existing.ino().to_string(),
                        theirs: target_meta.ino().to_string(),
                    }
                    .into());
                }
                Ok(())
            }
            tar::EntryType::Symlink => {
                let theirs = entry
                    .link_name()
                    .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })?
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let ours = fs::read_link(&on_disk)
                    .map_err(|e| StackerError::io(&on_disk, e))?
                    .to_string_lossy()
                    .into_owned();
                if ours != theirs {
                    return Err(ApplyConflict::AttrMismatch {
                        path: clean.to_string(),
                        attr: "symlink target",
                        ours,
                        theirs,
                    }
                    .into());
                }
                Ok(())
            }
            tar::EntryType::Regular | tar::EntryType::GNUSparse | tar::EntryType::Continuous => {
                self.merge_regular(&mut entry, clean, &on_disk, rootfs, outcome)
            }
            other => Err(StackerError::LayerAssembly {
                reason: format!("unknown tar entry type {:?} for {}", other, clean),
            }),
        }
    }

    /// Content handling for regular files: identical bytes are a no-op,
    /// text divergence goes through the three-way merge, binaries conflict
    /// unless they're on the regenerable list.
    fn merge_regular(
        &self,
        entry: &mut tar::Entry<'_, Box<dyn Read>>,
        clean: &str,
        on_disk: &Path,
        rootfs: &Path,
        outcome: &mut ApplyOutcome,
    ) -> Result<()> {
        let mut theirs = Vec::new();
        entry.read_to_end(&mut theirs).map_err(|e| StackerError::LayerAssembly {
            reason: format!("reading {}: {}", clean, e),
        })?;

        let ours = fs::read(on_disk).map_err(|e| StackerError::io(on_disk, e))?;

        if ours.len() == theirs.len() {
            let mut ha = Sha256::new();
            ha.update(&ours);
            let mut hb = Sha256::new();
            hb.update(&theirs);
            if ha.finalize() == hb.finalize() {
                return Ok(());
            }
        }

        if !looks_textual(&ours) || !looks_textual(&theirs) {
            // ld.so.cache is regenerated whenever shared objects are
            // installed; two library layers would otherwise never merge
            if LD_CACHE_FILES.contains(&clean) {
                outcome.needs_ld_cache_regen = true;
                return Ok(());
            }
            return Err(ApplyConflict::BinaryConflict {
                path: clean.to_string(),
                content_type: "application/octet-stream".to_string(),
            }
            .into());
        }

        let ancestor_path = self.storage.rootfs_path(APPLY_BASE).join(clean);
        // absent in the ancestor means both sides added the file: merge
        // from empty so both diffs read as additive
        let ancestor = fs::read_to_string(&ancestor_path).unwrap_or_default();

        let ours_text = String::from_utf8(ours).map_err(|_| ApplyConflict::BinaryConflict {
            path: clean.to_string(),
            content_type: "application/octet-stream".to_string(),
        })?;
        let theirs_text =
            String::from_utf8(theirs).map_err(|_| ApplyConflict::BinaryConflict {
                path: clean.to_string(),
                content_type: "application/octet-stream".to_string(),
            })?;

        let patch = diffy::create_patch(&ancestor, &theirs_text);
        let merged = diffy::apply(&ours_text, &patch).map_err(|e| {
            ApplyConflict::Unmergeable { path: clean.to_string(), reason: e.to_string() }
        })?;

        debug!(path = clean, "three-way merge succeeded");

        // truncate in place so mode and xattrs survive
        fs::write(rootfs.join(clean), merged).map_err(|e| StackerError::io(on_disk, e))?;
        Ok(())
    }
}

fn types_match(meta: &fs::Metadata, etype: tar::EntryType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    let ft = meta.file_type();
    match etype {
        tar::EntryType::Regular | tar::EntryType::GNUSparse | tar::EntryType::Continuous => {
            ft.is_file()
        }
        // an existing hard link target is just a regular file
        tar::EntryType::Link => ft.is_file(),
        tar::EntryType::Directory => ft.is_dir(),
        tar::EntryType::Symlink => ft.is_symlink(),
        tar::EntryType::Char => ft.is_char_device(),
        tar::EntryType::Block => ft.is_block_device(),
        tar::EntryType::Fifo => ft.is_fifo(),
        _ => false,
    }
}

/// Extended attributes carried in the entry's pax records.
fn entry_xattrs(entry: &mut tar::Entry<'_, Box<dyn Read>>) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut out = BTreeMap::new();
    let Ok(Some(pax)) = entry.pax_extensions() else {
        return Ok(out);
    };
    for ext in pax {
        let Ok(ext) = ext else { continue };
        let Ok(key) = ext.key() else { continue };
        if let Some(name) = key.strip_prefix("SCHILY.xattr.") {
            out.insert(name.to_string(), ext.value_bytes().to_vec());
        }
    }
    Ok(out)
}

fn disk_xattrs(path: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    let Ok(names) = xattr::list(path) else {
        return out;
    };
    for name in names {
        if let Ok(Some(value)) = xattr::get(path, &name) {
            out.insert(name.to_string_lossy().into_owned(), value);
        }
    }
    out
}

/// A cheap text sniff: no NUL in the first block and valid UTF-8 where we
/// cut it.
fn looks_textual(content: &[u8]) -> bool {
    let head = &content[..content.len().min(512)];
    !head.contains(&0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_textual() {
        assert!(looks_textual(b"hello\nworld\n"));
        assert!(looks_textual(b""));
        assert!(!looks_textual(b"\x7fELF\x02\x01\x01\x00\x00"));
    }

    #[test]
    fn test_three_way_merge_distinct_additions() {
        // the scenario the engine exists for: two images append different
        // lines to the same base file
        let ancestor = "a\n";
        let theirs = "a\nb\n";
        let ours = "a\n";

        let patch = diffy::create_patch(ancestor, theirs);
        let merged = diffy::apply(ours, &patch).unwrap();
        assert_eq!(merged, "a\nb\n");

        // second image appends c; ours now carries b
        let theirs2 = "a\nc\n";
        let patch2 = diffy::create_patch(ancestor, theirs2);
        let merged2 = diffy::apply(&merged, &patch2).unwrap();
        let mut lines: Vec<&str> = merged2.lines().collect();
        lines.sort_unstable();
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_three_way_merge_conflicting_change_fails() {
        // both sides rewrite the same line differently
        let ancestor = "value = 1\n";
        let theirs = "value = 2\n";
        let ours = "value = 3\n";

        let patch = diffy::create_patch(ancestor, theirs);
        assert!(diffy::apply(ours, &patch).is_err());
    }

    #[test]
    fn test_ld_cache_paths_whitelisted() {
        assert!(LD_CACHE_FILES.contains(&"etc/ld.so.cache"));
        assert!(LD_CACHE_FILES.contains(&"var/cache/ldconfig/aux-cache"));
    }

    #[test]
    fn test_types_match() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f"), "x").unwrap();
        let meta = tmp.path().join("f").symlink_metadata().unwrap();
        assert!(types_match(&meta, tar::EntryType::Regular));
        assert!(!types_match(&meta, tar::EntryType::Directory));

        let dmeta = tmp.path().symlink_metadata().unwrap();
        assert!(types_match(&dmeta, tar::EntryType::Directory));
    }
}
