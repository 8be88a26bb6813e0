//! OCI image layout handling.
//!
//! This module owns every on-disk OCI layout stacker touches: the build
//! output and the base-layer cache. It provides blob storage keyed by
//! SHA256 digest, manifest/config lookup and mutation, tag management
//! through the index, layout-to-layout image copies, and garbage
//! collection of unreferenced blobs.

pub mod mtree;
pub mod repack;
pub mod unpack;

use crate::error::{Result, StackerError};
use oci_spec::image::{
    Arch, Descriptor, DescriptorBuilder, ImageConfiguration, ImageConfigurationBuilder,
    ImageIndex, ImageIndexBuilder, ImageManifest, ImageManifestBuilder, MediaType, Os,
    RootFsBuilder,
};
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Media type of the compressed read-only filesystem layers stacker can
/// emit alongside gzipped tars.
pub const MEDIA_TYPE_LAYER_SQUASHFS: &str = "application/vnd.stacker.image.layer.squashfs";

/// Annotation holding the recipe directory's VCS version, when derivable.
pub const GIT_VERSION_ANNOTATION: &str = "ws.tycho.stacker.git_version";

/// Annotation holding the post-substitution recipe text, set when no VCS
/// version is available.
pub const CONTENTS_ANNOTATION: &str = "ws.tycho.stacker.stacker_yaml";

const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// The layer representations an output image can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerType {
    /// Gzipped tar, the interchange default.
    Tar,
    /// Compressed read-only filesystem image.
    Squashfs,
}

impl LayerType {
    pub fn parse(s: &str) -> Result<LayerType> {
        match s {
            "tar" => Ok(LayerType::Tar),
            "squashfs" => Ok(LayerType::Squashfs),
            other => Err(StackerError::LayerAssembly {
                reason: format!("unknown layer type: {}", other),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LayerType::Tar => "tar",
            LayerType::Squashfs => "squashfs",
        }
    }

    /// The media type layers of this kind carry in a manifest.
    pub fn media_type(&self) -> MediaType {
        match self {
            LayerType::Tar => MediaType::ImageLayerGzip,
            LayerType::Squashfs => MediaType::Other(MEDIA_TYPE_LAYER_SQUASHFS.to_string()),
        }
    }

    /// Classify a manifest by its first layer's media type. Empty manifests
    /// count as tar: there is nothing to convert.
    pub fn of_manifest(manifest: &ImageManifest) -> LayerType {
        match manifest.layers().first() {
            Some(first) if first.media_type() == &LayerType::Squashfs.media_type() => {
                LayerType::Squashfs
            }
            _ => LayerType::Tar,
        }
    }
}

impl std::fmt::Display for LayerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The aggregate hash of a manifest's config digest and the first `prefix`
/// layer digests. It names a reusable extracted snapshot: two manifests
/// whose configs and layer prefixes match extract to identical bytes.
pub fn aggregate_hash(manifest: &ImageManifest, prefix: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(manifest.config().digest().as_bytes());
    for layer in manifest.layers().iter().take(prefix) {
        hasher.update(layer.digest().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// An OCI image layout rooted at a directory.
#[derive(Debug, Clone)]
pub struct OciLayout {
    path: PathBuf,
}

impl OciLayout {
    /// Create a fresh layout: `oci-layout` marker, empty index, blob tree.
    pub fn create(path: impl Into<PathBuf>) -> Result<OciLayout> {
        let path = path.into();
        fs::create_dir_all(path.join("blobs").join("sha256"))
            .map_err(|e| StackerError::io(&path, e))?;
        fs::write(path.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#)
            .map_err(|e| StackerError::io(&path, e))?;

        let layout = OciLayout { path };
        let index = ImageIndexBuilder::default()
            .schema_version(2u32)
            .manifests(Vec::<Descriptor>::new())
            .build()
            .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })?;
        layout.write_index(&index)?;
        Ok(layout)
    }

    /// Open an existing layout.
    pub fn open(path: impl Into<PathBuf>) -> Result<OciLayout> {
        let path = path.into();
        if !path.join("oci-layout").exists() {
            return Err(StackerError::LayerAssembly {
                reason: format!("{} is not an OCI layout", path.display()),
            });
        }
        Ok(OciLayout { path })
    }

    /// Open the layout at `path`, creating it if absent.
    pub fn open_or_create(path: impl Into<PathBuf>) -> Result<OciLayout> {
        let path = path.into();
        if path.join("oci-layout").exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn blobs_dir(&self) -> PathBuf {
        self.path.join("blobs").join("sha256")
    }

    /// Path of the blob for a `sha256:<hex>` digest.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.blobs_dir().join(hex)
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Stream a blob into the store, returning its digest and size.
    /// Storing is idempotent: identical content lands on the same name.
    pub fn put_blob(&self, mut reader: impl Read) -> Result<(String, i64)> {
        let blobs = self.blobs_dir();
        let mut tmp = tempfile::NamedTempFile::new_in(&blobs)
            .map_err(|e| StackerError::io(&blobs, e))?;

        let mut hasher = Sha256::new();
        let mut size: i64 = 0;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).map_err(|e| StackerError::io(&blobs, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n]).map_err(|e| StackerError::io(&blobs, e))?;
            size += n as i64;
        }

        let digest = format!("sha256:{:x}", hasher.finalize());
        let dest = self.blob_path(&digest);
        if !dest.exists() {
            tmp.persist(&dest)
                .map_err(|e| StackerError::io(&dest, e.error))?;
        }

        debug!(digest = %digest, size, "stored blob");
        Ok((digest, size))
    }

    /// Store a JSON-serialized value as a blob.
    pub fn put_blob_json<T: Serialize>(&self, value: &T) -> Result<(String, i64)> {
        let data = serde_json::to_vec(value)
            .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })?;
        self.put_blob(data.as_slice())
    }

    /// Open a blob for reading.
    pub fn blob_reader(&self, digest: &str) -> Result<File> {
        let p = self.blob_path(digest);
        File::open(&p).map_err(|_| StackerError::BlobNotFound { digest: digest.to_string() })
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let p = self.blob_path(digest);
        fs::read(&p).map_err(|_| StackerError::BlobNotFound { digest: digest.to_string() })
    }

    fn index(&self) -> Result<ImageIndex> {
        let content = fs::read(self.path.join("index.json"))
            .map_err(|e| StackerError::io(self.path.join("index.json"), e))?;
        serde_json::from_slice(&content)
            .map_err(|e| StackerError::LayerAssembly { reason: format!("bad index: {}", e) })
    }

    fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let content = serde_json::to_vec(index)
            .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })?;
        fs::write(self.path.join("index.json"), content)
            .map_err(|e| StackerError::io(self.path.join("index.json"), e))
    }

    /// Every tag named in the index, in index order.
    pub fn tags(&self) -> Result<Vec<String>> {
        Ok(self
            .index()?
            .manifests()
            .iter()
            .filter_map(|d| {
                d.annotations().as_ref().and_then(|a| a.get(REF_NAME_ANNOTATION)).cloned()
            })
            .collect())
    }

    /// The manifest descriptor a tag points at.
    pub fn resolve_reference(&self, tag: &str) -> Result<Descriptor> {
        self.index()?
            .manifests()
            .iter()
            .find(|d| {
                d.annotations()
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME_ANNOTATION))
                    .is_some_and(|t| t == tag)
            })
            .cloned()
            .ok_or_else(|| StackerError::TagNotFound { tag: tag.to_string() })
    }

    /// Point `tag` at a manifest descriptor, replacing any previous target.
    pub fn update_reference(&self, tag: &str, desc: &Descriptor) -> Result<()> {
        let index = self.index()?;
        let mut manifests: Vec<Descriptor> = index
            .manifests()
            .iter()
            .filter(|d| {
                d.annotations()
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME_ANNOTATION))
                    .map_or(true, |t| t != tag)
            })
            .cloned()
            .collect();

        let mut annotations = desc.annotations().clone().unwrap_or_default();
        annotations.insert(REF_NAME_ANNOTATION.to_string(), tag.to_string());
        let tagged = DescriptorBuilder::default()
            .media_type(desc.media_type().clone())
            .digest(desc.digest().clone())
            .size(desc.size())
            .annotations(annotations)
            .build()
            .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })?;
        manifests.push(tagged);

        let mut index = index;
        index.set_manifests(manifests);
        self.write_index(&index)
    }

    /// Drop a tag from the index, leaving its blobs for `gc`.
    pub fn remove_reference(&self, tag: &str) -> Result<()> {
        let mut index = self.index()?;
        let manifests: Vec<Descriptor> = index
            .manifests()
            .iter()
            .filter(|d| {
                d.annotations()
                    .as_ref()
                    .and_then(|a| a.get(REF_NAME_ANNOTATION))
                    .map_or(true, |t| t != tag)
            })
            .cloned()
            .collect();
        index.set_manifests(manifests);
        self.write_index(&index)
    }

    /// Load the manifest a tag points at.
    pub fn lookup_manifest(&self, tag: &str) -> Result<ImageManifest> {
        let desc = self.resolve_reference(tag)?;
        self.lookup_manifest_by_descriptor(&desc)
    }

    /// Load a manifest through its descriptor.
    pub fn lookup_manifest_by_descriptor(&self, desc: &Descriptor) -> Result<ImageManifest> {
        let content = self.read_blob(desc.digest())?;
        serde_json::from_slice(&content)
            .map_err(|e| StackerError::LayerAssembly { reason: format!("bad manifest: {}", e) })
    }

    /// Load the image configuration a manifest points at.
    pub fn lookup_config(&self, manifest: &ImageManifest) -> Result<ImageConfiguration> {
        let content = self.read_blob(manifest.config().digest())?;
        serde_json::from_slice(&content)
            .map_err(|e| StackerError::LayerAssembly { reason: format!("bad config: {}", e) })
    }

    /// Write a manifest blob and return its descriptor.
    pub fn put_manifest(&self, manifest: &ImageManifest) -> Result<Descriptor> {
        let (digest, size) = self.put_blob_json(manifest)?;
        DescriptorBuilder::default()
            .media_type(MediaType::ImageManifest)
            .digest(digest)
            .size(size)
            .build()
            .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })
    }

    /// Write a config blob and return its descriptor.
    pub fn put_config(&self, config: &ImageConfiguration) -> Result<Descriptor> {
        let (digest, size) = self.put_blob_json(config)?;
        DescriptorBuilder::default()
            .media_type(MediaType::ImageConfig)
            .digest(digest)
            .size(size)
            .build()
            .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })
    }

    /// Write the blobs of an empty image (no layers, empty diff ID list)
    /// and return its manifest descriptor, without touching the index.
    pub fn put_empty_image(&self) -> Result<Descriptor> {
        let config = new_image_config();
        let config_desc = self.put_config(&config)?;

        let manifest = ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .config(config_desc)
            .layers(Vec::<Descriptor>::new())
            .build()
            .map_err(|e| StackerError::LayerAssembly { reason: e.to_string() })?;

        self.put_manifest(&manifest)
    }

    /// Initialize `tag` as an empty image: no layers, empty diff ID list.
    pub fn init_empty(&self, tag: &str) -> Result<Descriptor> {
        let desc = self.put_empty_image()?;
        self.update_reference(tag, &desc)?;
        Ok(desc)
    }

    /// Remove every blob no reachable manifest references. Returns the
    /// number of blobs removed.
    pub fn gc(&self) -> Result<usize> {
        let mut referenced: HashSet<String> = HashSet::new();

        for desc in self.index()?.manifests() {
            referenced.insert(desc.digest().clone());
            let Ok(manifest) = self.lookup_manifest_by_descriptor(desc) else {
                continue;
            };
            referenced.insert(manifest.config().digest().clone());
            for layer in manifest.layers() {
                referenced.insert(layer.digest().clone());
            }
        }

        let mut removed = 0;
        let blobs = self.blobs_dir();
        for entry in fs::read_dir(&blobs).map_err(|e| StackerError::io(&blobs, e))? {
            let entry = entry.map_err(|e| StackerError::io(&blobs, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !referenced.contains(&format!("sha256:{}", name)) {
                fs::remove_file(entry.path()).map_err(|e| StackerError::io(entry.path(), e))?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "garbage collected unreferenced blobs");
        }
        Ok(removed)
    }
}

/// A fresh image configuration for the current platform, with an empty
/// layer diff list.
pub fn new_image_config() -> ImageConfiguration {
    let rootfs = RootFsBuilder::default()
        .typ("layers".to_string())
        .diff_ids(Vec::<String>::new())
        .build()
        .expect("static rootfs");

    ImageConfigurationBuilder::default()
        .architecture(host_arch())
        .os(Os::Linux)
        .rootfs(rootfs)
        .build()
        .expect("static image config")
}

fn host_arch() -> Arch {
    match std::env::consts::ARCH {
        "x86_64" => Arch::Amd64,
        "aarch64" => Arch::ARM64,
        other => Arch::Other(other.to_string()),
    }
}

/// Copy the image at `src_tag` in `src` into `dst` under `dst_tag`,
/// bringing over every blob the manifest references.
pub fn copy_image(src: &OciLayout, src_tag: &str, dst: &OciLayout, dst_tag: &str) -> Result<()> {
    let desc = src.resolve_reference(src_tag)?;
    let manifest = src.lookup_manifest_by_descriptor(&desc)?;

    let mut to_copy: Vec<String> = vec![manifest.config().digest().clone()];
    to_copy.extend(manifest.layers().iter().map(|l| l.digest().clone()));
    to_copy.push(desc.digest().clone());

    for digest in to_copy {
        let dest = dst.blob_path(&digest);
        if dest.exists() {
            continue;
        }
        let source = src.blob_path(&digest);
        fs::copy(&source, &dest).map_err(|e| StackerError::io(&source, e))?;
    }

    dst.update_reference(dst_tag, &desc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_reopen() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("oci");
        OciLayout::create(&dir).unwrap();
        let layout = OciLayout::open(&dir).unwrap();
        assert!(layout.tags().unwrap().is_empty());
    }

    #[test]
    fn test_open_rejects_non_layout() {
        let tmp = TempDir::new().unwrap();
        assert!(OciLayout::open(tmp.path()).is_err());
    }

    #[test]
    fn test_blob_roundtrip_and_idempotence() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path().join("oci")).unwrap();

        let (digest, size) = layout.put_blob(&b"hello blob"[..]).unwrap();
        assert_eq!(size, 10);
        assert!(digest.starts_with("sha256:"));

        let (digest2, _) = layout.put_blob(&b"hello blob"[..]).unwrap();
        assert_eq!(digest, digest2);

        assert_eq!(layout.read_blob(&digest).unwrap(), b"hello blob");
    }

    #[test]
    fn test_init_empty_has_zero_layers() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path().join("oci")).unwrap();
        layout.init_empty("a").unwrap();

        assert_eq!(layout.tags().unwrap(), vec!["a"]);
        let manifest = layout.lookup_manifest("a").unwrap();
        assert!(manifest.layers().is_empty());

        let config = layout.lookup_config(&manifest).unwrap();
        assert!(config.rootfs().diff_ids().is_empty());
    }

    #[test]
    fn test_update_reference_replaces() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path().join("oci")).unwrap();
        let first = layout.init_empty("a").unwrap();
        let second = layout.init_empty("b").unwrap();

        layout.update_reference("a", &second).unwrap();
        let resolved = layout.resolve_reference("a").unwrap();
        assert_eq!(resolved.digest(), second.digest());
        assert_ne!(resolved.digest(), first.digest());
        assert_eq!(layout.tags().unwrap().len(), 2);
    }

    #[test]
    fn test_aggregate_hash_is_pure_in_prefix() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path().join("oci")).unwrap();
        layout.init_empty("a").unwrap();
        let manifest = layout.lookup_manifest("a").unwrap();

        let h0 = aggregate_hash(&manifest, 0);
        let h0_again = aggregate_hash(&manifest, 0);
        assert_eq!(h0, h0_again);
        // no layers: any prefix length collapses to the config digest
        assert_eq!(h0, aggregate_hash(&manifest, 5));
    }

    #[test]
    fn test_gc_removes_unreferenced() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path().join("oci")).unwrap();
        layout.init_empty("a").unwrap();

        let (orphan, _) = layout.put_blob(&b"orphaned bytes"[..]).unwrap();
        assert!(layout.has_blob(&orphan));

        let removed = layout.gc().unwrap();
        assert_eq!(removed, 1);
        assert!(!layout.has_blob(&orphan));

        // the tagged manifest's blobs survive
        assert!(layout.lookup_manifest("a").is_ok());
    }

    #[test]
    fn test_copy_image_brings_blobs() {
        let tmp = TempDir::new().unwrap();
        let src = OciLayout::create(tmp.path().join("src")).unwrap();
        let dst = OciLayout::create(tmp.path().join("dst")).unwrap();
        src.init_empty("base").unwrap();

        copy_image(&src, "base", &dst, "renamed").unwrap();

        let manifest = dst.lookup_manifest("renamed").unwrap();
        assert!(dst.lookup_config(&manifest).is_ok());
    }

    #[test]
    fn test_layer_type_of_manifest() {
        let tmp = TempDir::new().unwrap();
        let layout = OciLayout::create(tmp.path().join("oci")).unwrap();
        layout.init_empty("a").unwrap();
        let manifest = layout.lookup_manifest("a").unwrap();
        assert_eq!(LayerType::of_manifest(&manifest), LayerType::Tar);
    }
}
