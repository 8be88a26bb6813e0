//! Build cache.
//!
//! The cache maps layer names to the blob they produced last time, keyed on
//! everything that goes into a layer: the staged imports' hashes, the base
//! layer's own cache entry (for `built` bases, so invalidation propagates
//! down a chain), and the layer definition itself. It persists as one
//! schema-versioned JSON file, rewritten atomically; a version mismatch
//! silently wipes.

use crate::config::StackerConfig;
use crate::error::{Result, StackerError};
use crate::oci::mtree::FsManifest;
use crate::oci::OciLayout;
use crate::recipe::{ImageSource, LayerDefinition, Recipe};
use oci_spec::image::Descriptor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CACHE_VERSION: u32 = 1;

/// What kind of artifact an import staged as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportKind {
    File,
    Dir,
}

/// Content fingerprint of a staged import: a file's SHA256, or the SHA256
/// of a directory's canonical filesystem manifest (mtimes excluded either
/// way).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportHash {
    pub kind: ImportKind,
    pub hash: String,
}

/// Fingerprint a staged import on disk.
pub fn hash_import(path: &Path) -> Result<ImportHash> {
    let meta = fs::metadata(path).map_err(|e| StackerError::io(path, e))?;
    if meta.is_dir() {
        let manifest = FsManifest::walk(path)?;
        let mut hasher = Sha256::new();
        hasher.update(manifest.encode().as_bytes());
        Ok(ImportHash { kind: ImportKind::Dir, hash: format!("{:x}", hasher.finalize()) })
    } else {
        Ok(ImportHash { kind: ImportKind::File, hash: hash_file(path)? })
    }
}

/// SHA256 of a file's content, hex-encoded.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut f = File::open(path).map_err(|e| StackerError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).map_err(|e| StackerError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// One cached layer build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The manifest descriptor this layer produced; absent for build-only
    /// layers, which leave only a rootfs behind.
    pub blob: Option<Descriptor>,
    /// Import basename -> fingerprint at build time.
    pub imports: BTreeMap<String, ImportHash>,
    /// The layer name, kept so build-only entries can be checked for a
    /// surviving rootfs and for error messages.
    pub name: String,
    /// The definition that produced this entry. Lookups compare it against
    /// the current definition, so editing `run` or the image config
    /// invalidates the entry.
    pub layer: LayerDefinition,
    /// Structural hash of the base layer's cache entry when the base is
    /// `built`; empty otherwise. Propagates invalidation transitively.
    pub base: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    cache: BTreeMap<String, CacheEntry>,
}

/// The persistent build cache for one recipe.
pub struct BuildCache {
    path: PathBuf,
    imports_dir: PathBuf,
    rootfs_dir: PathBuf,
    recipe: Recipe,
    cache: BTreeMap<String, CacheEntry>,
}

impl BuildCache {
    /// Open the cache, wiping on version mismatch and pruning entries
    /// whose artifacts vanished from disk.
    pub fn open(config: &StackerConfig, layout: &OciLayout, recipe: &Recipe) -> Result<BuildCache> {
        let path = config.cache_file();
        let mut cache = BuildCache {
            path: path.clone(),
            imports_dir: config.imports_dir(),
            rootfs_dir: config.rootfs_dir.clone(),
            recipe: recipe.clone(),
            cache: BTreeMap::new(),
        };

        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(cache),
            Err(e) => return Err(StackerError::io(&path, e)),
        };

        let file: CacheFile = match serde_json::from_slice(&content) {
            Ok(file) => file,
            Err(e) => {
                warn!(error = %e, "unreadable cache, rebuilding from scratch");
                let _ = fs::remove_file(&path);
                return Ok(cache);
            }
        };

        if file.version != CACHE_VERSION {
            info!("old cache version found, clearing cache and rebuilding from scratch");
            let _ = fs::remove_file(&path);
            return Ok(cache);
        }

        cache.cache = file.cache;
        cache.prune(layout)?;
        Ok(cache)
    }

    /// Drop entries whose blob is gone from the layout, or whose build-only
    /// rootfs directory is gone.
    fn prune(&mut self, layout: &OciLayout) -> Result<()> {
        let mut dropped = Vec::new();
        for (name, entry) in &self.cache {
            let alive = match &entry.blob {
                Some(blob) => layout.lookup_manifest_by_descriptor(blob).is_ok(),
                None => self.rootfs_dir.join(&entry.name).exists(),
            };
            if !alive {
                info!(name = %entry.name, "couldn't find cached artifact, pruning it");
                dropped.push(name.clone());
            }
        }

        if !dropped.is_empty() {
            for name in dropped {
                self.cache.remove(&name);
            }
            self.persist()?;
        }
        Ok(())
    }

    fn import_disk_path(&self, layer: &str, import: &str) -> PathBuf {
        let base = Path::new(import)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| import.to_string());
        self.imports_dir.join(layer).join(base)
    }

    fn base_hash(&self, name: &str) -> Option<String> {
        let layer = self.recipe.get(name)?;
        let ImageSource::Built { tag } = layer.from_source().ok()? else {
            return Some(String::new());
        };

        let base_entry = self.lookup(tag)?;
        let encoded = serde_json::to_vec(base_entry).ok()?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Some(format!("{:x}", hasher.finalize()))
    }

    /// Find a still-valid cached build of `name`.
    ///
    /// A hit requires the recorded base fingerprint, layer definition, and
    /// each declared import's kind and content hash to match the present
    /// state. Layers with bind mounts never hit: arbitrary host directories
    /// are not tracked.
    pub fn lookup(&self, name: &str) -> Option<&CacheEntry> {
        let layer = self.recipe.get(name)?;

        if !layer.binds.is_empty() {
            debug!(name, "layer declares binds, skipping cache");
            return None;
        }

        let entry = self.cache.get(name)?;

        if entry.layer != *layer {
            debug!(name, "layer definition changed");
            return None;
        }

        if self.base_hash(name)? != entry.base {
            debug!(name, "base layer changed");
            return None;
        }

        for import in &layer.imports {
            let base = Path::new(import)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| import.clone());

            let cached = entry.imports.get(&base)?;
            let disk = self.import_disk_path(name, import);
            let current = hash_import(&disk).ok()?;

            if cached.kind != current.kind || cached.hash != current.hash {
                debug!(name, import = %base, "import changed");
                return None;
            }
        }

        Some(entry)
    }

    /// Record a successful build of `name`. Fingerprints are computed at
    /// this moment, against what's on disk right now.
    pub fn put(&mut self, name: &str, blob: Option<Descriptor>) -> Result<()> {
        let layer = self
            .recipe
            .get(name)
            .ok_or_else(|| StackerError::RecipeSyntax {
                path: name.to_string(),
                reason: "missing from recipe".to_string(),
            })?
            .clone();

        if !layer.binds.is_empty() {
            debug!(name, "layer declares binds, not recording cache entry");
            return Ok(());
        }

        let base = self.base_hash(name).unwrap_or_default();

        let mut imports = BTreeMap::new();
        for import in &layer.imports {
            let base_name = Path::new(import)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| import.clone());
            let disk = self.import_disk_path(name, import);
            imports.insert(base_name, hash_import(&disk)?);
        }

        self.cache.insert(
            name.to_string(),
            CacheEntry { blob, imports, name: name.to_string(), layer, base },
        );
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let file = CacheFile { version: CACHE_VERSION, cache: self.cache.clone() };
        let content = serde_json::to_vec(&file)
            .map_err(|e| StackerError::Other(anyhow::anyhow!("encoding cache: {}", e)))?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| StackerError::io(dir, e))?;
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StackerError::io(dir, e))?;
        fs::write(tmp.path(), &content).map_err(|e| StackerError::io(tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| StackerError::io(&self.path, e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{Bind, BuildConfig};
    use std::collections::BTreeMap as Map;
    use tempfile::TempDir;

    fn config(root: &Path) -> StackerConfig {
        StackerConfig {
            stacker_dir: root.join(".stacker"),
            oci_dir: root.join("oci"),
            rootfs_dir: root.join("roots"),
        }
    }

    fn recipe(layers: Vec<(&str, LayerDefinition)>) -> Recipe {
        Recipe {
            after_substitutions: String::new(),
            layer_order: layers.iter().map(|(n, _)| n.to_string()).collect(),
            layers: layers.into_iter().map(|(n, l)| (n.to_string(), l)).collect(),
            build_config: BuildConfig::default(),
            path: "test.yaml".to_string(),
            reference_directory: PathBuf::from("/"),
        }
    }

    fn scratch_layer() -> LayerDefinition {
        LayerDefinition { from: Some(ImageSource::Scratch), ..Default::default() }
    }

    fn stage_import(cfg: &StackerConfig, layer: &str, name: &str, content: &str) {
        let dir = cfg.imports_dir().join(layer);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
    }

    fn setup(root: &Path, layers: Vec<(&str, LayerDefinition)>) -> (StackerConfig, OciLayout, Recipe) {
        let cfg = config(root);
        fs::create_dir_all(&cfg.stacker_dir).unwrap();
        fs::create_dir_all(&cfg.rootfs_dir).unwrap();
        let layout = OciLayout::create(&cfg.oci_dir).unwrap();
        (cfg, layout, recipe(layers))
    }

    #[test]
    fn test_lookup_empty_cache_misses() {
        let tmp = TempDir::new().unwrap();
        let (cfg, layout, recipe) = setup(tmp.path(), vec![("a", scratch_layer())]);
        let cache = BuildCache::open(&cfg, &layout, &recipe).unwrap();
        assert!(cache.lookup("a").is_none());
    }

    #[test]
    fn test_put_then_hit() {
        let tmp = TempDir::new().unwrap();
        let (cfg, layout, recipe) = setup(tmp.path(), vec![("a", scratch_layer())]);
        let desc = layout.init_empty("a").unwrap();

        let mut cache = BuildCache::open(&cfg, &layout, &recipe).unwrap();
        cache.put("a", Some(desc.clone())).unwrap();

        let entry = cache.lookup("a").unwrap();
        assert_eq!(entry.blob.as_ref().unwrap().digest(), desc.digest());

        // survives a reopen
        let cache = BuildCache::open(&cfg, &layout, &recipe).unwrap();
        assert!(cache.lookup("a").is_some());
    }

    #[test]
    fn test_put_is_idempotent_on_disk() {
        let tmp = TempDir::new().unwrap();
        let (cfg, layout, recipe) = setup(tmp.path(), vec![("a", scratch_layer())]);
        let desc = layout.init_empty("a").unwrap();

        let mut cache = BuildCache::open(&cfg, &layout, &recipe).unwrap();
        cache.put("a", Some(desc.clone())).unwrap();
        let first = fs::read(cfg.cache_file()).unwrap();
        cache.put("a", Some(desc)).unwrap();
        let second = fs::read(cfg.cache_file()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_import_content_change_invalidates() {
        let tmp = TempDir::new().unwrap();
        let mut layer = scratch_layer();
        layer.imports = vec!["/elsewhere/f.txt".to_string()];
        let (cfg, layout, recipe) = setup(tmp.path(), vec![("a", layer)]);
        let desc = layout.init_empty("a").unwrap();

        stage_import(&cfg, "a", "f.txt", "v1");
        let mut cache = BuildCache::open(&cfg, &layout, &recipe).unwrap();
        cache.put("a", Some(desc)).unwrap();
        assert!(cache.lookup("a").is_some());

        stage_import(&cfg, "a", "f.txt", "v2");
        assert!(cache.lookup("a").is_none());
    }

    #[test]
    fn test_import_kind_change_invalidates() {
        let tmp = TempDir::new().unwrap();
        let mut layer = scratch_layer();
        layer.imports = vec!["/elsewhere/thing".to_string()];
        let (cfg, layout, recipe) = setup(tmp.path(), vec![("a", layer)]);
        let desc = layout.init_empty("a").unwrap();

        stage_import(&cfg, "a", "thing", "file content");
        let mut cache = BuildCache::open(&cfg, &layout, &recipe).unwrap();
        cache.put("a", Some(desc)).unwrap();

        // replace the staged file with a directory of the same name
        let staged = cfg.imports_dir().join("a").join("thing");
        fs::remove_file(&staged).unwrap();
        fs::create_dir(&staged).unwrap();
        assert!(cache.lookup("a").is_none());
    }

    #[test]
    fn test_base_entry_change_invalidates_child() {
        let tmp = TempDir::new().unwrap();
        let mut base = scratch_layer();
        base.imports = vec!["/elsewhere/f.txt".to_string()];
        let child = LayerDefinition {
            from: Some(ImageSource::Built { tag: "base".to_string() }),
            ..Default::default()
        };
        let (cfg, layout, recipe) =
            setup(tmp.path(), vec![("base", base), ("child", child)]);
        let base_desc = layout.init_empty("base").unwrap();
        let child_desc = layout.init_empty("child").unwrap();

        stage_import(&cfg, "base", "f.txt", "v1");
        let mut cache = BuildCache::open(&cfg, &layout, &recipe).unwrap();
        cache.put("base", Some(base_desc.clone())).unwrap();
        cache.put("child", Some(child_desc.clone())).unwrap();
        assert!(cache.lookup("child").is_some());

        // the base's import changes: base misses, and so must the child,
        // even though the child's own fields didn't move
        stage_import(&cfg, "base", "f.txt", "v2");
        assert!(cache.lookup("base").is_none());
        assert!(cache.lookup("child").is_none());

        // rebuild the base: its entry hash changes, so the child still
        // misses until it is rebuilt too
        cache.put("base", Some(base_desc)).unwrap();
        assert!(cache.lookup("base").is_some());
        assert!(cache.lookup("child").is_none());
    }

    #[test]
    fn test_layer_definition_change_invalidates() {
        let tmp = TempDir::new().unwrap();
        let (cfg, layout, recipe) = setup(tmp.path(), vec![("a", scratch_layer())]);
        let desc = layout.init_empty("a").unwrap();

        let mut cache = BuildCache::open(&cfg, &layout, &recipe).unwrap();
        cache.put("a", Some(desc)).unwrap();
        assert!(cache.lookup("a").is_some());

        // same name, edited run script
        let mut edited = scratch_layer();
        edited.run = vec!["touch /x".to_string()];
        let recipe2 = {
            let mut r = recipe.clone();
            r.layers.insert("a".to_string(), edited);
            r
        };
        let cache = BuildCache {
            path: cfg.cache_file(),
            imports_dir: cfg.imports_dir(),
            rootfs_dir: cfg.rootfs_dir.clone(),
            recipe: recipe2,
            cache: cache.cache.clone(),
        };
        assert!(cache.lookup("a").is_none());
    }

    #[test]
    fn test_binds_force_miss() {
        let tmp = TempDir::new().unwrap();
        let mut layer = scratch_layer();
        layer.binds = vec![Bind { source: PathBuf::from("/host"), target: "/host".into() }];
        let (cfg, layout, recipe) = setup(tmp.path(), vec![("a", layer)]);

        let mut cache = BuildCache::open(&cfg, &layout, &recipe).unwrap();
        cache.put("a", None).unwrap();
        assert!(cache.lookup("a").is_none());
    }

    #[test]
    fn test_version_mismatch_wipes() {
        let tmp = TempDir::new().unwrap();
        let (cfg, layout, recipe) = setup(tmp.path(), vec![("a", scratch_layer())]);

        fs::write(
            cfg.cache_file(),
            serde_json::to_vec(&CacheFile {
                version: CACHE_VERSION + 1,
                cache: {
                    let mut m = Map::new();
                    m.insert(
                        "a".to_string(),
                        CacheEntry {
                            blob: None,
                            imports: Map::new(),
                            name: "a".to_string(),
                            layer: scratch_layer(),
                            base: String::new(),
                        },
                    );
                    m
                },
            })
            .unwrap(),
        )
        .unwrap();

        let cache = BuildCache::open(&cfg, &layout, &recipe).unwrap();
        assert!(cache.lookup("a").is_none());
        assert!(!cfg.cache_file().exists());
    }

    #[test]
    fn test_prune_drops_missing_blob() {
        let tmp = TempDir::new().unwrap();
        let (cfg, layout, recipe) = setup(tmp.path(), vec![("a", scratch_layer())]);
        let desc = layout.init_empty("a").unwrap();

        let mut cache = BuildCache::open(&cfg, &layout, &recipe).unwrap();
        cache.put("a", Some(desc)).unwrap();

        // blow the layout away and reopen: the entry's blob is gone
        fs::remove_dir_all(&cfg.oci_dir).unwrap();
        let layout = OciLayout::create(&cfg.oci_dir).unwrap();
        let cache = BuildCache::open(&cfg, &layout, &recipe).unwrap();
        assert!(cache.lookup("a").is_none());
    }

    #[test]
    fn test_build_only_entry_checks_rootfs_dir() {
        let tmp = TempDir::new().unwrap();
        let mut layer = scratch_layer();
        layer.build_only = true;
        let (cfg, layout, recipe) = setup(tmp.path(), vec![("a", layer)]);

        fs::create_dir_all(cfg.rootfs_path("a")).unwrap();
        let mut cache = BuildCache::open(&cfg, &layout, &recipe).unwrap();
        cache.put("a", None).unwrap();
        assert!(cache.lookup("a").is_some());

        // rootfs disappears: pruned on next open
        fs::remove_dir_all(cfg.rootfs_path("a")).unwrap();
        let cache = BuildCache::open(&cfg, &layout, &recipe).unwrap();
        assert!(cache.lookup("a").is_none());
    }
}
