//! Import staging.
//!
//! Each layer's declared imports are materialized under
//! `imports/<layer>/<basename>` before the cache is consulted, so the cache
//! compares against exactly what the build will see. Sources are plain
//! paths, HTTP(S) URLs (re-verified by content hash on re-runs), and
//! `stacker://<layer>/<path>` reads from a sibling layer's built rootfs.
//! Entries whose source is no longer declared are cleaned first; the stager
//! never writes outside its per-layer directory.

use crate::cache::hash_file;
use crate::config::StackerConfig;
use crate::error::{Result, StackerError};
use crate::recipe::DockerishUrl;
use crate::storage::Storage;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Stage every import for `layer_name`.
pub fn import_layer(
    config: &StackerConfig,
    storage: &dyn Storage,
    layer_name: &str,
    imports: &[String],
) -> Result<()> {
    let dir = config.imports_dir().join(layer_name);
    fs::create_dir_all(&dir).map_err(|e| StackerError::io(&dir, e))?;

    let expected: HashSet<String> = imports.iter().map(|i| basename(i)).collect();

    // drop leftovers from previously declared imports; dotfiles are ours
    // (the staged run script lives here)
    for entry in fs::read_dir(&dir).map_err(|e| StackerError::io(&dir, e))? {
        let entry = entry.map_err(|e| StackerError::io(&dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || expected.contains(&name) {
            continue;
        }
        debug!(layer = layer_name, stale = %name, "removing stale import");
        let p = entry.path();
        if p.is_dir() {
            fs::remove_dir_all(&p).map_err(|e| StackerError::io(&p, e))?;
        } else {
            fs::remove_file(&p).map_err(|e| StackerError::io(&p, e))?;
        }
    }

    for import in imports {
        let dest = dir.join(basename(import));
        let url = DockerishUrl::parse(import);

        match url.scheme.as_str() {
            "http" | "https" => download(import, &dest)?,
            "stacker" => {
                let source = storage
                    .rootfs_path(&url.host)
                    .join(url.path.trim_start_matches('/'));
                copy_path(&source, &dest)?;
            }
            "" => copy_path(Path::new(import), &dest)?,
            other => {
                return Err(StackerError::RecipeSyntax {
                    path: import.clone(),
                    reason: format!("unknown import scheme {}", other),
                })
            }
        }
    }

    Ok(())
}

fn basename(import: &str) -> String {
    let trimmed = import.trim_end_matches('/');
    Path::new(trimmed)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| trimmed.to_string())
}

/// Fetch a URL to `dest`. When `dest` already exists, the download still
/// happens, but the file is only replaced if its content hash moved, so
/// downstream cache checks see a stable artifact.
fn download(url: &str, dest: &Path) -> Result<()> {
    let fetch_err = |reason: String| StackerError::NetworkFetch { url: url.to_string(), reason };

    let resp = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .map_err(|e| fetch_err(e.to_string()))?;
    let content = resp.bytes().map_err(|e| fetch_err(e.to_string()))?;

    if dest.exists() {
        let mut hasher = Sha256::new();
        hasher.update(&content);
        let new_hash = format!("{:x}", hasher.finalize());
        if hash_file(dest)? == new_hash {
            debug!(url, "import unchanged");
            return Ok(());
        }
        info!(url, "import content changed, refreshing");
    }

    fs::write(dest, &content).map_err(|e| StackerError::io(dest, e))?;
    Ok(())
}

/// Copy a file or directory tree into the staging directory, replacing any
/// previous artifact of the same name.
fn copy_path(source: &Path, dest: &Path) -> Result<()> {
    let meta = source.symlink_metadata().map_err(|e| StackerError::io(source, e))?;

    if dest.exists() {
        if dest.is_dir() {
            fs::remove_dir_all(dest).map_err(|e| StackerError::io(dest, e))?;
        } else {
            fs::remove_file(dest).map_err(|e| StackerError::io(dest, e))?;
        }
    }

    if meta.is_dir() {
        copy_dir(source, dest)
    } else {
        fs::copy(source, dest).map_err(|e| StackerError::io(source, e))?;
        Ok(())
    }
}

/// Copy a whole directory tree, preserving symlinks.
pub(crate) fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    copy_dir(source, dest)
}

fn copy_dir(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| StackerError::io(dest, e))?;

    for entry in fs::read_dir(source).map_err(|e| StackerError::io(source, e))? {
        let entry = entry.map_err(|e| StackerError::io(source, e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let meta = from.symlink_metadata().map_err(|e| StackerError::io(&from, e))?;

        if meta.is_dir() {
            copy_dir(&from, &to)?;
        } else if meta.file_type().is_symlink() {
            let target = fs::read_link(&from).map_err(|e| StackerError::io(&from, e))?;
            std::os::unix::fs::symlink(&target, &to).map_err(|e| StackerError::io(&to, e))?;
        } else {
            fs::copy(&from, &to).map_err(|e| StackerError::io(&from, e))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{LayerType, OciLayout};
    use crate::storage::TempSnapshot;
    use oci_spec::image::{Descriptor, ImageManifest};
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct FakeStorage {
        roots: PathBuf,
    }

    impl Storage for FakeStorage {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn create(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn snapshot(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn restore(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn delete(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn exists(&self, _: &str) -> bool {
            false
        }
        fn finalize(&self, _: &str) -> Result<()> {
            Ok(())
        }
        fn temporary_writable(&self, _: &str) -> Result<TempSnapshot<'_>> {
            unimplemented!()
        }
        fn detach(&self) -> Result<()> {
            Ok(())
        }
        fn gc(&self, _: &OciLayout, _: &OciLayout) -> Result<()> {
            Ok(())
        }
        fn unpack(&self, _: &OciLayout, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn repack(&self, _: &OciLayout, _: &str, _: &str, _: LayerType) -> Result<Descriptor> {
            unimplemented!()
        }
        fn update_fs_metadata(&self, _: &str, _: &Descriptor, _: &ImageManifest) -> Result<()> {
            Ok(())
        }
        fn rootfs_path(&self, name: &str) -> PathBuf {
            self.roots.join(name).join("rootfs")
        }
        fn bundle_path(&self, name: &str) -> PathBuf {
            self.roots.join(name)
        }
    }

    fn setup(root: &Path) -> (StackerConfig, FakeStorage) {
        let config = StackerConfig {
            stacker_dir: root.join(".stacker"),
            oci_dir: root.join("oci"),
            rootfs_dir: root.join("roots"),
        };
        (config, FakeStorage { roots: root.join("roots") })
    }

    #[test]
    fn test_stage_local_file() {
        let tmp = TempDir::new().unwrap();
        let (config, storage) = setup(tmp.path());
        let src = tmp.path().join("data.txt");
        fs::write(&src, "payload").unwrap();

        import_layer(&config, &storage, "web", &[src.to_string_lossy().into_owned()]).unwrap();

        let staged = config.imports_dir().join("web/data.txt");
        assert_eq!(fs::read_to_string(staged).unwrap(), "payload");
    }

    #[test]
    fn test_stage_local_directory_recursively() {
        let tmp = TempDir::new().unwrap();
        let (config, storage) = setup(tmp.path());
        let src = tmp.path().join("tree");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("sub/inner.txt"), "deep").unwrap();
        std::os::unix::fs::symlink("sub/inner.txt", src.join("alias")).unwrap();

        import_layer(&config, &storage, "web", &[src.to_string_lossy().into_owned()]).unwrap();

        let staged = config.imports_dir().join("web/tree");
        assert_eq!(fs::read_to_string(staged.join("sub/inner.txt")).unwrap(), "deep");
        assert!(staged.join("alias").symlink_metadata().unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_stacker_scheme_reads_sibling_rootfs() {
        let tmp = TempDir::new().unwrap();
        let (config, storage) = setup(tmp.path());
        let sibling = storage.rootfs_path("builder").join("out");
        fs::create_dir_all(sibling.parent().unwrap()).unwrap();
        fs::write(&sibling, "built artifact").unwrap();

        import_layer(&config, &storage, "consumer", &["stacker://builder/out".to_string()])
            .unwrap();

        let staged = config.imports_dir().join("consumer/out");
        assert_eq!(fs::read_to_string(staged).unwrap(), "built artifact");
    }

    #[test]
    fn test_stale_entries_cleaned() {
        let tmp = TempDir::new().unwrap();
        let (config, storage) = setup(tmp.path());
        let dir = config.imports_dir().join("web");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stale.txt"), "old").unwrap();
        fs::write(dir.join(".stacker-run.sh"), "#!/bin/sh").unwrap();

        let src = tmp.path().join("fresh.txt");
        fs::write(&src, "new").unwrap();
        import_layer(&config, &storage, "web", &[src.to_string_lossy().into_owned()]).unwrap();

        assert!(!dir.join("stale.txt").exists());
        assert!(dir.join("fresh.txt").exists());
        // dotfiles survive the sweep
        assert!(dir.join(".stacker-run.sh").exists());
    }

    #[test]
    fn test_restage_replaces_content() {
        let tmp = TempDir::new().unwrap();
        let (config, storage) = setup(tmp.path());
        let src = tmp.path().join("f.txt");

        fs::write(&src, "v1").unwrap();
        import_layer(&config, &storage, "web", &[src.to_string_lossy().into_owned()]).unwrap();
        fs::write(&src, "v2").unwrap();
        import_layer(&config, &storage, "web", &[src.to_string_lossy().into_owned()]).unwrap();

        let staged = config.imports_dir().join("web/f.txt");
        assert_eq!(fs::read_to_string(staged).unwrap(), "v2");
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        let tmp = TempDir::new().unwrap();
        let (config, storage) = setup(tmp.path());
        let err =
            import_layer(&config, &storage, "web", &["ftp://host/file".to_string()]).unwrap_err();
        assert!(err.to_string().contains("unknown import scheme"));
    }
}
