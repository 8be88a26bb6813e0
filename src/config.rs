//! Global build configuration and the on-disk directory layout.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Widely used stacker configuration: where build state, the output OCI
/// layout, and the rootfs trees live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackerConfig {
    /// Directory for build state (cache, imports, layer-bases).
    pub stacker_dir: PathBuf,
    /// Output OCI layout directory.
    pub oci_dir: PathBuf,
    /// Directory under which rootfs trees are materialized.
    pub rootfs_dir: PathBuf,
}

impl StackerConfig {
    /// Built-in substitutions every recipe sees, so recipes can refer to the
    /// configured directories without hardcoding them.
    pub fn substitutions(&self) -> Vec<String> {
        vec![
            format!("STACKER_ROOTFS_DIR={}", self.rootfs_dir.display()),
            format!("STACKER_STACKER_DIR={}", self.stacker_dir.display()),
            format!("STACKER_OCI_DIR={}", self.oci_dir.display()),
        ]
    }

    /// Path of the persistent build cache file.
    pub fn cache_file(&self) -> PathBuf {
        self.stacker_dir.join("build.cache")
    }

    /// Directory holding staged imports, one subdirectory per layer.
    pub fn imports_dir(&self) -> PathBuf {
        self.stacker_dir.join("imports")
    }

    /// Cache directory for tarball bases.
    pub fn layer_bases(&self) -> PathBuf {
        self.stacker_dir.join("layer-bases")
    }

    /// The base-image OCI layout the external copier populates.
    pub fn base_oci_dir(&self) -> PathBuf {
        self.stacker_dir.join("layer-bases").join("oci")
    }

    /// Path of a named rootfs under the roots directory.
    pub fn rootfs_path(&self, name: &str) -> PathBuf {
        self.rootfs_dir.join(name)
    }
}
