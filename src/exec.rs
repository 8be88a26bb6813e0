//! Container execution and image transport interfaces.
//!
//! The build core does not launch containers or talk to registries itself;
//! it drives these two traits. The executor is expected to run the given
//! command inside the prepared rootfs with private mounts, no named
//! network, the caller's binds and environment, an id-map when running
//! unprivileged, and signal forwarding (SIGINT upgraded to SIGKILL for the
//! target); the copier moves images between transport URLs.

use crate::error::{Result, StackerError};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A sane `PATH` for images that never set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Host variables passed through to builds that don't declare their own
/// pass-through list.
const DEFAULT_ENV_PASSTHROUGH: &[&str] = &[
    "ftp_proxy",
    "http_proxy",
    "https_proxy",
    "no_proxy",
    "FTP_PROXY",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "TERM",
];

/// A bind mount for a container run.
#[derive(Debug, Clone)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything the executor needs for one in-container run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Rootfs name, for logs and container naming.
    pub name: String,
    /// The directory to use as the container's root.
    pub rootfs: PathBuf,
    /// Command to execute inside the container.
    pub command: String,
    pub binds: Vec<BindMount>,
    pub env: BTreeMap<String, String>,
}

/// The external container launcher.
pub trait ContainerExecutor {
    /// Run the command, returning the process exit status.
    fn run(&self, spec: &RunSpec) -> Result<i32>;
}

/// The external image-transport copier. `src` and `dest` are transport
/// URLs (`docker://…`, `oci:dir:tag`, `zot://…`).
pub trait ImageCopier {
    fn copy(&self, src: &str, dest: &str, insecure: bool) -> Result<()>;
}

/// Filter `env` down to the keys matching any of the given regexes
/// (anchored on both ends).
pub fn filter_env(
    match_list: &[String],
    env: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut matchers = Vec::with_capacity(match_list.len());
    for pattern in match_list {
        let re = Regex::new(&format!("^{}$", pattern)).map_err(|e| StackerError::RecipeSyntax {
            path: pattern.clone(),
            reason: format!("bad build_env_passthrough pattern: {}", e),
        })?;
        matchers.push(re);
    }

    Ok(env
        .iter()
        .filter(|(key, _)| matchers.iter().any(|re| re.is_match(key)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect())
}

/// The environment for a build container: host environment filtered by the
/// pass-through list (or the proxy/TERM defaults), overlaid with the
/// layer's explicit build environment.
pub fn build_env(
    passthrough: &[String],
    build_env: &BTreeMap<String, String>,
    host_env: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let defaults: Vec<String> =
        DEFAULT_ENV_PASSTHROUGH.iter().map(|s| s.to_string()).collect();
    let match_list = if passthrough.is_empty() { &defaults } else { passthrough };

    let mut env = filter_env(match_list, host_env)?;
    for (k, v) in build_env {
        env.insert(k.clone(), v.clone());
    }
    Ok(env)
}

/// Snapshot of the process environment as a map.
pub fn host_env() -> BTreeMap<String, String> {
    std::env::vars().collect()
}
