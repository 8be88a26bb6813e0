//! VCS version strings for recipe directories.

use crate::error::Result;
use anyhow::anyhow;
use std::path::Path;
use std::process::Command;
use tracing::debug;

fn git(path: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(path)
        .args(args)
        .env("GIT_DISCOVERY_ACROSS_FILESYSTEM", "true")
        .output()
        .map_err(|e| crate::error::StackerError::io(path, e))?;

    if !output.status.success() {
        return Err(anyhow!(
            "git {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// A version string like `git describe --tags` produces, with `-dirty`
/// appended when the tree has local changes, falling back to the bare
/// commit hash when no tag is reachable. Errors mean "not a git
/// directory"; callers fall back to embedding the recipe text instead.
pub fn git_version(path: &Path) -> Result<String> {
    let vers = match git(path, &["describe", "--tags"]) {
        Ok(v) => v,
        Err(_) => {
            debug!("'git describe --tags' failed, falling back to hash");
            git(path, &["rev-parse", "HEAD"])?
        }
    };

    let status = git(path, &["status", "--porcelain", "--untracked-files=no"])?;
    if status.is_empty() {
        Ok(vers)
    } else {
        Ok(format!("{}-dirty", vers))
    }
}
