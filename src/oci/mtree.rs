//! Filesystem manifests.
//!
//! A walk of a rootfs produces one entry per path recording type, uid, gid,
//! mode, xattrs, content hash and link target. Modification times are
//! deliberately not recorded: two extractions of the same layer bits must
//! produce equal manifests. The canonical text encoding is what the build
//! cache hashes for directory imports and what repack diffs against.

use crate::error::{Result, StackerError};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use walkdir::WalkDir;

/// What kind of filesystem object an entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Char,
    Block,
    Fifo,
    Socket,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Dir => "dir",
            EntryKind::Symlink => "link",
            EntryKind::Char => "char",
            EntryKind::Block => "block",
            EntryKind::Fifo => "fifo",
            EntryKind::Socket => "socket",
        }
    }

    fn parse(s: &str) -> Result<EntryKind> {
        Ok(match s {
            "file" => EntryKind::File,
            "dir" => EntryKind::Dir,
            "link" => EntryKind::Symlink,
            "char" => EntryKind::Char,
            "block" => EntryKind::Block,
            "fifo" => EntryKind::Fifo,
            "socket" => EntryKind::Socket,
            other => {
                return Err(StackerError::LayerAssembly {
                    reason: format!("unknown manifest entry kind {}", other),
                })
            }
        })
    }
}

/// One filesystem object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// Path relative to the walk root, `/`-separated, no leading `./`.
    pub path: String,
    pub kind: EntryKind,
    pub uid: u32,
    pub gid: u32,
    /// Permission bits (no file type bits).
    pub mode: u32,
    /// Extended attributes, values base64-encoded.
    pub xattrs: BTreeMap<String, String>,
    /// Content hash, regular files only.
    pub sha256: Option<String>,
    /// Symlink target.
    pub link: Option<String>,
    /// Device major/minor, char and block entries only.
    pub device: Option<(u64, u64)>,
}

/// A whole-tree manifest, ordered by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsManifest {
    pub entries: BTreeMap<String, FsEntry>,
}

/// A difference between two manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub path: String,
    pub kind: DiffKind,
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push_str("%20"),
            '\n' => out.push_str("%0A"),
            '%' => out.push_str("%25"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    s.replace("%20", " ").replace("%0A", "\n").replace("%25", "%")
}

impl FsEntry {
    fn encode(&self) -> String {
        let mut fields = vec![
            escape(&self.path),
            format!("type={}", self.kind.as_str()),
            format!("uid={}", self.uid),
            format!("gid={}", self.gid),
            format!("mode={:o}", self.mode),
        ];
        if let Some(sha) = &self.sha256 {
            fields.push(format!("sha256={}", sha));
        }
        if let Some(link) = &self.link {
            fields.push(format!("link={}", escape(link)));
        }
        if let Some((major, minor)) = self.device {
            fields.push(format!("device={},{}", major, minor));
        }
        for (k, v) in &self.xattrs {
            fields.push(format!("xattr.{}={}", escape(k), v));
        }
        fields.join(" ")
    }

    fn parse(line: &str) -> Result<FsEntry> {
        let bad = |reason: String| StackerError::LayerAssembly { reason };
        let mut parts = line.split(' ');
        let path = unescape(
            parts.next().ok_or_else(|| bad(format!("empty manifest line: {}", line)))?,
        );

        let mut entry = FsEntry {
            path,
            kind: EntryKind::File,
            uid: 0,
            gid: 0,
            mode: 0,
            xattrs: BTreeMap::new(),
            sha256: None,
            link: None,
            device: None,
        };

        for field in parts {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| bad(format!("bad manifest field {}", field)))?;
            match key {
                "type" => entry.kind = EntryKind::parse(value)?,
                "uid" => entry.uid = value.parse().map_err(|_| bad(format!("bad uid {}", value)))?,
                "gid" => entry.gid = value.parse().map_err(|_| bad(format!("bad gid {}", value)))?,
                "mode" => {
                    entry.mode = u32::from_str_radix(value, 8)
                        .map_err(|_| bad(format!("bad mode {}", value)))?
                }
                "sha256" => entry.sha256 = Some(value.to_string()),
                "link" => entry.link = Some(unescape(value)),
                "device" => {
                    let (major, minor) = value
                        .split_once(',')
                        .ok_or_else(|| bad(format!("bad device {}", value)))?;
                    entry.device = Some((
                        major.parse().map_err(|_| bad(format!("bad device {}", value)))?,
                        minor.parse().map_err(|_| bad(format!("bad device {}", value)))?,
                    ));
                }
                k if k.starts_with("xattr.") => {
                    entry
                        .xattrs
                        .insert(unescape(&k["xattr.".len()..]), value.to_string());
                }
                other => return Err(bad(format!("unknown manifest field {}", other))),
            }
        }

        Ok(entry)
    }
}

fn hash_file(path: &Path) -> Result<String> {
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

fn read_xattrs(path: &Path) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    // unsupported filesystems just yield no attributes
    let Ok(names) = xattr::list(path) else {
        return out;
    };
    for name in names {
        if let Ok(Some(value)) = xattr::get(path, &name) {
            out.insert(
                name.to_string_lossy().into_owned(),
                base64::engine::general_purpose::STANDARD.encode(value),
            );
        }
    }
    out
}

impl FsManifest {
    /// Walk `root` and record every object beneath it. The root itself is
    /// not recorded; bind-mount scaffolding dirties its mtime and mode in
    /// ways that carry no layer content.
    pub fn walk(root: &Path) -> Result<FsManifest> {
        let mut entries = BTreeMap::new();

        for item in WalkDir::new(root).follow_links(false).min_depth(1) {
            let item = item.map_err(|e| StackerError::LayerAssembly {
                reason: format!("walking {}: {}", root.display(), e),
            })?;

            let rel = item
                .path()
                .strip_prefix(root)
                .expect("walkdir yields children of root")
                .to_string_lossy()
                .into_owned();

            let meta = item
                .path()
                .symlink_metadata()
                .map_err(|e| StackerError::io(item.path(), e))?;
            let ft = meta.file_type();

            let kind = if ft.is_dir() {
                EntryKind::Dir
            } else if ft.is_symlink() {
                EntryKind::Symlink
            } else if ft.is_char_device() {
                EntryKind::Char
            } else if ft.is_block_device() {
                EntryKind::Block
            } else if ft.is_fifo() {
                EntryKind::Fifo
            } else if ft.is_socket() {
                EntryKind::Socket
            } else {
                EntryKind::File
            };

            let sha256 = match kind {
                EntryKind::File => Some(hash_file(item.path())?),
                _ => None,
            };

            let link = match kind {
                EntryKind::Symlink => Some(
                    std::fs::read_link(item.path())
                        .map_err(|e| StackerError::io(item.path(), e))?
                        .to_string_lossy()
                        .into_owned(),
                ),
                _ => None,
            };

            let device = match kind {
                EntryKind::Char | EntryKind::Block => {
                    let rdev = meta.rdev();
                    Some((nix::sys::stat::major(rdev), nix::sys::stat::minor(rdev)))
                }
                _ => None,
            };

            let entry = FsEntry {
                path: rel.clone(),
                kind,
                uid: meta.uid(),
                gid: meta.gid(),
                mode: meta.mode() & 0o7777,
                xattrs: read_xattrs(item.path()),
                sha256,
                link,
                device,
            };

            entries.insert(rel, entry);
        }

        Ok(FsManifest { entries })
    }

    /// Canonical text form, one line per entry, path-ordered.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for entry in self.entries.values() {
            out.push_str(&entry.encode());
            out.push('\n');
        }
        out
    }

    pub fn parse(content: &str) -> Result<FsManifest> {
        let mut entries = BTreeMap::new();
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }
            let entry = FsEntry::parse(line)?;
            entries.insert(entry.path.clone(), entry);
        }
        Ok(FsManifest { entries })
    }

    /// Paths that changed from `self` to `newer`.
    pub fn diff(&self, newer: &FsManifest) -> Vec<DiffEntry> {
        let mut out = Vec::new();

        for (path, entry) in &newer.entries {
            match self.entries.get(path) {
                None => out.push(DiffEntry { path: path.clone(), kind: DiffKind::Added }),
                Some(old) if old != entry => {
                    out.push(DiffEntry { path: path.clone(), kind: DiffKind::Modified })
                }
                Some(_) => {}
            }
        }

        for path in self.entries.keys() {
            if !newer.entries.contains_key(path) {
                out.push(DiffEntry { path: path.clone(), kind: DiffKind::Removed });
            }
        }

        out
    }

    /// Paths identical in both manifests; the squashfs exclude list.
    pub fn unchanged(&self, newer: &FsManifest) -> Vec<String> {
        newer
            .entries
            .iter()
            .filter(|(path, entry)| self.entries.get(*path) == Some(*entry))
            .map(|(path, _)| path.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, content).unwrap();
    }

    #[test]
    fn test_walk_records_files_and_dirs() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "etc/hosts", "127.0.0.1\n");

        let manifest = FsManifest::walk(tmp.path()).unwrap();
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.entries["etc"].kind, EntryKind::Dir);
        let hosts = &manifest.entries["etc/hosts"];
        assert_eq!(hosts.kind, EntryKind::File);
        assert!(hosts.sha256.is_some());
    }

    #[test]
    fn test_encode_parse_roundtrip() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a file with spaces", "x");
        write(tmp.path(), "dir/nested", "y");
        std::os::unix::fs::symlink("nested", tmp.path().join("dir/alias")).unwrap();

        let manifest = FsManifest::walk(tmp.path()).unwrap();
        let parsed = FsManifest::parse(&manifest.encode()).unwrap();
        assert_eq!(manifest, parsed);
    }

    #[test]
    fn test_mtime_changes_do_not_change_manifest() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "f", "same content");

        let before = FsManifest::walk(tmp.path()).unwrap();
        // rewrite identical bytes; mtime moves, content does not
        write(tmp.path(), "f", "same content");
        let after = FsManifest::walk(tmp.path()).unwrap();

        assert_eq!(before.encode(), after.encode());
    }

    #[test]
    fn test_diff_classifies() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "keep", "same");
        write(tmp.path(), "change", "v1");
        write(tmp.path(), "remove", "bye");
        let old = FsManifest::walk(tmp.path()).unwrap();

        write(tmp.path(), "change", "v2");
        write(tmp.path(), "add", "new");
        fs::remove_file(tmp.path().join("remove")).unwrap();
        let new = FsManifest::walk(tmp.path()).unwrap();

        let diff = old.diff(&new);
        let find = |p: &str| diff.iter().find(|d| d.path == p).map(|d| d.kind.clone());
        assert_eq!(find("add"), Some(DiffKind::Added));
        assert_eq!(find("change"), Some(DiffKind::Modified));
        assert_eq!(find("remove"), Some(DiffKind::Removed));
        assert_eq!(find("keep"), None);

        let unchanged = old.unchanged(&new);
        assert!(unchanged.contains(&"keep".to_string()));
        assert!(!unchanged.contains(&"change".to_string()));
    }

    #[test]
    fn test_symlink_target_recorded() {
        let tmp = TempDir::new().unwrap();
        std::os::unix::fs::symlink("/somewhere", tmp.path().join("ln")).unwrap();

        let manifest = FsManifest::walk(tmp.path()).unwrap();
        let entry = &manifest.entries["ln"];
        assert_eq!(entry.kind, EntryKind::Symlink);
        assert_eq!(entry.link.as_deref(), Some("/somewhere"));
    }
}
