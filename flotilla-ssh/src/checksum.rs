//! Content manifests used to make copies convergent
//!
//! The local side is hashed in-process; the remote side is hashed with a
//! single `sha256sum` invocation. Only files whose digest differs (or that
//! are missing remotely) are uploaded. Symlinks are never followed; they are
//! recreated on the remote side with `ln -s`.

use flotilla_core::infra_driver::shell_quote;
use flotilla_core::{FlotillaError, FlotillaResult};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Relative path to lowercase hex SHA-256. A single-file copy is keyed by
/// the empty path.
pub type Manifest = BTreeMap<PathBuf, String>;

/// What a local source looks like on disk
#[derive(Debug, Default)]
pub struct LocalTree {
    pub is_dir: bool,
    pub files: Manifest,
    /// Relative directories, parents first. Empty for a single file.
    pub dirs: Vec<PathBuf>,
    /// Relative symlink path to the link target as stored on disk. A source
    /// that is itself a link is keyed by the empty path.
    pub links: BTreeMap<PathBuf, PathBuf>,
}

impl LocalTree {
    pub fn scan(source: &Path) -> FlotillaResult<Self> {
        let metadata =
            std::fs::symlink_metadata(source).map_err(|e| io_context(e, "stat", source))?;

        if metadata.file_type().is_symlink() {
            let target =
                std::fs::read_link(source).map_err(|e| io_context(e, "read link", source))?;
            return Ok(Self {
                links: BTreeMap::from([(PathBuf::new(), target)]),
                ..Default::default()
            });
        }

        if !metadata.is_dir() {
            let mut files = Manifest::new();
            files.insert(PathBuf::new(), digest_file(source)?);
            return Ok(Self {
                is_dir: false,
                files,
                ..Default::default()
            });
        }

        let mut tree = Self {
            is_dir: true,
            ..Default::default()
        };
        for entry in WalkDir::new(source).sort_by_file_name() {
            let entry = entry.map_err(|e| FlotillaError::Io(io::Error::other(e)))?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| FlotillaError::Internal {
                    message: format!("walked outside {:?}: {}", source, e),
                })?
                .to_path_buf();

            if entry.path_is_symlink() {
                let target = std::fs::read_link(entry.path())
                    .map_err(|e| io_context(e, "read link", entry.path()))?;
                tree.links.insert(relative, target);
            } else if entry.file_type().is_dir() {
                tree.dirs.push(relative);
            } else {
                tree.files.insert(relative, digest_file(entry.path())?);
            }
        }
        Ok(tree)
    }

    /// Remote location of a manifest entry under `remote_root`.
    pub fn remote_path(&self, remote_root: &Path, relative: &Path) -> PathBuf {
        if relative.as_os_str().is_empty() {
            remote_root.to_path_buf()
        } else {
            remote_root.join(relative)
        }
    }
}

fn io_context(e: io::Error, action: &str, path: &Path) -> FlotillaError {
    FlotillaError::Io(io::Error::new(
        e.kind(),
        format!("failed to {} {:?}: {}", action, path, e),
    ))
}

pub fn digest_file(path: &Path) -> FlotillaResult<String> {
    let mut file = File::open(path).map_err(|e| io_context(e, "open", path))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Command that prints the remote manifest of `remote` in `sha256sum`
/// format. A missing target prints nothing.
pub fn remote_manifest_command(remote: &Path, is_dir: bool) -> String {
    let target = shell_quote(&remote.to_string_lossy());
    if is_dir {
        format!(
            "if [ -d {0} ]; then cd {0} && find . -type f -exec sha256sum {{}} +; fi",
            target
        )
    } else {
        format!("if [ -f {0} ]; then sha256sum {0}; fi", target)
    }
}

/// Parse `sha256sum` output produced by [`remote_manifest_command`].
pub fn parse_remote_manifest(output: &str, is_dir: bool) -> Manifest {
    let mut manifest = Manifest::new();
    for line in output.lines() {
        // A name holding a backslash or newline is escaped and the line starts with a backslash
        let (escaped, line) = match line.strip_prefix('\\') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let Some((digest, rest)) = line.split_once(' ') else {
            continue;
        };
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            continue;
        }
        // Second column separator is ' ' (text mode) or '*' (binary mode)
        let path = rest.strip_prefix([' ', '*']).unwrap_or(rest);
        let key = if is_dir {
            let path = if escaped { unescape_name(path) } else { path.to_string() };
            PathBuf::from(path.strip_prefix("./").unwrap_or(&path))
        } else {
            PathBuf::new()
        };
        manifest.insert(key, digest.to_ascii_lowercase());
    }
    manifest
}

/// Reverse `sha256sum` name escaping: `\\` is a backslash, `\n` a newline.
fn unescape_name(name: &str) -> String {
    let mut unescaped = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            unescaped.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => unescaped.push('\n'),
            Some('r') => unescaped.push('\r'),
            Some(other) => unescaped.push(other),
            None => unescaped.push('\\'),
        }
    }
    unescaped
}

/// One shell command that replaces every link under `remote_root` with the
/// local link. `rm -rf` on a link removes the link, not its target.
pub fn link_command(remote_root: &Path, links: &BTreeMap<PathBuf, PathBuf>) -> Option<String> {
    if links.is_empty() {
        return None;
    }
    let steps: Vec<String> = links
        .iter()
        .map(|(relative, target)| {
            let path = if relative.as_os_str().is_empty() {
                remote_root.to_path_buf()
            } else {
                remote_root.join(relative)
            };
            let path = shell_quote(&path.to_string_lossy());
            format!(
                "rm -rf {0} && ln -s {1} {0}",
                path,
                shell_quote(&target.to_string_lossy())
            )
        })
        .collect();
    Some(steps.join(" && "))
}

/// Local entries that are missing or differ remotely, in path order.
pub fn pending_uploads<'a>(local: &'a Manifest, remote: &Manifest) -> Vec<&'a Path> {
    local
        .iter()
        .filter(|(path, digest)| remote.get(*path) != Some(*digest))
        .map(|(path, _)| path.as_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const EMPTY_SHA: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_scan_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("etc/cni")).unwrap();
        std::fs::write(dir.path().join("etc/cni/empty"), "").unwrap();
        std::fs::create_dir(dir.path().join("bin")).unwrap();

        let tree = LocalTree::scan(dir.path()).unwrap();
        assert!(tree.is_dir);
        assert_eq!(tree.files.get(Path::new("etc/cni/empty")).unwrap(), EMPTY_SHA);
        assert_eq!(
            tree.dirs,
            vec![
                PathBuf::new(),
                PathBuf::from("bin"),
                PathBuf::from("etc"),
                PathBuf::from("etc/cni")
            ]
        );
    }

    #[test]
    fn test_scan_single_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("Kubefile");
        std::fs::write(&file, "").unwrap();

        let tree = LocalTree::scan(&file).unwrap();
        assert!(!tree.is_dir);
        assert_eq!(tree.files.get(Path::new("")).unwrap(), EMPTY_SHA);
        assert_eq!(
            tree.remote_path(Path::new("/rootfs/Kubefile"), Path::new("")),
            PathBuf::from("/rootfs/Kubefile")
        );
    }

    #[test]
    fn test_parse_remote_manifest() {
        let output = format!(
            "{EMPTY_SHA}  ./etc/a.conf\n\
             {EMPTY_SHA} *./bin/tool\n\
             sha256sum: ./x: Permission denied\n"
        );
        let manifest = parse_remote_manifest(&output, true);
        assert_eq!(manifest.len(), 2);
        assert!(manifest.contains_key(Path::new("etc/a.conf")));
        assert!(manifest.contains_key(Path::new("bin/tool")));

        let single = parse_remote_manifest(&format!("{EMPTY_SHA}  /rootfs/Kubefile\n"), false);
        assert_eq!(single.get(Path::new("")).unwrap(), EMPTY_SHA);
    }

    #[test]
    fn test_parse_escaped_names() {
        let output = format!(
            "\\{EMPTY_SHA}  ./etc/back\\\\slash\n\\{EMPTY_SHA}  ./etc/new\\nline\n"
        );
        let manifest = parse_remote_manifest(&output, true);
        assert_eq!(manifest.len(), 2);
        assert!(manifest.contains_key(Path::new("etc/back\\slash")));
        assert!(manifest.contains_key(Path::new("etc/new\nline")));
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_records_links_without_following() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("usr/lib")).unwrap();
        std::fs::write(dir.path().join("usr/lib/libc.so"), "").unwrap();
        std::os::unix::fs::symlink("usr/lib", dir.path().join("lib")).unwrap();
        std::os::unix::fs::symlink("/nowhere", dir.path().join("dangling")).unwrap();

        let tree = LocalTree::scan(dir.path()).unwrap();
        assert_eq!(tree.files.len(), 1);
        assert!(tree.files.contains_key(Path::new("usr/lib/libc.so")));
        assert!(!tree.dirs.contains(&PathBuf::from("lib")));
        assert_eq!(
            tree.links,
            BTreeMap::from([
                (PathBuf::from("dangling"), PathBuf::from("/nowhere")),
                (PathBuf::from("lib"), PathBuf::from("usr/lib")),
            ])
        );
    }

    #[test]
    fn test_link_command() {
        let links = BTreeMap::from([(PathBuf::from("lib"), PathBuf::from("usr/lib"))]);
        assert_eq!(
            link_command(Path::new("/rootfs"), &links).unwrap(),
            "rm -rf /rootfs/lib && ln -s usr/lib /rootfs/lib"
        );
        assert!(link_command(Path::new("/rootfs"), &BTreeMap::new()).is_none());

        let top = BTreeMap::from([(PathBuf::new(), PathBuf::from("usr/lib"))]);
        assert_eq!(
            link_command(Path::new("/rootfs/lib"), &top).unwrap(),
            "rm -rf /rootfs/lib && ln -s usr/lib /rootfs/lib"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_source_link() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("usr/lib")).unwrap();
        std::os::unix::fs::symlink("usr/lib", dir.path().join("lib")).unwrap();

        let tree = LocalTree::scan(&dir.path().join("lib")).unwrap();
        assert!(!tree.is_dir);
        assert!(tree.files.is_empty());
        assert_eq!(tree.links.get(Path::new("")).unwrap(), Path::new("usr/lib"));
    }

    #[test]
    fn test_pending_uploads() {
        let local: Manifest = [
            (PathBuf::from("same"), "aa".to_string()),
            (PathBuf::from("changed"), "bb".to_string()),
            (PathBuf::from("new"), "cc".to_string()),
        ]
        .into();
        let remote: Manifest = [
            (PathBuf::from("same"), "aa".to_string()),
            (PathBuf::from("changed"), "00".to_string()),
            (PathBuf::from("stale"), "dd".to_string()),
        ]
        .into();

        assert_eq!(
            pending_uploads(&local, &remote),
            vec![Path::new("changed"), Path::new("new")]
        );
    }

    #[test]
    fn test_remote_manifest_command_quotes() {
        let cmd = remote_manifest_command(Path::new("/data/my rootfs"), true);
        assert!(cmd.starts_with("if [ -d '/data/my rootfs' ]"));
        assert!(cmd.contains("sha256sum {} +"));
    }
}
