use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// How long a path stays marked as "written by us" for watcher-echo
/// suppression.
const SELF_WRITE_WINDOW_SECS: u64 = 2;

/// Prefix for same-directory temp files used by atomic writes.
const TMP_PREFIX: &str = ".kenaz-tmp-";

/// One `.md` file found by [`Vault::list`]. Checksums are computed lazily
/// by callers that actually read the file.
#[derive(Debug, Clone)]
pub struct VaultEntry {
    pub path: String,
    pub updated_at: i64,
    pub size: u64,
}

/// Safe file I/O rooted at the vault directory.
///
/// Every operation takes a vault-relative, forward-slash path and rejects
/// anything that would resolve outside the root: absolute inputs, `..`
/// escapes, and symlinks pointing out of the tree.
pub struct Vault {
    root: PathBuf,
    recent_writes: Mutex<HashMap<String, Instant>>,
}

impl Vault {
    pub fn open(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .map_err(|e| Error::Invalid(format!("vault root {}: {e}", root.display())))?;
        Ok(Vault {
            root,
            recent_writes: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path to an absolute one under the root, or fail
    /// with a path-escape error. The file itself need not exist yet.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        if rel.contains('\\') {
            return Err(Error::Invalid(format!("backslash in path: {rel}")));
        }
        let input = Path::new(rel);
        if input.is_absolute() {
            return Err(Error::PathEscape(rel.to_string()));
        }

        // Lexical clean: `.` dropped, `..` must not climb past the root.
        let mut clean = PathBuf::new();
        for component in input.components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !clean.pop() {
                        return Err(Error::PathEscape(rel.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(Error::PathEscape(rel.to_string()));
                }
            }
        }

        let joined = self.root.join(&clean);

        // Symlink check: the nearest existing ancestor, fully resolved,
        // must still be under the canonicalized root.
        let mut probe = joined.as_path();
        loop {
            if probe.exists() {
                let resolved = probe.canonicalize()?;
                if !resolved.starts_with(&self.root) {
                    return Err(Error::PathEscape(rel.to_string()));
                }
                break;
            }
            match probe.parent() {
                Some(parent) => probe = parent,
                None => return Err(Error::PathEscape(rel.to_string())),
            }
        }

        Ok(joined)
    }

    /// List every `.md` file beneath `dir` (`""` = whole vault), skipping
    /// dotfiles and dot-directories (which also covers our temp files).
    pub fn list(&self, dir: &str) -> Result<Vec<VaultEntry>> {
        let base = self.resolve(dir)?;
        let mut entries = Vec::new();

        for entry in WalkDir::new(&base)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.path()))
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            if path.extension().and_then(|s| s.to_str()) != Some("md") {
                continue;
            }

            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!("skipping {}: {err}", path.display());
                    continue;
                }
            };

            entries.push(VaultEntry {
                path: self.relative(path),
                updated_at: meta.modified().map(unix_ms).unwrap_or(0),
                size: meta.len(),
            });
        }

        Ok(entries)
    }

    pub fn read(&self, rel: &str) -> Result<Vec<u8>> {
        let path = self.resolve(rel)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(rel.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, rel: &str) -> Result<bool> {
        Ok(self.resolve(rel)?.is_file())
    }

    /// File modification time in unix milliseconds.
    pub fn mtime(&self, rel: &str) -> Result<i64> {
        let path = self.resolve(rel)?;
        let meta = fs::metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(rel.to_string())
            } else {
                e.into()
            }
        })?;
        Ok(meta.modified().map(unix_ms).unwrap_or(0))
    }

    /// Atomic write: temp file in the target directory, fsync, rename.
    /// Readers observe either the old bytes or the new ones, never a
    /// partial payload.
    pub fn write(&self, rel: &str, contents: &[u8]) -> Result<()> {
        let path = self.resolve(rel)?;
        let parent = path
            .parent()
            .ok_or_else(|| Error::Invalid(format!("no parent directory: {rel}")))?;
        fs::create_dir_all(parent)?;

        let temp_path = parent.join(format!("{TMP_PREFIX}{}", uuid::Uuid::new_v4()));

        self.mark_self_write(rel);

        let result = (|| -> Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(contents)?;
            file.sync_all()?;
            drop(file);
            fs::rename(&temp_path, &path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }

    pub fn delete(&self, rel: &str) -> Result<()> {
        let path = self.resolve(rel)?;
        self.mark_self_write(rel);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(rel.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move a file within the vault. Fails if the destination exists.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let from = self.resolve(old)?;
        let to = self.resolve(new)?;
        if !from.exists() {
            return Err(Error::NotFound(old.to_string()));
        }
        if to.exists() {
            return Err(Error::AlreadyExists(new.to_string()));
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        self.mark_self_write(old);
        self.mark_self_write(new);
        fs::rename(&from, &to)?;
        Ok(())
    }

    /// Vault-relative, forward-slash form of an absolute path.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Record that we are about to touch `rel`, so the watcher can tell
    /// its own echo from an external edit.
    pub fn mark_self_write(&self, rel: &str) {
        if let Ok(mut writes) = self.recent_writes.lock() {
            writes.retain(|_, t| t.elapsed().as_secs() < SELF_WRITE_WINDOW_SECS * 2);
            writes.insert(rel.to_string(), Instant::now());
        }
    }

    /// True if `rel` was written by us within the suppression window.
    pub fn is_recent_self_write(&self, rel: &str) -> bool {
        match self.recent_writes.lock() {
            Ok(writes) => writes
                .get(rel)
                .map(|t| t.elapsed().as_secs() < SELF_WRITE_WINDOW_SECS)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// True for our own atomic-write temp files.
pub fn is_tmp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with(TMP_PREFIX))
        .unwrap_or(false)
}

/// Hex-encoded SHA-256 of note bytes; the basis for optimistic concurrency.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn unix_ms(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vault() -> (TempDir, Vault) {
        let dir = TempDir::new().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        (dir, vault)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, vault) = vault();
        vault.write("notes/a.md", b"hello").unwrap();
        assert_eq!(vault.read("notes/a.md").unwrap(), b"hello");
    }

    #[test]
    fn rejects_traversal_inputs() {
        let (_dir, vault) = vault();
        for bad in ["../x.md", "/etc/passwd", "a/../../x.md", "./sub/../../x.md"] {
            let err = vault.resolve(bad).unwrap_err();
            assert!(
                matches!(err, Error::PathEscape(_)),
                "{bad} should be a path escape, got {err:?}"
            );
        }
    }

    #[test]
    fn inner_dotdot_that_stays_inside_is_allowed() {
        let (_dir, vault) = vault();
        vault.write("a/../b.md", b"ok").unwrap();
        assert_eq!(vault.read("b.md").unwrap(), b"ok");
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escape() {
        let (_dir, vault) = vault();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.md"), b"secret").unwrap();
        std::os::unix::fs::symlink(outside.path(), vault.root().join("escape")).unwrap();

        let err = vault.read("escape/secret.md").unwrap_err();
        assert!(matches!(err, Error::PathEscape(_)));
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let (_dir, vault) = vault();
        vault.write("note.md", b"v1").unwrap();
        vault.write("note.md", b"v2").unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(vault.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_tmp_file(&e.path()))
            .collect();
        assert!(leftovers.is_empty());
        assert_eq!(vault.read("note.md").unwrap(), b"v2");
    }

    #[test]
    fn list_finds_nested_md_and_skips_hidden() {
        let (_dir, vault) = vault();
        vault.write("a.md", b"a").unwrap();
        vault.write("sub/deep/b.md", b"b").unwrap();
        std::fs::write(vault.root().join("c.txt"), b"c").unwrap();
        std::fs::create_dir_all(vault.root().join(".git")).unwrap();
        std::fs::write(vault.root().join(".git/d.md"), b"d").unwrap();
        std::fs::write(vault.root().join(format!("{TMP_PREFIX}e")), b"e").unwrap();

        let mut paths: Vec<_> = vault.list("").unwrap().into_iter().map(|e| e.path).collect();
        paths.sort();
        assert_eq!(paths, vec!["a.md", "sub/deep/b.md"]);
    }

    #[test]
    fn abandoned_temp_file_never_shadows_the_target() {
        let (_dir, vault) = vault();
        vault.write("note.md", b"v1").unwrap();

        // A write that died before its rename leaves only a temp file.
        std::fs::write(vault.root().join(format!("{TMP_PREFIX}crashed")), b"v2-par").unwrap();

        assert_eq!(vault.read("note.md").unwrap(), b"v1");
        let paths: Vec<_> = vault.list("").unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["note.md"]);
    }

    #[test]
    fn delete_is_not_found_when_absent() {
        let (_dir, vault) = vault();
        vault.write("x.md", b"x").unwrap();
        vault.delete("x.md").unwrap();
        assert!(matches!(vault.delete("x.md"), Err(Error::NotFound(_))));
    }

    #[test]
    fn rename_refuses_existing_destination() {
        let (_dir, vault) = vault();
        vault.write("old.md", b"1").unwrap();
        vault.write("new.md", b"2").unwrap();
        assert!(matches!(
            vault.rename("old.md", "new.md"),
            Err(Error::AlreadyExists(_))
        ));

        vault.delete("new.md").unwrap();
        vault.rename("old.md", "new.md").unwrap();
        assert_eq!(vault.read("new.md").unwrap(), b"1");
    }

    #[test]
    fn self_write_marks_expire() {
        let (_dir, vault) = vault();
        vault.write("x.md", b"x").unwrap();
        assert!(vault.is_recent_self_write("x.md"));
        assert!(!vault.is_recent_self_write("other.md"));
    }

    #[test]
    fn checksum_is_stable_hex_sha256() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
