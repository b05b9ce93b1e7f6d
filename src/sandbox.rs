use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::state::ChangeSet;

/// Directory names never scanned for source files.
const SKIPPED_DIRS: &[&str] = &["__pycache__", ".git", "venv", ".venv", "node_modules"];

/// Suffix of the hidden sibling files changes are staged in before the rename.
const STAGING_SUFFIX: &str = ".swarm-tmp";

/// Confines reads and writes to a single target directory.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: &Path) -> Result<Self> {
        let root = root.canonicalize().map_err(|e| {
            Error::Validation(format!("target {} is not accessible: {e}", root.display()))
        })?;
        if !root.is_dir() {
            return Err(Error::Validation(format!(
                "target {} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` (relative to the root, or absolute) and check it stays inside.
    ///
    /// `..` components are folded lexically and the deepest existing ancestor is
    /// canonicalized, so symlinks pointing outside the root are caught too.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        if path.trim().is_empty() {
            return Err(Error::Sandbox("empty path".to_string()));
        }
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let normalized = normalize(&joined)
            .ok_or_else(|| Error::Sandbox(format!("path climbs above filesystem root: {path}")))?;

        let mut existing = normalized.as_path();
        let mut tail: Vec<OsString> = Vec::new();
        while !existing.exists() {
            match (existing.file_name(), existing.parent()) {
                (Some(name), Some(parent)) => {
                    tail.push(name.to_os_string());
                    existing = parent;
                }
                _ => return Err(Error::Sandbox(format!("cannot resolve path: {path}"))),
            }
        }
        let mut resolved = existing
            .canonicalize()
            .map_err(|e| Error::Sandbox(format!("cannot resolve {path}: {e}")))?;
        for part in tail.iter().rev() {
            resolved.push(part);
        }

        if !resolved.starts_with(&self.root) {
            return Err(Error::Sandbox(format!(
                "path outside target {}: {path}",
                self.root.display()
            )));
        }
        Ok(resolved)
    }

    /// Path of `path` relative to the root, with `/` separators.
    pub fn relative(&self, path: &Path) -> Result<String> {
        let rel = path.strip_prefix(&self.root).map_err(|_| {
            Error::Sandbox(format!("path outside target: {}", path.display()))
        })?;
        Ok(rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/"))
    }

    pub fn read(&self, path: &str) -> Result<String> {
        let resolved = self.resolve(path)?;
        if !resolved.is_file() {
            return Err(Error::Validation(format!("not a file: {path}")));
        }
        fs::read_to_string(&resolved).map_err(Error::Io)
    }

    /// Write every change, or none of them.
    ///
    /// All paths are resolved before the first write; a single invalid path
    /// rejects the whole set. Contents are staged in sibling temporary files
    /// and renamed over their targets only once every file is staged, so an
    /// I/O error while writing leaves all targets untouched. Returns the
    /// written paths relative to the root.
    pub fn apply(&self, changes: &ChangeSet) -> Result<Vec<String>> {
        let mut resolved = Vec::with_capacity(changes.len());
        for (path, content) in changes {
            let target = self.resolve(path)?;
            if target == self.root || target.is_dir() {
                return Err(Error::Validation(format!(
                    "change targets a directory: {path}"
                )));
            }
            resolved.push((target, content));
        }

        let mut staged = Vec::with_capacity(resolved.len());
        for (target, content) in resolved {
            match stage(&target, content) {
                Ok(temp) => staged.push((temp, target)),
                Err(e) => {
                    discard(&staged);
                    return Err(e);
                }
            }
        }

        let mut written = Vec::with_capacity(staged.len());
        for (i, (temp, target)) in staged.iter().enumerate() {
            if let Err(e) = fs::rename(temp, target) {
                discard(&staged[i..]);
                return Err(Error::Io(e));
            }
            debug!(path = %target.display(), "applied change");
            written.push(self.relative(target)?);
        }
        Ok(written)
    }

    /// Files under the root with the given extension, relative and sorted.
    pub fn list_files(&self, extension: &str) -> Result<Vec<String>> {
        let mut found = Vec::new();
        self.walk(&self.root, extension, &mut found)?;
        found.sort();
        Ok(found)
    }

    fn walk(&self, dir: &Path, extension: &str, found: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_dir() {
                let name = entry.file_name();
                if SKIPPED_DIRS.iter().any(|s| name == *s) {
                    continue;
                }
                self.walk(&path, extension, found)?;
            } else if file_type.is_file()
                && path.extension().is_some_and(|ext| ext == extension)
            {
                found.push(self.relative(&path)?);
            }
        }
        Ok(())
    }
}

/// Write `content` to a hidden sibling of `target` and return its path.
fn stage(target: &Path, content: &str) -> Result<PathBuf> {
    let (Some(parent), Some(name)) = (target.parent(), target.file_name()) else {
        return Err(Error::Sandbox(format!(
            "cannot stage write to {}",
            target.display()
        )));
    };
    fs::create_dir_all(parent)?;
    let mut temp_name = OsString::from(".");
    temp_name.push(name);
    temp_name.push(STAGING_SUFFIX);
    let temp = parent.join(temp_name);
    if let Err(e) = fs::write(&temp, content) {
        let _ = fs::remove_file(&temp);
        return Err(Error::Io(e));
    }
    Ok(temp)
}

fn discard(staged: &[(PathBuf, PathBuf)]) {
    for (temp, _) in staged {
        if let Err(e) = fs::remove_file(temp) {
            warn!(path = %temp.display(), error = %e, "failed to remove staged change");
        }
    }
}

/// Fold `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}
