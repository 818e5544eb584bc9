use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("local name is empty")]
    Empty,
    #[error("local name contains unsupported component")]
    UnsupportedComponent,
}

/// Canonical remote form: leading `/`, no empty or `.` segments, `..`
/// resolved without climbing above the root, no trailing `/`.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

pub fn join_path(dir: &str, relative: &str) -> String {
    normalize_path(&format!("{dir}/{relative}"))
}

/// Splits a remote path into its parent directory and final name.
pub fn split_parent(path: &str) -> (String, String) {
    let normalized = normalize_path(path);
    match normalized.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => ("/".to_string(), normalized),
    }
}

pub fn parent_path(path: &str) -> Option<String> {
    let normalized = normalize_path(path);
    if normalized == "/" {
        return None;
    }
    Some(split_parent(&normalized).0)
}

pub fn file_name(path: &str) -> String {
    split_parent(path).1
}

/// First directory component of a batch-relative directory prefix
/// (`"a/b/"` gives `"a"`).
pub fn top_level_component(dir_path: &str) -> Option<&str> {
    dir_path.split('/').find(|part| !part.is_empty())
}

/// Shortens `name` to at most `max` characters, keeping the extension.
pub fn truncate_display_name(name: &str, max: usize) -> String {
    let total = name.chars().count();
    if total <= max || max == 0 {
        return name.to_string();
    }
    let ext = match name.rfind('.') {
        Some(idx) if idx > 0 => &name[idx..],
        _ => "",
    };
    let ext_len = ext.chars().count();
    if ext_len + 2 > max {
        let head: String = name.chars().take(max.saturating_sub(1)).collect();
        return format!("{head}…");
    }
    let head: String = name.chars().take(max - ext_len - 1).collect();
    format!("{head}…{ext}")
}

/// Maps a server-supplied file name under a local directory.
pub fn local_target_for(root: &Path, name: &str) -> Result<PathBuf, PathError> {
    if name.trim().is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    let mut pushed = false;
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                pushed = true;
            }
            Component::CurDir => continue,
            Component::RootDir | Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    if !pushed {
        return Err(PathError::Empty);
    }
    Ok(out)
}
