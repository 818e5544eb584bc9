use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::paths::{join_path, split_parent, top_level_component};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// A filesystem entry queued for transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    /// Path relative to the batch root, e.g. `a/x.txt`.
    pub path: String,
    pub name: String,
    /// Relative directory prefix, `"a/"` for `a/x.txt`, empty at the root.
    pub dir_path: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Epoch seconds.
    pub mtime: i64,
    pub source: Option<PathBuf>,
    pub content_type: Option<String>,
    pub dest_path: String,
    pub upload_dir: String,
    pub is_conflicted: bool,
    pub parent_is_conflicted: bool,
    pub current_size: Option<u64>,
    pub current_mtime: Option<i64>,
}

impl TransferItem {
    pub fn file(path: &str, size: u64, mtime: i64) -> Self {
        Self::new(path, EntryKind::File, size, mtime)
    }

    pub fn dir(path: &str, mtime: i64) -> Self {
        Self::new(path, EntryKind::Dir, 0, mtime)
    }

    fn new(path: &str, kind: EntryKind, size: u64, mtime: i64) -> Self {
        let relative = path.trim_matches('/').to_string();
        let (dir_path, name) = match relative.rsplit_once('/') {
            Some((dir, name)) => (format!("{dir}/"), name.to_string()),
            None => (String::new(), relative.clone()),
        };
        Self {
            path: relative,
            name,
            dir_path,
            kind,
            size,
            mtime,
            source: None,
            content_type: None,
            dest_path: String::new(),
            upload_dir: String::new(),
            is_conflicted: false,
            parent_is_conflicted: false,
            current_size: None,
            current_mtime: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    pub fn top_dir(&self) -> Option<&str> {
        top_level_component(&self.dir_path)
    }

    /// Computes `dest_path` and `upload_dir` under `current_dir`.
    pub fn assign_destination(&mut self, current_dir: &str) {
        self.dest_path = join_path(current_dir, &self.path);
        self.upload_dir = split_parent(&self.dest_path).0;
    }

    /// Replaces the first component of the relative path with `new_root`.
    pub(crate) fn rename_root(&mut self, new_root: &str, current_dir: &str) {
        let rest = match self.path.split_once('/') {
            Some((_, rest)) if !self.dir_path.is_empty() => Some(rest.to_string()),
            _ => None,
        };
        let renamed = match rest {
            Some(rest) => format!("{new_root}/{rest}"),
            None => new_root.to_string(),
        };
        self.replace_path(&renamed, current_dir);
    }

    /// Replaces the last component, keeping the directory prefix.
    pub(crate) fn rename_leaf(&mut self, new_name: &str, current_dir: &str) {
        let renamed = format!("{}{new_name}", self.dir_path);
        self.replace_path(&renamed, current_dir);
    }

    fn replace_path(&mut self, relative: &str, current_dir: &str) {
        let mut updated = Self::new(relative, self.kind, self.size, self.mtime);
        updated.source = self.source.take();
        updated.content_type = self.content_type.take();
        updated.assign_destination(current_dir);
        *self = updated;
    }
}

/// Walks `source` and returns one item per file and directory, with paths
/// relative to the parent of `source`.
pub async fn collect_local_items(source: &Path) -> io::Result<Vec<TransferItem>> {
    let root_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;

    let mut items = Vec::new();
    let mut pending = vec![(source.to_path_buf(), root_name)];
    while let Some((local, relative)) = pending.pop() {
        let meta = tokio::fs::metadata(&local).await?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        if !meta.is_dir() {
            let content_type = mime_guess::from_path(&local).first_or_octet_stream();
            items.push(
                TransferItem::file(&relative, meta.len(), mtime)
                    .with_content_type(content_type.essence_str())
                    .with_source(local),
            );
            continue;
        }

        items.push(TransferItem::dir(&relative, mtime).with_source(local.clone()));
        let mut children = Vec::new();
        let mut entries = tokio::fs::read_dir(&local).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            children.push((entry.path(), format!("{relative}/{name}")));
        }
        children.sort_by(|a, b| b.1.cmp(&a.1));
        pending.extend(children);
    }
    Ok(items)
}
