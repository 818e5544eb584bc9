use std::collections::{HashMap, HashSet};

use gfweb_core::DirEntry;
use tracing::debug;

use crate::item::TransferItem;
use crate::naming::suggest_new_name;

/// What the user decided for one colliding name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictChoice {
    KeepCurrent,
    KeepIncoming,
    KeepBoth,
}

impl ConflictChoice {
    /// Maps the `keep current` / `keep incoming` checkbox pair.
    pub fn from_flags(keep_current: bool, keep_incoming: bool) -> Self {
        match (keep_current, keep_incoming) {
            (true, true) => ConflictChoice::KeepBoth,
            (false, true) => ConflictChoice::KeepIncoming,
            _ => ConflictChoice::KeepCurrent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictReport {
    pub has_conflict: bool,
    pub items: Vec<TransferItem>,
}

/// One decision point: a colliding top-level name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    pub name: String,
    pub is_dir: bool,
    pub incoming_size: u64,
    pub incoming_mtime: i64,
    pub current_size: Option<u64>,
    pub current_mtime: Option<i64>,
}

pub fn detect_conflicts(incoming: Vec<TransferItem>, existing: &[DirEntry]) -> ConflictReport {
    let mut has_conflict = false;
    let items = incoming
        .into_iter()
        .map(|mut item| {
            item.is_conflicted = false;
            item.parent_is_conflicted = false;
            item.current_size = None;
            item.current_mtime = None;

            let by_parent = item
                .top_dir()
                .and_then(|top| existing.iter().find(|entry| entry.name == top))
                .map(|entry| (entry, true));
            let hit = by_parent.or_else(|| {
                existing
                    .iter()
                    .find(|entry| entry.name == item.name)
                    .map(|entry| (entry, false))
            });
            if let Some((entry, via_parent)) = hit {
                item.is_conflicted = true;
                item.parent_is_conflicted = via_parent;
                item.current_size = Some(entry.size);
                item.current_mtime = Some(entry.mtime);
                has_conflict = true;
            }
            item
        })
        .collect();
    ConflictReport {
        has_conflict,
        items,
    }
}

fn conflict_key(item: &TransferItem) -> &str {
    if item.parent_is_conflicted {
        item.top_dir().unwrap_or(&item.name)
    } else {
        &item.name
    }
}

/// Collapses conflicted items to one entry per colliding top-level name,
/// in first-seen order.
pub fn unique_conflicts(items: &[TransferItem]) -> Vec<ConflictEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut entries: HashMap<String, ConflictEntry> = HashMap::new();
    for item in items.iter().filter(|item| item.is_conflicted) {
        let key = conflict_key(item);
        let entry = entries.entry(key.to_string()).or_insert_with(|| {
            order.push(key.to_string());
            ConflictEntry {
                name: key.to_string(),
                is_dir: item.parent_is_conflicted || item.is_dir(),
                incoming_size: 0,
                incoming_mtime: 0,
                current_size: item.current_size,
                current_mtime: item.current_mtime,
            }
        });
        entry.incoming_size = entry.incoming_size.saturating_add(item.size);
        entry.incoming_mtime = entry.incoming_mtime.max(item.mtime);
    }
    order
        .into_iter()
        .filter_map(|key| entries.remove(&key))
        .collect()
}

pub fn assign_destinations(items: &mut [TransferItem], current_dir: &str) {
    for item in items.iter_mut() {
        item.assign_destination(current_dir);
    }
}

/// Applies the user's choices. Conflicted items without a choice keep the
/// current copy and are dropped.
pub fn resolve(
    items: Vec<TransferItem>,
    choices: &HashMap<String, ConflictChoice>,
    existing_names: &HashSet<String>,
    current_dir: &str,
) -> Vec<TransferItem> {
    let mut taken = existing_names.clone();
    for item in items.iter().filter(|item| !item.is_conflicted) {
        taken.insert(item.top_dir().unwrap_or(&item.name).to_string());
    }

    let mut renamed: HashMap<String, String> = HashMap::new();
    let mut out = Vec::with_capacity(items.len());
    for mut item in items {
        if !item.is_conflicted {
            out.push(item);
            continue;
        }
        let key = conflict_key(&item).to_string();
        match choices.get(&key).copied().unwrap_or(ConflictChoice::KeepCurrent) {
            ConflictChoice::KeepCurrent => {
                debug!(path = %item.path, "keeping current copy, skipping incoming");
            }
            ConflictChoice::KeepIncoming => out.push(item),
            ConflictChoice::KeepBoth => {
                let new_root = renamed
                    .entry(key.clone())
                    .or_insert_with(|| {
                        let name = suggest_new_name(&key, &taken);
                        taken.insert(name.clone());
                        name
                    })
                    .clone();
                if item.parent_is_conflicted {
                    item.rename_root(&new_root, current_dir);
                } else {
                    item.rename_leaf(&new_root, current_dir);
                }
                out.push(item);
            }
        }
    }
    out
}
