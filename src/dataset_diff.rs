//! Dataset diff engine
//!
//! Diffs one dataset between two revisions, or between a revision and the
//! working copy. Content deltas carry lazy values: a feature row or tile
//! pointer is only read if something downstream looks at it.

use std::collections::BTreeMap;

use tracing::debug;

use crate::dataset::Dataset;
use crate::delta::{Delta, DeltaFlags, KeyValue};
use crate::diff::{DatasetDiff, DeltaDiff, DiffNode};
use crate::error::{Error, Result};
use crate::key_filter::{DatasetKeyFilter, UserStringKeyFilter};
use crate::store::ObjectId;
use crate::tree::{diff_trees, join_path, ChangeStatus, IndexEntry};
use crate::value::{ItemType, ItemValue, Key};
use crate::working_copy::{decode_physical_path, decode_physical_path_lenient, WorkingCopy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    /// Produce content deltas. When off, only `data_changes` is reported.
    pub include_content: bool,
    /// Working-copy diffs only: a new tile file whose name decodes (leniently)
    /// to an existing tile becomes an update of that tile instead of an
    /// insert under a new name.
    pub promote_inserts_to_updates: bool,
    /// Repo diffs only: also diff files outside datasets.
    pub include_files: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            include_content: true,
            promote_inserts_to_updates: false,
            include_files: false,
        }
    }
}

/// Diff two revisions of one dataset. Either side may be absent.
pub fn get_dataset_diff(
    old: Option<&Dataset>,
    new: Option<&Dataset>,
    filter: &DatasetKeyFilter,
    options: &DiffOptions,
) -> Result<DatasetDiff> {
    let mut out = DatasetDiff::new();
    out.kind = new.or(old).map(Dataset::kind);
    if filter.wants(ItemType::Meta) {
        out.set(ItemType::Meta, diff_meta(old, new, filter.get(ItemType::Meta))?);
    }

    let content_types: Vec<ItemType> = {
        let mut t: Vec<_> = old.iter().chain(new.iter()).map(|d| d.kind().content_type()).collect();
        t.dedup();
        t
    };
    for item_type in content_types {
        // A dataset replaced by one of another kind diffs as a full delete
        // plus a full insert.
        let old_side = old.filter(|d| d.kind().content_type() == item_type);
        let new_side = new.filter(|d| d.kind().content_type() == item_type);
        if options.include_content {
            if filter.wants(item_type) {
                let diff = diff_content(old_side, new_side, item_type, filter.get(item_type))?;
                out.set(item_type, diff);
            }
        } else {
            let old_tree = old_side.map(Dataset::content_tree).transpose()?.flatten();
            let new_tree = new_side.map(Dataset::content_tree).transpose()?.flatten();
            let changed = old_tree != new_tree || out.data_changes == Some(true);
            out.data_changes = Some(changed);
        }
    }
    out.prune();
    Ok(out)
}

fn meta_dict(ds: Option<&Dataset>, filter: &UserStringKeyFilter) -> Result<BTreeMap<Key, ItemValue>> {
    let Some(ds) = ds else {
        return Ok(BTreeMap::new());
    };
    Ok(ds
        .meta_items()?
        .into_iter()
        .filter(|(name, _)| filter.contains_str(name))
        .map(|(name, v)| (Key::text(name), ItemValue::Meta(v)))
        .collect())
}

/// Dict diff of the meta items of two revisions.
pub fn diff_meta(
    old: Option<&Dataset>,
    new: Option<&Dataset>,
    filter: &UserStringKeyFilter,
) -> Result<DeltaDiff> {
    Ok(DeltaDiff::diff_dicts(&meta_dict(old, filter)?, &meta_dict(new, filter)?))
}

fn lazy_side(ds: &Dataset, item_type: ItemType, entry: &IndexEntry) -> Result<KeyValue> {
    let rel = join_path(item_type.as_str(), &entry.path);
    let (_, key) = ds.decode_path(&rel)?;
    let value = ds.lazy_item(item_type, &key, entry.id);
    Ok(KeyValue::lazy(key, value))
}

/// Diff the feature or tile subtrees of two revisions.
pub fn diff_content(
    old: Option<&Dataset>,
    new: Option<&Dataset>,
    item_type: ItemType,
    filter: &UserStringKeyFilter,
) -> Result<DeltaDiff> {
    let mut out = DeltaDiff::new();
    let Some(store) = old.or(new).map(|d| d.store().clone()) else {
        return Ok(out);
    };
    let old_tree = old.map(Dataset::content_tree).transpose()?.flatten();
    let new_tree = new.map(Dataset::content_tree).transpose()?.flatten();

    for change in diff_trees(&store, old_tree, new_tree)? {
        match change.status {
            ChangeStatus::Added | ChangeStatus::Modified | ChangeStatus::Deleted => {}
            status => {
                return Err(Error::UnrecognisedChange {
                    status: status.as_str(),
                    path: change.path().to_string(),
                })
            }
        }
        let old_kv = match (old, &change.old) {
            (Some(ds), Some(e)) => Some(lazy_side(ds, item_type, e)?),
            _ => None,
        };
        let new_kv = match (new, &change.new) {
            (Some(ds), Some(e)) => Some(lazy_side(ds, item_type, e)?),
            _ => None,
        };
        let wanted = old_kv.iter().chain(new_kv.iter()).any(|kv| filter.contains(kv.key()));
        if !wanted {
            continue;
        }
        out.add(Delta::new(old_kv, new_kv)?)?;
    }
    debug!(
        dataset = old.or(new).map(Dataset::path).unwrap_or_default(),
        %item_type,
        deltas = out.len(),
        "content diff"
    );
    Ok(out)
}

// ── Working copy ───────────────────────────────────────────────────────

struct WcChange {
    physical: String,
    item_type: ItemType,
    key: Key,
    old: Option<KeyValue>,
    new: Option<ItemValue>,
}

fn base_side(base: Option<&Dataset>, item_type: ItemType, key: &Key) -> Result<Option<KeyValue>> {
    let Some(ds) = base else {
        return Ok(None);
    };
    Ok(ds
        .item_blob(item_type, key)?
        .map(|blob: ObjectId| KeyValue::lazy(key.clone(), ds.lazy_item(item_type, key, blob))))
}

/// Diff the tracked revision of a dataset against the working copy's
/// dirty items. Every delta is flagged as a working-copy edit.
pub fn diff_to_working_copy(
    base: Option<&Dataset>,
    wc: &dyn WorkingCopy,
    dataset: &str,
    filter: &DatasetKeyFilter,
    options: &DiffOptions,
) -> Result<DatasetDiff> {
    let mut out = DatasetDiff::new();
    out.kind = wc.dataset_kind(dataset).or(base.map(Dataset::kind));
    let dirty = wc.dirty_paths();
    let Some(paths) = dirty.get(dataset) else {
        return Ok(out);
    };

    // Hand out every lazy base value before forcing any, so a missing
    // blob triggers one fetch covering all of them.
    let mut changes = Vec::with_capacity(paths.len());
    for physical in paths {
        let (item_type, key) = decode_physical_path(physical)?;
        changes.push(WcChange {
            old: base_side(base, item_type, &key)?,
            new: wc.read_physical(dataset, physical)?,
            physical: physical.clone(),
            item_type,
            key,
        });
    }

    let flags = DeltaFlags::WORKING_COPY_EDIT;
    let mut promotable = Vec::new();
    for change in changes {
        let alt = if options.promote_inserts_to_updates && change.item_type == ItemType::Tile {
            decode_physical_path_lenient(&change.physical)
                .map(|(_, k)| k)
                .filter(|k| *k != change.key)
        } else {
            None
        };
        let in_filter = filter.contains(change.item_type, &change.key)
            || alt.as_ref().is_some_and(|k| filter.contains(change.item_type, k));
        if !in_filter {
            continue;
        }
        let new_kv = change.new.map(|v| KeyValue::new(change.key.clone(), v));
        let delta = match (change.old, new_kv) {
            (None, None) => None,
            (Some(old), Some(new)) => Delta::maybe_update(old, new)?,
            (None, Some(new)) => match alt {
                Some(alt_key) => {
                    promotable.push((alt_key, new));
                    None
                }
                None => Some(Delta::insert(new)),
            },
            (Some(old), None) => Some(Delta::delete(old)),
        };
        if let Some(d) = delta {
            out.add_delta(change.item_type, d.with_flags(flags))?;
        }
    }

    for (alt_key, new) in promotable {
        promote_insert(&mut out, base, alt_key, new, flags)?;
    }

    if !options.include_content {
        let content_changed = [ItemType::Feature, ItemType::Tile]
            .into_iter()
            .any(|t| out.get(t).is_some_and(|d| !d.is_empty()));
        for t in [ItemType::Feature, ItemType::Tile] {
            out.set(t, DeltaDiff::new());
        }
        out.data_changes = Some(content_changed);
    }
    out.prune();
    Ok(out)
}

/// Turn an insert of a leniently named tile into an update of the tile it
/// names, if that tile exists. Otherwise it stays an insert under its own
/// physical name.
fn promote_insert(
    out: &mut DatasetDiff,
    base: Option<&Dataset>,
    alt_key: Key,
    new: KeyValue,
    flags: DeltaFlags,
) -> Result<()> {
    let (strict_key, value) = (new.key().clone(), new.value()?.clone());
    let renamed = KeyValue::new(alt_key.clone(), value);
    let tiles = out.get_or_create(ItemType::Tile);

    // The old file may have been deleted under its canonical name.
    let existing_is_delete = tiles.get(&alt_key).map(|d| d.new_side().is_none());
    match existing_is_delete {
        Some(true) => {
            if let Some((Some(old), _)) = tiles.remove(&alt_key).map(Delta::into_parts) {
                if let Some(update) = Delta::maybe_update(old, renamed)? {
                    tiles.add(update.with_flags(flags))?;
                }
            }
            return Ok(());
        }
        Some(false) => {
            // The canonical file changed too; the new file stays its own insert.
            tiles.add(Delta::insert(new).with_flags(flags))?;
            return Ok(());
        }
        None => {}
    }

    match base_side(base, ItemType::Tile, &alt_key)? {
        Some(old) => {
            debug!(from = %strict_key, to = %alt_key, "promoted tile insert to update");
            if let Some(update) = Delta::maybe_update(old, renamed)? {
                tiles.add(update.with_flags(flags))?;
            }
        }
        None => tiles.add(Delta::insert(new).with_flags(flags))?,
    }
    Ok(())
}
