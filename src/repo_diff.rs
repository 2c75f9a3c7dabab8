//! Repository diffs
//!
//! Runs the dataset diff engine over every dataset of two repository
//! structures, or of a structure and the working copy.

use std::collections::BTreeSet;

use tracing::debug;

use crate::dataset::DatasetKind;
use crate::dataset_diff::{diff_to_working_copy, get_dataset_diff, DiffOptions};
use crate::delta::{Delta, KeyValue};
use crate::diff::{DatasetDiff, DeltaDiff, DiffNode, RepoDiff};
use crate::error::{Error, Result};
use crate::key_filter::RepoKeyFilter;
use crate::structure::RepoStructure;
use crate::tree::{diff_trees, ChangeStatus};
use crate::value::{ItemValue, Key};
use crate::working_copy::WorkingCopy;

/// Diff every dataset between two structures.
pub fn get_repo_diff(
    old: &RepoStructure,
    new: &RepoStructure,
    filter: &RepoKeyFilter,
    options: &DiffOptions,
) -> Result<RepoDiff> {
    let mut out = RepoDiff::new();
    if old.tree() != new.tree() {
        let old_ds = old.datasets()?;
        let new_ds = new.datasets()?;
        let paths: BTreeSet<&String> = old_ds.keys().chain(new_ds.keys()).collect();
        for path in paths {
            if !filter.contains_dataset(path) {
                continue;
            }
            let diff = get_dataset_diff(old_ds.get(path), new_ds.get(path), filter.get(path), options)?;
            if !diff.is_empty() {
                out.set(path, diff);
            }
        }
        if options.include_files {
            out.files = Some(get_files_diff(old, new)?);
        }
    }
    out.prune();
    debug!(
        old = %old.tree().short(),
        new = %new.tree().short(),
        datasets = out.dataset_paths().count(),
        "repo diff"
    );
    Ok(out)
}

fn inside_dataset(path: &str) -> bool {
    path.split('/').any(|c| DatasetKind::from_dirname(c).is_some())
}

/// Diff of the files that don't belong to any dataset, keyed by path.
pub fn get_files_diff(old: &RepoStructure, new: &RepoStructure) -> Result<DeltaDiff> {
    let mut out = DeltaDiff::new();
    for change in diff_trees(old.store(), Some(old.tree()), Some(new.tree()))? {
        if inside_dataset(change.path()) {
            continue;
        }
        match change.status {
            ChangeStatus::Added | ChangeStatus::Modified | ChangeStatus::Deleted => {}
            status => {
                return Err(Error::UnrecognisedChange {
                    status: status.as_str(),
                    path: change.path().to_string(),
                })
            }
        }
        let side = |e: &crate::tree::IndexEntry| {
            KeyValue::new(Key::text(e.path.clone()), ItemValue::File(e.id))
        };
        out.add(Delta::new(change.old.as_ref().map(side), change.new.as_ref().map(side))?)?;
    }
    Ok(out)
}

/// Diff `base` against the working copy.
///
/// `tracked` is the structure the working copy was last reset to. When it
/// differs from `base`, the base→tracked diff is concatenated with the
/// tracked→working-copy diff dataset by dataset.
pub fn get_repo_diff_to_working_copy(
    base: &RepoStructure,
    tracked: &RepoStructure,
    wc: &dyn WorkingCopy,
    filter: &RepoKeyFilter,
    options: &DiffOptions,
) -> Result<RepoDiff> {
    let mut out = get_repo_diff(base, tracked, filter, options)?;
    let tracked_ds = tracked.datasets()?;
    let dirty = wc.dirty_paths();

    for path in dirty.keys() {
        if !filter.contains_dataset(path) {
            continue;
        }
        let wc_diff = diff_to_working_copy(tracked_ds.get(path), wc, path, filter.get(path), options)?;
        if wc_diff.is_empty() {
            continue;
        }
        let combined = match out.remove(path) {
            Some(committed) => committed.concat(wc_diff)?,
            None => wc_diff,
        };
        out.set(path, combined);
    }
    out.prune();
    Ok(out)
}

/// Working-copy changes of one dataset only, against what it tracks.
pub fn get_dataset_diff_to_working_copy(
    tracked: &RepoStructure,
    wc: &dyn WorkingCopy,
    dataset: &str,
    filter: &RepoKeyFilter,
    options: &DiffOptions,
) -> Result<DatasetDiff> {
    let base = tracked.dataset(dataset)?;
    diff_to_working_copy(base.as_ref(), wc, dataset, filter.get(dataset), options)
}
