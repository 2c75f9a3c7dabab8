//! Diff application
//!
//! Writes a [`RepoDiff`] onto a base tree. Every delta is checked against
//! what is actually there first; a single failed precondition, schema
//! violation or uncommittable meta item aborts the whole application and
//! no tree is written.

use std::rc::Rc;

use tracing::debug;

use crate::dataset::{encode_item, Dataset, DatasetKind};
use crate::delta::{Delta, DeltaType};
use crate::diff::{DatasetDiff, DeltaDiff, RepoDiff};
use crate::error::{Error, MetaItemProblem, MetaItemProblemKind, Result};
use crate::schema::{Schema, SCHEMA_ITEM};
use crate::store::{ObjectId, ObjectStore, TreeEntry};
use crate::structure::RepoStructure;
use crate::tree::TreeBuilder;
use crate::value::{ItemType, ItemValue, Key, MetaValue};

/// Meta item values that can't be committed.
pub fn check_meta_items(diff: &RepoDiff) -> Result<Vec<MetaItemProblem>> {
    let mut problems = Vec::new();
    for (ds, ds_diff) in diff.iter() {
        let Some(meta) = ds_diff.meta() else {
            continue;
        };
        for (key, delta) in meta.iter() {
            let Some(value) = delta.new_value()? else {
                continue;
            };
            let name = key.to_string();
            let problem = |kind| MetaItemProblem {
                dataset: ds.clone(),
                item: name.clone(),
                kind,
            };
            let invalid = |reason: &str| problem(MetaItemProblemKind::InvalidValue(reason.to_string()));
            match value {
                ItemValue::Meta(MetaValue::ListOfConflicts(values)) => {
                    problems.push(problem(MetaItemProblemKind::ListOfConflicts(values.len())));
                }
                ItemValue::Meta(MetaValue::Json(_)) if !MetaValue::is_json_name(&name) => {
                    problems.push(invalid("JSON value for a text item"));
                }
                ItemValue::Meta(MetaValue::Text(_)) if MetaValue::is_json_name(&name) => {
                    problems.push(invalid("text value for a JSON item"));
                }
                ItemValue::Meta(m) if name == SCHEMA_ITEM => {
                    if let Err(e) = Schema::from_meta(m) {
                        problems.push(invalid(&e.to_string()));
                    }
                }
                ItemValue::Meta(_) => {}
                _ => problems.push(invalid("not a meta value")),
            }
        }
    }
    Ok(problems)
}

fn label(ds: &str, item_type: ItemType, key: &Key) -> String {
    format!("{ds}:{item_type}:{key}")
}

/// Collected failures of one application.
#[derive(Debug, Default)]
struct ApplyReport {
    conflicts: Vec<String>,
    violations: Vec<(String, Vec<String>)>,
}

impl Dataset {
    /// Write this dataset's part of `diff` into `builder`. Preconditions
    /// that don't hold are pushed onto `conflicts` as labels. Content of
    /// the other dataset kind fails with [`Error::WrongDatasetKind`].
    ///
    /// An insert of an item that already exists is accepted when
    /// `reference` holds exactly the current value: the diff was made
    /// against a tree where the item was missing, not absent.
    pub fn apply_diff(
        &self,
        diff: &DatasetDiff,
        builder: &mut TreeBuilder<'_>,
        reference: Option<&Dataset>,
        conflicts: &mut Vec<String>,
    ) -> Result<()> {
        for (item_type, deltas) in diff.iter() {
            let item_type = *item_type;
            if item_type != ItemType::Meta && item_type != self.kind().content_type() {
                return Err(self.wrong_kind(item_type));
            }
            for (key, delta) in deltas.iter() {
                if !self.delta_applies(item_type, delta, reference)? {
                    conflicts.push(label(self.path(), item_type, key));
                    continue;
                }
                self.write_delta(item_type, delta, builder)?;
            }
        }
        Ok(())
    }

    fn wrong_kind(&self, item_type: ItemType) -> Error {
        Error::WrongDatasetKind {
            dataset: self.path().to_string(),
            kind: self.kind().as_str(),
            item_type: item_type.as_str(),
        }
    }

    fn delta_applies(&self, item_type: ItemType, delta: &Delta, reference: Option<&Dataset>) -> Result<bool> {
        match delta.delta_type() {
            DeltaType::Insert => {
                let key = delta.key();
                let Some(current) = self.get_item(item_type, key)? else {
                    return Ok(true);
                };
                match reference {
                    Some(r) => Ok(r.get_item(item_type, key)?.as_ref() == Some(&current)),
                    None => Ok(false),
                }
            }
            DeltaType::Update | DeltaType::Delete => {
                let (Some(old_key), Some(old_value)) = (delta.old_key(), delta.old_value()?) else {
                    return Ok(false);
                };
                if self.get_item(item_type, old_key)?.as_ref() != Some(old_value) {
                    return Ok(false);
                }
                // A rename can't land on an item that's already there.
                match delta.new_key() {
                    Some(new_key) if new_key != old_key => Ok(self.item_blob(item_type, new_key)?.is_none()),
                    _ => Ok(true),
                }
            }
        }
    }

    fn write_delta(&self, item_type: ItemType, delta: &Delta, builder: &mut TreeBuilder<'_>) -> Result<()> {
        if let Some(old_key) = delta.old_key() {
            builder.remove(&self.item_repo_path(item_type, old_key)?)?;
        }
        if let (Some(new_key), Some(value)) = (delta.new_key(), delta.new_value()?) {
            builder.insert_data(&self.item_repo_path(item_type, new_key)?, &encode_item(value)?)?;
        }
        Ok(())
    }

    /// Schema problems of every inserted or updated feature in `diff`,
    /// checked against the schema the dataset will have afterwards.
    pub fn validate_diff(&self, diff: &DatasetDiff) -> Result<Vec<String>> {
        let Some(features) = diff.get(ItemType::Feature).filter(|d| d.len() > 0) else {
            return Ok(Vec::new());
        };
        let schema = match diff.meta().and_then(|m| m.get(&Key::text(SCHEMA_ITEM))) {
            Some(d) => match d.new_value()? {
                Some(ItemValue::Meta(m)) => Some(Schema::from_meta(m)?),
                _ => None,
            },
            None => self.schema()?,
        };
        let Some(schema) = schema else {
            return Ok(vec!["features written to a dataset without a schema".to_string()]);
        };
        let mut problems = Vec::new();
        for delta in features.values() {
            let Some(ItemValue::Feature(f)) = delta.new_value()? else {
                continue;
            };
            let key = delta.new_key().unwrap_or(delta.key());
            problems.extend(schema.validate_feature(key, f));
            match schema.key_of(f) {
                Ok(k) if &k == key => {}
                Ok(k) => problems.push(format!("feature {key}: primary key value is {k}")),
                Err(e) => problems.push(format!("feature {key}: {e}")),
            }
        }
        Ok(problems)
    }
}

fn schema_delta(diff: &DatasetDiff) -> Option<&Delta> {
    diff.meta()?.get(&Key::text(SCHEMA_ITEM))
}

fn apply_files(files: &DeltaDiff, builder: &mut TreeBuilder<'_>, report: &mut ApplyReport) -> Result<()> {
    for (key, delta) in files.iter() {
        let path = key.to_string();
        let current = match builder.get(&path)? {
            Some(TreeEntry::Blob(id)) => Some(id),
            _ => None,
        };
        let expected = match delta.old_value()? {
            Some(ItemValue::File(id)) => Some(*id),
            Some(_) => return Err(Error::corrupt(format!("file delta {path} holds a non-file value"))),
            None => None,
        };
        if current != expected {
            report.conflicts.push(format!("file:{path}"));
            continue;
        }
        match delta.new_value()? {
            Some(ItemValue::File(id)) => builder.insert(&path, *id)?,
            Some(_) => return Err(Error::corrupt(format!("file delta {path} holds a non-file value"))),
            None => {
                builder.remove(&path)?;
            }
        }
    }
    Ok(())
}

/// Apply `diff` to `base_tree` and write the result.
///
/// `resolve_missing_values_from` names a tree whose values reconcile
/// inserts of items that already exist (see [`Dataset::apply_diff`]).
pub fn apply_repo_diff(
    store: &Rc<ObjectStore>,
    base_tree: ObjectId,
    diff: &RepoDiff,
    resolve_missing_values_from: Option<ObjectId>,
) -> Result<ObjectId> {
    let problems = check_meta_items(diff)?;
    if !problems.is_empty() {
        return Err(Error::InvalidMetaItems { problems });
    }

    let base = RepoStructure::new(Rc::clone(store), base_tree);
    let reference = resolve_missing_values_from.map(|t| RepoStructure::new(Rc::clone(store), t));
    let mut builder = TreeBuilder::new(store, Some(base_tree))?;
    let mut report = ApplyReport::default();

    for (path, ds_diff) in diff.iter() {
        let existing = base.dataset(path)?;
        let schema_change = schema_delta(ds_diff).map(Delta::delta_type);

        if schema_change == Some(DeltaType::Delete) {
            match existing {
                Some(ds) => {
                    builder.remove(&ds.inner_path())?;
                }
                None => report.conflicts.push(label(path, ItemType::Meta, &Key::text(SCHEMA_ITEM))),
            }
            continue;
        }

        let dataset = match existing {
            Some(ds) => {
                if let Some(kind) = ds_diff.kind.filter(|k| *k != ds.kind()) {
                    return Err(ds.wrong_kind(kind.content_type()));
                }
                ds
            }
            None => {
                let kind = ds_diff.kind.unwrap_or(if ds_diff.get(ItemType::Tile).is_some() {
                    DatasetKind::Tile
                } else {
                    DatasetKind::Table
                });
                debug!(dataset = %path, ?kind, "creating dataset");
                Dataset::new(Rc::clone(store), path, kind, None)
            }
        };
        let reference_ds = match &reference {
            Some(r) => r.dataset(path)?,
            None => None,
        };
        dataset.apply_diff(ds_diff, &mut builder, reference_ds.as_ref(), &mut report.conflicts)?;

        let problems = dataset.validate_diff(ds_diff)?;
        if !problems.is_empty() {
            report.violations.push((path.clone(), problems));
        }
    }

    if let Some(files) = &diff.files {
        apply_files(files, &mut builder, &mut report)?;
    }

    if !report.conflicts.is_empty() {
        return Err(Error::PatchDoesNotApply {
            conflicts: report.conflicts,
        });
    }
    if !report.violations.is_empty() {
        return Err(Error::SchemaViolations {
            violations: report.violations,
        });
    }
    let tree = builder.write()?;
    debug!(base = %base_tree.short(), tree = %tree.short(), "applied diff");
    Ok(tree)
}
