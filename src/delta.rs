//! Deltas
//!
//! A [`Delta`] is one insert, update or delete of a single item. Deltas
//! invert with `!` and chain with `+` (or [`Delta::concat`]):
//!
//! | self \ other | insert | update | delete |
//! |---|---|---|---|
//! | insert | conflict | insert(other.new) | nothing |
//! | update | conflict | maybe_update(self.old, other.new) | delete(self.old) |
//! | delete | maybe_update(self.old, other.new) | conflict | conflict |
//!
//! Concatenation assumes the deltas are chained (`self.new` is `other.old`)
//! and only checks that their types are compatible.

use std::fmt;
use std::ops::{Add, BitOr, Not};

use crate::error::{Error, Result};
use crate::lazy::Lazy;
use crate::value::{ItemValue, Key};

static NULL_KEY: Key = Key::Null;

/// One side of a delta: a key and a (possibly deferred) value.
#[derive(Debug, Clone)]
pub struct KeyValue {
    key: Key,
    value: Lazy<ItemValue>,
}

impl KeyValue {
    pub fn new(key: Key, value: ItemValue) -> Self {
        Self {
            key,
            value: Lazy::loaded(value),
        }
    }

    pub fn lazy(key: Key, value: Lazy<ItemValue>) -> Self {
        Self { key, value }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn value(&self) -> Result<&ItemValue> {
        self.value.force()
    }

    pub fn lazy_value(&self) -> &Lazy<ItemValue> {
        &self.value
    }

    /// Key and value both equal. Forces both values.
    pub fn try_eq(&self, other: &KeyValue) -> Result<bool> {
        Ok(self.key == other.key && self.value.try_eq(&other.value)?)
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeltaType {
    Insert,
    Update,
    Delete,
}

impl DeltaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaType::Insert => "insert",
            DeltaType::Update => "update",
            DeltaType::Delete => "delete",
        }
    }

    /// Plural form used in summaries.
    pub fn plural(&self) -> &'static str {
        match self {
            DeltaType::Insert => "inserts",
            DeltaType::Update => "updates",
            DeltaType::Delete => "deletes",
        }
    }
}

impl fmt::Display for DeltaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delta flags (bitmask).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeltaFlags(u8);

impl DeltaFlags {
    pub const NONE: DeltaFlags = DeltaFlags(0);
    /// The new side was read from the working copy.
    pub const WORKING_COPY_EDIT: DeltaFlags = DeltaFlags(0x1);

    pub fn contains(&self, other: DeltaFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl BitOr for DeltaFlags {
    type Output = DeltaFlags;

    fn bitor(self, rhs: Self) -> Self {
        DeltaFlags(self.0 | rhs.0)
    }
}

/// A single change to one item.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    old: Option<KeyValue>,
    new: Option<KeyValue>,
    pub flags: DeltaFlags,
}

impl Delta {
    /// Fails with [`Error::EmptyDelta`] if both sides are absent.
    pub fn new(old: Option<KeyValue>, new: Option<KeyValue>) -> Result<Self> {
        if old.is_none() && new.is_none() {
            return Err(Error::EmptyDelta);
        }
        Ok(Self {
            old,
            new,
            flags: DeltaFlags::NONE,
        })
    }

    pub fn insert(new: KeyValue) -> Self {
        Self {
            old: None,
            new: Some(new),
            flags: DeltaFlags::NONE,
        }
    }

    pub fn update(old: KeyValue, new: KeyValue) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
            flags: DeltaFlags::NONE,
        }
    }

    pub fn delete(old: KeyValue) -> Self {
        Self {
            old: Some(old),
            new: None,
            flags: DeltaFlags::NONE,
        }
    }

    /// An update, or `None` if old and new are the same.
    pub fn maybe_update(old: KeyValue, new: KeyValue) -> Result<Option<Self>> {
        if old.try_eq(&new)? {
            Ok(None)
        } else {
            Ok(Some(Self::update(old, new)))
        }
    }

    pub fn with_flags(mut self, flags: DeltaFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    pub fn delta_type(&self) -> DeltaType {
        match (&self.old, &self.new) {
            (None, _) => DeltaType::Insert,
            (Some(_), Some(_)) => DeltaType::Update,
            (Some(_), None) => DeltaType::Delete,
        }
    }

    pub fn old(&self) -> Option<&KeyValue> {
        self.old.as_ref()
    }

    pub fn new_side(&self) -> Option<&KeyValue> {
        self.new.as_ref()
    }

    pub fn old_key(&self) -> Option<&Key> {
        self.old.as_ref().map(KeyValue::key)
    }

    pub fn new_key(&self) -> Option<&Key> {
        self.new.as_ref().map(KeyValue::key)
    }

    pub fn old_value(&self) -> Result<Option<&ItemValue>> {
        self.old.as_ref().map(KeyValue::value).transpose()
    }

    pub fn new_value(&self) -> Result<Option<&ItemValue>> {
        self.new.as_ref().map(KeyValue::value).transpose()
    }

    /// Identifying key: the old key if there is one, else the new key.
    pub fn key(&self) -> &Key {
        match (&self.old, &self.new) {
            (Some(kv), _) | (None, Some(kv)) => kv.key(),
            // Unreachable: construction rejects empty deltas.
            (None, None) => &NULL_KEY,
        }
    }

    pub fn into_parts(self) -> (Option<KeyValue>, Option<KeyValue>) {
        (self.old, self.new)
    }

    /// `self` followed by `other`. `Ok(None)` means the changes cancel out.
    pub fn concat(self, other: Delta) -> Result<Option<Delta>> {
        use DeltaType::*;
        let flags = self.flags | other.flags;
        let conflict = |a: DeltaType, b: DeltaType, key: &Key| Error::DeltaConflict {
            key: key.to_string(),
            first: a.as_str(),
            second: b.as_str(),
        };
        let (st, ot) = (self.delta_type(), other.delta_type());
        let result = match (st, ot) {
            (Insert, Update) => other.new.map(Delta::insert),
            (Insert, Delete) => None,
            (Update, Update) | (Delete, Insert) => match (self.old, other.new) {
                (Some(old), Some(new)) => Delta::maybe_update(old, new)?,
                _ => None,
            },
            (Update, Delete) => self.old.map(Delta::delete),
            (Insert, Insert) | (Update, Insert) | (Delete, Update) | (Delete, Delete) => {
                return Err(conflict(st, ot, self.key()));
            }
        };
        Ok(result.map(|d| d.with_flags(flags)))
    }
}

impl Not for Delta {
    type Output = Delta;

    /// Swap old and new.
    fn not(self) -> Delta {
        Delta {
            old: self.new,
            new: self.old,
            flags: self.flags,
        }
    }
}

impl Add for Delta {
    type Output = Result<Option<Delta>>;

    fn add(self, other: Delta) -> Self::Output {
        self.concat(other)
    }
}
