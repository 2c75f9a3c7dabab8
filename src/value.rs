//! Item keys and values
//!
//! Every addressable item in a dataset is identified by an [`ItemType`]
//! and a [`Key`], and holds an [`ItemValue`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::store::ObjectId;
use crate::tile::TilePointer;

/// Item key.
///
/// Ordering puts integers first (numerically), then strings (lexically),
/// then composite keys, and the "no key" value last.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Int(i64),
    Text(String),
    Tuple(Vec<Key>),
    Null,
}

impl Key {
    pub fn text(s: impl Into<String>) -> Self {
        Key::Text(s.into())
    }

    pub fn to_json(&self) -> Value {
        match self {
            Key::Int(i) => Value::from(*i),
            Key::Text(s) => Value::String(s.clone()),
            Key::Tuple(parts) => Value::Array(parts.iter().map(Key::to_json).collect()),
            Key::Null => Value::Null,
        }
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(match value {
            Value::Null => Key::Null,
            Value::String(s) => Key::Text(s.clone()),
            Value::Number(n) => Key::Int(
                n.as_i64()
                    .ok_or_else(|| Error::corrupt(format!("key {n} is not an integer")))?,
            ),
            Value::Array(parts) => Key::Tuple(
                parts
                    .iter()
                    .map(Key::from_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            other => return Err(Error::corrupt(format!("{other} can't be a key"))),
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Key::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    /// Composite keys are comma-joined.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Text(s) => f.write_str(s),
            Key::Tuple(parts) => {
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{p}")?;
                }
                Ok(())
            }
            Key::Null => f.write_str("null"),
        }
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(s)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let v = Value::deserialize(d)?;
        Key::from_json(&v).map_err(serde::de::Error::custom)
    }
}

// ── Item types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ItemType {
    Meta,
    Feature,
    Tile,
}

impl ItemType {
    pub const ALL: [ItemType; 3] = [ItemType::Meta, ItemType::Feature, ItemType::Tile];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Meta => "meta",
            ItemType::Feature => "feature",
            ItemType::Tile => "tile",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "meta" => Ok(ItemType::Meta),
            "feature" => Ok(ItemType::Feature),
            "tile" => Ok(ItemType::Tile),
            _ => Err(Error::Usage(format!("unknown item type {s:?}"))),
        }
    }
}

// ── Values ─────────────────────────────────────────────────────────────

/// A feature row: column name → value.
pub type Feature = serde_json::Map<String, Value>;

/// Value of a meta item.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Json(Value),
    Text(String),
    /// Several candidate values with no winner. Can't be committed.
    ListOfConflicts(Vec<MetaValue>),
}

impl MetaValue {
    /// Meta items ending in `.json` hold JSON, everything else is text.
    pub fn is_json_name(name: &str) -> bool {
        name.ends_with(".json")
    }

    pub fn decode(name: &str, data: &[u8]) -> Result<Self> {
        if Self::is_json_name(name) {
            Ok(MetaValue::Json(serde_json::from_slice(data)?))
        } else {
            let text = String::from_utf8(data.to_vec())
                .map_err(|_| Error::corrupt(format!("meta item {name} is not UTF-8")))?;
            Ok(MetaValue::Text(text))
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            MetaValue::Json(v) => Ok(serde_json::to_vec_pretty(v)?),
            MetaValue::Text(s) => Ok(s.as_bytes().to_vec()),
            MetaValue::ListOfConflicts(_) => Err(Error::corrupt(
                "a list of conflicting values can't be stored",
            )),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            MetaValue::Json(v) => v.clone(),
            MetaValue::Text(s) => Value::String(s.clone()),
            MetaValue::ListOfConflicts(items) => {
                Value::Array(items.iter().map(MetaValue::to_json).collect())
            }
        }
    }
}

/// The value of any item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemValue {
    Meta(MetaValue),
    Feature(Feature),
    Tile(TilePointer),
    /// A non-dataset file, by blob id.
    File(ObjectId),
}

impl ItemValue {
    pub fn as_meta(&self) -> Option<&MetaValue> {
        match self {
            ItemValue::Meta(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_feature(&self) -> Option<&Feature> {
        match self {
            ItemValue::Feature(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_tile(&self) -> Option<&TilePointer> {
        match self {
            ItemValue::Tile(t) => Some(t),
            _ => None,
        }
    }

    /// JSON rendering used in diff and conflict output.
    pub fn to_json(&self, key: &Key) -> Value {
        match self {
            ItemValue::Meta(m) => m.to_json(),
            ItemValue::Feature(f) => Value::Object(f.clone()),
            ItemValue::Tile(t) => t.summary(&key.to_string()),
            ItemValue::File(id) => Value::String(id.to_hex()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ordering() {
        let mut keys = vec![
            Key::Null,
            Key::text("b"),
            Key::Int(10),
            Key::text("a"),
            Key::Int(-2),
            Key::Tuple(vec![Key::Int(1)]),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                Key::Int(-2),
                Key::Int(10),
                Key::text("a"),
                Key::text("b"),
                Key::Tuple(vec![Key::Int(1)]),
                Key::Null,
            ]
        );
    }

    #[test]
    fn test_composite_key_display() {
        let k = Key::Tuple(vec![Key::Int(1), Key::text("x")]);
        assert_eq!(k.to_string(), "1,x");
    }

    #[test]
    fn test_key_json() {
        let k = Key::Tuple(vec![Key::Int(1), Key::text("x"), Key::Null]);
        assert_eq!(k.to_json(), json!([1, "x", null]));
        assert_eq!(Key::from_json(&k.to_json()).unwrap(), k);
        assert!(Key::from_json(&json!(1.5)).is_err());
        assert!(Key::from_json(&json!({"a": 1})).is_err());
    }

    #[test]
    fn test_item_type_parse() {
        assert_eq!("tile".parse::<ItemType>().unwrap(), ItemType::Tile);
        assert!("feat".parse::<ItemType>().is_err());
    }

    #[test]
    fn test_meta_value_by_name() {
        let json_item = MetaValue::decode("schema.json", b"[1, 2]").unwrap();
        assert_eq!(json_item, MetaValue::Json(json!([1, 2])));
        let text_item = MetaValue::decode("title", b"Roads").unwrap();
        assert_eq!(text_item, MetaValue::Text("Roads".into()));
        assert!(MetaValue::decode("format.json", b"{nope").is_err());
    }

    #[test]
    fn test_list_of_conflicts_not_encodable() {
        let v = MetaValue::ListOfConflicts(vec![MetaValue::Text("a".into())]);
        assert!(v.encode().is_err());
    }
}
