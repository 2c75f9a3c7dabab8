//! Table schemas
//!
//! `schema.json` is an ordered list of columns. Primary key columns carry a
//! `primaryKeyIndex`; a feature's key is built from them in that order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::value::{Feature, Key, MetaValue};

pub const SCHEMA_ITEM: &str = "schema.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Integer,
    Float,
    Text,
    Geometry,
    Blob,
    Date,
    Timestamp,
}

impl DataType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            DataType::Boolean => value.is_boolean(),
            DataType::Integer => value.is_i64() || value.is_u64(),
            DataType::Float => value.is_number(),
            DataType::Text | DataType::Blob | DataType::Date | DataType::Timestamp => {
                value.is_string()
            }
            // Hex WKB or a GeoJSON geometry object.
            DataType::Geometry => {
                value.is_string() || value.as_object().is_some_and(|o| o.contains_key("type"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub id: String,
    pub name: String,
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key_index: Option<usize>,
}

impl Column {
    pub fn new(name: &str, data_type: DataType, primary_key_index: Option<usize>) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
            data_type,
            primary_key_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let schema: Schema = serde_json::from_value(value.clone())?;
        if schema.pk_columns().is_empty() {
            return Err(Error::corrupt("schema has no primary key column"));
        }
        Ok(schema)
    }

    pub fn from_meta(value: &MetaValue) -> Result<Self> {
        match value {
            MetaValue::Json(v) => Self::from_json(v),
            _ => Err(Error::corrupt("schema.json must hold JSON")),
        }
    }

    pub fn to_meta(&self) -> Result<MetaValue> {
        Ok(MetaValue::Json(serde_json::to_value(self)?))
    }

    /// Primary key columns in key order.
    pub fn pk_columns(&self) -> Vec<&Column> {
        let mut pks: Vec<&Column> = self
            .columns
            .iter()
            .filter(|c| c.primary_key_index.is_some())
            .collect();
        pks.sort_by_key(|c| c.primary_key_index);
        pks
    }

    /// Name of the first geometry column.
    pub fn geometry_column(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.data_type == DataType::Geometry)
            .map(|c| c.name.as_str())
    }

    /// The key of a feature: its single primary key value, or a tuple of them.
    pub fn key_of(&self, feature: &Feature) -> Result<Key> {
        let pks = self.pk_columns();
        let mut parts = Vec::with_capacity(pks.len());
        for col in &pks {
            let v = feature.get(&col.name).unwrap_or(&Value::Null);
            parts.push(Key::from_json(v)?);
        }
        match parts.len() {
            0 => Err(Error::corrupt("schema has no primary key column")),
            1 => Ok(parts.remove(0)),
            _ => Ok(Key::Tuple(parts)),
        }
    }

    /// Problems with a feature under this schema. Empty means valid.
    pub fn validate_feature(&self, key: &Key, feature: &Feature) -> Vec<String> {
        let mut problems = Vec::new();
        for name in feature.keys() {
            if !self.columns.iter().any(|c| &c.name == name) {
                problems.push(format!("feature {key}: unknown column {name:?}"));
            }
        }
        for col in &self.columns {
            match feature.get(&col.name) {
                None | Some(Value::Null) => {
                    if col.primary_key_index.is_some() {
                        problems.push(format!(
                            "feature {key}: primary key column {:?} is null",
                            col.name
                        ));
                    }
                }
                Some(v) if !col.data_type.accepts(v) => problems.push(format!(
                    "feature {key}: column {:?} expects {:?}, got {v}",
                    col.name, col.data_type
                )),
                Some(_) => {}
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roads() -> Schema {
        Schema::new(vec![
            Column::new("fid", DataType::Integer, Some(0)),
            Column::new("geom", DataType::Geometry, None),
            Column::new("name", DataType::Text, None),
        ])
    }

    fn row(v: Value) -> Feature {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_schema_json_layout() {
        let v = serde_json::to_value(roads()).unwrap();
        assert_eq!(
            v[0],
            json!({"id": "fid", "name": "fid", "dataType": "integer", "primaryKeyIndex": 0})
        );
        assert!(v[1].get("primaryKeyIndex").is_none());
        assert_eq!(Schema::from_json(&v).unwrap(), roads());
    }

    #[test]
    fn test_schema_without_pk_rejected() {
        let v = json!([{"id": "a", "name": "a", "dataType": "text"}]);
        assert!(Schema::from_json(&v).is_err());
    }

    #[test]
    fn test_key_of_single_and_composite() {
        let f = row(json!({"fid": 7, "name": "x"}));
        assert_eq!(roads().key_of(&f).unwrap(), Key::Int(7));

        let composite = Schema::new(vec![
            Column::new("b", DataType::Text, Some(1)),
            Column::new("a", DataType::Integer, Some(0)),
        ]);
        let f = row(json!({"a": 1, "b": "z"}));
        assert_eq!(
            composite.key_of(&f).unwrap(),
            Key::Tuple(vec![Key::Int(1), Key::text("z")])
        );
    }

    #[test]
    fn test_validate_feature() {
        let ok = row(json!({"fid": 1, "geom": "0101", "name": "a"}));
        assert!(roads().validate_feature(&Key::Int(1), &ok).is_empty());

        let bad = row(json!({"fid": 1, "name": 5, "colour": "red"}));
        let problems = roads().validate_feature(&Key::Int(1), &bad);
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().any(|p| p.contains("colour")));
        assert!(problems.iter().any(|p| p.contains("\"name\"")));

        let null_pk = row(json!({"name": "a"}));
        assert_eq!(roads().validate_feature(&Key::Null, &null_pk).len(), 1);
    }

    #[test]
    fn test_geometry_column() {
        assert_eq!(roads().geometry_column(), Some("geom"));
    }
}
