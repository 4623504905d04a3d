//! Record schemas in the Avro JSON notation, and merging calc columns into them.

use serde::{Deserialize, Serialize};

use crate::transform::CalcColumn;
use crate::value::Value;

/// Schema of a record container.
///
/// Attributes this crate does not interpret (`namespace`, `doc`, ...) are kept
/// as they are, so a schema survives a read and write unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub name: String,
    pub fields: Vec<Field>,
    #[serde(flatten)]
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

/// The only top-level schema type a record container can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Record,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(flatten)]
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldType {
    Primitive(Primitive),
    Union(Vec<FieldType>),
    Complex(Complex),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    Null,
    Boolean,
    Int,
    Long,
    Float,
    Double,
    String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Complex {
    Array { items: Box<FieldType> },
}

impl Schema {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            kind: RecordKind::Record,
            name: name.into(),
            fields,
            attrs: Default::default(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }
}

impl Field {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            attrs: Default::default(),
        }
    }

    /// Field holding a calc column: any storable value, or null when evaluation failed.
    pub fn calc(name: impl Into<String>) -> Self {
        let ty = FieldType::Union(
            [
                Primitive::Null,
                Primitive::Boolean,
                Primitive::Long,
                Primitive::Double,
                Primitive::String,
            ]
            .into_iter()
            .map(FieldType::Primitive)
            .collect(),
        );
        let mut field = Self::new(name, ty);
        field.attrs.insert("default".to_string(), serde_json::Value::Null);
        field
    }
}

impl FieldType {
    /// Convert a JSON value of this type. `None` when the value does not match.
    pub fn decode(&self, json: &serde_json::Value) -> Option<Value> {
        use serde_json::Value as J;

        match (self, json) {
            (FieldType::Primitive(p), json) => match (p, json) {
                (Primitive::Null, J::Null) => Some(Value::Null),
                (Primitive::Boolean, J::Bool(b)) => Some(Value::Bool(*b)),
                (Primitive::Int, J::Number(n)) => n
                    .as_i64()
                    .filter(|i| i32::try_from(*i).is_ok())
                    .map(Value::Int),
                (Primitive::Long, J::Number(n)) => n.as_i64().map(Value::Int),
                (Primitive::Float | Primitive::Double, J::Number(n)) => n.as_f64().map(Value::Float),
                (Primitive::String, J::String(s)) => Some(Value::Str(s.clone())),
                _ => None,
            },
            (FieldType::Union(variants), json) => variants.iter().find_map(|ty| ty.decode(json)),
            (FieldType::Complex(Complex::Array { items }), J::Array(values)) => values
                .iter()
                .map(|v| items.decode(v))
                .collect::<Option<Vec<_>>>()
                .map(Value::List),
            _ => None,
        }
    }

    /// Whether a value may be written into a field of this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::Primitive(p), value) => matches!(
                (p, value),
                (Primitive::Null, Value::Null)
                    | (Primitive::Boolean, Value::Bool(_))
                    | (Primitive::Long, Value::Int(_))
                    | (Primitive::Float | Primitive::Double, Value::Float(_))
                    | (Primitive::String, Value::Str(_))
            ) || matches!((p, value), (Primitive::Int, Value::Int(i)) if i32::try_from(*i).is_ok()),
            (FieldType::Union(variants), value) => variants.iter().any(|ty| ty.accepts(value)),
            (FieldType::Complex(Complex::Array { items }), Value::List(values)) => {
                values.iter().all(|v| items.accepts(v))
            }
            _ => false,
        }
    }
}

/// Calc column names that cannot be added to a schema.
#[derive(Debug, Clone, PartialEq, Eq, Default, thiserror::Error)]
#[error("calc columns conflict: {}", describe_conflict(.duplicates, .collisions, .invalid))]
pub struct SchemaConflict {
    /// Names given to more than one calc column.
    pub duplicates: Vec<String>,
    /// Names already used by the input schema.
    pub collisions: Vec<String>,
    /// Names that are not valid field names.
    pub invalid: Vec<String>,
}

fn describe_conflict(duplicates: &[String], collisions: &[String], invalid: &[String]) -> String {
    let quoted = |names: &[String]| {
        names
            .iter()
            .map(|n| format!("'{n}'"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut parts = Vec::new();
    if !duplicates.is_empty() {
        parts.push(format!("duplicate names {}", quoted(duplicates)));
    }
    if !collisions.is_empty() {
        parts.push(format!("already in input schema {}", quoted(collisions)));
    }
    if !invalid.is_empty() {
        parts.push(format!("invalid names {}", quoted(invalid)));
    }
    parts.join("; ")
}

impl SchemaConflict {
    pub fn is_empty(&self) -> bool {
        self.duplicates.is_empty() && self.collisions.is_empty() && self.invalid.is_empty()
    }
}

/// Extend the input schema with one nullable field per calc column, in request order.
pub fn merge(input: &Schema, columns: &[CalcColumn]) -> Result<Schema, SchemaConflict> {
    let mut conflict = SchemaConflict::default();

    for (i, column) in columns.iter().enumerate() {
        let name = &column.name;
        let repeated = columns[..i].iter().any(|c| &c.name == name);
        if repeated && !conflict.duplicates.contains(name) {
            conflict.duplicates.push(name.clone());
        }
    }
    for column in columns {
        if input.field(&column.name).is_some() && !conflict.collisions.contains(&column.name) {
            conflict.collisions.push(column.name.clone());
        }
    }
    for column in columns {
        let valid = lazy_regex::regex_is_match!(r"^[A-Za-z_][A-Za-z0-9_]*$", &column.name);
        if !valid && !conflict.invalid.contains(&column.name) {
            conflict.invalid.push(column.name.clone());
        }
    }

    if !conflict.is_empty() {
        return Err(conflict);
    }

    let mut merged = input.clone();
    merged
        .fields
        .extend(columns.iter().map(|column| Field::calc(&column.name)));
    Ok(merged)
}
