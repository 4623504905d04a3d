use std::cmp::Ordering;

use serde::ser::SerializeSeq;
use thiserror::Error;

/// A value produced or consumed by formulas.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Str,
    List,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueKind::Null => "None",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Str => "str",
            ValueKind::List => "list",
        };
        f.write_str(name)
    }
}

/// Aggregated type of the values produced for one calc column.
///
/// Later variants absorb earlier ones: a column that produced both integers and
/// floats is `Double`, anything mixed with text is `String`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InferredType {
    Int,
    Double,
    String,
}

impl InferredType {
    /// Type of a single value. Booleans count as integers, lists as text, nulls as nothing.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) | Value::Int(_) => Some(InferredType::Int),
            Value::Float(_) => Some(InferredType::Double),
            Value::Str(_) | Value::List(_) => Some(InferredType::String),
        }
    }

    pub fn aggregate(current: Option<Self>, value: &Value) -> Option<Self> {
        match (current, Self::of(value)) {
            (None, new) => new,
            (current, None) => current,
            (Some(a), Some(b)) => Some(a.max(b)),
        }
    }
}

/// Failure raised while evaluating a formula. Always local to one record.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
    #[error("unsupported operand types for {op}: '{lhs}' and '{rhs}'")]
    OperandTypes {
        op: &'static str,
        lhs: ValueKind,
        rhs: ValueKind,
    },

    #[error("bad operand type for unary {op}: '{operand}'")]
    UnaryType { op: &'static str, operand: ValueKind },

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow in {0}")]
    Overflow(&'static str),

    #[error("'{container}' index out of range: {index}")]
    IndexOutOfRange { container: ValueKind, index: i64 },

    #[error("'{0}' object is not subscriptable")]
    NotSubscriptable(ValueKind),

    #[error("indices must be integers, not '{0}'")]
    IndexType(ValueKind),

    #[error("no field named '{0}' in record")]
    MissingField(String),

    #[error("{what} exceeds the limit of {limit}")]
    LimitExceeded { what: &'static str, limit: usize },

    #[error("{name}() {message}")]
    Call { name: String, message: String },

    #[error("{0}")]
    Value(String),

    #[error("operation not permitted: {0}")]
    NotPermitted(String),
}

impl Fault {
    pub fn call(name: impl Into<String>, message: impl Into<String>) -> Self {
        Fault::Call {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::List(_) => ValueKind::List,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
        }
    }

    /// Numeric view of the value. Booleans are integers here, as in the formula language.
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Bool(b) => Some(Number::Int(*b as i64)),
            Value::Int(i) => Some(Number::Int(*i)),
            Value::Float(f) => Some(Number::Float(*f)),
            _ => None,
        }
    }

    /// Equality as formulas see it: numbers compare by value across int and float.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a.cmp_exact(&b) == Some(Ordering::Equal),
            _ => match (self, other) {
                (Value::List(a), Value::List(b)) => {
                    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
                }
                _ => self == other,
            },
        }
    }

    /// Ordering for `<`, `min`, `max` and friends.
    pub fn compare(&self, other: &Value, op: &'static str) -> Result<Option<Ordering>, Fault> {
        if let (Some(a), Some(b)) = (self.as_number(), other.as_number()) {
            return Ok(a.cmp_exact(&b));
        }
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b) {
                    if x.loose_eq(y) {
                        continue;
                    }
                    return x.compare(y, op);
                }
                Ok(Some(a.len().cmp(&b.len())))
            }
            _ => Err(Fault::OperandTypes {
                op,
                lhs: self.kind(),
                rhs: other.kind(),
            }),
        }
    }

    /// Text form used by `str()` and when a result must be stored as text.
    pub fn to_text(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.repr(),
        }
    }

    /// Quoted form, used for list items and diagnostics.
    pub fn repr(&self) -> String {
        match self {
            Value::Null => "None".to_string(),
            Value::Bool(true) => "True".to_string(),
            Value::Bool(false) => "False".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => format_float(*f),
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            Value::List(items) => {
                let items: Vec<String> = items.iter().map(Value::repr).collect();
                format!("[{}]", items.join(", "))
            }
        }
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "nan".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl serde::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

/// Numeric operand, after booleans were folded into integers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(i) => *i as f64,
            Number::Float(f) => *f,
        }
    }

    /// Compare without losing precision when both sides are integers.
    pub fn cmp_exact(&self, other: &Number) -> Option<Ordering> {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => Some(a.cmp(b)),
            _ => self.as_f64().partial_cmp(&other.as_f64()),
        }
    }
}
