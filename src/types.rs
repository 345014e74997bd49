/// Types shared by the adapter and the remote engine: primary keys,
/// key types, rows and table declarations.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A row is a mapping from field name to value.
pub type Row = serde_json::Map<String, Value>;

/// Primary key value.
///
/// Serialized untagged so keys travel as plain JSON numbers or strings.
/// Integer keys sort before text keys; a table only ever holds one kind.
/// There is no float form: `number` tables must use integral key values,
/// and a row whose key is fractional is rejected as having no key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DbKey {
    Int(i64),
    Text(String),
}

impl DbKey {
    /// Read a key out of a row field value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(DbKey::Int),
            Value::String(s) => Some(DbKey::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            DbKey::Int(n) => Value::from(*n),
            DbKey::Text(s) => Value::from(s.as_str()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            DbKey::Int(n) => Some(*n),
            DbKey::Text(_) => None,
        }
    }
}

impl fmt::Display for DbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbKey::Int(n) => write!(f, "{}", n),
            DbKey::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for DbKey {
    fn from(n: i64) -> Self {
        DbKey::Int(n)
    }
}

impl From<&str> for DbKey {
    fn from(s: &str) -> Self {
        DbKey::Text(s.to_string())
    }
}

impl From<String> for DbKey {
    fn from(s: String) -> Self {
        DbKey::Text(s)
    }
}

/// Declared type of a table's primary key.
///
/// Serialized by its declared name (`"int"`, `"timeIdms"`, ...), the same
/// form `parse` accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum KeyType {
    Int,
    /// Numeric keys; values must still be integral.
    Number,
    String,
    Uuid,
    /// Time-ordered id, second resolution.
    TimeId,
    /// Time-ordered id, millisecond resolution.
    TimeIdMs,
    /// Any type name the adapter has no generation strategy for.
    Other(String),
}

impl KeyType {
    pub fn parse(name: &str) -> Self {
        match name {
            "int" => KeyType::Int,
            "number" => KeyType::Number,
            "string" => KeyType::String,
            "uuid" => KeyType::Uuid,
            "timeId" => KeyType::TimeId,
            "timeIdms" => KeyType::TimeIdMs,
            other => KeyType::Other(other.to_string()),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, KeyType::Int | KeyType::Number)
    }

    pub fn name(&self) -> &str {
        match self {
            KeyType::Int => "int",
            KeyType::Number => "number",
            KeyType::String => "string",
            KeyType::Uuid => "uuid",
            KeyType::TimeId => "timeId",
            KeyType::TimeIdMs => "timeIdms",
            KeyType::Other(name) => name,
        }
    }
}

impl From<String> for KeyType {
    fn from(name: String) -> Self {
        KeyType::parse(&name)
    }
}

impl From<KeyType> for String {
    fn from(key_type: KeyType) -> Self {
        key_type.name().to_string()
    }
}

/// Declaration of a table's primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDefinition {
    pub name: String,
    /// Field of the row that holds the primary key.
    pub primary_key: String,
    pub key_type: KeyType,
    /// Only honoured for numeric key types.
    #[serde(default)]
    pub auto_increment: bool,
}

impl TableDefinition {
    pub fn new(name: &str, primary_key: &str, key_type: KeyType) -> Self {
        Self {
            name: name.to_string(),
            primary_key: primary_key.to_string(),
            key_type,
            auto_increment: false,
        }
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Whether keys for this table come from the auto-increment counter.
    pub fn uses_auto_increment(&self) -> bool {
        self.auto_increment && self.key_type.is_numeric()
    }
}
