use serde::{Deserialize, Serialize};

/// StorageClass is the declared shape of a context's stored value.
/// It's fixed per context in the catalog, not per row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    /// No value is stored; rows carry only flags.
    Null,
    /// A 64-bit signed integer, stored in the `num` column.
    Int,
    /// Opaque bytes, stored in the `value` column.
    Bytes,
    /// UTF-8 text, stored in the `value` column.
    Text,
    /// A structured value serialized to the `value` column, optionally
    /// validated against a per-context schema.
    Serialized,
}

/// Value is the dynamically-typed payload of a property or node row.
/// The runtime variant must match the owning context's [`StorageClass`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Null,
    Int(i64),
    Bytes(Vec<u8>),
    Text(String),
    Serialized(serde_json::Value),
}

impl Value {
    pub fn storage_class(&self) -> StorageClass {
        match self {
            Value::Null => StorageClass::Null,
            Value::Int(_) => StorageClass::Int,
            Value::Bytes(_) => StorageClass::Bytes,
            Value::Text(_) => StorageClass::Text,
            Value::Serialized(_) => StorageClass::Serialized,
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}
impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}
impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Serialized(v)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn storage_class_of_variants() {
        assert_eq!(Value::Null.storage_class(), StorageClass::Null);
        assert_eq!(Value::Int(3).storage_class(), StorageClass::Int);
        assert_eq!(Value::from("x").storage_class(), StorageClass::Text);
        assert_eq!(
            Value::Serialized(serde_json::json!({"a": 1})).storage_class(),
            StorageClass::Serialized,
        );
    }
}
