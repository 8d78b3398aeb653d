//! Typed key/value payload container.
//!
//! A [`ValueContainer`] maps string keys to typed [`Value`]s while preserving
//! insertion order, which makes its binary serialization deterministic: two
//! containers holding the same keys and values in the same order serialize to
//! byte-identical output (see [`crate::codec`]).

use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// A typed value held in a [`ValueContainer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Container(ValueContainer),
}

impl Value {
    /// Human-readable name of the variant, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::I8(_) => "i8",
            Self::I16(_) => "i16",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::U8(_) => "u8",
            Self::U16(_) => "u16",
            Self::U32(_) => "u32",
            Self::U64(_) => "u64",
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
            Self::Str(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Container(_) => "container",
        }
    }

    /// Widening integer view: any signed/unsigned integer variant as i64.
    ///
    /// Returns `None` for non-integer variants and for u64 values that do
    /// not fit in i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I8(v) => Some(i64::from(*v)),
            Self::I16(v) => Some(i64::from(*v)),
            Self::I32(v) => Some(i64::from(*v)),
            Self::I64(v) => Some(*v),
            Self::U8(v) => Some(i64::from(*v)),
            Self::U16(v) => Some(i64::from(*v)),
            Self::U32(v) => Some(i64::from(*v)),
            Self::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Floating-point view covering both float widths.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F32(v) => Some(f64::from(*v)),
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<ValueContainer> for Value {
    fn from(v: ValueContainer) -> Self {
        Self::Container(v)
    }
}

/// Ordered mapping from string keys to typed values.
///
/// Safe for concurrent readers; mutation requires external synchronization
/// (or [`SharedContainer`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueContainer {
    entries: Vec<(String, Value)>,
}

impl ValueContainer {
    /// Create an empty container
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Add or replace the value for `key`.
    ///
    /// Replacing keeps the key's original position so serialization stays
    /// deterministic across updates.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
        self
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Get the value for `key`
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Remove the value for `key`, returning it if present.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key)?.as_i64()
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Value::U8(v) => Some(u64::from(*v)),
            Value::U16(v) => Some(u64::from(*v)),
            Value::U32(v) => Some(u64::from(*v)),
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_f64()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            Value::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key)? {
            Value::Bytes(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_container(&self, key: &str) -> Option<&ValueContainer> {
        match self.get(key)? {
            Value::Container(v) => Some(v),
            _ => None,
        }
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size of the binary serialization in bytes.
    pub fn byte_size(&self) -> usize {
        crate::codec::encoded_len(self)
    }

    /// Copy every entry of `other` into `self`, replacing on key collision.
    pub fn merge(&mut self, other: &ValueContainer) {
        for (k, v) in other.iter() {
            self.set(k, v.clone());
        }
    }

    /// Compact binary form (see [`crate::codec`])
    pub fn to_bytes(&self) -> crate::error::BusResult<Vec<u8>> {
        crate::codec::encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::error::BusResult<Self> {
        crate::codec::decode(bytes)
    }

    /// Human-readable secondary form (JSON)
    pub fn to_json(&self) -> crate::error::BusResult<String> {
        crate::codec::encode_json(self)
    }

    pub fn from_json(text: &str) -> crate::error::BusResult<Self> {
        crate::codec::decode_json(text)
    }
}

impl FromIterator<(String, Value)> for ValueContainer {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut c = Self::new();
        for (k, v) in iter {
            c.set(k, v);
        }
        c
    }
}

/// Thread-safe wrapper around a [`ValueContainer`].
///
/// Concurrent mutators serialize through a read-write lock; readers work on
/// cloned snapshots.
#[derive(Debug, Default)]
pub struct SharedContainer {
    inner: RwLock<ValueContainer>,
}

impl SharedContainer {
    pub fn new(container: ValueContainer) -> Self {
        Self {
            inner: RwLock::new(container),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.set(key, value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current contents
    pub fn snapshot(&self) -> ValueContainer {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_replace() {
        let mut c = ValueContainer::new();
        c.set("name", "alice").set("age", 30i64).set("name", "bob");

        assert_eq!(c.len(), 2);
        assert_eq!(c.get_str("name"), Some("bob"));
        assert_eq!(c.get_i64("age"), Some(30));
        // Replacement keeps insertion position
        assert_eq!(c.keys().collect::<Vec<_>>(), vec!["name", "age"]);
    }

    #[test]
    fn test_typed_accessors() {
        let c = ValueContainer::new()
            .with("flag", true)
            .with("count", Value::U32(7))
            .with("ratio", 0.5f64)
            .with("blob", vec![1u8, 2, 3]);

        assert_eq!(c.get_bool("flag"), Some(true));
        assert_eq!(c.get_u64("count"), Some(7));
        assert_eq!(c.get_i64("count"), Some(7));
        assert_eq!(c.get_f64("ratio"), Some(0.5));
        assert_eq!(c.get_bytes("blob"), Some(&[1u8, 2, 3][..]));
        assert_eq!(c.get_str("flag"), None);
        assert_eq!(c.get("missing"), None);
    }

    #[test]
    fn test_nested_container() {
        let inner = ValueContainer::new().with("x", 1i64);
        let outer = ValueContainer::new().with("inner", inner.clone());

        assert_eq!(outer.get_container("inner"), Some(&inner));
        assert_eq!(outer.get_container("inner").unwrap().get_i64("x"), Some(1));
    }

    #[test]
    fn test_merge() {
        let mut a = ValueContainer::new().with("k1", 1i64).with("k2", 2i64);
        let b = ValueContainer::new().with("k2", 20i64).with("k3", 3i64);
        a.merge(&b);

        assert_eq!(a.get_i64("k1"), Some(1));
        assert_eq!(a.get_i64("k2"), Some(20));
        assert_eq!(a.get_i64("k3"), Some(3));
        assert_eq!(a.keys().collect::<Vec<_>>(), vec!["k1", "k2", "k3"]);
    }

    #[test]
    fn test_shared_container() {
        let shared = SharedContainer::new(ValueContainer::new().with("a", 1i64));
        shared.set("b", 2i64);

        assert_eq!(shared.get("a"), Some(Value::I64(1)));
        assert_eq!(shared.len(), 2);
        assert_eq!(shared.snapshot().get_i64("b"), Some(2));
    }

    #[test]
    fn test_u64_as_i64_overflow() {
        let v = Value::U64(u64::MAX);
        assert_eq!(v.as_i64(), None);
        assert_eq!(Value::U64(42).as_i64(), Some(42));
    }
}
