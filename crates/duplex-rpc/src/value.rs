//! Structured values carried by the channel.
//!
//! A `Value` is an owned tree of scalars, sequences, insertion-ordered
//! records, raw binary buffers and typed numeric views over buffers. Because
//! it is an owned tree, a `Value` can never contain a cycle. The only shared
//! parts are buffers, whose storage is immutable and reference counted.

use crate::{Result, RpcError};
use bytes::Bytes;
use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde::de::DeserializeOwned;
use std::fmt;

/// Insertion-ordered record. Iteration order is member insertion order.
pub type Map = IndexMap<String, Value>;

/// Largest integer an `f64` represents exactly (2^53 - 1).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// A structured value as delivered by the channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(Map),
    /// Raw binary buffer. The only transferable kind.
    Buffer(ArrayBuffer),
    /// Typed numeric view over a buffer. Never picked up for transfer.
    View(TypedArray),
}

impl Value {
    /// Build an object from `(key, value)` pairs, keeping their order.
    pub fn object<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&ArrayBuffer> {
        match self {
            Value::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn as_view(&self) -> Option<&TypedArray> {
        match self {
            Value::View(view) => Some(view),
            _ => None,
        }
    }

    /// Look up a member of an object. `None` for non-objects.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Short name of the value's kind, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Buffer(_) => "ArrayBuffer",
            Value::View(view) => view.kind().name(),
        }
    }

    /// Convert a JSON value. JSON has no buffers, so the result never
    /// contains transferables.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to JSON. Buffers and views become arrays of bytes.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Build a value from anything serde can serialize.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Value::from_json(serde_json::to_value(value)?))
    }

    /// Deserialize this value into a typed structure.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_json()?)?)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) => {
                // Integral numbers go out as integers so typed targets like
                // `i64` deserialize cleanly.
                if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
                    serializer.serialize_i64(*n as i64)
                } else {
                    serializer.serialize_f64(*n)
                }
            }
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    out.serialize_entry(k, v)?;
                }
                out.end()
            }
            Value::Buffer(buffer) => serializer.serialize_bytes(buffer.as_bytes()),
            Value::View(view) => serializer.serialize_bytes(view.as_bytes()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Object(map)
    }
}

impl From<ArrayBuffer> for Value {
    fn from(buffer: ArrayBuffer) -> Self {
        Value::Buffer(buffer)
    }
}

impl From<TypedArray> for Value {
    fn from(view: TypedArray) -> Self {
        Value::View(view)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from_json(json)
    }
}

impl FromIterator<Value> for Value {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Value::Array(iter.into_iter().collect())
    }
}

// ============================================================================
// Binary buffers
// ============================================================================

/// A raw binary buffer.
///
/// Storage is immutable and reference counted, so cloning an `ArrayBuffer`
/// hands out another reference to the same bytes. Equality compares
/// contents; use [`ArrayBuffer::same_buffer`] for identity.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ArrayBuffer(Bytes);

impl ArrayBuffer {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        ArrayBuffer(bytes.into())
    }

    /// A buffer of `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        ArrayBuffer(Bytes::from(vec![0u8; len]))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// True when both handles refer to the same storage.
    ///
    /// Zero-length buffers carry no storage and all compare as the same.
    pub fn same_buffer(&self, other: &ArrayBuffer) -> bool {
        self.0.as_ptr() == other.0.as_ptr() && self.0.len() == other.0.len()
    }

    /// Copy the contents into fresh storage.
    pub fn deep_copy(&self) -> Self {
        ArrayBuffer(Bytes::copy_from_slice(&self.0))
    }
}

impl fmt::Debug for ArrayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArrayBuffer({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for ArrayBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        ArrayBuffer(bytes.into())
    }
}

impl From<Bytes> for ArrayBuffer {
    fn from(bytes: Bytes) -> Self {
        ArrayBuffer(bytes)
    }
}

impl From<&'static [u8]> for ArrayBuffer {
    fn from(bytes: &'static [u8]) -> Self {
        ArrayBuffer(Bytes::from_static(bytes))
    }
}

// ============================================================================
// Typed views
// ============================================================================

/// Element type of a typed numeric view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypedArrayKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
}

impl TypedArrayKind {
    pub fn element_size(&self) -> usize {
        match self {
            TypedArrayKind::Int8 | TypedArrayKind::Uint8 | TypedArrayKind::Uint8Clamped => 1,
            TypedArrayKind::Int16 | TypedArrayKind::Uint16 => 2,
            TypedArrayKind::Int32 | TypedArrayKind::Uint32 | TypedArrayKind::Float32 => 4,
            TypedArrayKind::Float64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TypedArrayKind::Int8 => "Int8Array",
            TypedArrayKind::Uint8 => "Uint8Array",
            TypedArrayKind::Uint8Clamped => "Uint8ClampedArray",
            TypedArrayKind::Int16 => "Int16Array",
            TypedArrayKind::Uint16 => "Uint16Array",
            TypedArrayKind::Int32 => "Int32Array",
            TypedArrayKind::Uint32 => "Uint32Array",
            TypedArrayKind::Float32 => "Float32Array",
            TypedArrayKind::Float64 => "Float64Array",
        }
    }
}

impl fmt::Display for TypedArrayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed numeric view over a window of an [`ArrayBuffer`].
#[derive(Debug, Clone, PartialEq)]
pub struct TypedArray {
    kind: TypedArrayKind,
    buffer: ArrayBuffer,
    byte_offset: usize,
    length: usize,
}

impl TypedArray {
    /// View `length` elements of `kind` starting at `byte_offset`.
    pub fn new(
        kind: TypedArrayKind,
        buffer: ArrayBuffer,
        byte_offset: usize,
        length: usize,
    ) -> Result<Self> {
        let size = kind.element_size();
        if byte_offset % size != 0 {
            return Err(RpcError::Range {
                message: format!("start offset of {} should be a multiple of {}", kind, size),
            });
        }
        let end = length
            .checked_mul(size)
            .and_then(|bytes| bytes.checked_add(byte_offset));
        match end {
            Some(end) if end <= buffer.len() => Ok(Self {
                kind,
                buffer,
                byte_offset,
                length,
            }),
            _ => Err(RpcError::Range {
                message: format!("Invalid typed array length: {}", length),
            }),
        }
    }

    /// View the whole buffer.
    pub fn from_buffer(kind: TypedArrayKind, buffer: ArrayBuffer) -> Result<Self> {
        let size = kind.element_size();
        if buffer.len() % size != 0 {
            return Err(RpcError::Range {
                message: format!("byte length of {} should be a multiple of {}", kind, size),
            });
        }
        let length = buffer.len() / size;
        Self::new(kind, buffer, 0, length)
    }

    pub fn kind(&self) -> TypedArrayKind {
        self.kind
    }

    pub fn buffer(&self) -> &ArrayBuffer {
        &self.buffer
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn byte_len(&self) -> usize {
        self.length * self.kind.element_size()
    }

    /// The bytes inside the view's window.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer.as_bytes()[self.byte_offset..self.byte_offset + self.byte_len()]
    }

    /// Same window over a different buffer of equal length.
    pub(crate) fn with_buffer(self, buffer: ArrayBuffer) -> Self {
        Self { buffer, ..self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_object_keeps_insertion_order() {
        let value = Value::object([("z", Value::from(1)), ("a", Value::from(2))]);
        let keys: Vec<&str> = value
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn test_from_json_converts_nested_values() {
        let value = Value::from_json(serde_json::json!({"x": 2, "tags": ["a", null]}));
        assert_eq!(value.get("x"), Some(&Value::Number(2.0)));
        assert_eq!(
            value.get("tags"),
            Some(&Value::Array(vec![Value::from("a"), Value::Null]))
        );
    }

    #[test]
    fn test_integral_numbers_serialize_as_integers() {
        let json = Value::from(5).to_json().unwrap();
        assert_eq!(json, serde_json::json!(5));
        let json = Value::from(2.5).to_json().unwrap();
        assert_eq!(json, serde_json::json!(2.5));
    }

    #[test]
    fn test_deserialize_into_typed_struct() {
        #[derive(Deserialize)]
        struct Args {
            x: i64,
            y: i64,
        }

        let value = Value::object([("x", Value::from(2)), ("y", Value::from(3))]);
        let args: Args = value.deserialize_into().unwrap();
        assert_eq!(args.x + args.y, 5);
    }

    #[test]
    fn test_buffer_serializes_as_byte_array() {
        let value = Value::from(ArrayBuffer::from(vec![1u8, 2, 3]));
        assert_eq!(value.to_json().unwrap(), serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_buffer_identity_vs_equality() {
        let a = ArrayBuffer::from(vec![7u8; 4]);
        let shared = a.clone();
        let copy = a.deep_copy();

        assert!(a.same_buffer(&shared));
        assert!(!a.same_buffer(&copy));
        assert_eq!(a, copy);
    }

    #[test]
    fn test_typed_array_rejects_misaligned_offset() {
        let err = TypedArray::new(TypedArrayKind::Int32, ArrayBuffer::zeroed(16), 2, 1)
            .unwrap_err();
        assert!(err.to_string().contains("multiple of 4"));
    }

    #[test]
    fn test_typed_array_rejects_out_of_bounds() {
        let err = TypedArray::new(TypedArrayKind::Float64, ArrayBuffer::zeroed(16), 8, 2)
            .unwrap_err();
        assert!(err.to_string().contains("Invalid typed array length"));
    }

    #[test]
    fn test_typed_array_window_bytes() {
        let buffer = ArrayBuffer::from(vec![0u8, 1, 2, 3, 4, 5, 6, 7]);
        let view = TypedArray::new(TypedArrayKind::Uint16, buffer, 2, 2).unwrap();
        assert_eq!(view.as_bytes(), &[2, 3, 4, 5]);
        assert_eq!(view.byte_len(), 4);
        assert_eq!(Value::from(view).type_name(), "Uint16Array");
    }

    #[test]
    fn test_from_buffer_requires_whole_elements() {
        assert!(TypedArray::from_buffer(TypedArrayKind::Uint32, ArrayBuffer::zeroed(6)).is_err());
        let view =
            TypedArray::from_buffer(TypedArrayKind::Uint32, ArrayBuffer::zeroed(8)).unwrap();
        assert_eq!(view.len(), 2);
    }
}
