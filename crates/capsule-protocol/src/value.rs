//! The interchange value set carried in CALL arguments and RESULT payloads.
//!
//! [`Value`] is deliberately closed: null, booleans, 64-bit integers, finite
//! floats, text, raw byte buffers, ordered sequences and text-keyed maps.
//! Anything else is rejected with a [`SerializationError`] before it reaches
//! the wire.
//!
//! On the wire a value is plain JSON, except byte buffers which are encoded as
//! a single-key object `{"$bytes": "<base64>"}`. A user map whose only key is
//! `"$bytes"` would be ambiguous and is refused.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use base64::prelude::*;
use serde::de::{self, DeserializeOwned, MapAccess, SeqAccess, Visitor};
use serde::ser::{self, Impossible, SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SerializationError;

/// Reserved object key marking a base64-encoded byte buffer.
pub const BYTES_KEY: &str = "$bytes";

/// Keyword arguments of a remote call.
pub type Kwargs = BTreeMap<String, Value>;

/// A value that can cross the channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Wrap a raw byte buffer.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(data.into())
    }

    /// Short name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
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

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of the value; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Look up a key when the value is a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Check that the value (recursively) can be encoded on the wire.
    pub fn check_encodable(&self) -> Result<(), SerializationError> {
        match self {
            Value::Float(f) if !f.is_finite() => Err(SerializationError::new(
                "float",
                format!("non-finite float {} has no interchange form", f),
            )),
            Value::List(items) => items.iter().try_for_each(Value::check_encodable),
            Value::Map(entries) => {
                if entries.len() == 1 && entries.contains_key(BYTES_KEY) {
                    return Err(SerializationError::new(
                        "map",
                        format!("the single key `{}` is reserved for byte buffers", BYTES_KEY),
                    ));
                }
                entries.values().try_for_each(Value::check_encodable)
            }
            _ => Ok(()),
        }
    }

    /// Convert to JSON for typed decoding. Byte buffers become arrays of
    /// numbers so they decode into `Vec<u8>` fields.
    pub fn into_plain_json(self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            Value::Float(f) => serde_json::Value::from(f),
            Value::Str(s) => serde_json::Value::String(s),
            Value::Bytes(b) => serde_json::Value::Array(b.into_iter().map(Into::into).collect()),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Value::into_plain_json).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, v.into_plain_json()))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

macro_rules! from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(i64::from(v))
            }
        })*
    };
}

from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(v: BTreeMap<String, T>) -> Self {
        Value::Map(v.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<Value>> From<HashMap<String, T>> for Value {
    fn from(v: HashMap<String, T>) -> Self {
        Value::Map(v.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<Value>> FromIterator<T> for Value {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Value::List(iter.into_iter().map(Into::into).collect())
    }
}

/// Convert any serializable value into the interchange set.
///
/// Fails fast on anything outside the set (non-text map keys, non-finite
/// floats, integers beyond the signed 64-bit range) instead of coercing.
pub fn to_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, SerializationError> {
    let outer = std::any::type_name::<T>();
    let converted = value.serialize(ValueSerializer).map_err(|e| {
        if e.type_name == "unknown" {
            SerializationError::new(outer, e.reason)
        } else if e.type_name == outer {
            e
        } else {
            e.within(outer)
        }
    })?;
    converted.check_encodable()?;
    Ok(converted)
}

/// Decode a value into a typed result.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, SerializationError> {
    let found = value.type_name();
    serde_json::from_value(value.into_plain_json()).map_err(|e| {
        SerializationError::new(
            std::any::type_name::<T>(),
            format!("cannot decode from {}: {}", found, e),
        )
    })
}

// ============================================================================
// Wire encoding
// ============================================================================

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => {
                if !f.is_finite() {
                    return Err(ser::Error::custom(format!(
                        "non-finite float {} has no interchange form",
                        f
                    )));
                }
                serializer.serialize_f64(*f)
            }
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(BYTES_KEY, &BASE64_STANDARD.encode(b))?;
                map.end()
            }
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                if entries.len() == 1 && entries.contains_key(BYTES_KEY) {
                    return Err(ser::Error::custom(format!(
                        "the single key `{}` is reserved for byte buffers",
                        BYTES_KEY
                    )));
                }
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an interchange value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| E::custom(format!("integer {} exceeds the signed 64-bit range", v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::Str(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut entries = BTreeMap::new();
        while let Some((key, value)) = map.next_entry::<String, Value>()? {
            entries.insert(key, value);
        }
        if entries.len() == 1 {
            if let Some(Value::Str(encoded)) = entries.get(BYTES_KEY) {
                let data = BASE64_STANDARD
                    .decode(encoded)
                    .map_err(de::Error::custom)?;
                return Ok(Value::Bytes(data));
            }
        }
        Ok(Value::Map(entries))
    }
}

// ============================================================================
// Serializer from arbitrary `Serialize` types into `Value`
// ============================================================================

struct ValueSerializer;

fn out_of_range(type_name: &str, v: impl fmt::Display) -> SerializationError {
    SerializationError::new(
        type_name,
        format!("{} exceeds the signed 64-bit integer range", v),
    )
}

fn finite(type_name: &str, v: f64) -> Result<Value, SerializationError> {
    if v.is_finite() {
        Ok(Value::Float(v))
    } else {
        Err(SerializationError::new(
            type_name,
            format!("non-finite float {} has no interchange form", v),
        ))
    }
}

impl ser::Serializer for ValueSerializer {
    type Ok = Value;
    type Error = SerializationError;
    type SerializeSeq = SeqBuilder;
    type SerializeTuple = SeqBuilder;
    type SerializeTupleStruct = SeqBuilder;
    type SerializeTupleVariant = VariantSeqBuilder;
    type SerializeMap = MapBuilder;
    type SerializeStruct = MapBuilder;
    type SerializeStructVariant = VariantMapBuilder;

    fn serialize_bool(self, v: bool) -> Result<Value, SerializationError> {
        Ok(Value::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<Value, SerializationError> {
        Ok(Value::Int(v.into()))
    }

    fn serialize_i16(self, v: i16) -> Result<Value, SerializationError> {
        Ok(Value::Int(v.into()))
    }

    fn serialize_i32(self, v: i32) -> Result<Value, SerializationError> {
        Ok(Value::Int(v.into()))
    }

    fn serialize_i64(self, v: i64) -> Result<Value, SerializationError> {
        Ok(Value::Int(v))
    }

    fn serialize_i128(self, v: i128) -> Result<Value, SerializationError> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| out_of_range("i128", v))
    }

    fn serialize_u8(self, v: u8) -> Result<Value, SerializationError> {
        Ok(Value::Int(v.into()))
    }

    fn serialize_u16(self, v: u16) -> Result<Value, SerializationError> {
        Ok(Value::Int(v.into()))
    }

    fn serialize_u32(self, v: u32) -> Result<Value, SerializationError> {
        Ok(Value::Int(v.into()))
    }

    fn serialize_u64(self, v: u64) -> Result<Value, SerializationError> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| out_of_range("u64", v))
    }

    fn serialize_u128(self, v: u128) -> Result<Value, SerializationError> {
        i64::try_from(v)
            .map(Value::Int)
            .map_err(|_| out_of_range("u128", v))
    }

    fn serialize_f32(self, v: f32) -> Result<Value, SerializationError> {
        finite("f32", f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<Value, SerializationError> {
        finite("f64", v)
    }

    fn serialize_char(self, v: char) -> Result<Value, SerializationError> {
        Ok(Value::Str(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<Value, SerializationError> {
        Ok(Value::Str(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Value, SerializationError> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn serialize_none(self) -> Result<Value, SerializationError> {
        Ok(Value::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<Value, SerializationError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Value, SerializationError> {
        Ok(Value::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Value, SerializationError> {
        Ok(Value::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<Value, SerializationError> {
        Ok(Value::Str(variant.to_string()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<Value, SerializationError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<Value, SerializationError> {
        let mut entries = BTreeMap::new();
        entries.insert(variant.to_string(), value.serialize(ValueSerializer)?);
        Ok(Value::Map(entries))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqBuilder, SerializationError> {
        Ok(SeqBuilder {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqBuilder, SerializationError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqBuilder, SerializationError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantSeqBuilder, SerializationError> {
        Ok(VariantSeqBuilder {
            variant,
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapBuilder, SerializationError> {
        Ok(MapBuilder {
            entries: BTreeMap::new(),
            next_key: None,
        })
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<MapBuilder, SerializationError> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<VariantMapBuilder, SerializationError> {
        Ok(VariantMapBuilder {
            variant,
            entries: BTreeMap::new(),
        })
    }
}

struct SeqBuilder {
    items: Vec<Value>,
}

impl ser::SerializeSeq for SeqBuilder {
    type Ok = Value;
    type Error = SerializationError;

    fn serialize_element<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> Result<(), SerializationError> {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<Value, SerializationError> {
        Ok(Value::List(self.items))
    }
}

impl ser::SerializeTuple for SeqBuilder {
    type Ok = Value;
    type Error = SerializationError;

    fn serialize_element<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> Result<(), SerializationError> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Value, SerializationError> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for SeqBuilder {
    type Ok = Value;
    type Error = SerializationError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> Result<(), SerializationError> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> Result<Value, SerializationError> {
        ser::SerializeSeq::end(self)
    }
}

struct VariantSeqBuilder {
    variant: &'static str,
    items: Vec<Value>,
}

impl ser::SerializeTupleVariant for VariantSeqBuilder {
    type Ok = Value;
    type Error = SerializationError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> Result<(), SerializationError> {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<Value, SerializationError> {
        let mut entries = BTreeMap::new();
        entries.insert(self.variant.to_string(), Value::List(self.items));
        Ok(Value::Map(entries))
    }
}

struct MapBuilder {
    entries: BTreeMap<String, Value>,
    next_key: Option<String>,
}

impl ser::SerializeMap for MapBuilder {
    type Ok = Value;
    type Error = SerializationError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), SerializationError> {
        self.next_key = Some(key.serialize(MapKeySerializer)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(
        &mut self,
        value: &T,
    ) -> Result<(), SerializationError> {
        let key = self
            .next_key
            .take()
            .ok_or_else(|| SerializationError::new("map", "value serialized before its key"))?;
        self.entries.insert(key, value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<Value, SerializationError> {
        Ok(Value::Map(self.entries))
    }
}

impl ser::SerializeStruct for MapBuilder {
    type Ok = Value;
    type Error = SerializationError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), SerializationError> {
        self.entries
            .insert(key.to_string(), value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<Value, SerializationError> {
        Ok(Value::Map(self.entries))
    }
}

struct VariantMapBuilder {
    variant: &'static str,
    entries: BTreeMap<String, Value>,
}

impl ser::SerializeStructVariant for VariantMapBuilder {
    type Ok = Value;
    type Error = SerializationError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), SerializationError> {
        self.entries
            .insert(key.to_string(), value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> Result<Value, SerializationError> {
        let mut outer = BTreeMap::new();
        outer.insert(self.variant.to_string(), Value::Map(self.entries));
        Ok(Value::Map(outer))
    }
}

/// Accepts only text-like map keys.
struct MapKeySerializer;

fn key_error(type_name: &str) -> SerializationError {
    SerializationError::new(type_name, "map keys must be text")
}

impl ser::Serializer for MapKeySerializer {
    type Ok = String;
    type Error = SerializationError;
    type SerializeSeq = Impossible<String, SerializationError>;
    type SerializeTuple = Impossible<String, SerializationError>;
    type SerializeTupleStruct = Impossible<String, SerializationError>;
    type SerializeTupleVariant = Impossible<String, SerializationError>;
    type SerializeMap = Impossible<String, SerializationError>;
    type SerializeStruct = Impossible<String, SerializationError>;
    type SerializeStructVariant = Impossible<String, SerializationError>;

    fn serialize_str(self, v: &str) -> Result<String, SerializationError> {
        Ok(v.to_string())
    }

    fn serialize_char(self, v: char) -> Result<String, SerializationError> {
        Ok(v.to_string())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> Result<String, SerializationError> {
        Ok(variant.to_string())
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<String, SerializationError> {
        value.serialize(self)
    }

    fn serialize_bool(self, _v: bool) -> Result<String, SerializationError> {
        Err(key_error("bool"))
    }

    fn serialize_i8(self, _v: i8) -> Result<String, SerializationError> {
        Err(key_error("i8"))
    }

    fn serialize_i16(self, _v: i16) -> Result<String, SerializationError> {
        Err(key_error("i16"))
    }

    fn serialize_i32(self, _v: i32) -> Result<String, SerializationError> {
        Err(key_error("i32"))
    }

    fn serialize_i64(self, _v: i64) -> Result<String, SerializationError> {
        Err(key_error("i64"))
    }

    fn serialize_u8(self, _v: u8) -> Result<String, SerializationError> {
        Err(key_error("u8"))
    }

    fn serialize_u16(self, _v: u16) -> Result<String, SerializationError> {
        Err(key_error("u16"))
    }

    fn serialize_u32(self, _v: u32) -> Result<String, SerializationError> {
        Err(key_error("u32"))
    }

    fn serialize_u64(self, _v: u64) -> Result<String, SerializationError> {
        Err(key_error("u64"))
    }

    fn serialize_f32(self, _v: f32) -> Result<String, SerializationError> {
        Err(key_error("f32"))
    }

    fn serialize_f64(self, _v: f64) -> Result<String, SerializationError> {
        Err(key_error("f64"))
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<String, SerializationError> {
        Err(key_error("bytes"))
    }

    fn serialize_none(self) -> Result<String, SerializationError> {
        Err(key_error("none"))
    }

    fn serialize_some<T: Serialize + ?Sized>(
        self,
        _value: &T,
    ) -> Result<String, SerializationError> {
        Err(key_error("option"))
    }

    fn serialize_unit(self) -> Result<String, SerializationError> {
        Err(key_error("unit"))
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<String, SerializationError> {
        Err(key_error(name))
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<String, SerializationError> {
        Err(key_error(name))
    }

    fn serialize_seq(
        self,
        _len: Option<usize>,
    ) -> Result<Self::SerializeSeq, SerializationError> {
        Err(key_error("sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, SerializationError> {
        Err(key_error("tuple"))
    }

    fn serialize_tuple_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, SerializationError> {
        Err(key_error(name))
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, SerializationError> {
        Err(key_error(name))
    }

    fn serialize_map(
        self,
        _len: Option<usize>,
    ) -> Result<Self::SerializeMap, SerializationError> {
        Err(key_error("map"))
    }

    fn serialize_struct(
        self,
        name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, SerializationError> {
        Err(key_error(name))
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, SerializationError> {
        Err(key_error(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: i32,
        y: i32,
        label: Option<String>,
    }

    #[test]
    fn test_bytes_wire_form() {
        let value = Value::bytes(vec![0u8, 1, 2, 255]);
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"$bytes":"AAEC/w=="}"#);

        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_nested_wire_form() {
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), Value::Int(-3));
        map.insert("f".to_string(), Value::Float(0.5));
        map.insert("items".to_string(), Value::from(vec!["a", "b"]));
        map.insert("none".to_string(), Value::Null);
        let value = Value::Map(map);

        let json = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_non_finite_float_rejected() {
        let err = Value::Float(f64::NAN).check_encodable().unwrap_err();
        assert_eq!(err.type_name, "float");
        assert!(serde_json::to_string(&Value::Float(f64::INFINITY)).is_err());

        let err = to_value(&vec![1.0, f64::NAN]).unwrap_err();
        assert_eq!(err.type_name, "f64");
        assert!(err.reason.contains("NaN"));
    }

    #[test]
    fn test_reserved_bytes_key_rejected() {
        let mut map = BTreeMap::new();
        map.insert(BYTES_KEY.to_string(), Value::from("not really bytes"));
        let err = Value::Map(map).check_encodable().unwrap_err();
        assert!(err.reason.contains("reserved"));
    }

    #[test]
    fn test_to_value_struct() {
        let point = Point {
            x: 1,
            y: -2,
            label: None,
        };
        let value = to_value(&point).unwrap();
        assert_eq!(value.get("x"), Some(&Value::Int(1)));
        assert_eq!(value.get("y"), Some(&Value::Int(-2)));
        assert_eq!(value.get("label"), Some(&Value::Null));

        let back: Point = from_value(value).unwrap();
        assert_eq!(back, point);
    }

    #[test]
    fn test_to_value_rejects_integer_keys() {
        let mut map = HashMap::new();
        map.insert(7i32, "seven");
        let err = to_value(&map).unwrap_err();
        assert_eq!(err.type_name, "i32");
        assert!(err.reason.contains("map keys must be text"));
    }

    #[test]
    fn test_to_value_rejects_large_unsigned() {
        let err = to_value(&u64::MAX).unwrap_err();
        assert_eq!(err.type_name, "u64");
        assert_eq!(to_value(&42u64).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_enum_encoding() {
        #[derive(Serialize)]
        enum Shape {
            Empty,
            Circle(f64),
            Rect { w: i64, h: i64 },
        }

        assert_eq!(to_value(&Shape::Empty).unwrap(), Value::from("Empty"));
        assert_eq!(
            to_value(&Shape::Circle(1.5)).unwrap().get("Circle"),
            Some(&Value::Float(1.5))
        );
        let rect = to_value(&Shape::Rect { w: 2, h: 3 }).unwrap();
        assert_eq!(rect.get("Rect").and_then(|r| r.get("h")), Some(&Value::Int(3)));
    }

    #[test]
    fn test_deserialize_rejects_huge_integer() {
        let result: Result<Value, _> = serde_json::from_str("18446744073709551615");
        assert!(result.is_err());
    }

    #[test]
    fn test_from_value_type_mismatch() {
        let err = from_value::<Point>(Value::from("nope")).unwrap_err();
        assert!(err.type_name.ends_with("Point"));
        assert!(err.reason.contains("str"));
    }

    #[test]
    fn test_bytes_decode_into_vec() {
        let data: Vec<u8> = from_value(Value::bytes(vec![9u8, 8, 7])).unwrap();
        assert_eq!(data, vec![9, 8, 7]);
    }
}
