//! Runtime values stored in object attributes and used as filter literals.
//!
//! Values serialize to plain JSON where JSON has a native representation.
//! Types JSON lacks (decimals, dates, bytes, pointers, files) are written as
//! objects tagged with a `__type` key.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::Error;

/// Key used to tag non-JSON value types.
pub const TYPE_KEY: &str = "__type";

/// A single-valued reference to another object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    /// Class of the referenced object.
    pub class_name: String,
    /// Id of the referenced object.
    pub id: String,
}

impl ObjectRef {
    /// Create a new object reference.
    pub fn new(class_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            id: id.into(),
        }
    }
}

/// A file attribute. Small files keep their bytes inline; larger ones are
/// offloaded to a file store and addressed by token.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRef {
    /// Original file name.
    pub name: String,
    /// Content size in bytes.
    pub size: u64,
    /// File store token, set once the content has been offloaded.
    pub token: Option<String>,
    /// Inline content.
    pub data: Option<Vec<u8>>,
}

impl FileRef {
    /// A file whose content is carried inline.
    pub fn inline(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            size: data.len() as u64,
            token: None,
            data: Some(data),
        }
    }

    /// A file whose content lives in the file store.
    pub fn stored(name: impl Into<String>, size: u64, token: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            token: Some(token.into()),
            data: None,
        }
    }
}

/// A dynamically typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Floating point number.
    Number(f64),
    /// Arbitrary-precision decimal.
    Decimal(Decimal),
    /// UTF-8 string.
    String(String),
    /// UTC timestamp.
    Date(DateTime<Utc>),
    /// Binary data.
    Bytes(Vec<u8>),
    /// Reference to another object.
    Pointer(ObjectRef),
    /// File attribute.
    File(FileRef),
    /// Ordered list of values.
    Array(Vec<Value>),
    /// Nested object.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if this value is a number or decimal.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Number(_) | Value::Decimal(_))
    }

    /// Name of the value's type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Bytes(_) => "bytes",
            Value::Pointer(_) => "pointer",
            Value::File(_) => "file",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Try to get as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as f64. Decimals are converted.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    /// Try to get as string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get as array slice.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Try to get as object map.
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Try to get as object reference.
    pub fn as_pointer(&self) -> Option<&ObjectRef> {
        match self {
            Value::Pointer(r) => Some(r),
            _ => None,
        }
    }

    /// Truthiness used by expression conditions.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Decimal(d) => !d.is_zero(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Number(_) | Value::Decimal(_) => 1,
            Value::String(_) => 2,
            Value::Object(_) => 3,
            Value::Array(_) => 4,
            Value::Bytes(_) => 5,
            Value::File(_) => 6,
            Value::Pointer(_) => 7,
            Value::Bool(_) => 8,
            Value::Date(_) => 9,
        }
    }

    /// Compare two values of compatible types.
    ///
    /// Numbers and decimals compare with each other. Returns `None` for
    /// incompatible types.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.cmp(b)),
            (Value::Number(a), Value::Decimal(b)) => match Decimal::from_f64(*a) {
                Some(a) => Some(a.cmp(b)),
                None => a.partial_cmp(&b.to_f64()?),
            },
            (Value::Decimal(_), Value::Number(_)) => other.compare(self).map(Ordering::reverse),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Pointer(a), Value::Pointer(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total ordering used for sorting and grouping.
    ///
    /// Values of different types order by a fixed type rank.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        if let Some(ordering) = self.compare(other) {
            return ordering;
        }
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ordering = x.total_cmp(y);
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Object(a), Value::Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ordering = ka.cmp(kb).then_with(|| va.total_cmp(vb));
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::File(a), Value::File(b)) => a.name.cmp(&b.name).then(a.token.cmp(&b.token)),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    /// Equality that treats numbers and decimals of equal magnitude as equal.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(_) | Value::Decimal(_), Value::Number(_) | Value::Decimal(_)) => {
                self.compare(other) == Some(Ordering::Equal)
            }
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.loose_eq(vb))
            }
            _ => self == other,
        }
    }

    /// Look up a dotted path inside this value.
    ///
    /// Numeric segments index into arrays. Any other segment applied to an
    /// array is projected across its elements.
    pub fn get_path(&self, path: &str) -> Option<Cow<'_, Value>> {
        if path.is_empty() {
            return Some(Cow::Borrowed(self));
        }
        let (head, rest) = split_path(path);
        match self {
            Value::Object(map) => {
                let child = map.get(head)?;
                match rest {
                    Some(rest) => child.get_path(rest),
                    None => Some(Cow::Borrowed(child)),
                }
            }
            Value::Array(items) => {
                if let Ok(index) = head.parse::<usize>() {
                    let child = items.get(index)?;
                    return match rest {
                        Some(rest) => child.get_path(rest),
                        None => Some(Cow::Borrowed(child)),
                    };
                }
                let projected: Vec<Value> = items
                    .iter()
                    .filter_map(|item| item.get_path(path).map(Cow::into_owned))
                    .collect();
                if projected.is_empty() {
                    None
                } else {
                    Some(Cow::Owned(Value::Array(projected)))
                }
            }
            _ => None,
        }
    }

    /// Set the value at a dotted path, creating intermediate objects.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let (head, rest) = split_path(path);
        if let Value::Array(items) = self {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(child) = items.get_mut(index) {
                    match rest {
                        Some(rest) => child.set_path(rest, value),
                        None => *child = value,
                    }
                    return;
                }
            }
        }
        if !matches!(self, Value::Object(_)) {
            *self = Value::Object(BTreeMap::new());
        }
        if let Value::Object(map) = self {
            match rest {
                Some(rest) => map
                    .entry(head.to_string())
                    .or_insert(Value::Null)
                    .set_path(rest, value),
                None => {
                    map.insert(head.to_string(), value);
                }
            }
        }
    }

    /// Remove the value at a dotted path.
    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        let (head, rest) = split_path(path);
        match (self, rest) {
            (Value::Object(map), None) => map.remove(head),
            (Value::Object(map), Some(rest)) => map.get_mut(head)?.remove_path(rest),
            _ => None,
        }
    }

    /// Convert to a JSON value.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::Decimal(d) => tagged("Decimal", [("value", Json::String(d.to_string()))]),
            Value::String(s) => Json::String(s.clone()),
            Value::Date(d) => tagged(
                "Date",
                [("iso", Json::String(d.to_rfc3339_opts(SecondsFormat::Millis, true)))],
            ),
            Value::Bytes(b) => tagged("Bytes", [("hex", Json::String(hex::encode(b)))]),
            Value::Pointer(r) => tagged(
                "Pointer",
                [
                    ("className", Json::String(r.class_name.clone())),
                    ("objectId", Json::String(r.id.clone())),
                ],
            ),
            Value::File(f) => {
                let mut json = tagged(
                    "File",
                    [("name", Json::String(f.name.clone())), ("size", Json::from(f.size))],
                );
                if let Json::Object(map) = &mut json {
                    if let Some(token) = &f.token {
                        map.insert("token".into(), Json::String(token.clone()));
                    }
                    if let Some(data) = &f.data {
                        map.insert("hex".into(), Json::String(hex::encode(data)));
                    }
                }
                json
            }
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => Json::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }

    /// Parse from a JSON value, decoding `__type` tagged objects.
    pub fn from_json(json: Json) -> Result<Self, Error> {
        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(
                n.as_f64()
                    .ok_or_else(|| Error::InvalidValue(format!("number out of range: {n}")))?,
            ),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            Json::Object(mut map) => match map.remove(TYPE_KEY) {
                Some(Json::String(tag)) => Self::from_tagged(&tag, map)?,
                Some(other) => {
                    return Err(Error::InvalidValue(format!(
                        "`{TYPE_KEY}` must be a string, got {other}"
                    )))
                }
                None => Value::Object(
                    map.into_iter()
                        .map(|(key, value)| Ok((key, Value::from_json(value)?)))
                        .collect::<Result<_, Error>>()?,
                ),
            },
        })
    }

    fn from_tagged(tag: &str, mut map: serde_json::Map<String, Json>) -> Result<Self, Error> {
        match tag {
            "Decimal" => {
                let text = take_string(&mut map, tag, "value")?;
                Decimal::from_str(&text)
                    .map(Value::Decimal)
                    .map_err(|e| Error::InvalidValue(format!("invalid decimal `{text}`: {e}")))
            }
            "Date" => {
                let text = take_string(&mut map, tag, "iso")?;
                DateTime::parse_from_rfc3339(&text)
                    .map(|d| Value::Date(d.with_timezone(&Utc)))
                    .map_err(|e| Error::InvalidValue(format!("invalid date `{text}`: {e}")))
            }
            "Bytes" => {
                let text = take_string(&mut map, tag, "hex")?;
                hex::decode(&text)
                    .map(Value::Bytes)
                    .map_err(|e| Error::InvalidValue(format!("invalid bytes: {e}")))
            }
            "Pointer" => Ok(Value::Pointer(ObjectRef::new(
                take_string(&mut map, tag, "className")?,
                take_string(&mut map, tag, "objectId")?,
            ))),
            "File" => {
                let name = take_string(&mut map, tag, "name")?;
                let token = match map.remove("token") {
                    Some(Json::String(token)) => Some(token),
                    _ => None,
                };
                let data = match map.remove("hex") {
                    Some(Json::String(text)) => Some(
                        hex::decode(&text)
                            .map_err(|e| Error::InvalidValue(format!("invalid file data: {e}")))?,
                    ),
                    _ => None,
                };
                let size = map
                    .get("size")
                    .and_then(Json::as_u64)
                    .or_else(|| data.as_ref().map(|d| d.len() as u64))
                    .unwrap_or(0);
                Ok(Value::File(FileRef {
                    name,
                    size,
                    token,
                    data,
                }))
            }
            other => Err(Error::InvalidValue(format!("unknown value type `{other}`"))),
        }
    }
}

/// Split a dotted path into its first segment and the remainder.
pub fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

fn take_string(
    map: &mut serde_json::Map<String, Json>,
    tag: &str,
    key: &str,
) -> Result<String, Error> {
    match map.remove(key) {
        Some(Json::String(s)) => Ok(s),
        _ => Err(Error::InvalidValue(format!(
            "{tag} value requires string field `{key}`"
        ))),
    }
}

fn tagged<const N: usize>(tag: &str, fields: [(&str, Json); N]) -> Json {
    let mut map = serde_json::Map::new();
    map.insert(TYPE_KEY.to_string(), Json::String(tag.to_string()));
    for (key, value) in fields {
        map.insert(key.to_string(), value);
    }
    Json::Object(map)
}

fn number_to_json(n: f64) -> Json {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Json::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Json::Number)
            .unwrap_or(Json::Null)
    }
}

impl From<Value> for Json {
    fn from(value: Value) -> Self {
        value.to_json()
    }
}

impl TryFrom<Json> for Value {
    type Error = Error;

    fn try_from(json: Json) -> Result<Self, Self::Error> {
        Value::from_json(json)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(v as f64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Date(v)
    }
}

impl From<ObjectRef> for Value {
    fn from(v: ObjectRef) -> Self {
        Value::Pointer(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
