//! # Values
//!
//! The structured-clone value model carried in arguments and payloads.
//!
//! ## Philosophy
//!
//! - **JSON-shaped**: Most values are plain JSON data and copy freely.
//! - **Transferable kinds**: `Buffer`, `Port` and `Bitmap` own storage that may
//!   move across a channel without copying. A buffer or bitmap can also be
//!   copied (fresh allocation); a port can only ever be transferred.
//!
//! ## JSON form
//!
//! Plain data maps to plain JSON. The non-JSON kinds use single-key tagged
//! objects: `{"$undefined":true}`, `{"$buffer":[..]}` and
//! `{"$bitmap":[w,h,[..]]}`. Numbers JSON cannot hold are spelled out as
//! `{"$number":"NaN"}`, `"Infinity"` or `"-Infinity"`. Ports have no JSON form.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::mpsc;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::ser::SerializeMap;
use serde::ser::SerializeSeq;

use crate::error::Result;
use crate::error::WireError;

const UNDEFINED_TAG: &str = "$undefined";
const BUFFER_TAG: &str = "$buffer";
const BITMAP_TAG: &str = "$bitmap";
const NUMBER_TAG: &str = "$number";

/// A value that can cross the worker boundary.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Buffer(Buffer),
    Port(Port),
    Bitmap(Bitmap),
}

/// The runtime nature of a value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Undefined,
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
    Buffer,
    Port,
    Bitmap,
}

impl Kind {
    /// Whether values of this kind own storage that can be moved zero-copy.
    pub fn is_transferable(self) -> bool {
        matches!(self, Kind::Buffer | Kind::Port | Kind::Bitmap)
    }
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Undefined => Kind::Undefined,
            Value::Null => Kind::Null,
            Value::Bool(_) => Kind::Bool,
            Value::Number(_) => Kind::Number,
            Value::String(_) => Kind::String,
            Value::Array(_) => Kind::Array,
            Value::Object(_) => Kind::Object,
            Value::Buffer(_) => Kind::Buffer,
            Value::Port(_) => Kind::Port,
            Value::Bitmap(_) => Kind::Bitmap,
        }
    }

    /// Builds an object from key/value pairs.
    pub fn object<K, I>(entries: I) -> Value
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
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

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Looks up a field of an object. Anything else has no fields.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Renders the textual description used when an error crosses the
    /// boundary. Follows the usual script-engine string conversion.
    pub fn to_text(&self) -> String {
        match self {
            Value::Undefined => "undefined".into(),
            Value::Null => "null".into(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => number_text(*n),
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::Undefined | Value::Null => String::new(),
                    other => other.to_text(),
                })
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(_) => "[object Object]".into(),
            Value::Buffer(_) => "[object ArrayBuffer]".into(),
            Value::Port(_) => "[object MessagePort]".into(),
            Value::Bitmap(_) => "[object ImageBitmap]".into(),
        }
    }

    /// Whether a port appears anywhere inside the value.
    pub fn holds_port(&self) -> bool {
        match self {
            Value::Port(_) => true,
            Value::Array(items) => items.iter().any(Value::holds_port),
            Value::Object(map) => map.values().any(Value::holds_port),
            _ => false,
        }
    }

    /// Deep-copies the value. Buffers and bitmaps get fresh storage.
    ///
    /// Returns `WireError::DataClone` if the value contains a port.
    pub fn structured_clone(&self) -> Result<Value> {
        Ok(match self {
            Value::Array(items) => Value::Array(
                items.iter().map(Value::structured_clone).collect::<Result<_>>()?,
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.structured_clone()?)))
                    .collect::<Result<_>>()?,
            ),
            Value::Buffer(buf) => Value::Buffer(buf.copy()),
            Value::Bitmap(bitmap) => Value::Bitmap(bitmap.copy()),
            Value::Port(_) => return Err(WireError::DataClone("MessagePort")),
            other => other.clone(),
        })
    }
}

fn number_text(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".into() } else { "-Infinity".into() }
    } else if n == 0.0 {
        "0".into()
    } else {
        n.to_string()
    }
}

// ============================================================================
//  TRANSFERABLE KINDS
// ============================================================================

/// A raw byte buffer. Clones share storage; `copy` allocates.
#[derive(Clone, Debug)]
pub struct Buffer(Arc<[u8]>);

impl Buffer {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when both handles point at the same backing storage.
    pub fn shares_storage(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn copy(&self) -> Self {
        Self(Arc::from(self.as_slice()))
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

/// A decoded image handle: dimensions plus RGBA pixel storage.
#[derive(Clone, Debug)]
pub struct Bitmap {
    pub width: u32,
    pub height: u32,
    pixels: Arc<[u8]>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32, pixels: impl Into<Vec<u8>>) -> Self {
        Self { width, height, pixels: Arc::from(pixels.into()) }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn shares_storage(&self, other: &Bitmap) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }

    pub fn copy(&self) -> Self {
        Self { width: self.width, height: self.height, pixels: Arc::from(self.pixels()) }
    }
}

impl PartialEq for Bitmap {
    fn eq(&self, other: &Self) -> bool {
        self.width == other.width && self.height == other.height && self.pixels() == other.pixels()
    }
}

/// One end of an entangled pair of message endpoints.
///
/// Values posted on one end are received on the other. Ports compare by
/// identity: two handles are equal only if they are the same endpoint.
#[derive(Clone, Debug)]
pub struct Port(Arc<PortInner>);

#[derive(Debug)]
struct PortInner {
    tx: mpsc::Sender<Value>,
    rx: Mutex<mpsc::Receiver<Value>>,
}

impl Port {
    /// Creates two entangled endpoints.
    pub fn pair() -> (Port, Port) {
        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();

        let a = PortInner { tx: tx_a, rx: Mutex::new(rx_b) };
        let b = PortInner { tx: tx_b, rx: Mutex::new(rx_a) };

        (Port(Arc::new(a)), Port(Arc::new(b)))
    }

    /// Posts a value to the entangled endpoint. Returns false if it is gone.
    pub fn post(&self, value: Value) -> bool {
        self.0.tx.send(value).is_ok()
    }

    /// Takes the next value posted by the entangled endpoint, if any.
    pub fn try_recv(&self) -> Option<Value> {
        let rx = self.0.rx.lock().ok()?;
        rx.try_recv().ok()
    }
}

impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

// ============================================================================
//  CONVERSIONS
// ============================================================================

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

impl From<Buffer> for Value {
    fn from(buf: Buffer) -> Self {
        Value::Buffer(buf)
    }
}

impl From<Port> for Value {
    fn from(port: Port) -> Self {
        Value::Port(port)
    }
}

impl From<Bitmap> for Value {
    fn from(bitmap: Bitmap) -> Self {
        Value::Bitmap(bitmap)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Undefined, Into::into)
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = WireError;

    fn try_from(json: serde_json::Value) -> Result<Self> {
        use serde_json::Value as Json;

        Ok(match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(
                n.as_f64().ok_or_else(|| WireError::Malformed(format!("number out of range: {}", n)))?,
            ),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(
                items.into_iter().map(Value::try_from).collect::<Result<_>>()?,
            ),
            Json::Object(map) if map.len() == 1 && map.contains_key(UNDEFINED_TAG) => Value::Undefined,
            Json::Object(mut map) if map.len() == 1 && map.contains_key(BUFFER_TAG) => {
                let bytes = map.remove(BUFFER_TAG).unwrap_or_default();
                Value::Buffer(Buffer::new(json_bytes(bytes)?))
            }
            Json::Object(mut map) if map.len() == 1 && map.contains_key(NUMBER_TAG) => {
                match map.remove(NUMBER_TAG) {
                    Some(Json::String(text)) => Value::Number(non_finite(&text)?),
                    other => return Err(WireError::Malformed(format!("bad {} payload: {:?}", NUMBER_TAG, other))),
                }
            }
            Json::Object(mut map) if map.len() == 1 && map.contains_key(BITMAP_TAG) => {
                let parts = map.remove(BITMAP_TAG).unwrap_or_default();
                let (width, height, pixels): (u32, u32, serde_json::Value) =
                    serde_json::from_value(parts)?;
                Value::Bitmap(Bitmap::new(width, height, json_bytes(pixels)?))
            }
            Json::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| Ok((k, Value::try_from(v)?)))
                    .collect::<Result<_>>()?,
            ),
        })
    }
}

fn non_finite(text: &str) -> Result<f64> {
    match text {
        "NaN" => Ok(f64::NAN),
        "Infinity" => Ok(f64::INFINITY),
        "-Infinity" => Ok(f64::NEG_INFINITY),
        other => Err(WireError::Malformed(format!("{:?} is not a non-finite number", other))),
    }
}

fn json_bytes(json: serde_json::Value) -> Result<Vec<u8>> {
    Ok(serde_json::from_value(json)?)
}

// ============================================================================
//  SERDE
// ============================================================================

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Undefined => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(UNDEFINED_TAG, &true)?;
                map.end()
            }
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Number(n) if !n.is_finite() => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(NUMBER_TAG, &number_text(*n))?;
                map.end()
            }
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
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
            Value::Object(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (k, v) in fields {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            Value::Buffer(buf) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(BUFFER_TAG, buf.as_slice())?;
                map.end()
            }
            Value::Bitmap(bitmap) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(BITMAP_TAG, &(bitmap.width, bitmap.height, bitmap.pixels()))?;
                map.end()
            }
            Value::Port(_) => Err(S::Error::custom(WireError::Unserializable("MessagePort"))),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::try_from(json).map_err(D::Error::custom)
    }
}
