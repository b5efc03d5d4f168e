//! Work items read from an upstream stage's output file.
//!
//! Every item carries an `id` field (integer or string) that is the sole
//! dedup and resume key across the whole pipeline. All other fields are
//! passed through opaquely.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::{self, Visitor};
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::InputError;

/// Field holding the item identifier.
pub const ID_FIELD: &str = "id";

/// Field holding the item's image path.
pub const IMAGE_FIELD: &str = "image";

/// Stable, comparable item identifier.
///
/// Integers sort before strings; integers compare numerically and strings
/// lexicographically. Integer ids cover the whole `i64` and `u64` range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemId {
    Int(i128),
    Text(String),
}

impl ItemId {
    /// Extracts an identifier from a JSON value, if it is an integer or a string.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(i128::from)
                .or_else(|| n.as_u64().map(i128::from))
                .map(ItemId::Int),
            Value::String(s) => Some(ItemId::Text(s.clone())),
            _ => None,
        }
    }
}

impl Serialize for ItemId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ItemId::Int(n) => {
                if let Ok(small) = i64::try_from(*n) {
                    serializer.serialize_i64(small)
                } else if let Ok(large) = u64::try_from(*n) {
                    serializer.serialize_u64(large)
                } else {
                    Err(S::Error::custom(format!("id {} is out of range", n)))
                }
            }
            ItemId::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = ItemId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer or string id")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ItemId, E> {
                Ok(ItemId::Int(i128::from(v)))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ItemId, E> {
                Ok(ItemId::Int(i128::from(v)))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ItemId, E> {
                Ok(ItemId::Text(v.to_string()))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

impl Ord for ItemId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ItemId::Int(a), ItemId::Int(b)) => a.cmp(b),
            (ItemId::Text(a), ItemId::Text(b)) => a.cmp(b),
            (ItemId::Int(_), ItemId::Text(_)) => Ordering::Less,
            (ItemId::Text(_), ItemId::Int(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for ItemId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Int(n) => write!(f, "{}", n),
            ItemId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for ItemId {
    fn from(value: i64) -> Self {
        ItemId::Int(i128::from(value))
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        ItemId::Text(value.to_string())
    }
}

/// One input unit requiring a remote call.
///
/// Immutable once constructed: fields are only exposed by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    id: ItemId,
    fields: Map<String, Value>,
}

impl WorkItem {
    /// Builds a work item from a raw JSON record.
    ///
    /// Returns `None` when the record is not an object or carries no usable `id`.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(fields) = value else {
            return None;
        };
        let id = fields.get(ID_FIELD).and_then(ItemId::from_value)?;
        Some(Self { id, fields })
    }

    /// Returns the item identifier.
    pub fn id(&self) -> &ItemId {
        &self.id
    }

    /// Returns all fields, including `id`.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Returns a single field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns a field as a non-empty string.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    /// Returns a field as a path, if present and non-empty.
    pub fn path_field(&self, name: &str) -> Option<PathBuf> {
        self.str_field(name).map(PathBuf::from)
    }
}

/// Reads the upstream input file.
///
/// Accepts a JSON array of objects or a single object. Relative image paths are
/// resolved against the input file's directory; when the resolved file does not
/// exist and `image_dir` is given, `<image_dir>/<file name>` is tried instead.
pub fn read_input(path: &Path, image_dir: Option<&Path>) -> Result<Vec<Value>, InputError> {
    let mut records = read_records(path)?;

    let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
    for record in &mut records {
        if let Value::Object(fields) = record {
            resolve_image_path(fields, base_dir, image_dir);
        }
    }

    debug!(path = %path.display(), count = records.len(), "Loaded input records");
    Ok(records)
}

/// Reads a JSON array of records (or a single object) without touching any field.
pub fn read_records(path: &Path) -> Result<Vec<Value>, InputError> {
    if !path.exists() {
        return Err(InputError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)?;
    let data: Value = serde_json::from_str(&content).map_err(|source| InputError::Decode {
        path: path.to_path_buf(),
        source,
    })?;

    match data {
        Value::Array(items) => Ok(items),
        obj @ Value::Object(_) => Ok(vec![obj]),
        _ => Err(InputError::InvalidShape(path.to_path_buf())),
    }
}

fn resolve_image_path(fields: &mut Map<String, Value>, base_dir: &Path, image_dir: Option<&Path>) {
    let Some(raw) = fields.get(IMAGE_FIELD).and_then(Value::as_str) else {
        return;
    };
    if raw.is_empty() {
        return;
    }

    let raw_path = PathBuf::from(raw);
    let mut resolved = if raw_path.is_absolute() {
        raw_path
    } else {
        base_dir.join(raw_path)
    };

    if !resolved.exists() {
        if let Some(dir) = image_dir {
            if let Some(name) = resolved.file_name() {
                let candidate = dir.join(name);
                if candidate.exists() {
                    resolved = candidate;
                }
            }
        }
    }

    if !resolved.exists() {
        warn!(image = %resolved.display(), "Image not found after resolving path");
    }

    fields.insert(
        IMAGE_FIELD.to_string(),
        Value::String(resolved.to_string_lossy().into_owned()),
    );
}
