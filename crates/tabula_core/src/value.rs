//! Cell values and column types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a large object held by a [`crate::BlobStore`].
///
/// Rows store only the reference; the bytes live in the blob store and are
/// kept alive by the reference count that row writes establish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    /// Blob store identifier.
    pub id: u64,
    /// Kind of large object (binary, text, ...). Opaque to the engine.
    pub subtype: i32,
}

impl BlobRef {
    /// Creates a binary blob reference.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self { id, subtype: 0 }
    }

    /// Creates a reference with an explicit subtype.
    #[must_use]
    pub const fn with_subtype(id: u64, subtype: i32) -> Self {
        Self { id, subtype }
    }
}

/// The declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// `true` / `false`.
    Boolean,
    /// 64-bit signed integer.
    Integer,
    /// UTF-8 string.
    Text,
    /// Short byte string stored inline.
    Binary,
    /// Large object stored out of line.
    Blob,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Boolean => "BOOLEAN",
            Self::Integer => "INTEGER",
            Self::Text => "TEXT",
            Self::Binary => "BINARY",
            Self::Blob => "BLOB",
        };
        f.write_str(s)
    }
}

/// A single cell value.
///
/// Values are totally ordered: `Null` sorts first, then values group by
/// kind (booleans, integers, text, binary, blobs) and compare naturally
/// within a kind. Column indexes rely on this order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean value.
    Boolean(bool),
    /// Integer value.
    Integer(i64),
    /// Text value.
    Text(String),
    /// Inline binary value.
    Binary(Vec<u8>),
    /// Large object reference.
    Blob(BlobRef),
}

impl Value {
    /// Returns `true` for `Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the column type this value belongs to, `None` for `Null`.
    #[must_use]
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Self::Null => None,
            Self::Boolean(_) => Some(ColumnType::Boolean),
            Self::Integer(_) => Some(ColumnType::Integer),
            Self::Text(_) => Some(ColumnType::Text),
            Self::Binary(_) => Some(ColumnType::Binary),
            Self::Blob(_) => Some(ColumnType::Blob),
        }
    }

    /// Whether this value may be stored in a column of type `ty`.
    #[must_use]
    pub fn fits(&self, ty: ColumnType) -> bool {
        self.column_type().map_or(true, |own| own == ty)
    }

    /// Returns the blob reference held by this value, if any.
    #[must_use]
    pub fn as_blob(&self) -> Option<BlobRef> {
        match self {
            Self::Blob(blob) => Some(*blob),
            _ => None,
        }
    }

    /// Returns the integer held by this value, if any.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the boolean held by this value, if any.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "'{v}'"),
            Self::Binary(v) => write!(f, "<{} bytes>", v.len()),
            Self::Blob(b) => write!(f, "<blob {}>", b.id),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(v)
    }
}

impl From<BlobRef> for Value {
    fn from(v: BlobRef) -> Self {
        Self::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
