//! Values exchanged with the bridge: the JSON image of a COM `VARIANT`.

use serde::{Deserialize, Serialize};

/// Identifier of one object in the bridge's handle table.
///
/// Identifiers are never reused within one bridge process, so a stale id is
/// always reported as unknown rather than silently aliasing a newer object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A value that can be sent to or received from the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variant {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// A reference to an object in the host's graph. Whoever receives this
    /// owns one reference and must release it.
    Object { handle: ObjectId },
    Error(ErrorValue),
}

/// Excel error values (`#N/A`, `#REF!`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorValue {
    pub code: String,
}

impl Variant {
    pub fn is_null(&self) -> bool {
        matches!(self, Variant::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Variant::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Variant::Object { handle } => Some(*handle),
            _ => None,
        }
    }
}

impl From<&str> for Variant {
    fn from(s: &str) -> Self {
        Variant::String(s.to_string())
    }
}

impl From<String> for Variant {
    fn from(s: String) -> Self {
        Variant::String(s)
    }
}

impl From<f64> for Variant {
    fn from(n: f64) -> Self {
        Variant::Number(n)
    }
}

impl From<i32> for Variant {
    fn from(n: i32) -> Self {
        Variant::Number(n as f64)
    }
}

impl From<i64> for Variant {
    fn from(n: i64) -> Self {
        Variant::Number(n as f64)
    }
}

impl From<bool> for Variant {
    fn from(b: bool) -> Self {
        Variant::Bool(b)
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Variant::Null => write!(f, "<empty>"),
            Variant::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Variant::Number(n) => write!(f, "{n}"),
            Variant::String(s) => write!(f, "{s}"),
            Variant::Object { handle } => write!(f, "<object {handle}>"),
            Variant::Error(e) => write!(f, "{}", e.code),
        }
    }
}
