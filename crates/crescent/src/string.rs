//! Shared string handles and the module string table.
//!
//! Script strings are immutable and widely shared (constants, table keys,
//! error payloads), so they are stored behind reference-counted handles.
//! Equality takes the pointer fast path first and falls back to content
//! comparison, which gives the language's value semantics (equal content
//! means equal strings) without a global interner.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::rc::Rc;

/// An immutable, cheaply clonable script string.
#[derive(Debug, Clone)]
pub struct LuaStr(Rc<str>);

impl serde::Serialize for LuaStr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for LuaStr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

impl LuaStr {
    /// Creates a new handle owning a copy of `s`.
    pub fn new(s: &str) -> Self {
        Self(Rc::from(s))
    }

    /// Returns the string content.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if both handles point at the same allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for LuaStr {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0 == other.0
    }
}

impl Eq for LuaStr {}

impl Hash for LuaStr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Content hash so equal strings from different allocations collide.
        self.0.hash(state);
    }
}

impl Deref for LuaStr {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LuaStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LuaStr {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for LuaStr {
    fn from(s: String) -> Self {
        Self(Rc::from(s))
    }
}

/// The module's ordered string table.
///
/// On the wire, string references are 1-based varints; index 0 means
/// "no string". `get` takes the wire index directly so callers never
/// perform the off-by-one adjustment themselves.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StringTable {
    entries: Vec<LuaStr>,
}

impl StringTable {
    /// Appends a string and returns its wire index (1-based).
    pub fn push(&mut self, s: String) -> u32 {
        self.entries.push(LuaStr::from(s));
        self.entries.len() as u32
    }

    /// Looks up a wire index. Index 0 and out-of-range indices yield `None`.
    #[must_use]
    pub fn get(&self, wire_index: u32) -> Option<&LuaStr> {
        if wire_index == 0 {
            return None;
        }
        self.entries.get(wire_index as usize - 1)
    }

    /// Number of entries in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table holds no strings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
