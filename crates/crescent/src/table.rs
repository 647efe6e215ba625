//! The table type: a mutable map with an array part for the contiguous
//! 1-based integer prefix and an insertion-ordered hash part for
//! everything else.
//!
//! `#t` is the array-part length. Iteration (the generic `for` protocol)
//! walks the array part first, then the hash part in insertion order. No
//! other ordering is guaranteed.

use indexmap::IndexMap;

use crate::error::RuntimeError;
use crate::string::LuaStr;
use crate::value::Value;

/// Hashable projection of a key value.
///
/// Numbers are canonicalized to their bit pattern (negative zero folds
/// into zero); tables, closures and host functions key by identity.
/// The original key `Value` is stored alongside each hash entry so
/// iteration can yield it back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TableKey {
    Bool(bool),
    Number(u64),
    Str(LuaStr),
    Vector([u32; 4]),
    Obj(usize),
}

impl TableKey {
    /// Projects a value into a key. `None` for nil and NaN, which can
    /// never be present in a table.
    fn project(value: &Value) -> Option<Self> {
        match value {
            Value::Nil => None,
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => {
                if n.is_nan() {
                    None
                } else {
                    // Fold -0.0 into 0.0 so both spell the same key.
                    let n = if *n == 0.0 { 0.0 } else { *n };
                    Some(Self::Number(n.to_bits()))
                }
            }
            Value::Str(s) => Some(Self::Str(s.clone())),
            Value::Vector(v) => Some(Self::Vector([
                v.x.to_bits(),
                v.y.to_bits(),
                v.z.to_bits(),
                v.w.to_bits(),
            ])),
            Value::Table(t) => Some(Self::Obj(std::rc::Rc::as_ptr(t) as usize)),
            Value::Closure(c) => Some(Self::Obj(std::rc::Rc::as_ptr(c) as usize)),
            Value::Native(n) => Some(Self::Obj(std::rc::Rc::as_ptr(n) as usize)),
        }
    }

    fn int(i: i64) -> Self {
        Self::Number((i as f64).to_bits())
    }
}

#[derive(Debug, Default)]
pub struct Table {
    /// Values at integer keys `1..=array.len()`.
    array: Vec<Value>,
    /// Everything else; entries keep their original key value.
    hash: IndexMap<TableKey, (Value, Value), ahash::RandomState>,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-sizes the array and hash parts. Both are hints only.
    #[must_use]
    pub fn with_capacity(narray: usize, nhash: usize) -> Self {
        Self {
            array: Vec::with_capacity(narray),
            hash: IndexMap::with_capacity_and_hasher(nhash, ahash::RandomState::new()),
        }
    }

    /// Length of the contiguous 1-based integer prefix.
    #[must_use]
    pub fn len(&self) -> usize {
        self.array.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.array.is_empty() && self.hash.is_empty()
    }

    /// Reads `t[key]`. Missing keys (and nil/NaN keys) read as nil.
    #[must_use]
    pub fn get(&self, key: &Value) -> Value {
        if let Value::Number(n) = key {
            if let Some(i) = exact_int(*n) {
                return self.get_int(i);
            }
        }
        match TableKey::project(key) {
            Some(k) => self.hash.get(&k).map_or(Value::Nil, |(_, v)| v.clone()),
            None => Value::Nil,
        }
    }

    /// Reads `t[i]` for an integer key.
    #[must_use]
    pub fn get_int(&self, i: i64) -> Value {
        if i >= 1 {
            if let Some(v) = self.array.get(i as usize - 1) {
                return v.clone();
            }
        }
        self.hash
            .get(&TableKey::int(i))
            .map_or(Value::Nil, |(_, v)| v.clone())
    }

    /// Writes `t[key] = value`. Nil and NaN keys are errors; assigning
    /// nil removes the entry.
    pub fn set(&mut self, key: Value, value: Value) -> Result<(), RuntimeError> {
        if let Value::Number(n) = &key {
            if let Some(i) = exact_int(*n) {
                self.set_int(i, value);
                return Ok(());
            }
        }
        let Some(k) = TableKey::project(&key) else {
            let what = if key.is_nil() { "nil" } else { "NaN" };
            return Err(RuntimeError::type_error(format!("table index is {what}")));
        };
        if value.is_nil() {
            self.hash.shift_remove(&k);
        } else {
            self.hash.insert(k, (key, value));
        }
        Ok(())
    }

    /// Writes `t[i] = value` for an integer key, maintaining the array
    /// part: appending at `len + 1` extends it and migrates any entries
    /// that become contiguous; removing the tail truncates it.
    pub fn set_int(&mut self, i: i64, value: Value) {
        let len = self.array.len() as i64;
        if i >= 1 && i <= len {
            let idx = i as usize - 1;
            if value.is_nil() && i == len {
                self.array.pop();
                while matches!(self.array.last(), Some(Value::Nil)) {
                    self.array.pop();
                }
            } else {
                self.array[idx] = value;
            }
        } else if i == len + 1 {
            if value.is_nil() {
                self.hash.shift_remove(&TableKey::int(i));
                return;
            }
            self.array.push(value);
            // Entries parked in the hash part may now be contiguous.
            loop {
                let next = TableKey::int(self.array.len() as i64 + 1);
                match self.hash.shift_remove(&next) {
                    Some((_, v)) => self.array.push(v),
                    None => break,
                }
            }
        } else {
            let k = TableKey::int(i);
            if value.is_nil() {
                self.hash.shift_remove(&k);
            } else {
                self.hash.insert(k, (Value::Number(i as f64), value));
            }
        }
    }

    /// Host convenience: `t[key] = value` with a string key.
    pub fn set_str(&mut self, key: &str, value: Value) {
        let key = Value::str(key);
        // String keys are always hashable.
        let _ = self.set(key, value);
    }

    /// Host convenience: reads `t[key]` with a string key.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Value {
        self.get(&Value::str(key))
    }

    /// Entry at `pos` in iteration order (array part first, then hash
    /// part). Used by the generic-for iterator.
    #[must_use]
    pub(crate) fn entry_at(&self, pos: usize) -> Option<(Value, Value)> {
        if pos < self.array.len() {
            let v = self.array[pos].clone();
            return Some((Value::Number(pos as f64 + 1.0), v));
        }
        let (_, (key, value)) = self.hash.get_index(pos - self.array.len())?;
        Some((key.clone(), value.clone()))
    }

    /// Total number of iterable positions (array slots plus hash entries).
    #[must_use]
    pub(crate) fn iter_len(&self) -> usize {
        self.array.len() + self.hash.len()
    }
}

/// Returns `Some(i)` when `n` is an exact integer representable in i64.
fn exact_int(n: f64) -> Option<i64> {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        Some(n as i64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_prefix_and_length() {
        let mut t = Table::new();
        t.set_int(1, Value::Number(10.0));
        t.set_int(2, Value::Number(20.0));
        t.set_int(3, Value::Number(30.0));
        assert_eq!(t.len(), 3);
        assert_eq!(t.get_int(2), Value::Number(20.0));
        assert_eq!(t.get_int(4), Value::Nil);
    }

    #[test]
    fn out_of_order_integer_keys_migrate_into_the_array() {
        let mut t = Table::new();
        t.set_int(2, Value::str("b"));
        t.set_int(3, Value::str("c"));
        assert_eq!(t.len(), 0);
        t.set_int(1, Value::str("a"));
        assert_eq!(t.len(), 3);
        assert_eq!(t.get_int(3), Value::str("c"));
    }

    #[test]
    fn removing_the_tail_truncates_the_prefix() {
        let mut t = Table::new();
        for i in 1..=3 {
            t.set_int(i, Value::Number(i as f64));
        }
        t.set_int(3, Value::Nil);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn nil_and_nan_keys_are_rejected_on_write() {
        let mut t = Table::new();
        assert!(t.set(Value::Nil, Value::Number(1.0)).is_err());
        assert!(t.set(Value::Number(f64::NAN), Value::Number(1.0)).is_err());
        // Reads are forgiving.
        assert_eq!(t.get(&Value::Nil), Value::Nil);
    }

    #[test]
    fn string_keys_compare_by_content() {
        let mut t = Table::new();
        t.set_str("answer", Value::Number(42.0));
        assert_eq!(t.get(&Value::str("answer")), Value::Number(42.0));
    }

    #[test]
    fn iteration_order_is_array_then_insertion() {
        let mut t = Table::new();
        t.set_int(1, Value::str("first"));
        t.set_str("k1", Value::Number(1.0));
        t.set_str("k2", Value::Number(2.0));
        let entries: Vec<_> = (0..t.iter_len()).filter_map(|i| t.entry_at(i)).collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].1, Value::str("first"));
        assert_eq!(entries[1].0, Value::str("k1"));
        assert_eq!(entries[2].0, Value::str("k2"));
    }

    #[test]
    fn negative_zero_folds_into_zero() {
        let mut t = Table::new();
        t.set(Value::Number(0.0), Value::str("zero")).unwrap();
        assert_eq!(t.get(&Value::Number(-0.0)), Value::str("zero"));
    }
}
