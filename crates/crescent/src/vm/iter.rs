//! Generalized iteration over non-function iterables.
//!
//! The reference runtime expresses this as a coroutine per active generic
//! `for` loop; here it is a plain iterator object whose exhaustion stands
//! in for the end-of-stream sentinel. An iterator is installed by FORGPREP
//! (keyed by the target FORGLOOP's instruction position), resumed by each
//! FORGLOOP iteration, and removed when it ends or when the frame exits.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::table::Table;
use crate::value::Value;

/// A live generic-for iterator over a table.
#[derive(Debug)]
pub(crate) struct GenIter {
    table: Rc<RefCell<Table>>,
    pos: usize,
}

impl GenIter {
    /// Builds an iterator for a non-function iterable. Only tables are
    /// iterable; anything else is a type error.
    pub(super) fn new(value: &Value) -> Result<Self, RuntimeError> {
        match value {
            Value::Table(t) => Ok(Self {
                table: t.clone(),
                pos: 0,
            }),
            other => Err(RuntimeError::type_error(format!(
                "attempt to iterate over a {} value",
                other.type_name()
            ))),
        }
    }

    /// The next key/value pair: array part in index order, then hash part
    /// in insertion order. `None` is the end-of-stream marker.
    pub(super) fn next(&mut self) -> Option<(Value, Value)> {
        let table = self.table.borrow();
        while self.pos < table.iter_len() {
            let entry = table.entry_at(self.pos);
            self.pos += 1;
            match entry {
                Some((key, value)) if !value.is_nil() => return Some((key, value)),
                _ => {}
            }
        }
        None
    }
}
