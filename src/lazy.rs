//! Deferred values
//!
//! A [`Lazy`] holds either a value or a pending computation for it. The
//! computation runs at most once successfully; the result is memoized and
//! shared by every clone. A failed computation is not memoized, so a read
//! that hit missing content can be retried after a fetch.

use std::cell::OnceCell;
use std::fmt;
use std::rc::Rc;

use crate::error::Result;

/// A zero-argument computation producing a value.
pub type Thunk<V> = Rc<dyn Fn() -> Result<V>>;

/// How a [`Lazy`] is constructed.
pub enum Deferred<V> {
    Loaded(V),
    Pending(Thunk<V>),
}

struct Cell<V> {
    value: OnceCell<V>,
    pending: Option<Thunk<V>>,
}

/// Memoizing deferred value. Cloning is cheap and shares the cache.
pub struct Lazy<V> {
    cell: Rc<Cell<V>>,
}

impl<V> Clone for Lazy<V> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<V> Lazy<V> {
    pub fn new(deferred: Deferred<V>) -> Self {
        let cell = match deferred {
            Deferred::Loaded(v) => Cell {
                value: OnceCell::from(v),
                pending: None,
            },
            Deferred::Pending(thunk) => Cell {
                value: OnceCell::new(),
                pending: Some(thunk),
            },
        };
        Self { cell: Rc::new(cell) }
    }

    pub fn loaded(value: V) -> Self {
        Self::new(Deferred::Loaded(value))
    }

    pub fn pending(f: impl Fn() -> Result<V> + 'static) -> Self {
        Self::new(Deferred::Pending(Rc::new(f)))
    }

    /// Evaluate (once) and return the value.
    pub fn force(&self) -> Result<&V> {
        if let Some(v) = self.cell.value.get() {
            return Ok(v);
        }
        let Some(thunk) = &self.cell.pending else {
            return Err(crate::error::Error::corrupt("lazy value has no source"));
        };
        let v = thunk()?;
        Ok(self.cell.value.get_or_init(|| v))
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.value.get().is_some()
    }

    /// The value if it has already been computed.
    pub fn get_if_loaded(&self) -> Option<&V> {
        self.cell.value.get()
    }

    /// True if both handles share one cache.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<V: PartialEq> Lazy<V> {
    /// Compare values, forcing both sides.
    pub fn try_eq(&self, other: &Self) -> Result<bool> {
        if self.ptr_eq(other) {
            return Ok(true);
        }
        Ok(self.force()? == other.force()?)
    }
}

impl<V: PartialEq> PartialEq for Lazy<V> {
    /// Values that can't be computed are only equal to themselves.
    fn eq(&self, other: &Self) -> bool {
        self.try_eq(other).unwrap_or(false)
    }
}

impl<V: fmt::Debug> fmt::Debug for Lazy<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell.value.get() {
            Some(v) => f.debug_tuple("Lazy").field(v).finish(),
            None => f.write_str("Lazy(<pending>)"),
        }
    }
}

impl<V> From<V> for Lazy<V> {
    fn from(value: V) -> Self {
        Self::loaded(value)
    }
}
