//! Runtime values
//!
//! Everything a program can publish, bind or pass to a site. Aggregates are
//! immutable once built and shared through `Arc`, so values can cross into
//! site worker threads. The only mutable things a value can point at are
//! futures, which are owned by the engine's cell table.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::arena::ArenaIndex;

/// Handle to a closure in the engine heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClosureId(pub(crate) ArenaIndex);

/// Handle to a future/cell in the engine's cell table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(pub(crate) ArenaIndex);

/// Index of a site in the engine's site table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SiteId(pub(crate) usize);

/// Runtime values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// The unit value carried by publications that carry no data
    Signal,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    Tuple(Arc<[Value]>),

    /// Empty list
    Nil,
    /// List cell
    Cons(Arc<(Value, Value)>),

    /// A tagged value such as a datatype constructor or an error
    Tagged { tag: Arc<str>, fields: Arc<[Value]> },

    /// A record with named fields
    Record(Arc<BTreeMap<String, Value>>),

    Closure(ClosureId),
    Site(SiteId),

    /// A reference to a cell that may not be bound yet
    Future(CellId),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn tuple(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Tuple(items.into_iter().collect())
    }

    pub fn tagged(tag: impl AsRef<str>, fields: impl IntoIterator<Item = Value>) -> Self {
        Value::Tagged {
            tag: Arc::from(tag.as_ref()),
            fields: fields.into_iter().collect(),
        }
    }

    pub fn record(fields: impl IntoIterator<Item = (String, Value)>) -> Self {
        Value::Record(Arc::new(fields.into_iter().collect()))
    }

    pub fn cons(head: Value, tail: Value) -> Self {
        Value::Cons(Arc::new((head, tail)))
    }

    /// Build a proper list from an iterator
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        let items: Vec<Value> = items.into_iter().collect();
        items
            .into_iter()
            .rev()
            .fold(Value::Nil, |tail, head| Value::cons(head, tail))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Signal => "Signal",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Str(_) => "String",
            Value::Tuple(_) => "Tuple",
            Value::Nil | Value::Cons(_) => "List",
            Value::Tagged { .. } => "Tagged",
            Value::Record(_) => "Record",
            Value::Closure(_) => "Closure",
            Value::Site(_) => "Site",
            Value::Future(_) => "Future",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Call `f` on every heap handle directly contained in this value
    pub(crate) fn visit_refs(&self, f: &mut impl FnMut(HeapRef)) {
        match self {
            Value::Closure(id) => f(HeapRef::Closure(*id)),
            Value::Future(id) => f(HeapRef::Cell(*id)),
            Value::Tuple(items) => items.iter().for_each(|v| v.visit_refs(f)),
            Value::Cons(cell) => {
                cell.0.visit_refs(f);
                cell.1.visit_refs(f);
            }
            Value::Tagged { fields, .. } => fields.iter().for_each(|v| v.visit_refs(f)),
            Value::Record(fields) => fields.values().for_each(|v| v.visit_refs(f)),
            Value::Signal
            | Value::Bool(_)
            | Value::Int(_)
            | Value::Str(_)
            | Value::Nil
            | Value::Site(_) => {}
        }
    }
}

/// A heap handle reachable from a value, used by the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum HeapRef {
    Closure(ClosureId),
    Cell(CellId),
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Signal => write!(f, "signal"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Value::Nil => write!(f, "[]"),
            Value::Cons(_) => {
                write!(f, "[")?;
                let mut cur = self;
                let mut first = true;
                while let Value::Cons(cell) = cur {
                    if !first {
                        write!(f, ", ")?;
                    }
                    first = false;
                    write!(f, "{}", cell.0)?;
                    cur = &cell.1;
                }
                if !matches!(cur, Value::Nil) {
                    write!(f, " | {}", cur)?;
                }
                write!(f, "]")
            }
            Value::Tagged { tag, fields } => {
                write!(f, "{}", tag)?;
                if !fields.is_empty() {
                    write!(f, "(")?;
                    for (i, field) in fields.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", field)?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
            Value::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} = {}", name, value)?;
                }
                write!(f, "}}")
            }
            Value::Closure(id) => write!(f, "<closure {:?}>", id.0),
            Value::Site(id) => write!(f, "<site {}>", id.0),
            Value::Future(id) => write!(f, "<future {:?}>", id.0),
        }
    }
}
