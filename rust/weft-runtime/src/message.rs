//! Tagged message records.
//!
//! A [`Message`] is an immutable record with an integer kind (`what`), an
//! optional primary [`Value`], and an optional set of named values. Process
//! work items are messages; what the fields mean is entirely up to the code
//! that produces and consumes them.
//!
//! Messages are moved, not shared: posting or enqueuing a message consumes
//! it, which is what makes the record immutable once submitted. Where a
//! message must fan out to several consumers (progress updates to multiple
//! watch ports) it is cloned; [`Message::clone`] deep-copies the named-value
//! map while sharing the cheap interior payloads.
//!
//! # Example
//!
//! ```rust
//! use weft_runtime::message::{Message, Value};
//!
//! let msg = Message::new(7)
//!     .with_data(Value::Int(42))
//!     .with_field("path", Value::from("/tmp/scratch"));
//! assert_eq!(msg.what(), 7);
//! assert_eq!(msg.get_int("missing"), None);
//! assert_eq!(msg.get_string("path"), Some("/tmp/scratch"));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A single typed value carried inside a [`Message`].
///
/// The scalar variants cover the wire-level payloads the runtime itself
/// sends; `Shared` carries arbitrary user state (a work item's context, a
/// results accumulator) behind an `Arc`. Dropping the last clone of a
/// `Shared` value releases the underlying data — the owner's `Drop` is the
/// destroy notification.
#[derive(Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Shared(Arc<dyn Any + Send + Sync>),
}

impl Value {
    /// Wrap arbitrary user data for transport inside a message.
    pub fn shared<T: Any + Send + Sync>(value: T) -> Self {
        Value::Shared(Arc::new(value))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Downcast a `Shared` value to a concrete type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Value::Shared(any) => Arc::clone(any).downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(x) => write!(f, "Float({x})"),
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Shared(_) => write!(f, "Shared(..)"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s))
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A tagged record: integer kind, optional primary value, optional named
/// fields.
///
/// The named-field map is allocated lazily — most messages carry only a
/// `what` code, or a `what` plus primary data.
#[derive(Clone)]
pub struct Message {
    what: u32,
    data: Option<Value>,
    fields: Option<HashMap<Arc<str>, Value>>,
}

impl Message {
    /// Create a message carrying only a kind code.
    pub fn new(what: u32) -> Self {
        Self {
            what,
            data: None,
            fields: None,
        }
    }

    /// Builder: attach the primary data value.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Builder: attach a named value.
    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.set(name, value);
        self
    }

    /// The message kind code.
    pub fn what(&self) -> u32 {
        self.what
    }

    /// The primary data value, if any.
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Number of named fields.
    pub fn field_count(&self) -> usize {
        self.fields.as_ref().map_or(0, HashMap::len)
    }

    /// Whether the message carries no data and no named fields.
    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.field_count() == 0
    }

    /// Whether a named field exists.
    pub fn contains(&self, name: &str) -> bool {
        self.fields.as_ref().is_some_and(|m| m.contains_key(name))
    }

    /// Set a named value, replacing any previous value under that name.
    pub fn set(&mut self, name: &str, value: Value) {
        self.fields
            .get_or_insert_with(HashMap::new)
            .insert(Arc::from(name), value);
    }

    /// Look up a named value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.as_ref()?.get(name)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name)?.as_bool()
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name)?.as_int()
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        self.get(name)?.as_float()
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.get(name)?.as_str()
    }

    /// Downcast a named `Shared` field to a concrete type.
    pub fn get_shared<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name)?.downcast::<T>()
    }

    /// Iterate over the named fields in unspecified order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields
            .iter()
            .flat_map(|m| m.iter().map(|(k, v)| (&**k, v)))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("what", &self.what)
            .field("data", &self.data)
            .field("fields", &self.field_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn bare_message_is_empty() {
        let msg = Message::new(3);
        assert_eq!(msg.what(), 3);
        assert!(msg.is_empty());
        assert_eq!(msg.field_count(), 0);
        assert!(!msg.contains("anything"));
    }

    #[test]
    fn primary_data() {
        let msg = Message::new(1).with_data(Value::Int(99));
        assert_eq!(msg.data().and_then(Value::as_int), Some(99));
        assert!(!msg.is_empty());
    }

    #[test]
    fn typed_field_accessors() {
        let mut msg = Message::new(0);
        msg.set("flag", Value::Bool(true));
        msg.set("count", Value::Int(-5));
        msg.set("ratio", Value::Float(0.25));
        msg.set("name", Value::from("worker"));

        assert_eq!(msg.get_bool("flag"), Some(true));
        assert_eq!(msg.get_int("count"), Some(-5));
        assert_eq!(msg.get_float("ratio"), Some(0.25));
        assert_eq!(msg.get_string("name"), Some("worker"));
        assert_eq!(msg.field_count(), 4);

        // Wrong-type lookups return None rather than panicking.
        assert_eq!(msg.get_int("name"), None);
        assert_eq!(msg.get_string("count"), None);
    }

    #[test]
    fn set_replaces_existing_value() {
        let mut msg = Message::new(0);
        msg.set("n", Value::Int(1));
        msg.set("n", Value::Int(2));
        assert_eq!(msg.get_int("n"), Some(2));
        assert_eq!(msg.field_count(), 1);
    }

    #[test]
    fn copy_preserves_named_fields() {
        let mut msg = Message::new(9).with_data(Value::from("payload"));
        msg.set("a", Value::Int(1));
        msg.set("b", Value::Bool(false));

        let copy = msg.clone();
        assert_eq!(copy.what(), 9);
        assert_eq!(copy.data().and_then(Value::as_str), Some("payload"));
        assert_eq!(copy.get_int("a"), Some(1));
        assert_eq!(copy.get_bool("b"), Some(false));
        assert_eq!(copy.field_count(), msg.field_count());
    }

    #[test]
    fn shared_value_downcasts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let msg = Message::new(5).with_field("counter", Value::Shared(Arc::clone(&counter) as _));

        let seen = msg.get_shared::<AtomicUsize>("counter").unwrap();
        seen.fetch_add(3, Ordering::Relaxed);
        assert_eq!(counter.load(Ordering::Relaxed), 3);

        // Downcasting to the wrong type fails cleanly.
        assert!(msg.get_shared::<String>("counter").is_none());
    }

    #[test]
    fn shared_value_dropped_with_last_clone() {
        struct Tracker(Arc<AtomicUsize>);
        impl Drop for Tracker {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let msg = Message::new(0).with_field("t", Value::shared(Tracker(Arc::clone(&drops))));
        let copy = msg.clone();

        drop(msg);
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        drop(copy);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn debug_format() {
        let msg = Message::new(2).with_data(Value::Int(1)).with_field("k", Value::Bool(true));
        let dbg = format!("{msg:?}");
        assert!(dbg.contains("what: 2"));
        assert!(dbg.contains("fields: 1"));
    }
}
