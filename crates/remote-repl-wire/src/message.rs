//! One protocol message: a dictionary carrying `op` plus op-specific fields.

use crate::value::{Dict, Value};

/// A single request or response message.
///
/// Requests always carry `op`; responses echo `id` and `session` back to the
/// requester. Everything else is op-specific (`code`, `stop_id`, `status`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    fields: Dict,
}

impl Message {
    /// Create an empty message.
    #[must_use]
    pub const fn new() -> Self {
        Self { fields: Dict::new() }
    }

    /// Create a message with the given `op`.
    #[must_use]
    pub fn of(op: &str) -> Self {
        Self::new().with("op", op)
    }

    /// Builder-style field set.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.set(key, value);
        self
    }

    /// Set a field, replacing any existing entry.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.set(key, value);
    }

    /// Remove a field, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.fields.get(key).and_then(Value::as_int)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// The operation name, if present.
    #[must_use]
    pub fn op(&self) -> Option<&str> {
        self.get_str("op")
    }

    /// The request/response correlation id, if present.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.get_str("id")
    }

    /// The session token, if present.
    #[must_use]
    pub fn session(&self) -> Option<&str> {
        self.get_str("session")
    }

    /// The `status` tag list, if present.
    #[must_use]
    pub fn status(&self) -> Option<Vec<&str>> {
        self.get("status")
            .and_then(Value::as_list)
            .map(|tags| tags.iter().filter_map(Value::as_str).collect())
    }

    /// The underlying dictionary.
    #[must_use]
    pub const fn fields(&self) -> &Dict {
        &self.fields
    }
}

impl From<Dict> for Message {
    fn from(fields: Dict) -> Self {
        Self { fields }
    }
}

impl From<Message> for Dict {
    fn from(msg: Message) -> Self {
        msg.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_read_typed_fields() {
        let msg = Message::of("eval")
            .with("id", "e1")
            .with("line", 20)
            .with("status", Value::strings(["done", "paused"]));

        assert_eq!(msg.op(), Some("eval"));
        assert_eq!(msg.id(), Some("e1"));
        assert_eq!(msg.session(), None);
        assert_eq!(msg.get_int("line"), Some(20));
        assert_eq!(msg.status(), Some(vec!["done", "paused"]));
    }
}
