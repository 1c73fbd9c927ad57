//! Turns a [`Context`] into the live value table and its wire metadata

use serde_json::{Map, Value};

use super::value::{ContextItem, ContextValue};
use crate::protocol::ContextEntry;

/// Insertion-ordered set of named context items
///
/// Inserting an existing name replaces the value but keeps the original position.
#[derive(Debug, Clone, Default)]
pub struct Context {
    items: Vec<(String, ContextItem)>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: impl Into<String>, item: impl Into<ContextItem>) -> Self {
        self.insert(name, item);
        self
    }

    /// Builder-style insert of any serializable value
    pub fn with_value<T: serde::Serialize + ?Sized>(self, name: impl Into<String>, value: &T) -> Self {
        self.with(name, ContextValue::data(value))
    }

    pub fn insert(&mut self, name: impl Into<String>, item: impl Into<ContextItem>) {
        let name = name.into();
        let item = item.into();
        match self.items.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = item,
            None => self.items.push((name, item)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ContextItem> {
        self.items.iter().find(|(n, _)| n == name).map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ContextItem)> {
        self.items.iter().map(|(n, item)| (n.as_str(), item))
    }
}

/// Live values an invocation's expressions run against
#[derive(Debug, Clone, Default)]
pub struct ContextTable {
    values: Vec<(String, ContextValue)>,
}

impl ContextTable {
    pub fn get(&self, name: &str) -> Option<&ContextValue> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Insert or replace a value, keeping the position of an existing name
    pub fn set(&mut self, name: impl Into<String>, value: ContextValue) {
        let name = name.into();
        match self.values.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The whole table as one JSON object
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (name, value) in &self.values {
            map.insert(name.clone(), value.to_json());
        }
        Value::Object(map)
    }
}

/// Split a context into the live table and the metadata sent to the agent
///
/// Error values get a description that embeds their message and trace, so the
/// agent can read them without a callback.
pub fn serialize_context(context: &Context) -> (ContextTable, Vec<ContextEntry>) {
    let mut table = ContextTable::default();
    let mut entries = Vec::with_capacity(context.len());

    for (name, item) in context.iter() {
        table.set(name, item.value.clone());

        let description = match &item.value {
            ContextValue::Error(error) => {
                let mut text = String::new();
                if let Some(desc) = &item.description {
                    text.push_str(desc);
                    text.push('\n');
                }
                text.push_str(&format!("Message: {}\n", error.message()));
                if let Some(trace) = error.formatted_trace() {
                    text.push_str(&format!("Backtrace:\n{}", trace));
                }
                Some(text)
            }
            _ => item.description.clone(),
        };

        entries.push(ContextEntry {
            name: name.to_string(),
            runtime_type: item.value.runtime_type(),
            description,
        });
    }

    (table, entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CapturedError, ContextCallable};

    #[test]
    fn test_simple_values() {
        let context = Context::new().with_value("x", &42).with_value("y", "hello");
        let (table, entries) = serialize_context(&context);

        assert_eq!(table.to_json(), serde_json::json!({"x": 42, "y": "hello"}));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "x");
        assert_eq!(entries[0].runtime_type, "integer");
        assert_eq!(entries[1].name, "y");
        assert_eq!(entries[1].runtime_type, "string");
        assert!(entries[0].description.is_none());
    }

    #[test]
    fn test_described_item() {
        let context = Context::new()
            .with("x", ContextItem::described(Value::from(42), "The answer"))
            .with_value("y", "hello");
        let (_, entries) = serialize_context(&context);
        assert_eq!(entries[0].description.as_deref(), Some("The answer"));
    }

    #[test]
    fn test_error_description_contains_message() {
        let error = CapturedError::new("ValueError", "test error");
        let context = Context::new().with("error", error);
        let (table, entries) = serialize_context(&context);

        assert!(matches!(table.get("error"), Some(ContextValue::Error(_))));
        assert_eq!(entries[0].runtime_type, "ValueError");
        let description = entries[0].description.as_deref().unwrap_or_default();
        assert!(description.contains("Message: test error"));
    }

    #[test]
    fn test_error_description_keeps_caller_text() {
        let error = CapturedError::new("DivisionByZero", "attempt to divide by zero");
        let context = Context::new().with("error", ContextItem::described(error, "Failed while averaging"));
        let (_, entries) = serialize_context(&context);
        let description = entries[0].description.clone().unwrap_or_default();
        assert!(description.starts_with("Failed while averaging\n"));
        assert!(description.contains("attempt to divide by zero"));
    }

    #[test]
    fn test_duplicate_name_last_write_wins_in_place() {
        let mut context = Context::new();
        context.insert("a", Value::from(1));
        context.insert("b", Value::from(2));
        context.insert("a", Value::from(3));
        let (table, entries) = serialize_context(&context);

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(table.to_json()["a"], 3);
    }

    #[test]
    fn test_entry_count_and_names_match_input() {
        let context = Context::new()
            .with_value("numbers", &vec![1, 2, 3])
            .with("double", ContextCallable::new(|_| Ok(Value::Null)))
            .with("err", CapturedError::new("E", "m"))
            .with_value("cfg", &serde_json::json!({"debug": true}));
        let (table, entries) = serialize_context(&context);

        assert_eq!(entries.len(), context.len());
        assert_eq!(table.len(), context.len());
        for ((name, _), entry) in context.iter().zip(&entries) {
            assert_eq!(name, entry.name);
        }
        assert_eq!(entries[1].runtime_type, "function");
    }
}
