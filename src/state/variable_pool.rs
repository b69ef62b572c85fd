//! Variable pool
//!
//! Node outputs keyed by `(node_id, field)`. Written only by the engine loop;
//! workers receive a cloned snapshot with every dispatch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

use crate::graph::NodeId;

/// Pseudo node id holding system variables (`sys.user_id`, `sys.query`, ...)
pub const SYSTEM_VARIABLE_NODE_ID: &str = "sys";

/// Reference to a value in the pool
///
/// Serialized as a string array: `["node", "field", "nested", "path"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Selector {
    pub node_id: NodeId,
    pub field: String,
    /// Keys (or array indices) below the field value
    pub path: Vec<String>,
}

impl Selector {
    /// Selector for a whole field
    pub fn new(node_id: impl Into<NodeId>, field: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            field: field.into(),
            path: Vec::new(),
        }
    }

    /// Append a nested path segment
    pub fn with_path(mut self, segment: impl Into<String>) -> Self {
        self.path.push(segment.into());
        self
    }

    /// Parse a dotted selector such as `llm.text` or `llm.json.items.0`
    pub fn parse(dotted: &str) -> Option<Self> {
        let parts: Vec<String> = dotted.split('.').map(str::to_string).collect();
        Self::try_from(parts).ok()
    }

    /// The `(node_id, field)` pair without the nested path
    pub fn root(&self) -> Selector {
        Selector::new(self.node_id.clone(), self.field.clone())
    }
}

impl TryFrom<Vec<String>> for Selector {
    type Error = String;

    fn try_from(parts: Vec<String>) -> Result<Self, Self::Error> {
        let mut iter = parts.into_iter();
        match (iter.next(), iter.next()) {
            (Some(node), Some(field)) if !node.is_empty() && !field.is_empty() => Ok(Self {
                node_id: NodeId(node),
                field,
                path: iter.collect(),
            }),
            _ => Err("selector needs at least a node id and a field".to_string()),
        }
    }
}

impl From<Selector> for Vec<String> {
    fn from(selector: Selector) -> Self {
        let mut parts = vec![selector.node_id.0, selector.field];
        parts.extend(selector.path);
        parts
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id, self.field)?;
        for segment in &self.path {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

/// Node outputs, user inputs, and system variables for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariablePool {
    variables: HashMap<NodeId, Map<String, Value>>,
    #[serde(default)]
    user_inputs: Map<String, Value>,
    #[serde(default)]
    version: u64,
}

impl VariablePool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool with user inputs (exposed through the Start node)
    pub fn with_user_inputs(user_inputs: Map<String, Value>) -> Self {
        Self {
            user_inputs,
            ..Default::default()
        }
    }

    /// Set a system variable under [`SYSTEM_VARIABLE_NODE_ID`]
    pub fn with_system_variable(mut self, field: impl Into<String>, value: Value) -> Self {
        self.add(SYSTEM_VARIABLE_NODE_ID, field, value);
        self
    }

    /// Inputs supplied by the caller when the run started
    pub fn user_inputs(&self) -> &Map<String, Value> {
        &self.user_inputs
    }

    /// Write a value; last write wins
    pub fn add(&mut self, node_id: impl Into<NodeId>, field: impl Into<String>, value: Value) {
        self.variables
            .entry(node_id.into())
            .or_default()
            .insert(field.into(), value);
        self.version += 1;
    }

    /// Write every output of a node
    pub fn add_outputs(&mut self, node_id: &NodeId, outputs: &Map<String, Value>) {
        for (field, value) in outputs {
            self.add(node_id.clone(), field.clone(), value.clone());
        }
    }

    /// Write the value addressed by a selector, creating nested objects as needed
    pub fn set(&mut self, selector: &Selector, value: Value) {
        if selector.path.is_empty() {
            self.add(selector.node_id.clone(), selector.field.clone(), value);
            return;
        }
        let fields = self.variables.entry(selector.node_id.clone()).or_default();
        let mut slot = fields
            .entry(selector.field.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        for segment in &selector.path {
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            slot = match slot {
                Value::Object(map) => map.entry(segment.clone()).or_insert(Value::Null),
                _ => return,
            };
        }
        *slot = value;
        self.version += 1;
    }

    /// Look up a value, following the nested path through objects and arrays
    pub fn get(&self, selector: &Selector) -> Option<&Value> {
        let mut value = self
            .variables
            .get(&selector.node_id)?
            .get(&selector.field)?;
        for segment in &selector.path {
            value = match value {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(value)
    }

    /// Whether a value exists at the selector
    pub fn contains(&self, selector: &Selector) -> bool {
        self.get(selector).is_some()
    }

    /// All fields written by a node
    pub fn node_outputs(&self, node_id: &str) -> Option<&Map<String, Value>> {
        self.variables.get(node_id)
    }

    /// Drop every value written by a node
    pub fn remove_node(&mut self, node_id: &str) {
        if self.variables.remove(node_id).is_some() {
            self.version += 1;
        }
    }

    /// Number of writes applied so far
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Render a pool value as text for templates and stream chunks
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_last_write_wins_and_version() {
        let mut pool = VariablePool::new();
        let sel = Selector::new("llm", "text");

        pool.add("llm", "text", json!("first"));
        pool.add("llm", "text", json!("second"));

        assert_eq!(pool.get(&sel), Some(&json!("second")));
        assert_eq!(pool.version(), 2);
    }

    #[test]
    fn test_nested_lookup() {
        let mut pool = VariablePool::new();
        pool.add("tool", "json", json!({"items": [{"name": "a"}, {"name": "b"}]}));

        let sel = Selector::parse("tool.json.items.1.name").unwrap();
        assert_eq!(pool.get(&sel), Some(&json!("b")));
        assert!(pool.get(&Selector::parse("tool.json.missing").unwrap()).is_none());
        assert!(pool.get(&Selector::parse("tool.json.items.x").unwrap()).is_none());
    }

    #[test]
    fn test_set_nested_creates_objects() {
        let mut pool = VariablePool::new();
        let sel = Selector::new("human", "form").with_path("answer");
        pool.set(&sel, json!("yes"));

        assert_eq!(pool.get(&sel), Some(&json!("yes")));
        assert_eq!(pool.get(&Selector::new("human", "form")), Some(&json!({"answer": "yes"})));
    }

    #[test]
    fn test_system_variables_and_inputs() {
        let mut inputs = Map::new();
        inputs.insert("query".into(), json!("hello"));
        let pool = VariablePool::with_user_inputs(inputs).with_system_variable("user_id", json!("u1"));

        assert_eq!(pool.user_inputs()["query"], json!("hello"));
        assert_eq!(
            pool.get(&Selector::new(SYSTEM_VARIABLE_NODE_ID, "user_id")),
            Some(&json!("u1"))
        );
    }

    #[test]
    fn test_selector_serde_as_array() {
        let sel = Selector::new("llm", "usage").with_path("tokens");
        let json = serde_json::to_string(&sel).unwrap();
        assert_eq!(json, r#"["llm","usage","tokens"]"#);

        let back: Selector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sel);
        assert!(serde_json::from_str::<Selector>(r#"["only"]"#).is_err());
    }

    #[test]
    fn test_render_value() {
        assert_eq!(render_value(&json!("text")), "text");
        assert_eq!(render_value(&json!(42)), "42");
        assert_eq!(render_value(&Value::Null), "");
        assert_eq!(render_value(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[test]
    fn test_pool_serde() {
        let mut pool = VariablePool::new();
        pool.add("a", "x", json!(1));
        let json = serde_json::to_string(&pool).unwrap();
        let back: VariablePool = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pool);
    }
}
