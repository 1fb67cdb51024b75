//! Node arena standing in for the engine's memory space.

use crate::runtime::error::contract_violation;
use crate::runtime::foreign::{ForeignHeap, ForeignRef, ForeignType};
use std::cell::RefCell;

#[derive(Debug, Clone)]
enum Node {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Array(Vec<ForeignRef>),
    Object(Vec<(String, ForeignRef)>),
}

/// Append-only arena of immutable nodes. A pointer is the node's index; index
/// 0 is reserved for the null pointer. Frames reclaim nodes by truncation.
#[derive(Debug)]
pub struct Heap {
    nodes: RefCell<Vec<Node>>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            nodes: RefCell::new(vec![Node::Null]),
        }
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.borrow().len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn alloc(&self, node: Node) -> ForeignRef {
        let mut nodes = self.nodes.borrow_mut();
        let index = u32::try_from(nodes.len())
            .unwrap_or_else(|_| contract_violation("foreign heap exhausted"));
        nodes.push(node);
        ForeignRef(index)
    }

    fn with_node<R>(&self, pointer: ForeignRef, f: impl FnOnce(&Node) -> R) -> R {
        let nodes = self.nodes.borrow();
        match nodes.get(pointer.0 as usize) {
            Some(node) if !pointer.is_null() => f(node),
            _ => contract_violation(format!("dangling foreign reference {}", pointer.0)),
        }
    }

    pub fn write_json(&self, json: &serde_json::Value) -> ForeignRef {
        match json {
            serde_json::Value::Null => self.alloc(Node::Null),
            serde_json::Value::Bool(b) => self.alloc(Node::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => self.alloc(Node::Int(i)),
                None => self.alloc(Node::Float(n.as_f64().unwrap_or(f64::NAN))),
            },
            serde_json::Value::String(s) => self.alloc(Node::String(s.clone())),
            serde_json::Value::Array(items) => {
                let items: Vec<_> = items.iter().map(|item| self.write_json(item)).collect();
                self.alloc(Node::Array(items))
            }
            serde_json::Value::Object(map) => {
                let fields: Vec<_> = map
                    .iter()
                    .map(|(key, value)| (key.clone(), self.write_json(value)))
                    .collect();
                self.alloc(Node::Object(fields))
            }
        }
    }

    /// Reads a value back as JSON; the null pointer reads as `null`.
    pub fn read_json(&self, pointer: ForeignRef) -> serde_json::Value {
        if pointer.is_null() {
            return serde_json::Value::Null;
        }
        let node = self.with_node(pointer, Node::clone);
        match node {
            Node::Null => serde_json::Value::Null,
            Node::Int(i) => serde_json::Value::from(i),
            Node::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Node::Bool(b) => serde_json::Value::Bool(b),
            Node::String(s) => serde_json::Value::String(s),
            Node::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(|i| self.read_json(i)).collect())
            }
            Node::Object(fields) => serde_json::Value::Object(
                fields
                    .into_iter()
                    .map(|(key, value)| (key, self.read_json(value)))
                    .collect(),
            ),
        }
    }
}

impl ForeignHeap for Heap {
    fn type_of(&self, value: ForeignRef) -> ForeignType {
        if value.is_null() {
            return ForeignType::Undefined;
        }
        self.with_node(value, |node| match node {
            Node::Null => ForeignType::Null,
            Node::Int(_) => ForeignType::Int,
            Node::Float(_) => ForeignType::Float,
            Node::Bool(_) => ForeignType::Boolean,
            Node::String(_) => ForeignType::String,
            Node::Array(_) => ForeignType::Array,
            Node::Object(_) => ForeignType::Object,
        })
    }

    fn as_int(&self, value: ForeignRef) -> i64 {
        self.with_node(value, |node| match node {
            Node::Int(i) => *i,
            other => contract_violation(format!("expected an int, found {other:?}")),
        })
    }

    fn as_float(&self, value: ForeignRef) -> f64 {
        self.with_node(value, |node| match node {
            Node::Float(f) => *f,
            Node::Int(i) => *i as f64,
            other => contract_violation(format!("expected a float, found {other:?}")),
        })
    }

    fn as_bool(&self, value: ForeignRef) -> bool {
        self.with_node(value, |node| match node {
            Node::Bool(b) => *b,
            other => contract_violation(format!("expected a boolean, found {other:?}")),
        })
    }

    fn read_string(&self, value: ForeignRef) -> String {
        self.with_node(value, |node| match node {
            Node::String(s) => s.clone(),
            other => contract_violation(format!("expected a string, found {other:?}")),
        })
    }

    fn array_size(&self, value: ForeignRef) -> usize {
        self.with_node(value, |node| match node {
            Node::Array(items) => items.len(),
            other => contract_violation(format!("expected an array, found {other:?}")),
        })
    }

    fn array_at(&self, value: ForeignRef, index: usize) -> ForeignRef {
        self.with_node(value, |node| match node {
            Node::Array(items) => items
                .get(index)
                .copied()
                .unwrap_or_else(|| contract_violation(format!("array index {index} out of range"))),
            other => contract_violation(format!("expected an array, found {other:?}")),
        })
    }

    fn object_size(&self, value: ForeignRef) -> usize {
        self.with_node(value, |node| match node {
            Node::Object(fields) => fields.len(),
            other => contract_violation(format!("expected an object, found {other:?}")),
        })
    }

    fn field_name(&self, value: ForeignRef, index: usize) -> String {
        self.with_node(value, |node| match node {
            Node::Object(fields) => fields
                .get(index)
                .map(|(name, _)| name.clone())
                .unwrap_or_else(|| contract_violation(format!("field {index} out of range"))),
            other => contract_violation(format!("expected an object, found {other:?}")),
        })
    }

    fn field_value(&self, value: ForeignRef, index: usize) -> ForeignRef {
        self.with_node(value, |node| match node {
            Node::Object(fields) => fields
                .get(index)
                .map(|(_, value)| *value)
                .unwrap_or_else(|| contract_violation(format!("field {index} out of range"))),
            other => contract_violation(format!("expected an object, found {other:?}")),
        })
    }

    fn create_null(&self) -> ForeignRef {
        self.alloc(Node::Null)
    }

    fn create_int(&self, value: i64) -> ForeignRef {
        self.alloc(Node::Int(value))
    }

    fn create_float(&self, value: f64) -> ForeignRef {
        self.alloc(Node::Float(value))
    }

    fn create_bool(&self, value: bool) -> ForeignRef {
        self.alloc(Node::Bool(value))
    }

    fn create_string(&self, value: &str) -> ForeignRef {
        self.alloc(Node::String(value.to_owned()))
    }

    fn create_array(&self, items: &[ForeignRef]) -> ForeignRef {
        self.alloc(Node::Array(items.to_vec()))
    }

    fn create_object(&self, fields: &[(String, ForeignRef)]) -> ForeignRef {
        self.alloc(Node::Object(fields.to_vec()))
    }

    fn begin_frame(&self) -> usize {
        self.nodes.borrow().len()
    }

    fn end_frame(&self, mark: usize) {
        self.nodes.borrow_mut().truncate(mark.max(1));
    }
}
