//! Zero-copy views over foreign composite values.
//!
//! A [`HostValue`] is what host closures receive from the engine. Scalars are
//! copied on import; arrays and objects arrive as a [`ValueView`] that reads
//! the foreign buffer lazily, one field or element at a time, and caches what
//! it resolved. The `'f` lifetime is the foreign call frame the buffer belongs
//! to, so a view cannot be retained past the call that produced it; use
//! [`HostValue::detach`] for an owned copy.

use crate::runtime::conversion::materialize;
use crate::runtime::error::BridgeError;
use crate::runtime::foreign::{ForeignHeap, ForeignRef, ForeignType};
use crate::runtime::value::{LimitTracker, Limits, Value};
use indexmap::IndexMap;
use once_cell::unsync::OnceCell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A value crossing the bridge.
#[derive(Clone)]
pub enum HostValue<'f> {
    /// Scalar copied out of the foreign heap
    Primitive(Value),
    /// Read-only view over a foreign array or object
    View(Rc<ValueView<'f>>),
    /// Host-owned value
    Owned(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Array,
    Object,
}

/// Read-only projection of a foreign array or object.
pub struct ValueView<'f> {
    heap: &'f dyn ForeignHeap,
    pointer: ForeignRef,
    shape: Shape,
    limits: Limits,
    fields: OnceCell<IndexMap<String, usize>>,
    children: RefCell<HashMap<usize, HostValue<'f>>>,
}

/// Imports `pointer` without copying composites.
pub(crate) fn view_of<'f>(
    heap: &'f dyn ForeignHeap,
    pointer: ForeignRef,
    limits: Limits,
) -> HostValue<'f> {
    let shape = match heap.type_of(pointer) {
        ForeignType::Undefined | ForeignType::Null => {
            return HostValue::Primitive(Value::Null)
        }
        ForeignType::Int => return HostValue::Primitive(Value::Int(heap.as_int(pointer))),
        ForeignType::Float => return HostValue::Primitive(Value::Float(heap.as_float(pointer))),
        ForeignType::Boolean => return HostValue::Primitive(Value::Bool(heap.as_bool(pointer))),
        ForeignType::String => {
            return HostValue::Primitive(Value::String(heap.read_string(pointer)))
        }
        ForeignType::Array => Shape::Array,
        ForeignType::Object => Shape::Object,
    };
    HostValue::View(Rc::new(ValueView {
        heap,
        pointer,
        shape,
        limits,
        fields: OnceCell::new(),
        children: RefCell::new(HashMap::new()),
    }))
}

impl<'f> ValueView<'f> {
    pub fn pointer(&self) -> ForeignRef {
        self.pointer
    }

    pub fn is_array(&self) -> bool {
        self.shape == Shape::Array
    }

    pub fn is_object(&self) -> bool {
        self.shape == Shape::Object
    }

    pub fn len(&self) -> usize {
        match self.shape {
            Shape::Array => self.heap.array_size(self.pointer),
            Shape::Object => self.field_index().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn field_index(&self) -> &IndexMap<String, usize> {
        self.fields.get_or_init(|| {
            (0..self.heap.object_size(self.pointer))
                .map(|i| (self.heap.field_name(self.pointer, i), i))
                .collect()
        })
    }

    fn child(&self, index: usize) -> HostValue<'f> {
        if let Some(cached) = self.children.borrow().get(&index) {
            return cached.clone();
        }
        let pointer = match self.shape {
            Shape::Array => self.heap.array_at(self.pointer, index),
            Shape::Object => self.heap.field_value(self.pointer, index),
        };
        let value = view_of(self.heap, pointer, self.limits);
        self.children.borrow_mut().insert(index, value.clone());
        value
    }

    pub fn get(&self, key: &str) -> Option<HostValue<'f>> {
        if self.shape != Shape::Object {
            return None;
        }
        let index = *self.field_index().get(key)?;
        Some(self.child(index))
    }

    pub fn at(&self, index: usize) -> Option<HostValue<'f>> {
        if self.shape != Shape::Array || index >= self.len() {
            return None;
        }
        Some(self.child(index))
    }

    pub fn keys(&self) -> Vec<String> {
        match self.shape {
            Shape::Object => self.field_index().keys().cloned().collect(),
            Shape::Array => Vec::new(),
        }
    }

    pub fn materialize(&self) -> Result<Value, BridgeError> {
        let mut tracker = LimitTracker::new(self.limits);
        materialize(self.heap, self.pointer, &mut tracker)
    }
}

impl<'f> HostValue<'f> {
    pub fn owned(value: impl Into<Value>) -> Self {
        HostValue::Owned(value.into())
    }

    pub fn is_view(&self) -> bool {
        matches!(self, HostValue::View(_))
    }

    /// The foreign pointer of a not-yet-detached view.
    pub fn pointer(&self) -> Option<ForeignRef> {
        match self {
            HostValue::View(view) => Some(view.pointer()),
            _ => None,
        }
    }

    fn owned_value(&self) -> Option<&Value> {
        match self {
            HostValue::Primitive(value) | HostValue::Owned(value) => Some(value),
            HostValue::View(_) => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<HostValue<'f>> {
        match self {
            HostValue::View(view) => view.get(key),
            other => other
                .owned_value()
                .and_then(|value| value.get(key))
                .map(|value| HostValue::Owned(value.clone())),
        }
    }

    pub fn at(&self, index: usize) -> Option<HostValue<'f>> {
        match self {
            HostValue::View(view) => view.at(index),
            HostValue::Owned(Value::Array(items)) => {
                items.get(index).map(|value| HostValue::Owned(value.clone()))
            }
            _ => None,
        }
    }

    /// Number of elements or fields; zero for scalars.
    pub fn len(&self) -> usize {
        match self {
            HostValue::View(view) => view.len(),
            HostValue::Owned(Value::Array(items)) => items.len(),
            HostValue::Owned(Value::Object(map)) => map.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        match self {
            HostValue::View(view) => view.keys(),
            HostValue::Owned(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Iterates array elements or object field values, in order.
    pub fn iter(&self) -> impl Iterator<Item = HostValue<'f>> + '_ {
        let keys = self.keys();
        let len = self.len();
        let by_index = keys.is_empty();
        (0..len).filter_map(move |i| {
            if by_index {
                self.at(i)
            } else {
                self.get(&keys[i])
            }
        })
    }

    pub fn as_str(&self) -> Option<&str> {
        self.owned_value().and_then(Value::as_str)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.owned_value().and_then(Value::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.owned_value().and_then(Value::as_f64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.owned_value().and_then(Value::as_bool)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.owned_value(), Some(Value::Null))
    }

    /// Deep copy into a host-owned value, independent of the foreign buffer.
    pub fn detach(&self) -> Result<Value, BridgeError> {
        match self {
            HostValue::View(view) => view.materialize(),
            HostValue::Primitive(value) | HostValue::Owned(value) => Ok(value.clone()),
        }
    }

    /// Like [`HostValue::detach`] but keeps the result as a `HostValue`.
    pub fn to_owned_value(&self) -> Result<HostValue<'static>, BridgeError> {
        Ok(HostValue::Owned(self.detach()?))
    }

    /// Full materialization as JSON.
    pub fn to_json(&self) -> Result<serde_json::Value, BridgeError> {
        self.detach()?.to_json()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<(), BridgeError> {
        match self {
            HostValue::View(_) => Err(BridgeError::ImmutableValue),
            HostValue::Owned(Value::Object(map)) => {
                map.insert(key.to_owned(), value.into());
                Ok(())
            }
            _ => Err(BridgeError::UnsupportedValueType(format!(
                "cannot set field '{key}' on a non-object value"
            ))),
        }
    }

    pub fn push(&mut self, value: impl Into<Value>) -> Result<(), BridgeError> {
        match self {
            HostValue::View(_) => Err(BridgeError::ImmutableValue),
            HostValue::Owned(Value::Array(items)) => {
                items.push(value.into());
                Ok(())
            }
            _ => Err(BridgeError::UnsupportedValueType(
                "cannot push onto a non-array value".to_string(),
            )),
        }
    }

    pub fn remove(&mut self, key: &str) -> Result<Option<Value>, BridgeError> {
        match self {
            HostValue::View(_) => Err(BridgeError::ImmutableValue),
            HostValue::Owned(Value::Object(map)) => Ok(map.shift_remove(key)),
            _ => Ok(None),
        }
    }
}

impl fmt::Debug for HostValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Primitive(value) => f.debug_tuple("Primitive").field(value).finish(),
            HostValue::Owned(value) => f.debug_tuple("Owned").field(value).finish(),
            HostValue::View(view) => f
                .debug_struct("View")
                .field("pointer", &view.pointer)
                .field("shape", &view.shape)
                .finish(),
        }
    }
}

impl From<Value> for HostValue<'_> {
    fn from(value: Value) -> Self {
        HostValue::Owned(value)
    }
}

impl From<serde_json::Value> for HostValue<'_> {
    fn from(json: serde_json::Value) -> Self {
        HostValue::Owned(Value::from(json))
    }
}

impl From<&str> for HostValue<'_> {
    fn from(s: &str) -> Self {
        HostValue::Owned(Value::from(s))
    }
}

impl From<String> for HostValue<'_> {
    fn from(s: String) -> Self {
        HostValue::Owned(Value::String(s))
    }
}

impl From<i64> for HostValue<'_> {
    fn from(i: i64) -> Self {
        HostValue::Owned(Value::Int(i))
    }
}

impl From<bool> for HostValue<'_> {
    fn from(b: bool) -> Self {
        HostValue::Owned(Value::Bool(b))
    }
}
