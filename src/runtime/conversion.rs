//! Marshaling between host values and the foreign heap.

use crate::runtime::error::BridgeError;
use crate::runtime::foreign::{ForeignHeap, ForeignRef, ForeignType};
use crate::runtime::value::{LimitTracker, Limits, Value};
use crate::runtime::view::{view_of, HostValue};
use indexmap::IndexMap;

/// Import/export entry points of the value bridge.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueBridge {
    limits: Limits,
}

impl ValueBridge {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Imports a foreign value. Without `copy`, composites come back as views
    /// valid for the current foreign call only; with `copy` they are deep
    /// materialized into host-owned values.
    pub fn import_value<'f>(
        &self,
        heap: &'f dyn ForeignHeap,
        pointer: ForeignRef,
        copy: bool,
    ) -> Result<HostValue<'f>, BridgeError> {
        if copy {
            let mut tracker = LimitTracker::new(self.limits);
            Ok(HostValue::Owned(materialize(heap, pointer, &mut tracker)?))
        } else {
            Ok(self.import_view(heap, pointer))
        }
    }

    /// Zero-copy import; never fails.
    pub fn import_view<'f>(&self, heap: &'f dyn ForeignHeap, pointer: ForeignRef) -> HostValue<'f> {
        view_of(heap, pointer, self.limits)
    }

    /// Imports and materializes; shorthand for `import_value(.., true)`.
    pub fn import_owned(
        &self,
        heap: &dyn ForeignHeap,
        pointer: ForeignRef,
    ) -> Result<Value, BridgeError> {
        let mut tracker = LimitTracker::new(self.limits);
        materialize(heap, pointer, &mut tracker)
    }

    pub fn import_string(&self, heap: &dyn ForeignHeap, pointer: ForeignRef) -> String {
        heap.read_string(pointer)
    }

    pub fn export_string(&self, heap: &dyn ForeignHeap, value: &str) -> ForeignRef {
        heap.create_string(value)
    }

    /// Exports a host value. A view that was never detached is handed back
    /// as its original pointer.
    pub fn export_value(
        &self,
        heap: &dyn ForeignHeap,
        value: &HostValue<'_>,
    ) -> Result<ForeignRef, BridgeError> {
        match value {
            HostValue::View(view) => Ok(view.pointer()),
            HostValue::Primitive(value) | HostValue::Owned(value) => {
                self.export_owned(heap, value)
            }
        }
    }

    pub fn export_owned(
        &self,
        heap: &dyn ForeignHeap,
        value: &Value,
    ) -> Result<ForeignRef, BridgeError> {
        let mut tracker = LimitTracker::new(self.limits);
        export(heap, value, &mut tracker)
    }

    /// Exports a sequence of host values as one foreign array.
    pub fn export_array(
        &self,
        heap: &dyn ForeignHeap,
        values: &[HostValue<'_>],
    ) -> Result<ForeignRef, BridgeError> {
        let items = values
            .iter()
            .map(|value| self.export_value(heap, value))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(heap.create_array(&items))
    }
}

/// Deep copy of a foreign value, enforcing limits.
pub(crate) fn materialize(
    heap: &dyn ForeignHeap,
    pointer: ForeignRef,
    tracker: &mut LimitTracker,
) -> Result<Value, BridgeError> {
    tracker.enter()?;

    let value = match heap.type_of(pointer) {
        ForeignType::Undefined | ForeignType::Null => {
            tracker.add_bytes(4)?;
            Value::Null
        }
        ForeignType::Boolean => {
            tracker.add_bytes(5)?;
            Value::Bool(heap.as_bool(pointer))
        }
        ForeignType::Int => {
            tracker.add_bytes(20)?;
            Value::Int(heap.as_int(pointer))
        }
        ForeignType::Float => {
            tracker.add_bytes(24)?;
            Value::Float(heap.as_float(pointer))
        }
        ForeignType::String => {
            let s = heap.read_string(pointer);
            tracker.add_bytes(s.len())?;
            Value::String(s)
        }
        ForeignType::Array => {
            let len = heap.array_size(pointer);
            let mut items = Vec::with_capacity(len);
            for i in 0..len {
                items.push(materialize(heap, heap.array_at(pointer, i), tracker)?);
            }
            Value::Array(items)
        }
        ForeignType::Object => {
            let len = heap.object_size(pointer);
            let mut map = IndexMap::with_capacity(len);
            for i in 0..len {
                let key = heap.field_name(pointer, i);
                tracker.add_bytes(key.len())?;
                let value = materialize(heap, heap.field_value(pointer, i), tracker)?;
                map.insert(key, value);
            }
            Value::Object(map)
        }
    };

    tracker.exit();
    Ok(value)
}

fn export(
    heap: &dyn ForeignHeap,
    value: &Value,
    tracker: &mut LimitTracker,
) -> Result<ForeignRef, BridgeError> {
    tracker.enter()?;

    let pointer = match value {
        Value::Null => {
            tracker.add_bytes(4)?;
            heap.create_null()
        }
        Value::Bool(b) => {
            tracker.add_bytes(5)?;
            heap.create_bool(*b)
        }
        Value::Int(i) => {
            tracker.add_bytes(20)?;
            heap.create_int(*i)
        }
        Value::Float(f) if !f.is_finite() => {
            return Err(BridgeError::UnsupportedValueType(format!(
                "non-finite float {f} cannot be exported"
            )))
        }
        Value::Float(f) => {
            tracker.add_bytes(24)?;
            heap.create_float(*f)
        }
        Value::String(s) => {
            tracker.add_bytes(s.len())?;
            heap.create_string(s)
        }
        Value::Array(items) => {
            let items = items
                .iter()
                .map(|item| export(heap, item, tracker))
                .collect::<Result<Vec<_>, _>>()?;
            heap.create_array(&items)
        }
        Value::Object(map) => {
            let mut fields = Vec::with_capacity(map.len());
            for (key, item) in map {
                tracker.add_bytes(key.len())?;
                fields.push((key.clone(), export(heap, item, tracker)?));
            }
            heap.create_object(&fields)
        }
    };

    tracker.exit();
    Ok(pointer)
}
