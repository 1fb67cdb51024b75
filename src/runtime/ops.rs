//! Collection operators offered to user computations.
//!
//! User code implements the closure traits below ([`Mapper`],
//! [`Accumulator`], [`LazyCompute`], [`AsyncLazy`], [`Service`]) and wires
//! them into the engine's dataflow graph through [`Operators`]. Every
//! operator registers its closures as handles and asks the engine for a new
//! collection, returning the collection's name.

use crate::runtime::bridge::{Bridge, HostObject};
use crate::runtime::error::BridgeError;
use crate::runtime::foreign::{ExecutionContext, ForeignError, ForeignRef, IteratorRef};
use crate::runtime::registry::Handle;
use crate::runtime::value::{Entry, Value};
use crate::runtime::view::HostValue;
use futures::future::LocalBoxFuture;
use std::rc::Rc;

/// Key/value pairs produced by a [`Mapper`] for one input key.
pub type MapOutput<'f> = Vec<(HostValue<'f>, HostValue<'f>)>;

/// Maps one key and its values to any number of output pairs. Outputs that
/// share a key are coalesced into that key's value sequence.
pub trait Mapper {
    fn map<'f>(
        &self,
        key: HostValue<'f>,
        values: NonEmptyIter<'f>,
        ops: &Operators<'f>,
    ) -> Result<MapOutput<'f>, BridgeError>;
}

/// Fold and retract pair maintaining a per-key aggregate.
pub trait Accumulator {
    /// Value of the aggregate before anything is folded in.
    fn initial(&self) -> Value;

    fn accumulate<'f>(
        &self,
        acc: HostValue<'f>,
        value: HostValue<'f>,
    ) -> Result<HostValue<'f>, BridgeError>;

    /// Retracts a value folded in earlier. `None` means the aggregate must
    /// be rebuilt from [`Accumulator::initial`].
    fn dismiss<'f>(
        &self,
        acc: HostValue<'f>,
        value: HostValue<'f>,
    ) -> Result<Option<HostValue<'f>>, BridgeError>;
}

/// Computes the value of a lazy collection on first read of a key.
pub trait LazyCompute {
    fn compute<'f>(
        &self,
        key: HostValue<'f>,
        this: &LazySelf<'f>,
        ops: &Operators<'f>,
    ) -> Result<Option<HostValue<'f>>, BridgeError>;
}

/// What an async-lazy call resolves to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsyncValue {
    /// `None` reports the previous payload as still current.
    pub payload: Option<Value>,
    pub metadata: Option<Value>,
}

impl AsyncValue {
    pub fn payload(payload: impl Into<Value>) -> Self {
        Self {
            payload: Some(payload.into()),
            metadata: None,
        }
    }

    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, metadata: impl Into<Value>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}

/// Reason an async-lazy call failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    Message(String),
    Value(Value),
}

impl Rejection {
    /// Textual form; structured reasons are rendered as JSON.
    pub fn message(&self) -> String {
        match self {
            Rejection::Message(message) => message.clone(),
            Rejection::Value(Value::String(message)) => message.clone(),
            Rejection::Value(value) => match value.to_json() {
                Ok(json) => json.to_string(),
                Err(err) => err.to_string(),
            },
        }
    }
}

impl From<BridgeError> for Rejection {
    fn from(err: BridgeError) -> Self {
        Rejection::Message(err.to_string())
    }
}

impl From<&str> for Rejection {
    fn from(message: &str) -> Self {
        Rejection::Message(message.to_owned())
    }
}

impl From<String> for Rejection {
    fn from(message: String) -> Self {
        Rejection::Message(message)
    }
}

/// A lazy collection whose values come from an async computation.
pub trait AsyncLazy {
    /// Parameters of the call for `key`. A change of parameters for a key
    /// starts a new call.
    fn params<'f>(&self, key: &HostValue<'f>) -> Result<Value, BridgeError> {
        let _ = key;
        Ok(Value::Null)
    }

    /// Starts the computation. Runs inside a foreign call, so only owned
    /// values may be carried into the returned future.
    fn call(&self, key: Value, params: Value) -> LocalBoxFuture<'static, Result<AsyncValue, Rejection>>;
}

/// Builds the collection graph of a service.
pub trait Service {
    fn init(&self, ops: &Operators<'_>) -> Result<(), BridgeError>;

    /// Resolves a resource request to a collection. By default a resource is
    /// the collection of the same name.
    fn resource(
        &self,
        name: &str,
        params: &Value,
        ops: &Operators<'_>,
    ) -> Result<String, BridgeError> {
        let _ = (params, ops);
        Ok(name.to_owned())
    }
}

/// Operator surface handed to user closures while an execution context is
/// active.
pub struct Operators<'f> {
    bridge: &'f Bridge,
    name: Option<String>,
}

impl<'f> Operators<'f> {
    pub(crate) fn new(bridge: &'f Bridge) -> Self {
        Self { bridge, name: None }
    }

    /// Operators whose next derived collection is called `name` instead of
    /// an engine-chosen name.
    ///
    /// ```ignore
    /// let active = ops.named("active_users").map(&users, OnlyActive)?;
    /// assert_eq!(active, "active_users");
    /// ```
    pub fn named(&self, name: impl Into<String>) -> Operators<'f> {
        Operators {
            bridge: self.bridge,
            name: Some(name.into()),
        }
    }

    fn ctx(&self) -> ExecutionContext {
        self.bridge.contexts().require_current()
    }

    /// The engine keeps none of the handles passed to a failed operator.
    fn rollback(&self, err: ForeignError, registered: &[Handle]) -> BridgeError {
        for handle in registered {
            self.bridge.release(*handle);
        }
        self.bridge.foreign_error(err)
    }

    /// Declares a writable input collection with its initial entries.
    pub fn input(&self, name: &str, entries: Vec<Entry>) -> Result<String, BridgeError> {
        let ctx = self.ctx();
        let encoded = Value::Array(
            entries
                .into_iter()
                .map(|Entry(key, values)| Value::Array(vec![key, Value::Array(values)]))
                .collect(),
        );
        let pointer = self.bridge.values().export_owned(self.bridge.heap(), &encoded)?;
        self.bridge
            .engine()
            .input(ctx, name, pointer)
            .map_err(|err| self.bridge.foreign_error(err))
    }

    pub fn map(&self, source: &str, mapper: impl Mapper + 'static) -> Result<String, BridgeError> {
        let ctx = self.ctx();
        let handle = self.bridge.register(HostObject::Mapper(Rc::new(mapper)));
        self.bridge
            .engine()
            .map(ctx, self.name.as_deref(), source, handle)
            .map_err(|err| self.rollback(err, &[handle]))
    }

    pub fn map_reduce(
        &self,
        source: &str,
        mapper: impl Mapper + 'static,
        accumulator: impl Accumulator + 'static,
    ) -> Result<String, BridgeError> {
        let ctx = self.ctx();
        let initial = self
            .bridge
            .values()
            .export_owned(self.bridge.heap(), &accumulator.initial())?;
        let mapper = self.bridge.register(HostObject::Mapper(Rc::new(mapper)));
        let accumulator = self
            .bridge
            .register(HostObject::Accumulator(Rc::new(accumulator)));
        self.bridge
            .engine()
            .map_reduce(ctx, self.name.as_deref(), source, mapper, accumulator, initial)
            .map_err(|err| self.rollback(err, &[mapper, accumulator]))
    }

    fn register_sources(&self, sources: Vec<(&str, Box<dyn Mapper>)>) -> Vec<(String, Handle)> {
        sources
            .into_iter()
            .map(|(source, mapper)| {
                let handle = self.bridge.register(HostObject::Mapper(Rc::from(mapper)));
                (source.to_owned(), handle)
            })
            .collect()
    }

    /// One collection fed by several sources, each with its own mapper.
    pub fn multimap(&self, sources: Vec<(&str, Box<dyn Mapper>)>) -> Result<String, BridgeError> {
        let ctx = self.ctx();
        let sources = self.register_sources(sources);
        self.bridge
            .engine()
            .multimap(ctx, self.name.as_deref(), &sources)
            .map_err(|err| {
                let handles: Vec<_> = sources.iter().map(|(_, handle)| *handle).collect();
                self.rollback(err, &handles)
            })
    }

    pub fn multimap_reduce(
        &self,
        sources: Vec<(&str, Box<dyn Mapper>)>,
        accumulator: impl Accumulator + 'static,
    ) -> Result<String, BridgeError> {
        let ctx = self.ctx();
        let initial = self
            .bridge
            .values()
            .export_owned(self.bridge.heap(), &accumulator.initial())?;
        let sources = self.register_sources(sources);
        let accumulator = self
            .bridge
            .register(HostObject::Accumulator(Rc::new(accumulator)));
        self.bridge
            .engine()
            .multimap_reduce(ctx, self.name.as_deref(), &sources, accumulator, initial)
            .map_err(|err| {
                let mut handles: Vec<_> = sources.iter().map(|(_, handle)| *handle).collect();
                handles.push(accumulator);
                self.rollback(err, &handles)
            })
    }

    pub fn lazy(&self, compute: impl LazyCompute + 'static) -> Result<String, BridgeError> {
        let ctx = self.ctx();
        let handle = self.bridge.register(HostObject::Lazy(Rc::new(compute)));
        self.bridge
            .engine()
            .lazy(ctx, handle)
            .map_err(|err| self.rollback(err, &[handle]))
    }

    pub fn async_lazy(&self, call: impl AsyncLazy + 'static) -> Result<String, BridgeError> {
        let ctx = self.ctx();
        let handle = self.bridge.register(HostObject::AsyncLazy(Rc::new(call)));
        self.bridge
            .engine()
            .async_lazy(ctx, handle)
            .map_err(|err| self.rollback(err, &[handle]))
    }

    fn read(
        &self,
        collection: &str,
        key: HostValue<'f>,
        lazy: bool,
    ) -> Result<Vec<HostValue<'f>>, BridgeError> {
        let ctx = self.ctx();
        let heap = self.bridge.heap();
        let key = self.bridge.values().export_value(heap, &key)?;
        let engine = self.bridge.engine();
        let array = if lazy {
            engine.get_array_lazy(ctx, collection, key)
        } else {
            engine.get_array(ctx, collection, key)
        }
        .map_err(|err| self.bridge.foreign_error(err))?;
        let values = self.bridge.values().import_view(heap, array);
        Ok(values.iter().collect())
    }

    fn exactly_one(
        collection: &str,
        mut values: Vec<HostValue<'f>>,
    ) -> Result<HostValue<'f>, BridgeError> {
        match values.len() {
            1 => Ok(values.remove(0)),
            n => Err(BridgeError::Foreign(format!(
                "expected exactly one value in '{collection}', found {n}"
            ))),
        }
    }

    fn at_most_one(
        collection: &str,
        mut values: Vec<HostValue<'f>>,
    ) -> Result<Option<HostValue<'f>>, BridgeError> {
        match values.len() {
            0 => Ok(None),
            1 => Ok(Some(values.remove(0))),
            n => Err(BridgeError::Foreign(format!(
                "expected at most one value in '{collection}', found {n}"
            ))),
        }
    }

    pub fn get_array(
        &self,
        collection: &str,
        key: impl Into<HostValue<'f>>,
    ) -> Result<Vec<HostValue<'f>>, BridgeError> {
        self.read(collection, key.into(), false)
    }

    pub fn get_one(
        &self,
        collection: &str,
        key: impl Into<HostValue<'f>>,
    ) -> Result<HostValue<'f>, BridgeError> {
        Self::exactly_one(collection, self.read(collection, key.into(), false)?)
    }

    pub fn maybe_get(
        &self,
        collection: &str,
        key: impl Into<HostValue<'f>>,
    ) -> Result<Option<HostValue<'f>>, BridgeError> {
        Self::at_most_one(collection, self.read(collection, key.into(), false)?)
    }

    pub fn size(&self, collection: &str) -> Result<usize, BridgeError> {
        let ctx = self.ctx();
        self.bridge
            .engine()
            .size(ctx, collection)
            .map_err(|err| self.bridge.foreign_error(err))
    }

    pub fn get_array_lazy(
        &self,
        collection: &str,
        key: impl Into<HostValue<'f>>,
    ) -> Result<Vec<HostValue<'f>>, BridgeError> {
        self.read(collection, key.into(), true)
    }

    pub fn get_one_lazy(
        &self,
        collection: &str,
        key: impl Into<HostValue<'f>>,
    ) -> Result<HostValue<'f>, BridgeError> {
        Self::exactly_one(collection, self.read(collection, key.into(), true)?)
    }

    pub fn maybe_get_lazy(
        &self,
        collection: &str,
        key: impl Into<HostValue<'f>>,
    ) -> Result<Option<HostValue<'f>>, BridgeError> {
        Self::at_most_one(collection, self.read(collection, key.into(), true)?)
    }
}

/// Access to the lazy collection a [`LazyCompute`] is computing, for
/// recursive definitions.
pub struct LazySelf<'f> {
    ops: Operators<'f>,
    collection: String,
}

impl<'f> LazySelf<'f> {
    pub(crate) fn new(bridge: &'f Bridge, collection: &str) -> Self {
        Self {
            ops: Operators::new(bridge),
            collection: collection.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        &self.collection
    }

    pub fn get_array(&self, key: impl Into<HostValue<'f>>) -> Result<Vec<HostValue<'f>>, BridgeError> {
        self.ops.get_array_lazy(&self.collection, key)
    }

    pub fn get_one(&self, key: impl Into<HostValue<'f>>) -> Result<HostValue<'f>, BridgeError> {
        self.ops.get_one_lazy(&self.collection, key)
    }

    pub fn maybe_get(
        &self,
        key: impl Into<HostValue<'f>>,
    ) -> Result<Option<HostValue<'f>>, BridgeError> {
        self.ops.maybe_get_lazy(&self.collection, key)
    }
}

/// Iterator over the values of one key. The engine guarantees at least one.
pub struct NonEmptyIter<'f> {
    bridge: &'f Bridge,
    cursor: IteratorRef,
}

impl<'f> NonEmptyIter<'f> {
    pub(crate) fn new(bridge: &'f Bridge, cursor: IteratorRef) -> Self {
        Self { bridge, cursor }
    }

    fn import(&self, pointer: ForeignRef) -> HostValue<'f> {
        self.bridge.values().import_view(self.bridge.heap(), pointer)
    }

    /// The first value, regardless of how far the iterator has advanced.
    pub fn first(&self) -> HostValue<'f> {
        self.import(self.bridge.engine().iterator_first(self.cursor))
    }

    /// The only value; fails when the key holds more than one.
    pub fn unique_value(&self) -> Result<HostValue<'f>, BridgeError> {
        let pointer = self
            .bridge
            .engine()
            .iterator_unique_value(self.cursor)
            .map_err(|err| self.bridge.foreign_error(err))?;
        Ok(self.import(pointer))
    }

    pub fn to_vec(self) -> Vec<HostValue<'f>> {
        self.collect()
    }
}

impl<'f> Iterator for NonEmptyIter<'f> {
    type Item = HostValue<'f>;

    fn next(&mut self) -> Option<Self::Item> {
        let pointer = self.bridge.engine().iterator_next(self.cursor);
        if pointer.is_null() {
            None
        } else {
            Some(self.import(pointer))
        }
    }
}

impl Clone for NonEmptyIter<'_> {
    fn clone(&self) -> Self {
        Self {
            bridge: self.bridge,
            cursor: self.bridge.engine().clone_iterator(self.cursor),
        }
    }
}
