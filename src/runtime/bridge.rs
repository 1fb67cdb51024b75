//! The host side of the foreign boundary.
//!
//! [`Bridge`] owns the handle registry, the value bridge, the execution
//! context stack and the async driver for one engine instance, implements
//! the [`HostCallbacks`] the engine calls while it recomputes, and exposes
//! the top-level protocol operations the runtime thread runs on behalf of
//! the server.

use crate::runtime::config::RuntimeConfig;
use crate::runtime::context::ContextStack;
use crate::runtime::conversion::ValueBridge;
use crate::runtime::error::{contract_violation, BridgeError};
use crate::runtime::foreign::{
    ExecutionContext, ForeignEngine, ForeignError, ForeignHeap, ForeignRef, HeapFrame,
    HostCallbacks, IteratorRef, WriterRef,
};
use crate::runtime::op_driver::{
    AsyncResult, FuturesUnorderedDriver, OpDriver, OpFuture, PendingCall,
};
use crate::runtime::ops::{
    Accumulator, AsyncLazy, LazyCompute, LazySelf, Mapper, NonEmptyIter, Operators, Service,
};
use crate::runtime::registry::{Handle, HandleRegistry};
use crate::runtime::value::{Entry, Limits, Value};
use crate::runtime::view::HostValue;
use futures::future::poll_fn;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// A host object the engine may reference by handle.
#[derive(Clone)]
pub(crate) enum HostObject {
    Service(Rc<dyn Service>),
    Mapper(Rc<dyn Mapper>),
    Accumulator(Rc<dyn Accumulator>),
    Lazy(Rc<dyn LazyCompute>),
    AsyncLazy(Rc<dyn AsyncLazy>),
    Error(BridgeError),
}

impl HostObject {
    fn kind(&self) -> &'static str {
        match self {
            HostObject::Service(_) => "service",
            HostObject::Mapper(_) => "mapper",
            HostObject::Accumulator(_) => "accumulator",
            HostObject::Lazy(_) => "lazy compute",
            HostObject::AsyncLazy(_) => "async lazy",
            HostObject::Error(_) => "error",
        }
    }
}

/// Result of a full or incremental resource read.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    pub values: Vec<Entry>,
    /// Token to resume from; present only for authenticated reads.
    pub reactive: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub live_handles: usize,
    pub pending_calls: usize,
    pub total_submitted: usize,
    pub total_completed: usize,
}

pub struct Bridge {
    engine: Rc<dyn ForeignEngine>,
    handles: RefCell<HandleRegistry<HostObject>>,
    values: ValueBridge,
    contexts: ContextStack,
    driver: FuturesUnorderedDriver,
    changes: watch::Sender<u64>,
    faults: broadcast::Sender<BridgeError>,
}

impl Bridge {
    /// Creates the bridge and links it to `engine` as its host.
    pub fn new(
        engine: Rc<dyn ForeignEngine>,
        config: &RuntimeConfig,
        changes: watch::Sender<u64>,
        faults: broadcast::Sender<BridgeError>,
    ) -> Rc<Self> {
        let bridge = Rc::new(Self {
            engine,
            handles: RefCell::new(HandleRegistry::new()),
            values: ValueBridge::new(Limits {
                max_depth: config.max_depth,
                max_bytes: config.max_bytes,
            }),
            contexts: ContextStack::new(),
            driver: FuturesUnorderedDriver::default(),
            changes,
            faults,
        });
        let host: Rc<dyn HostCallbacks> = bridge.clone();
        bridge.engine.link(Rc::downgrade(&host));
        bridge
    }

    pub(crate) fn engine(&self) -> &dyn ForeignEngine {
        &*self.engine
    }

    pub(crate) fn heap(&self) -> &dyn ForeignHeap {
        self.engine.heap()
    }

    pub(crate) fn values(&self) -> &ValueBridge {
        &self.values
    }

    pub(crate) fn contexts(&self) -> &ContextStack {
        &self.contexts
    }

    pub(crate) fn register(&self, object: HostObject) -> Handle {
        self.handles.borrow_mut().register(object)
    }

    pub(crate) fn release(&self, handle: Handle) {
        let object = self.handles.borrow_mut().delete(handle);
        tracing::trace!(handle = handle.id(), kind = object.kind(), "handle released");
    }

    fn object_as<T>(
        &self,
        handle: Handle,
        kind: &str,
        pick: impl FnOnce(HostObject) -> Option<T>,
    ) -> T {
        let object = self.handles.borrow().get(handle).clone();
        let found = object.kind();
        match pick(object) {
            Some(object) => object,
            None => contract_violation(format!(
                "handle {} names a {found}, expected a {kind}",
                handle.id()
            )),
        }
    }

    /// Registers `err` so it can travel through the engine as a handle.
    pub(crate) fn raise(&self, err: BridgeError) -> Handle {
        tracing::debug!("raising through the engine: {}", err);
        self.register(HostObject::Error(err))
    }

    /// Unregisters an error object raised earlier and returns its error.
    pub(crate) fn take_error(&self, handle: Handle) -> BridgeError {
        match self.handles.borrow_mut().delete(handle) {
            HostObject::Error(err) => err,
            other => contract_violation(format!(
                "handle {} names a {}, expected an error",
                handle.id(),
                other.kind()
            )),
        }
    }

    pub(crate) fn foreign_error(&self, err: ForeignError) -> BridgeError {
        match err {
            ForeignError::UnknownCollection(name) => BridgeError::UnknownCollection(name),
            ForeignError::Raised(handle) => self.take_error(handle),
            ForeignError::Failed(message) => BridgeError::Foreign(message),
        }
    }

    pub fn live_handles(&self) -> usize {
        self.handles.borrow().len()
    }

    pub fn stats(&self) -> RuntimeStats {
        let inflight = self.driver.stats();
        RuntimeStats {
            live_handles: self.live_handles(),
            pending_calls: inflight.pending_count,
            total_submitted: inflight.total_submitted,
            total_completed: inflight.total_completed,
        }
    }

    fn notify_changed(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    fn fault(&self, err: BridgeError) {
        tracing::error!("{}", err);
        // Nobody listening is fine.
        let _ = self.faults.send(err);
    }

    /// Creates the engine state and runs the service's `init`. Returns the
    /// run id.
    pub fn initialize(&self, service: Rc<dyn Service>) -> Result<String, BridgeError> {
        let run_id = Uuid::new_v4().to_string();
        let _frame = HeapFrame::enter(self.heap());
        let handle = self.register(HostObject::Service(service));

        if let Err(err) = self.engine.create_for(&run_id, handle) {
            let err = self.foreign_error(err);
            self.release(handle);
            return Err(err);
        }
        tracing::info!(run_id = %run_id, "engine initialized");
        Ok(run_id)
    }

    /// Instantiates a resource and returns its reactive state blob.
    pub fn create_resource(
        &self,
        name: &str,
        params: &Value,
        auth: &[u8],
    ) -> Result<Value, BridgeError> {
        let heap = self.heap();
        let _frame = HeapFrame::enter(heap);
        let params = self.values.export_owned(heap, params)?;
        let blob = self
            .engine
            .create_resource(name, params, auth)
            .map_err(|err| self.foreign_error(err))?;
        self.values.import_owned(heap, blob)
    }

    pub fn get_all(
        &self,
        name: &str,
        params: &Value,
        auth: Option<&[u8]>,
        since: Option<&Value>,
    ) -> Result<ResourceSnapshot, BridgeError> {
        let heap = self.heap();
        let _frame = HeapFrame::enter(heap);
        let params = self.values.export_owned(heap, params)?;
        let since = match since {
            Some(token) => self.values.export_owned(heap, token)?,
            None => ForeignRef::NULL,
        };
        let pointer = self
            .engine
            .get_all(name, params, auth, since)
            .map_err(|err| self.foreign_error(err))?;
        let result = self.values.import_owned(heap, pointer)?;

        let values = decode_entries(result.get("values"))?;
        let reactive = result.get("reactive").filter(|token| !token.is_null()).cloned();
        Ok(ResourceSnapshot { values, reactive })
    }

    /// First value of `key`, if any.
    pub fn get_one(
        &self,
        name: &str,
        params: &Value,
        key: &Value,
    ) -> Result<Option<Value>, BridgeError> {
        let heap = self.heap();
        let _frame = HeapFrame::enter(heap);
        let params = self.values.export_owned(heap, params)?;
        let key = self.values.export_owned(heap, key)?;
        let pointer = self
            .engine
            .get_one(name, params, key)
            .map_err(|err| self.foreign_error(err))?;
        match self.values.import_owned(heap, pointer)? {
            Value::Array(values) => Ok(values.into_iter().next()),
            other => Err(BridgeError::Foreign(format!(
                "expected an array of values, found {other:?}"
            ))),
        }
    }

    /// Writes entries into an input collection. Observers are notified once
    /// the engine has committed.
    pub fn update(&self, collection: &str, entries: &[Entry]) -> Result<(), BridgeError> {
        let heap = self.heap();
        let _frame = HeapFrame::enter(heap);
        let encoded = Value::Array(
            entries
                .iter()
                .map(|Entry(key, values)| {
                    Value::Array(vec![key.clone(), Value::Array(values.clone())])
                })
                .collect(),
        );
        let pointer = self.values.export_owned(heap, &encoded)?;
        self.engine
            .update(collection, pointer)
            .map_err(|err| self.foreign_error(err))?;
        self.notify_changed();
        Ok(())
    }

    /// Waits for the next settled async call and delivers it.
    pub async fn deliver_next(&self) {
        let (call, result) = poll_fn(|cx| self.driver.poll_ready(cx)).await;
        self.deliver(call, result);
    }

    pub(crate) fn deliver(&self, call: PendingCall, result: AsyncResult) {
        tracing::debug!(call_id = %call.call_id, status = result.status(), "delivering async result");
        let heap = self.heap();
        let _frame = HeapFrame::enter(heap);

        let [call_id, collection, key, params, encoded] =
            match self.encode_delivery(heap, &call, &result) {
                Ok(refs) => refs,
                Err(err) => {
                    self.fault(BridgeError::AsyncDelivery(format!(
                        "call {}: {err}",
                        call.call_id
                    )));
                    return;
                }
            };

        let status = self
            .engine
            .async_result(call_id, collection, key, params, encoded);
        match Handle::from_sentinel(status) {
            Some(handle) => {
                let err = self.take_error(handle);
                self.fault(BridgeError::AsyncDelivery(format!(
                    "call {} refused: {err}",
                    call.call_id
                )));
            }
            None => self.notify_changed(),
        }
    }

    fn encode_delivery(
        &self,
        heap: &dyn ForeignHeap,
        call: &PendingCall,
        result: &AsyncResult,
    ) -> Result<[ForeignRef; 5], BridgeError> {
        Ok([
            self.values.export_string(heap, &call.call_id),
            self.values.export_string(heap, &call.collection),
            self.values.export_owned(heap, &call.key)?,
            self.values.export_owned(heap, &call.params)?,
            self.values.export_owned(heap, &result.to_value())?,
        ])
    }

    /// Stops the driver, closes the engine and drops whatever is left in the
    /// registry. Returns the number of handles the engine never detached.
    pub fn shutdown(&self) -> usize {
        self.driver.shutdown();
        {
            let _frame = HeapFrame::enter(self.heap());
            self.engine.close();
        }
        let leaked = self.handles.borrow_mut().clear();
        if leaked > 0 {
            tracing::warn!("{} handles still registered at shutdown", leaked);
        }
        leaked
    }

    fn run_init(&self, service: Handle) -> Result<(), BridgeError> {
        let service = self.object_as(service, "service", |object| match object {
            HostObject::Service(service) => Some(service),
            _ => None,
        });
        service.init(&Operators::new(self))
    }

    fn run_instantiate(
        &self,
        service: Handle,
        name: ForeignRef,
        params: ForeignRef,
    ) -> Result<ForeignRef, BridgeError> {
        let service = self.object_as(service, "service", |object| match object {
            HostObject::Service(service) => Some(service),
            _ => None,
        });
        let heap = self.heap();
        let name = self.values.import_string(heap, name);
        let params = self.values.import_owned(heap, params)?;
        let collection = service.resource(&name, &params, &Operators::new(self))?;
        Ok(self.values.export_string(heap, &collection))
    }

    fn run_map(
        &self,
        mapper: Handle,
        writer: WriterRef,
        key: ForeignRef,
        values: IteratorRef,
    ) -> Result<(), BridgeError> {
        let mapper = self.object_as(mapper, "mapper", |object| match object {
            HostObject::Mapper(mapper) => Some(mapper),
            _ => None,
        });
        let heap = self.heap();
        let key = self.values.import_view(heap, key);
        let outputs = mapper.map(key, NonEmptyIter::new(self, values), &Operators::new(self))?;

        // Outputs sharing a key become one value sequence, in output order.
        let mut grouped: IndexMap<String, (HostValue<'_>, Vec<HostValue<'_>>)> = IndexMap::new();
        for (key, value) in outputs {
            let identity = key.to_json()?.to_string();
            grouped
                .entry(identity)
                .or_insert_with(|| (key, Vec::new()))
                .1
                .push(value);
        }
        for (_, (key, values)) in grouped {
            let key = self.values.export_value(heap, &key)?;
            let values = self.values.export_array(heap, &values)?;
            self.engine.writer_set_array(writer, key, values);
        }
        Ok(())
    }

    fn run_lazy(
        &self,
        compute: Handle,
        collection: &str,
        key: ForeignRef,
    ) -> Result<ForeignRef, BridgeError> {
        let compute = self.object_as(compute, "lazy compute", |object| match object {
            HostObject::Lazy(compute) => Some(compute),
            _ => None,
        });
        let heap = self.heap();
        let key = self.values.import_view(heap, key);
        let this = LazySelf::new(self, collection);
        match compute.compute(key, &this, &Operators::new(self))? {
            Some(value) => self.values.export_value(heap, &value),
            None => Ok(ForeignRef::NULL),
        }
    }

    fn run_params(&self, call: Handle, key: ForeignRef) -> Result<ForeignRef, BridgeError> {
        let call = self.object_as(call, "async lazy", |object| match object {
            HostObject::AsyncLazy(call) => Some(call),
            _ => None,
        });
        let heap = self.heap();
        let key = self.values.import_view(heap, key);
        let params = call.params(&key)?;
        self.values.export_owned(heap, &params)
    }

    fn start_async(
        &self,
        call: Handle,
        call_id: ForeignRef,
        collection: ForeignRef,
        key: ForeignRef,
        params: ForeignRef,
    ) -> Result<(), BridgeError> {
        let lazy = self.object_as(call, "async lazy", |object| match object {
            HostObject::AsyncLazy(call) => Some(call),
            _ => None,
        });
        let heap = self.heap();
        // Copied: the future outlives the foreign call.
        let call_id = self.values.import_string(heap, call_id);
        let collection = self.values.import_string(heap, collection);
        let key = self.values.import_owned(heap, key)?;
        let params = self.values.import_owned(heap, params)?;

        let future = lazy.call(key.clone(), params.clone());
        let pending = PendingCall::new(call_id, collection, key, params);
        self.driver.submit(pending, OpFuture::from_settlement(future));
        Ok(())
    }

    fn accumulator(&self, handle: Handle) -> Rc<dyn Accumulator> {
        self.object_as(handle, "accumulator", |object| match object {
            HostObject::Accumulator(accumulator) => Some(accumulator),
            _ => None,
        })
    }

    fn run_accumulate(
        &self,
        accumulator: Handle,
        acc: ForeignRef,
        value: ForeignRef,
    ) -> Result<ForeignRef, BridgeError> {
        let accumulator = self.accumulator(accumulator);
        let heap = self.heap();
        let acc = self.values.import_view(heap, acc);
        let value = self.values.import_view(heap, value);
        let next = accumulator.accumulate(acc, value)?;
        self.values.export_value(heap, &next)
    }

    fn run_dismiss(
        &self,
        accumulator: Handle,
        acc: ForeignRef,
        value: ForeignRef,
    ) -> Result<ForeignRef, BridgeError> {
        let accumulator = self.accumulator(accumulator);
        let heap = self.heap();
        let acc = self.values.import_view(heap, acc);
        let value = self.values.import_view(heap, value);
        match accumulator.dismiss(acc, value)? {
            Some(next) => self.values.export_value(heap, &next),
            None => Ok(ForeignRef::NULL),
        }
    }
}

fn decode_entries(values: Option<&Value>) -> Result<Vec<Entry>, BridgeError> {
    let malformed = || BridgeError::Foreign("malformed entries in engine response".to_string());
    let Some(Value::Array(items)) = values else {
        return Err(malformed());
    };
    items
        .iter()
        .map(|item| match item {
            Value::Array(pair) => match pair.as_slice() {
                [key, Value::Array(values)] => Ok(Entry(key.clone(), values.clone())),
                _ => Err(malformed()),
            },
            _ => Err(malformed()),
        })
        .collect()
}

impl HostCallbacks for Bridge {
    fn detach_handle(&self, handle: Handle) {
        self.release(handle);
    }

    fn get_error_hdl(&self, message: &str) -> Handle {
        self.raise(BridgeError::Foreign(message.to_owned()))
    }

    fn init(&self, ctx: ExecutionContext, service: Handle) -> Result<(), Handle> {
        let _guard = self.contexts.enter(ctx);
        self.run_init(service).map_err(|err| self.raise(err))
    }

    fn instantiate_resource(
        &self,
        ctx: ExecutionContext,
        service: Handle,
        name: ForeignRef,
        params: ForeignRef,
    ) -> Result<ForeignRef, Handle> {
        let _guard = self.contexts.enter(ctx);
        self.run_instantiate(service, name, params)
            .map_err(|err| self.raise(err))
    }

    fn apply_map_fun(
        &self,
        ctx: ExecutionContext,
        mapper: Handle,
        writer: WriterRef,
        key: ForeignRef,
        values: IteratorRef,
    ) -> Result<(), Handle> {
        let _guard = self.contexts.enter(ctx);
        self.run_map(mapper, writer, key, values)
            .map_err(|err| self.raise(err))
    }

    fn apply_lazy_fun(
        &self,
        ctx: ExecutionContext,
        compute: Handle,
        collection: &str,
        key: ForeignRef,
    ) -> Result<ForeignRef, Handle> {
        let _guard = self.contexts.enter(ctx);
        self.run_lazy(compute, collection, key)
            .map_err(|err| self.raise(err))
    }

    fn apply_params_fun(
        &self,
        ctx: ExecutionContext,
        call: Handle,
        key: ForeignRef,
    ) -> Result<ForeignRef, Handle> {
        let _guard = self.contexts.enter(ctx);
        self.run_params(call, key).map_err(|err| self.raise(err))
    }

    fn apply_lazy_async_fun(
        &self,
        call: Handle,
        call_id: ForeignRef,
        collection: ForeignRef,
        key: ForeignRef,
        params: ForeignRef,
    ) -> Result<(), Handle> {
        self.start_async(call, call_id, collection, key, params)
            .map_err(|err| self.raise(err))
    }

    fn apply_accumulate(
        &self,
        accumulator: Handle,
        acc: ForeignRef,
        value: ForeignRef,
    ) -> Result<ForeignRef, Handle> {
        self.run_accumulate(accumulator, acc, value)
            .map_err(|err| self.raise(err))
    }

    fn apply_dismiss(
        &self,
        accumulator: Handle,
        acc: ForeignRef,
        value: ForeignRef,
    ) -> Result<ForeignRef, Handle> {
        self.run_dismiss(accumulator, acc, value)
            .map_err(|err| self.raise(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryEngine;
    use crate::runtime::ops::{AsyncValue, MapOutput, Rejection};
    use futures::future::{FutureExt, LocalBoxFuture};
    use serde_json::json;
    use std::cell::Cell;
    use std::collections::HashMap;
    use tokio::sync::oneshot;

    struct Harness {
        bridge: Rc<Bridge>,
        engine: Rc<MemoryEngine>,
        changes: watch::Receiver<u64>,
        faults: broadcast::Receiver<BridgeError>,
    }

    fn start(service: impl Service + 'static) -> Harness {
        let engine = Rc::new(MemoryEngine::new());
        let (changes_tx, changes) = watch::channel(0);
        let (faults_tx, faults) = broadcast::channel(8);
        let bridge = Bridge::new(
            engine.clone(),
            &RuntimeConfig::default(),
            changes_tx,
            faults_tx,
        );
        bridge.initialize(Rc::new(service)).unwrap();
        Harness {
            bridge,
            engine,
            changes,
            faults,
        }
    }

    /// Resources resolve through the names recorded during `init`.
    #[derive(Default)]
    struct Names(RefCell<HashMap<String, String>>);

    impl Names {
        fn record(&self, resource: &str, collection: String) {
            self.0.borrow_mut().insert(resource.to_owned(), collection);
        }

        fn resolve(&self, resource: &str) -> Result<String, BridgeError> {
            self.0
                .borrow()
                .get(resource)
                .cloned()
                .ok_or_else(|| BridgeError::UnknownCollection(resource.to_owned()))
        }
    }

    /// Emits `(parity, v)` and `("all", v)` for every value.
    struct Parity;

    impl Mapper for Parity {
        fn map<'f>(
            &self,
            _key: HostValue<'f>,
            values: NonEmptyIter<'f>,
            _ops: &Operators<'f>,
        ) -> Result<MapOutput<'f>, BridgeError> {
            let mut out = Vec::new();
            for value in values {
                let n = value
                    .as_i64()
                    .ok_or_else(|| BridgeError::user("expected an integer"))?;
                if n < 0 {
                    return Err(BridgeError::user("negative value"));
                }
                let parity = if n % 2 == 0 { "even" } else { "odd" };
                out.push((HostValue::from(parity), value.clone()));
                out.push((HostValue::from("all"), value));
            }
            Ok(out)
        }
    }

    /// Sends every value to the single key "total".
    struct ToTotal;

    impl Mapper for ToTotal {
        fn map<'f>(
            &self,
            _key: HostValue<'f>,
            values: NonEmptyIter<'f>,
            _ops: &Operators<'f>,
        ) -> Result<MapOutput<'f>, BridgeError> {
            Ok(values.map(|value| (HostValue::from("total"), value)).collect())
        }
    }

    struct Sum {
        dismissed: Rc<Cell<usize>>,
    }

    impl Accumulator for Sum {
        fn initial(&self) -> Value {
            Value::Int(0)
        }

        fn accumulate<'f>(
            &self,
            acc: HostValue<'f>,
            value: HostValue<'f>,
        ) -> Result<HostValue<'f>, BridgeError> {
            let total = acc.as_i64().unwrap_or(0) + value.as_i64().unwrap_or(0);
            Ok(HostValue::owned(total))
        }

        fn dismiss<'f>(
            &self,
            acc: HostValue<'f>,
            value: HostValue<'f>,
        ) -> Result<Option<HostValue<'f>>, BridgeError> {
            self.dismissed.set(self.dismissed.get() + 1);
            let total = acc.as_i64().unwrap_or(0) - value.as_i64().unwrap_or(0);
            Ok(Some(HostValue::owned(total)))
        }
    }

    struct Fib;

    impl LazyCompute for Fib {
        fn compute<'f>(
            &self,
            key: HostValue<'f>,
            this: &LazySelf<'f>,
            _ops: &Operators<'f>,
        ) -> Result<Option<HostValue<'f>>, BridgeError> {
            let n = key
                .as_i64()
                .ok_or_else(|| BridgeError::user("fib key must be an integer"))?;
            if n < 2 {
                return Ok(Some(HostValue::owned(n)));
            }
            let a = this.get_one(n - 1)?.as_i64().unwrap_or(0);
            let b = this.get_one(n - 2)?.as_i64().unwrap_or(0);
            Ok(Some(HostValue::owned(a + b)))
        }
    }

    type Settlement = Result<AsyncValue, Rejection>;
    type Pending = Rc<RefCell<Vec<(Value, oneshot::Sender<Settlement>)>>>;

    /// Async lookup whose futures settle when the test says so. The params
    /// of every key are the current `version`.
    struct Lookup {
        version: Rc<Cell<i64>>,
        pending: Pending,
    }

    impl AsyncLazy for Lookup {
        fn params<'f>(&self, _key: &HostValue<'f>) -> Result<Value, BridgeError> {
            Ok(Value::Int(self.version.get()))
        }

        fn call(
            &self,
            key: Value,
            _params: Value,
        ) -> LocalBoxFuture<'static, Result<AsyncValue, Rejection>> {
            let (tx, rx) = oneshot::channel();
            self.pending.borrow_mut().push((key, tx));
            async move {
                rx.await
                    .unwrap_or_else(|_| Err(Rejection::from("lookup abandoned")))
            }
            .boxed_local()
        }
    }

    struct Shop {
        names: Names,
        dismissed: Rc<Cell<usize>>,
        version: Rc<Cell<i64>>,
        pending: Pending,
    }

    impl Shop {
        fn new() -> Self {
            Self {
                names: Names::default(),
                dismissed: Rc::new(Cell::new(0)),
                version: Rc::new(Cell::new(1)),
                pending: Rc::new(RefCell::new(Vec::new())),
            }
        }
    }

    impl Service for Shop {
        fn init(&self, ops: &Operators<'_>) -> Result<(), BridgeError> {
            let points = ops.input(
                "points",
                vec![
                    Entry::new("ann", vec![Value::Int(3)]),
                    Entry::new("bob", vec![Value::Int(4)]),
                ],
            )?;
            self.names.record("points", points.clone());
            self.names.record("parity", ops.map(&points, Parity)?);
            self.names.record(
                "total",
                ops.map_reduce(
                    &points,
                    ToTotal,
                    Sum {
                        dismissed: self.dismissed.clone(),
                    },
                )?,
            );
            self.names.record("fib", ops.lazy(Fib)?);
            self.names.record(
                "lookup",
                ops.async_lazy(Lookup {
                    version: self.version.clone(),
                    pending: self.pending.clone(),
                })?,
            );
            Ok(())
        }

        fn resource(
            &self,
            name: &str,
            _params: &Value,
            _ops: &Operators<'_>,
        ) -> Result<String, BridgeError> {
            self.names.resolve(name)
        }
    }

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().map(|v| Value::Int(*v)).collect()
    }

    #[test]
    fn test_map_outputs_coalesce_by_key() {
        let h = start(Shop::new());

        let snapshot = h.bridge.get_all("parity", &Value::Null, None, None).unwrap();

        assert_eq!(
            snapshot.values,
            vec![
                Entry::new("all", ints(&[3, 4])),
                Entry::new("even", ints(&[4])),
                Entry::new("odd", ints(&[3])),
            ]
        );
        assert_eq!(snapshot.reactive, None);
        assert_eq!(h.bridge.contexts().depth(), 0);
    }

    #[test]
    fn test_reduce_retracts_replaced_values() {
        let shop = Shop::new();
        let dismissed = shop.dismissed.clone();
        let h = start(shop);
        let total = |h: &Harness| h.bridge.get_one("total", &Value::Null, &Value::from("total"));

        assert_eq!(total(&h).unwrap(), Some(Value::Int(7)));

        h.bridge
            .update("points", &[Entry::new("bob", ints(&[10]))])
            .unwrap();

        assert_eq!(total(&h).unwrap(), Some(Value::Int(13)));
        assert_eq!(dismissed.get(), 1);
        assert_eq!(*h.changes.borrow(), 1);
    }

    #[test]
    fn test_lazy_recursion_through_self() {
        let h = start(Shop::new());

        let fib = h
            .bridge
            .get_one("fib", &Value::Null, &Value::Int(20))
            .unwrap();

        assert_eq!(fib, Some(Value::Int(6765)));
        assert_eq!(h.bridge.contexts().depth(), 0);
    }

    #[test]
    fn test_failed_update_is_not_committed() {
        let h = start(Shop::new());
        let handles = h.bridge.live_handles();

        let err = h
            .bridge
            .update("points", &[Entry::new("eve", ints(&[-1]))])
            .unwrap_err();

        assert_eq!(err, BridgeError::user("negative value"));
        assert_eq!(h.bridge.live_handles(), handles);
        assert_eq!(h.bridge.contexts().depth(), 0);
        assert_eq!(*h.changes.borrow(), 0);
        let points = h.bridge.get_all("points", &Value::Null, None, None).unwrap();
        assert_eq!(points.values.len(), 2);
    }

    #[test]
    fn test_update_unknown_collection() {
        let h = start(Shop::new());

        let err = h
            .bridge
            .update("nope", &[Entry::new("a", ints(&[1]))])
            .unwrap_err();
        assert_eq!(err, BridgeError::UnknownCollection("nope".to_string()));

        // Derived collections are not writable either.
        let parity = h.engine.collections()[1].clone();
        let err = h
            .bridge
            .update(&parity, &[Entry::new("a", ints(&[1]))])
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnknownCollection(_)));
    }

    #[test]
    fn test_reactive_token_and_changes_since() {
        let h = start(Shop::new());
        let auth = b"user-1".as_slice();

        let first = h
            .bridge
            .get_all("points", &Value::Null, Some(auth), None)
            .unwrap();
        let token = first.reactive.expect("authenticated reads carry a token");

        h.bridge
            .update(
                "points",
                &[Entry::new("cat", ints(&[5])), Entry::delete("ann")],
            )
            .unwrap();

        let delta = h
            .bridge
            .get_all("points", &Value::Null, Some(auth), Some(&token))
            .unwrap();
        assert_eq!(
            delta.values,
            vec![Entry::delete("ann"), Entry::new("cat", ints(&[5]))]
        );
    }

    #[tokio::test]
    async fn test_async_lazy_settles_through_driver() {
        let shop = Shop::new();
        let pending = shop.pending.clone();
        let h = start(shop);
        let read = |h: &Harness| h.bridge.get_one("lookup", &Value::Null, &Value::from("paris"));

        let loading = read(&h).unwrap().unwrap();
        assert_eq!(loading.get("loading"), Some(&Value::Bool(true)));
        assert_eq!(h.bridge.stats().pending_calls, 1);

        // Same params: no second call.
        read(&h).unwrap();
        assert_eq!(pending.borrow().len(), 1);

        let (key, tx) = pending.borrow_mut().remove(0);
        assert_eq!(key, Value::from("paris"));
        tx.send(Ok(AsyncValue::payload("sunny"))).unwrap();
        h.bridge.deliver_next().await;

        let settled = read(&h).unwrap().unwrap();
        assert_eq!(settled.get("payload"), Some(&Value::from("sunny")));
        assert_eq!(settled.get("loading"), Some(&Value::Bool(false)));
        assert_eq!(*h.changes.borrow(), 1);
    }

    #[tokio::test]
    async fn test_superseded_call_is_ignored() {
        let shop = Shop::new();
        let pending = shop.pending.clone();
        let version = shop.version.clone();
        let h = start(shop);
        let read = |h: &Harness| h.bridge.get_one("lookup", &Value::Null, &Value::from("oslo"));

        read(&h).unwrap();
        version.set(2);
        read(&h).unwrap();
        let (_, stale) = pending.borrow_mut().remove(0);
        let (_, fresh) = pending.borrow_mut().remove(0);

        fresh.send(Ok(AsyncValue::payload("snow"))).unwrap();
        h.bridge.deliver_next().await;
        stale.send(Ok(AsyncValue::payload("rain"))).unwrap();
        h.bridge.deliver_next().await;

        let settled = read(&h).unwrap().unwrap();
        assert_eq!(settled.get("payload"), Some(&Value::from("snow")));
        let applied: Vec<bool> = h.engine.deliveries().iter().map(|d| d.applied).collect();
        assert_eq!(applied, vec![true, false]);
    }

    #[test]
    fn test_refused_delivery_is_reported_as_fault() {
        let mut h = start(Shop::new());
        let handles = h.bridge.live_handles();
        let points = h.engine.collections()[0].clone();

        h.bridge.deliver(
            PendingCall::new("points:1", points, Value::from("ann"), Value::Null),
            AsyncResult::Unchanged { metadata: None },
        );

        match h.faults.try_recv() {
            Ok(BridgeError::AsyncDelivery(message)) => {
                assert!(message.contains("not an async lazy collection"), "{message}");
            }
            other => panic!("expected a delivery fault, got {other:?}"),
        }
        assert_eq!(h.bridge.live_handles(), handles);
    }

    #[test]
    fn test_unknown_resource() {
        let h = start(Shop::new());

        let err = h
            .bridge
            .get_all("missing", &Value::Null, None, None)
            .unwrap_err();
        assert_eq!(err, BridgeError::UnknownCollection("missing".to_string()));
    }

    #[test]
    fn test_shutdown_releases_every_handle() {
        let h = start(Shop::new());
        assert!(h.bridge.live_handles() > 0);

        assert_eq!(h.bridge.shutdown(), 0);
        assert_eq!(h.bridge.live_handles(), 0);
    }

    struct Broken;

    impl Service for Broken {
        fn init(&self, ops: &Operators<'_>) -> Result<(), BridgeError> {
            ops.map("no-such-source", ToTotal)?;
            Ok(())
        }
    }

    #[test]
    fn test_failed_init_releases_service() {
        let engine = Rc::new(MemoryEngine::new());
        let (changes, _) = watch::channel(0);
        let (faults, _) = broadcast::channel(1);
        let bridge = Bridge::new(engine, &RuntimeConfig::default(), changes, faults);

        let err = bridge.initialize(Rc::new(Broken)).unwrap_err();

        assert_eq!(
            err,
            BridgeError::UnknownCollection("no-such-source".to_string())
        );
        assert_eq!(bridge.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_async_statuses_settle_in_order() {
        let shop = Shop::new();
        let pending = shop.pending.clone();
        let version = shop.version.clone();
        let h = start(shop);
        let read = |h: &Harness| {
            h.bridge
                .get_one("lookup", &Value::Null, &Value::from("rome"))
                .unwrap()
                .unwrap()
        };

        read(&h);
        let (_, tx) = pending.borrow_mut().remove(0);
        tx.send(Ok(AsyncValue::payload("warm"))).unwrap();
        h.bridge.deliver_next().await;

        version.set(2);
        let refreshing = read(&h);
        assert_eq!(refreshing.get("loading"), Some(&Value::Bool(true)));
        assert_eq!(refreshing.get("payload"), Some(&Value::from("warm")));
        let (_, tx) = pending.borrow_mut().remove(0);
        tx.send(Ok(AsyncValue::unchanged().with_metadata("cached")))
            .unwrap();
        h.bridge.deliver_next().await;

        let unchanged = read(&h);
        assert_eq!(unchanged.get("loading"), Some(&Value::Bool(false)));
        assert_eq!(unchanged.get("payload"), Some(&Value::from("warm")));
        assert_eq!(unchanged.get("metadata"), Some(&Value::from("cached")));

        version.set(3);
        read(&h);
        let (_, tx) = pending.borrow_mut().remove(0);
        tx.send(Err(Rejection::Value(Value::from(json!({"code": 503})))))
            .unwrap();
        h.bridge.deliver_next().await;

        let failed = read(&h);
        assert_eq!(failed.get("loading"), Some(&Value::Bool(false)));
        assert_eq!(failed.get("error"), Some(&Value::from(r#"{"code":503}"#)));
        assert_eq!(failed.get("payload"), None);

        let statuses: Vec<String> = h.engine.deliveries().into_iter().map(|d| d.status).collect();
        assert_eq!(statuses, vec!["success", "unchanged", "failure"]);
        assert_eq!(*h.changes.borrow(), 3);
    }

    /// Copies each value through, unless the async lookup for the key holds
    /// the payload "bad".
    struct Screen {
        lookup: String,
    }

    impl Mapper for Screen {
        fn map<'f>(
            &self,
            key: HostValue<'f>,
            values: NonEmptyIter<'f>,
            ops: &Operators<'f>,
        ) -> Result<MapOutput<'f>, BridgeError> {
            let status = ops.get_one_lazy(&self.lookup, key.clone())?;
            let rejected = status
                .get("payload")
                .is_some_and(|payload| payload.as_str() == Some("bad"));
            if rejected {
                return Err(BridgeError::user("mapper rejects bad"));
            }
            Ok(values.map(|value| (key.clone(), value)).collect())
        }
    }

    struct Screening {
        names: Names,
        version: Rc<Cell<i64>>,
        pending: Pending,
    }

    impl Service for Screening {
        fn init(&self, ops: &Operators<'_>) -> Result<(), BridgeError> {
            let src = ops.input("src", vec![Entry::new("k", ints(&[1]))])?;
            let lookup = ops.async_lazy(Lookup {
                version: self.version.clone(),
                pending: self.pending.clone(),
            })?;
            let screened = ops.named("screened").map(
                &src,
                Screen {
                    lookup: lookup.clone(),
                },
            )?;
            self.names.record("src", src);
            self.names.record("lookup", lookup);
            self.names.record("screened", screened);
            Ok(())
        }

        fn resource(
            &self,
            name: &str,
            _params: &Value,
            _ops: &Operators<'_>,
        ) -> Result<String, BridgeError> {
            self.names.resolve(name)
        }
    }

    #[tokio::test]
    async fn test_refused_delivery_rolls_back_the_slot() {
        let pending: Pending = Rc::new(RefCell::new(Vec::new()));
        let mut h = start(Screening {
            names: Names::default(),
            version: Rc::new(Cell::new(1)),
            pending: pending.clone(),
        });
        assert!(h.engine.collections().contains(&"screened".to_string()));

        // The call was started by the mapper while the graph was built.
        let (key, tx) = pending.borrow_mut().remove(0);
        assert_eq!(key, Value::from("k"));
        tx.send(Ok(AsyncValue::payload("bad"))).unwrap();
        h.bridge.deliver_next().await;

        match h.faults.try_recv() {
            Ok(BridgeError::AsyncDelivery(message)) => {
                assert!(message.contains("mapper rejects bad"), "{message}");
            }
            other => panic!("expected a delivery fault, got {other:?}"),
        }
        let slot = h
            .bridge
            .get_one("lookup", &Value::Null, &Value::from("k"))
            .unwrap()
            .unwrap();
        assert_eq!(slot.get("loading"), Some(&Value::Bool(true)));
        assert_eq!(slot.get("payload"), None);
        assert_eq!(*h.changes.borrow(), 0);

        h.bridge
            .update("src", &[Entry::new("k", ints(&[2]))])
            .unwrap();
        let screened = h
            .bridge
            .get_one("screened", &Value::Null, &Value::from("k"))
            .unwrap();
        assert_eq!(screened, Some(Value::Int(2)));
        assert_eq!(h.bridge.contexts().depth(), 0);
    }

    /// Counts values. Retraction always asks for a refold.
    struct Count {
        dismissed: Rc<Cell<usize>>,
    }

    impl Accumulator for Count {
        fn initial(&self) -> Value {
            Value::Int(0)
        }

        fn accumulate<'f>(
            &self,
            acc: HostValue<'f>,
            _value: HostValue<'f>,
        ) -> Result<HostValue<'f>, BridgeError> {
            Ok(HostValue::owned(acc.as_i64().unwrap_or(0) + 1))
        }

        fn dismiss<'f>(
            &self,
            _acc: HostValue<'f>,
            _value: HostValue<'f>,
        ) -> Result<Option<HostValue<'f>>, BridgeError> {
            self.dismissed.set(self.dismissed.get() + 1);
            Ok(None)
        }
    }

    fn totals<'a>(left: &'a str, right: &'a str) -> Vec<(&'a str, Box<dyn Mapper>)> {
        vec![(left, Box::new(ToTotal)), (right, Box::new(ToTotal))]
    }

    struct Merge {
        dismissed: Rc<Cell<usize>>,
    }

    impl Service for Merge {
        fn init(&self, ops: &Operators<'_>) -> Result<(), BridgeError> {
            let left = ops.input(
                "left",
                vec![
                    Entry::new("a", ints(&[1])),
                    Entry::new("b", ints(&[2])),
                ],
            )?;
            let right = ops.input("right", vec![Entry::new("c", ints(&[3]))])?;
            ops.named("merged").multimap(totals(&left, &right))?;
            ops.named("counted").multimap_reduce(
                totals(&left, &right),
                Count {
                    dismissed: self.dismissed.clone(),
                },
            )?;
            Ok(())
        }
    }

    #[test]
    fn test_multimap_and_multimap_reduce() {
        let dismissed = Rc::new(Cell::new(0));
        let h = start(Merge {
            dismissed: dismissed.clone(),
        });
        let total = Value::from("total");

        let merged = h.bridge.get_all("merged", &Value::Null, None, None).unwrap();
        assert_eq!(merged.values, vec![Entry::new("total", ints(&[1, 2, 3]))]);
        assert_eq!(
            h.bridge.get_one("counted", &Value::Null, &total).unwrap(),
            Some(Value::Int(3))
        );

        h.bridge
            .update("left", &[Entry::delete("a"), Entry::new("b", ints(&[2, 7]))])
            .unwrap();

        let merged = h.bridge.get_all("merged", &Value::Null, None, None).unwrap();
        assert_eq!(merged.values, vec![Entry::new("total", ints(&[2, 7, 3]))]);
        assert_eq!(
            h.bridge.get_one("counted", &Value::Null, &total).unwrap(),
            Some(Value::Int(3))
        );
        assert_eq!(dismissed.get(), 1);

        h.bridge.update("right", &[Entry::delete("c")]).unwrap();
        assert_eq!(
            h.bridge.get_one("counted", &Value::Null, &total).unwrap(),
            Some(Value::Int(2))
        );
        assert_eq!(dismissed.get(), 2);
    }

    /// Prices every order against the "prices" collection from inside the
    /// mapper, and reports what the value iterator saw.
    struct Quote {
        prices: String,
    }

    impl Mapper for Quote {
        fn map<'f>(
            &self,
            key: HostValue<'f>,
            values: NonEmptyIter<'f>,
            ops: &Operators<'f>,
        ) -> Result<MapOutput<'f>, BridgeError> {
            let first = values.first();
            let item = first
                .as_str()
                .ok_or_else(|| BridgeError::user("items are names"))?
                .to_owned();

            let mut advanced = values.clone();
            advanced.next();
            let first_after_next = advanced.first().as_str().map(str::to_owned);
            let items = values.clone().count();
            let unique = values.unique_value().is_ok();

            let price = ops
                .get_one(&self.prices, item.as_str())?
                .as_i64()
                .unwrap_or_default();
            let quote = json!({
                "item": item,
                "first_after_next": first_after_next,
                "price": price,
                "items": items,
                "unique": unique,
                "listed": ops.get_array(&self.prices, item.as_str())?.len(),
                "unlisted": ops.get_array(&self.prices, "kiwi")?.len(),
                "discount": ops.maybe_get(&self.prices, "discount")?.is_some(),
                "strict_missing": ops.get_one(&self.prices, "kiwi").is_err(),
                "catalog": ops.size(&self.prices)?,
            });
            Ok(vec![(key, HostValue::from(quote))])
        }
    }

    struct Store;

    impl Service for Store {
        fn init(&self, ops: &Operators<'_>) -> Result<(), BridgeError> {
            let prices = ops.input(
                "prices",
                vec![
                    Entry::new("apple", ints(&[3])),
                    Entry::new("pear", ints(&[5])),
                ],
            )?;
            let orders = ops.input(
                "orders",
                vec![
                    Entry::new("o1", vec![Value::from("apple")]),
                    Entry::new("o2", vec![Value::from("pear"), Value::from("apple")]),
                ],
            )?;
            ops.named("quotes").map(&orders, Quote { prices })?;
            Ok(())
        }
    }

    #[test]
    fn test_reads_from_inside_a_mapper() {
        let h = start(Store);
        let quote = |order: &str| {
            h.bridge
                .get_one("quotes", &Value::Null, &Value::from(order))
                .unwrap()
                .unwrap()
        };

        assert_eq!(
            quote("o1"),
            Value::from(json!({
                "item": "apple",
                "first_after_next": "apple",
                "price": 3,
                "items": 1,
                "unique": true,
                "listed": 1,
                "unlisted": 0,
                "discount": false,
                "strict_missing": true,
                "catalog": 2,
            }))
        );
        let o2 = quote("o2");
        assert_eq!(o2.get("item"), Some(&Value::from("pear")));
        assert_eq!(o2.get("first_after_next"), Some(&Value::from("pear")));
        assert_eq!(o2.get("price"), Some(&Value::Int(5)));
        assert_eq!(o2.get("items"), Some(&Value::Int(2)));
        assert_eq!(o2.get("unique"), Some(&Value::Bool(false)));
        assert_eq!(h.bridge.contexts().depth(), 0);

        // Reads track the collections they come from.
        h.bridge
            .update("prices", &[Entry::new("melon", ints(&[9]))])
            .unwrap();
        assert_eq!(quote("o1").get("catalog"), Some(&Value::Int(3)));
    }

    struct Clash;

    impl Service for Clash {
        fn init(&self, ops: &Operators<'_>) -> Result<(), BridgeError> {
            let points = ops.input("points", vec![Entry::new("a", ints(&[1]))])?;
            ops.named("points").map(&points, ToTotal)?;
            Ok(())
        }
    }

    #[test]
    fn test_named_collection_must_be_fresh() {
        let engine = Rc::new(MemoryEngine::new());
        let (changes, _) = watch::channel(0);
        let (faults, _) = broadcast::channel(1);
        let bridge = Bridge::new(engine, &RuntimeConfig::default(), changes, faults);

        let err = bridge.initialize(Rc::new(Clash)).unwrap_err();

        assert!(
            matches!(err, BridgeError::Foreign(ref message) if message.contains("already exists")),
            "{err:?}"
        );
        assert_eq!(bridge.live_handles(), 0);
    }
}
