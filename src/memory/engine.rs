//! In-process reference engine.
//!
//! Recomputes derived collections eagerly and in full after every committed
//! write. That is nowhere near incremental, but it honors the observable
//! contract of the engine exports: collection graphs, per-key change ticks
//! for reactive reads, memoized lazy values and the async-lazy slot
//! protocol.
//!
//! An async-lazy value reads as one of
//!
//! - `{"loading": true}` while the first call for the key is in flight
//!   (with the last `payload` once one has been delivered),
//! - `{"loading": false, "payload": .., "metadata": ..}` after success,
//! - `{"loading": false, "error": ..}` after a failure.

use super::heap::Heap;
use crate::runtime::error::contract_violation;
use crate::runtime::foreign::{
    ExecutionContext, ForeignEngine, ForeignError, ForeignHeap, ForeignRef, HostCallbacks,
    IteratorRef, WriterRef,
};
use crate::runtime::registry::Handle;
use indexmap::IndexMap;
use once_cell::unsync::OnceCell;
use serde_json::{json, Value as Json};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};

/// Number of async results [`MemoryEngine::deliveries`] remembers.
pub const DELIVERY_LOG_CAPACITY: usize = 64;

/// Rows keyed by the canonical JSON text of their key.
type Rows = BTreeMap<String, (Json, Vec<Json>)>;

fn key_id(key: &Json) -> String {
    key.to_string()
}

#[derive(Debug, Clone)]
struct Reducer {
    accumulator: Handle,
    initial: Json,
    contributions: BTreeMap<String, Vec<Json>>,
    accs: BTreeMap<String, Json>,
}

impl Reducer {
    fn new(accumulator: Handle, initial: Json) -> Self {
        Self {
            accumulator,
            initial,
            contributions: BTreeMap::new(),
            accs: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
enum Kind {
    Input,
    Derived {
        sources: Vec<(String, Handle)>,
        reducer: Option<Reducer>,
    },
    Lazy {
        compute: Handle,
    },
    AsyncLazy {
        call: Handle,
    },
}

impl Kind {
    fn is_eager(&self) -> bool {
        matches!(self, Kind::Input | Kind::Derived { .. })
    }

    fn handles(&self) -> Vec<Handle> {
        match self {
            Kind::Input => Vec::new(),
            Kind::Derived { sources, reducer } => sources
                .iter()
                .map(|(_, mapper)| *mapper)
                .chain(reducer.iter().map(|r| r.accumulator))
                .collect(),
            Kind::Lazy { compute } => vec![*compute],
            Kind::AsyncLazy { call } => vec![*call],
        }
    }
}

#[derive(Debug, Clone)]
struct Collection {
    kind: Kind,
    rows: Rows,
    /// Tick of the last change per key, deletions included.
    changed: BTreeMap<String, (Json, u64)>,
}

impl Collection {
    fn new(kind: Kind, rows: Rows, tick: u64) -> Self {
        let changed = rows
            .iter()
            .map(|(id, (key, _))| (id.clone(), (key.clone(), tick)))
            .collect();
        Self {
            kind,
            rows,
            changed,
        }
    }

    fn set(&mut self, key: Json, values: Vec<Json>, tick: u64) {
        let id = key_id(&key);
        self.changed.insert(id.clone(), (key.clone(), tick));
        if values.is_empty() {
            self.rows.remove(&id);
        } else {
            self.rows.insert(id, (key, values));
        }
    }

    fn replace_rows(&mut self, rows: Rows, tick: u64) {
        for (id, (key, _)) in &self.rows {
            if !rows.contains_key(id) {
                self.changed.insert(id.clone(), (key.clone(), tick));
            }
        }
        for (id, (key, values)) in &rows {
            if self.rows.get(id).map(|(_, old)| old) != Some(values) {
                self.changed.insert(id.clone(), (key.clone(), tick));
            }
        }
        self.rows = rows;
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    tick: u64,
    collections: IndexMap<String, Collection>,
}

#[derive(Debug)]
struct AsyncSlot {
    call_id: String,
    params: Json,
    value: Json,
}

#[derive(Debug)]
struct Cursor {
    values: Rc<Vec<Json>>,
    position: usize,
}

/// An async result as the engine received it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub call_id: String,
    pub collection: String,
    pub key: Json,
    pub status: String,
    /// `false` when the result answered a superseded call.
    pub applied: bool,
}

/// Reference implementation of [`ForeignEngine`] over a [`Heap`].
pub struct MemoryEngine {
    heap: Heap,
    host: OnceCell<Weak<dyn HostCallbacks>>,
    state: RefCell<State>,
    /// Uncommitted state of the write being recomputed. Reads see it first.
    staging: RefCell<Option<State>>,
    lazy_memo: RefCell<HashMap<(String, String), Vec<Json>>>,
    lazy_busy: RefCell<HashSet<(String, String)>>,
    async_slots: RefCell<HashMap<(String, String), AsyncSlot>>,
    cursors: RefCell<HashMap<u32, Cursor>>,
    writers: RefCell<HashMap<u32, Vec<(Json, Vec<Json>)>>>,
    sessions: RefCell<HashMap<(String, String), String>>,
    service: Cell<Option<Handle>>,
    run_id: RefCell<Option<String>>,
    next_id: Cell<u32>,
    deliveries: RefCell<VecDeque<Delivery>>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            heap: Heap::new(),
            host: OnceCell::new(),
            state: RefCell::new(State::default()),
            staging: RefCell::new(None),
            lazy_memo: RefCell::new(HashMap::new()),
            lazy_busy: RefCell::new(HashSet::new()),
            async_slots: RefCell::new(HashMap::new()),
            cursors: RefCell::new(HashMap::new()),
            writers: RefCell::new(HashMap::new()),
            sessions: RefCell::new(HashMap::new()),
            service: Cell::new(None),
            run_id: RefCell::new(None),
            next_id: Cell::new(0),
            deliveries: RefCell::new(VecDeque::with_capacity(DELIVERY_LOG_CAPACITY)),
        }
    }

    pub fn run_id(&self) -> Option<String> {
        self.run_id.borrow().clone()
    }

    /// Names of the collections created so far, in creation order.
    pub fn collections(&self) -> Vec<String> {
        self.state.borrow().collections.keys().cloned().collect()
    }

    /// The most recent async results received, oldest first. Only the last
    /// [`DELIVERY_LOG_CAPACITY`] are kept.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.borrow().iter().cloned().collect()
    }

    fn record_delivery(&self, delivery: Delivery) {
        let mut log = self.deliveries.borrow_mut();
        if log.len() == DELIVERY_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(delivery);
    }

    fn host(&self) -> Result<Rc<dyn HostCallbacks>, ForeignError> {
        self.host
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ForeignError::Failed("engine is not linked to a host".to_string()))
    }

    fn fresh_id(&self) -> u32 {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        id
    }

    fn fresh_ctx(&self) -> ExecutionContext {
        ExecutionContext(self.fresh_id())
    }

    fn active<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let staging = self.staging.borrow();
        match staging.as_ref() {
            Some(state) => f(state),
            None => f(&self.state.borrow()),
        }
    }

    fn active_mut<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut staging = self.staging.borrow_mut();
        match staging.as_mut() {
            Some(state) => f(state),
            None => f(&mut self.state.borrow_mut()),
        }
    }

    fn kind_of(&self, collection: &str) -> Result<Kind, ForeignError> {
        self.active(|state| state.collections.get(collection).map(|c| c.kind.clone()))
            .ok_or_else(|| ForeignError::UnknownCollection(collection.to_owned()))
    }

    fn eager_values(&self, collection: &str, key: &Json) -> Result<Vec<Json>, ForeignError> {
        let id = key_id(key);
        self.active(|state| match state.collections.get(collection) {
            Some(c) if c.kind.is_eager() => Ok(c
                .rows
                .get(&id)
                .map(|(_, values)| values.clone())
                .unwrap_or_default()),
            Some(_) => Err(ForeignError::Failed(format!(
                "'{collection}' is lazy and must be read lazily"
            ))),
            None => Err(ForeignError::UnknownCollection(collection.to_owned())),
        })
    }

    fn lazy_values(
        &self,
        ctx: ExecutionContext,
        collection: &str,
        key: &Json,
    ) -> Result<Vec<Json>, ForeignError> {
        match self.kind_of(collection)? {
            Kind::Lazy { compute } => self.compute_lazy(ctx, collection, compute, key),
            Kind::AsyncLazy { call } => self.read_async(ctx, collection, call, key),
            _ => Err(ForeignError::Failed(format!(
                "'{collection}' is not a lazy collection"
            ))),
        }
    }

    fn compute_lazy(
        &self,
        ctx: ExecutionContext,
        collection: &str,
        compute: Handle,
        key: &Json,
    ) -> Result<Vec<Json>, ForeignError> {
        let memo_key = (collection.to_owned(), key_id(key));
        if let Some(values) = self.lazy_memo.borrow().get(&memo_key) {
            return Ok(values.clone());
        }
        let host = self.host()?;
        if !self.lazy_busy.borrow_mut().insert(memo_key.clone()) {
            return Err(ForeignError::Failed(format!(
                "cyclic lazy read of {} in '{collection}'",
                memo_key.1
            )));
        }

        let key_ref = self.heap.write_json(key);
        let computed = host.apply_lazy_fun(ctx, compute, collection, key_ref);
        self.lazy_busy.borrow_mut().remove(&memo_key);

        let pointer = computed.map_err(ForeignError::Raised)?;
        let values = if pointer.is_null() {
            Vec::new()
        } else {
            vec![self.heap.read_json(pointer)]
        };
        self.lazy_memo.borrow_mut().insert(memo_key, values.clone());
        Ok(values)
    }

    fn read_async(
        &self,
        ctx: ExecutionContext,
        collection: &str,
        call: Handle,
        key: &Json,
    ) -> Result<Vec<Json>, ForeignError> {
        let host = self.host()?;
        let key_ref = self.heap.write_json(key);
        let params_ref = host
            .apply_params_fun(ctx, call, key_ref)
            .map_err(ForeignError::Raised)?;
        let params = self.heap.read_json(params_ref);

        let slot_key = (collection.to_owned(), key_id(key));
        let previous = match self.async_slots.borrow().get(&slot_key) {
            Some(slot) if slot.params == params => return Ok(vec![slot.value.clone()]),
            Some(slot) => slot.value.get("payload").cloned(),
            None => None,
        };

        let call_id = format!("{collection}:{}", self.fresh_id());
        let loading = match previous {
            Some(payload) => json!({"loading": true, "payload": payload}),
            None => json!({"loading": true}),
        };
        self.async_slots.borrow_mut().insert(
            slot_key.clone(),
            AsyncSlot {
                call_id: call_id.clone(),
                params,
                value: loading.clone(),
            },
        );

        let call_ref = self.heap.create_string(&call_id);
        let collection_ref = self.heap.create_string(collection);
        if let Err(handle) =
            host.apply_lazy_async_fun(call, call_ref, collection_ref, key_ref, params_ref)
        {
            self.async_slots.borrow_mut().remove(&slot_key);
            return Err(ForeignError::Raised(handle));
        }
        tracing::debug!(call_id = %call_id, "async call started");
        Ok(vec![loading])
    }

    fn open_cursor(&self, values: Vec<Json>) -> IteratorRef {
        let id = self.fresh_id();
        self.cursors.borrow_mut().insert(
            id,
            Cursor {
                values: Rc::new(values),
                position: 0,
            },
        );
        IteratorRef(id)
    }

    fn cursor_values(&self, iterator: IteratorRef) -> (Rc<Vec<Json>>, usize) {
        match self.cursors.borrow().get(&iterator.0) {
            Some(cursor) => (cursor.values.clone(), cursor.position),
            None => contract_violation(format!("unknown iterator {}", iterator.0)),
        }
    }

    /// Runs every mapper over its source and coalesces the outputs by key.
    fn compute_derived(
        &self,
        ctx: ExecutionContext,
        sources: &[(String, Handle)],
        reducer: Option<&mut Reducer>,
    ) -> Result<Rows, ForeignError> {
        let host = self.host()?;
        let mut outputs = Rows::new();

        for (source, mapper) in sources {
            let rows = self
                .active(|state| state.collections.get(source).map(|c| c.rows.clone()))
                .ok_or_else(|| ForeignError::UnknownCollection(source.clone()))?;

            for (_, (key, values)) in rows {
                let writer = self.fresh_id();
                self.writers.borrow_mut().insert(writer, Vec::new());
                let cursor = self.open_cursor(values);
                let key_ref = self.heap.write_json(&key);

                let applied = host.apply_map_fun(ctx, *mapper, WriterRef(writer), key_ref, cursor);

                self.cursors.borrow_mut().remove(&cursor.0);
                let written = self.writers.borrow_mut().remove(&writer).unwrap_or_default();
                applied.map_err(ForeignError::Raised)?;

                for (out_key, out_values) in written {
                    outputs
                        .entry(key_id(&out_key))
                        .or_insert_with(|| (out_key, Vec::new()))
                        .1
                        .extend(out_values);
                }
            }
        }

        match reducer {
            None => Ok(outputs),
            Some(reducer) => self.reduce(&*host, reducer, outputs),
        }
    }

    fn reduce(
        &self,
        host: &dyn HostCallbacks,
        reducer: &mut Reducer,
        outputs: Rows,
    ) -> Result<Rows, ForeignError> {
        let mut rows = Rows::new();
        let mut contributions = BTreeMap::new();
        let mut accs = BTreeMap::new();

        for (id, (key, values)) in outputs {
            let old = reducer.contributions.remove(&id).unwrap_or_default();
            let acc = match reducer.accs.remove(&id) {
                Some(acc) if !old.is_empty() => {
                    self.retract_and_fold(host, reducer, acc, &old, &values)?
                }
                _ => self.fold(host, reducer, reducer.initial.clone(), &values)?,
            };
            accs.insert(id.clone(), acc.clone());
            contributions.insert(id.clone(), values);
            rows.insert(id, (key, vec![acc]));
        }

        reducer.contributions = contributions;
        reducer.accs = accs;
        Ok(rows)
    }

    fn fold(
        &self,
        host: &dyn HostCallbacks,
        reducer: &Reducer,
        mut acc: Json,
        values: &[Json],
    ) -> Result<Json, ForeignError> {
        for value in values {
            let acc_ref = self.heap.write_json(&acc);
            let value_ref = self.heap.write_json(value);
            let next = host
                .apply_accumulate(reducer.accumulator, acc_ref, value_ref)
                .map_err(ForeignError::Raised)?;
            acc = self.heap.read_json(next);
        }
        Ok(acc)
    }

    /// Retracts what left the key's multiset and folds in what joined it. A
    /// retraction that cannot be expressed refolds from the initial value.
    fn retract_and_fold(
        &self,
        host: &dyn HostCallbacks,
        reducer: &Reducer,
        mut acc: Json,
        old: &[Json],
        new: &[Json],
    ) -> Result<Json, ForeignError> {
        let mut added = new.to_vec();
        let mut removed = Vec::new();
        for value in old {
            match added.iter().position(|candidate| candidate == value) {
                Some(index) => {
                    added.remove(index);
                }
                None => removed.push(value.clone()),
            }
        }

        for value in &removed {
            let acc_ref = self.heap.write_json(&acc);
            let value_ref = self.heap.write_json(value);
            let next = host
                .apply_dismiss(reducer.accumulator, acc_ref, value_ref)
                .map_err(ForeignError::Raised)?;
            if next.is_null() {
                return self.fold(host, reducer, reducer.initial.clone(), new);
            }
            acc = self.heap.read_json(next);
        }
        self.fold(host, reducer, acc, &added)
    }

    fn derive(
        &self,
        ctx: ExecutionContext,
        name: Option<&str>,
        prefix: &str,
        sources: Vec<(String, Handle)>,
        mut reducer: Option<Reducer>,
    ) -> Result<String, ForeignError> {
        for (source, _) in &sources {
            if !self.kind_of(source)?.is_eager() {
                return Err(ForeignError::Failed(format!(
                    "cannot map over lazy collection '{source}'"
                )));
            }
        }

        if let Some(name) = name {
            if self.active(|state| state.collections.contains_key(name)) {
                return Err(ForeignError::Failed(format!(
                    "collection '{name}' already exists"
                )));
            }
        }

        let rows = self.compute_derived(ctx, &sources, reducer.as_mut())?;
        let name = match name {
            Some(name) => name.to_owned(),
            None => format!("{prefix}#{}", self.fresh_id()),
        };
        self.active_mut(|state| {
            let tick = state.tick;
            state.collections.insert(
                name.clone(),
                Collection::new(Kind::Derived { sources, reducer }, rows, tick),
            );
        });
        tracing::debug!(collection = %name, "derived collection created");
        Ok(name)
    }

    fn declare(&self, prefix: &str, kind: Kind) -> String {
        let name = format!("{prefix}#{}", self.fresh_id());
        self.active_mut(|state| {
            let tick = state.tick;
            state
                .collections
                .insert(name.clone(), Collection::new(kind, Rows::new(), tick));
        });
        name
    }

    fn recompute(&self, ctx: ExecutionContext) -> Result<(), ForeignError> {
        let derived: Vec<(String, Vec<(String, Handle)>, Option<Reducer>)> = self.active(|state| {
            state
                .collections
                .iter()
                .filter_map(|(name, collection)| match &collection.kind {
                    Kind::Derived { sources, reducer } => {
                        Some((name.clone(), sources.clone(), reducer.clone()))
                    }
                    _ => None,
                })
                .collect()
        });

        for (name, sources, mut reducer) in derived {
            let rows = self.compute_derived(ctx, &sources, reducer.as_mut())?;
            self.active_mut(|state| {
                let tick = state.tick;
                if let Some(collection) = state.collections.get_mut(&name) {
                    collection.replace_rows(rows, tick);
                    if let Kind::Derived { reducer: slot, .. } = &mut collection.kind {
                        *slot = reducer;
                    }
                }
            });
        }
        Ok(())
    }

    /// Applies a change to a copy of the state, recomputes every derived
    /// collection against it and commits only if all of that succeeded.
    fn transact(
        &self,
        apply: impl FnOnce(&mut State) -> Result<(), ForeignError>,
    ) -> Result<(), ForeignError> {
        if self.staging.borrow().is_some() {
            return Err(ForeignError::Failed(
                "engine is already recomputing".to_string(),
            ));
        }

        let mut next = self.state.borrow().clone();
        next.tick += 1;
        apply(&mut next)?;
        *self.staging.borrow_mut() = Some(next);
        self.lazy_memo.borrow_mut().clear();

        let result = self.recompute(self.fresh_ctx());
        let staged = self.staging.borrow_mut().take();
        self.lazy_memo.borrow_mut().clear();
        if let (Ok(()), Some(next)) = (&result, staged) {
            *self.state.borrow_mut() = next;
        }
        result
    }

    /// Maps a resource request to its collection, once per session.
    fn resolve(&self, name: &str, params: ForeignRef) -> Result<String, ForeignError> {
        let session = (name.to_owned(), key_id(&self.heap.read_json(params)));
        if let Some(collection) = self.sessions.borrow().get(&session) {
            return Ok(collection.clone());
        }

        let service = self
            .service
            .get()
            .ok_or_else(|| ForeignError::Failed("engine has no service".to_string()))?;
        let host = self.host()?;
        let name_ref = self.heap.create_string(name);
        let pointer = host
            .instantiate_resource(self.fresh_ctx(), service, name_ref, params)
            .map_err(ForeignError::Raised)?;
        let collection = self.heap.read_string(pointer);

        if !self.active(|state| state.collections.contains_key(&collection)) {
            return Err(ForeignError::UnknownCollection(name.to_owned()));
        }
        self.sessions.borrow_mut().insert(session, collection.clone());
        Ok(collection)
    }

    fn token(&self, collection: &str) -> Json {
        json!({"collection": collection, "watermark": self.active(|state| state.tick)})
    }

    fn watermark(token: &Json, collection: &str) -> Result<u64, ForeignError> {
        if token.get("collection").and_then(Json::as_str) != Some(collection) {
            return Err(ForeignError::Failed(
                "reactive token belongs to another resource".to_string(),
            ));
        }
        token
            .get("watermark")
            .and_then(Json::as_u64)
            .ok_or_else(|| ForeignError::Failed("malformed reactive token".to_string()))
    }

    fn settle(previous: &Json, result: &Json) -> Result<Json, String> {
        let metadata = result.get("metadata").cloned();
        let mut settled = match result.get("status").and_then(Json::as_str) {
            Some("success") => match result.get("payload") {
                Some(payload) => json!({"loading": false, "payload": payload}),
                None => return Err("success result without payload".to_string()),
            },
            Some("unchanged") => {
                let mut settled = json!({"loading": false});
                if let Some(payload) = previous.get("payload") {
                    settled["payload"] = payload.clone();
                }
                settled
            }
            Some("failure") => {
                let error = result.get("error").cloned().unwrap_or(Json::Null);
                json!({"loading": false, "error": error})
            }
            _ => return Err("async result has no valid status".to_string()),
        };
        if let Some(metadata) = metadata {
            settled["metadata"] = metadata;
        }
        Ok(settled)
    }
}

fn parse_entries(json: Json) -> Result<Vec<(Json, Vec<Json>)>, ForeignError> {
    let malformed = || ForeignError::Failed("entries must be [key, [values]] pairs".to_string());
    let Json::Array(items) = json else {
        return Err(malformed());
    };
    items
        .into_iter()
        .map(|item| match item {
            Json::Array(mut pair) if pair.len() == 2 => match pair.pop() {
                Some(Json::Array(values)) => Ok((pair.remove(0), values)),
                _ => Err(malformed()),
            },
            _ => Err(malformed()),
        })
        .collect()
}

impl ForeignEngine for MemoryEngine {
    fn heap(&self) -> &dyn ForeignHeap {
        &self.heap
    }

    fn link(&self, host: Weak<dyn HostCallbacks>) {
        if self.host.set(host).is_err() {
            contract_violation("engine linked twice");
        }
    }

    fn create_for(&self, run_id: &str, service: Handle) -> Result<(), ForeignError> {
        if self.service.get().is_some() {
            return Err(ForeignError::Failed("engine already initialized".to_string()));
        }
        let host = self.host()?;
        host.init(self.fresh_ctx(), service)
            .map_err(ForeignError::Raised)?;
        self.service.set(Some(service));
        *self.run_id.borrow_mut() = Some(run_id.to_owned());
        tracing::debug!(run_id, "engine state created");
        Ok(())
    }

    fn input(
        &self,
        _ctx: ExecutionContext,
        name: &str,
        entries: ForeignRef,
    ) -> Result<String, ForeignError> {
        let entries = parse_entries(self.heap.read_json(entries))?;
        if self.active(|state| state.collections.contains_key(name)) {
            return Err(ForeignError::Failed(format!(
                "collection '{name}' already exists"
            )));
        }
        self.active_mut(|state| {
            let tick = state.tick;
            let mut collection = Collection::new(Kind::Input, Rows::new(), tick);
            for (key, values) in entries {
                collection.set(key, values, tick);
            }
            state.collections.insert(name.to_owned(), collection);
        });
        Ok(name.to_owned())
    }

    fn map(
        &self,
        ctx: ExecutionContext,
        name: Option<&str>,
        source: &str,
        mapper: Handle,
    ) -> Result<String, ForeignError> {
        self.derive(ctx, name, "map", vec![(source.to_owned(), mapper)], None)
    }

    fn map_reduce(
        &self,
        ctx: ExecutionContext,
        name: Option<&str>,
        source: &str,
        mapper: Handle,
        accumulator: Handle,
        initial: ForeignRef,
    ) -> Result<String, ForeignError> {
        let reducer = Reducer::new(accumulator, self.heap.read_json(initial));
        self.derive(ctx, name, "reduce", vec![(source.to_owned(), mapper)], Some(reducer))
    }

    fn multimap(
        &self,
        ctx: ExecutionContext,
        name: Option<&str>,
        sources: &[(String, Handle)],
    ) -> Result<String, ForeignError> {
        self.derive(ctx, name, "multimap", sources.to_vec(), None)
    }

    fn multimap_reduce(
        &self,
        ctx: ExecutionContext,
        name: Option<&str>,
        sources: &[(String, Handle)],
        accumulator: Handle,
        initial: ForeignRef,
    ) -> Result<String, ForeignError> {
        let reducer = Reducer::new(accumulator, self.heap.read_json(initial));
        self.derive(ctx, name, "multireduce", sources.to_vec(), Some(reducer))
    }

    fn lazy(&self, _ctx: ExecutionContext, compute: Handle) -> Result<String, ForeignError> {
        Ok(self.declare("lazy", Kind::Lazy { compute }))
    }

    fn async_lazy(&self, _ctx: ExecutionContext, call: Handle) -> Result<String, ForeignError> {
        Ok(self.declare("async", Kind::AsyncLazy { call }))
    }

    fn get_array(
        &self,
        _ctx: ExecutionContext,
        collection: &str,
        key: ForeignRef,
    ) -> Result<ForeignRef, ForeignError> {
        let values = self.eager_values(collection, &self.heap.read_json(key))?;
        Ok(self.heap.write_json(&Json::Array(values)))
    }

    fn get_array_lazy(
        &self,
        ctx: ExecutionContext,
        collection: &str,
        key: ForeignRef,
    ) -> Result<ForeignRef, ForeignError> {
        let values = self.lazy_values(ctx, collection, &self.heap.read_json(key))?;
        Ok(self.heap.write_json(&Json::Array(values)))
    }

    fn size(&self, _ctx: ExecutionContext, collection: &str) -> Result<usize, ForeignError> {
        self.active(|state| match state.collections.get(collection) {
            Some(c) if c.kind.is_eager() => Ok(c.rows.len()),
            Some(_) => Err(ForeignError::Failed(format!(
                "lazy collection '{collection}' has no size"
            ))),
            None => Err(ForeignError::UnknownCollection(collection.to_owned())),
        })
    }

    fn iterator_first(&self, iterator: IteratorRef) -> ForeignRef {
        let (values, _) = self.cursor_values(iterator);
        match values.first() {
            Some(value) => self.heap.write_json(value),
            None => contract_violation("iterator over an empty key"),
        }
    }

    fn iterator_next(&self, iterator: IteratorRef) -> ForeignRef {
        let next = {
            let mut cursors = self.cursors.borrow_mut();
            let cursor = cursors
                .get_mut(&iterator.0)
                .unwrap_or_else(|| contract_violation(format!("unknown iterator {}", iterator.0)));
            let value = cursor.values.get(cursor.position).cloned();
            if value.is_some() {
                cursor.position += 1;
            }
            value
        };
        match next {
            Some(value) => self.heap.write_json(&value),
            None => ForeignRef::NULL,
        }
    }

    fn iterator_unique_value(&self, iterator: IteratorRef) -> Result<ForeignRef, ForeignError> {
        let (values, _) = self.cursor_values(iterator);
        match values.as_slice() {
            [value] => Ok(self.heap.write_json(value)),
            _ => Err(ForeignError::Failed(format!(
                "expected a unique value, found {}",
                values.len()
            ))),
        }
    }

    fn clone_iterator(&self, iterator: IteratorRef) -> IteratorRef {
        let (values, position) = self.cursor_values(iterator);
        let id = self.fresh_id();
        self.cursors
            .borrow_mut()
            .insert(id, Cursor { values, position });
        IteratorRef(id)
    }

    fn writer_set_array(&self, writer: WriterRef, key: ForeignRef, values: ForeignRef) {
        let key = self.heap.read_json(key);
        let values = match self.heap.read_json(values) {
            Json::Array(values) => values,
            other => contract_violation(format!("writer expects an array, found {other}")),
        };
        match self.writers.borrow_mut().get_mut(&writer.0) {
            Some(written) => written.push((key, values)),
            None => contract_violation(format!("unknown writer {}", writer.0)),
        }
    }

    fn async_result(
        &self,
        call_id: ForeignRef,
        collection: ForeignRef,
        key: ForeignRef,
        _params: ForeignRef,
        result: ForeignRef,
    ) -> i64 {
        let host = match self.host() {
            Ok(host) => host,
            Err(_) => contract_violation("async result delivered to an unlinked engine"),
        };
        let refuse = |message: String| host.get_error_hdl(&message).as_sentinel();

        let call_id = self.heap.read_string(call_id);
        let collection = self.heap.read_string(collection);
        let key = self.heap.read_json(key);
        let result = self.heap.read_json(result);

        if !matches!(self.kind_of(&collection), Ok(Kind::AsyncLazy { .. })) {
            return refuse(format!("'{collection}' is not an async lazy collection"));
        }
        let status = result
            .get("status")
            .and_then(Json::as_str)
            .unwrap_or_default()
            .to_owned();

        let slot_key = (collection.clone(), key_id(&key));
        let outcome = {
            let mut slots = self.async_slots.borrow_mut();
            match slots.get_mut(&slot_key) {
                Some(slot) if slot.call_id == call_id => Self::settle(&slot.value, &result)
                    .map(|settled| Some(std::mem::replace(&mut slot.value, settled))),
                _ => Ok(None),
            }
        };
        let previous = match outcome {
            Ok(previous) => previous,
            Err(message) => return refuse(format!("call {call_id}: {message}")),
        };

        self.record_delivery(Delivery {
            call_id: call_id.clone(),
            collection,
            key,
            status,
            applied: previous.is_some(),
        });
        let Some(previous) = previous else {
            tracing::debug!(call_id = %call_id, "ignoring result of superseded call");
            return 0;
        };

        let committed = self.transact(|_| Ok(()));
        if committed.is_err() {
            // The recompute saw the settled value; the committed state never did.
            if let Some(slot) = self.async_slots.borrow_mut().get_mut(&slot_key) {
                if slot.call_id == call_id {
                    slot.value = previous;
                }
            }
        }
        match committed {
            Ok(()) => 0,
            Err(ForeignError::Raised(handle)) => handle.as_sentinel(),
            Err(ForeignError::UnknownCollection(name)) => {
                refuse(format!("unknown collection '{name}'"))
            }
            Err(ForeignError::Failed(message)) => refuse(message),
        }
    }

    fn create_resource(
        &self,
        name: &str,
        params: ForeignRef,
        auth: &[u8],
    ) -> Result<ForeignRef, ForeignError> {
        let collection = self.resolve(name, params)?;
        tracing::debug!(resource = name, auth_len = auth.len(), "resource instantiated");
        Ok(self.heap.write_json(&self.token(&collection)))
    }

    fn get_all(
        &self,
        name: &str,
        params: ForeignRef,
        auth: Option<&[u8]>,
        since: ForeignRef,
    ) -> Result<ForeignRef, ForeignError> {
        let collection = self.resolve(name, params)?;
        let since = if since.is_null() {
            None
        } else {
            Some(Self::watermark(&self.heap.read_json(since), &collection)?)
        };

        let values = self.active(|state| {
            let c = state
                .collections
                .get(&collection)
                .ok_or_else(|| ForeignError::UnknownCollection(name.to_owned()))?;
            if !c.kind.is_eager() {
                return Err(ForeignError::Failed(format!(
                    "lazy resource '{name}' cannot be listed"
                )));
            }
            let values: Vec<Json> = match since {
                None => c
                    .rows
                    .values()
                    .map(|(key, values)| json!([key, values]))
                    .collect(),
                Some(watermark) => c
                    .changed
                    .iter()
                    .filter(|(_, (_, tick))| *tick > watermark)
                    .map(|(id, (key, _))| {
                        let values = c.rows.get(id).map(|(_, v)| v.clone()).unwrap_or_default();
                        json!([key, values])
                    })
                    .collect(),
            };
            Ok(values)
        })?;

        let reactive = match auth {
            Some(_) => self.token(&collection),
            None => Json::Null,
        };
        Ok(self
            .heap
            .write_json(&json!({"values": values, "reactive": reactive})))
    }

    fn get_one(
        &self,
        name: &str,
        params: ForeignRef,
        key: ForeignRef,
    ) -> Result<ForeignRef, ForeignError> {
        let collection = self.resolve(name, params)?;
        let key = self.heap.read_json(key);
        let values = if self.kind_of(&collection)?.is_eager() {
            self.eager_values(&collection, &key)?
        } else {
            self.lazy_values(self.fresh_ctx(), &collection, &key)?
        };
        Ok(self.heap.write_json(&Json::Array(values)))
    }

    fn update(&self, collection: &str, entries: ForeignRef) -> Result<(), ForeignError> {
        let entries = parse_entries(self.heap.read_json(entries))?;
        let count = entries.len();
        self.transact(|state| {
            let tick = state.tick;
            match state.collections.get_mut(collection) {
                Some(c) if matches!(c.kind, Kind::Input) => {
                    for (key, values) in entries {
                        c.set(key, values, tick);
                    }
                    Ok(())
                }
                _ => Err(ForeignError::UnknownCollection(collection.to_owned())),
            }
        })?;
        tracing::debug!(collection, count, "update committed");
        Ok(())
    }

    fn close(&self) {
        let mut handles: Vec<Handle> = {
            let mut state = self.state.borrow_mut();
            let handles = state
                .collections
                .values()
                .flat_map(|c| c.kind.handles())
                .collect();
            *state = State::default();
            handles
        };
        handles.extend(self.service.take());

        self.sessions.borrow_mut().clear();
        self.lazy_memo.borrow_mut().clear();
        self.async_slots.borrow_mut().clear();
        self.cursors.borrow_mut().clear();
        self.writers.borrow_mut().clear();

        if let Ok(host) = self.host() {
            for handle in handles {
                host.detach_handle(handle);
            }
        }
    }
}
