//! The foreign boundary contract.
//!
//! The engine lives in its own memory space and is reached only through the
//! traits below: [`ForeignHeap`] for values, [`ForeignEngine`] for the
//! engine's exports and [`HostCallbacks`] for what the engine calls back on
//! the host. Nothing here prescribes how a call physically crosses the
//! boundary.

use crate::runtime::registry::Handle;
use std::rc::Weak;

/// Opaque pointer into the foreign memory space. `0` is the null pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForeignRef(pub u32);

impl ForeignRef {
    pub const NULL: ForeignRef = ForeignRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Type tag of a foreign value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignType {
    Undefined,
    Null,
    Int,
    Float,
    Boolean,
    String,
    Array,
    Object,
}

/// Cursor identifying the recomputation currently running in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionContext(pub u32);

/// Foreign iterator over the values of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IteratorRef(pub u32);

/// Foreign sink for map outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriterRef(pub u32);

/// Failure reported by an engine export.
#[derive(Debug, Clone, PartialEq)]
pub enum ForeignError {
    /// The named collection does not exist or does not accept the operation.
    UnknownCollection(String),
    /// A host callback failed; the handle names the registered error object.
    Raised(Handle),
    /// Any other engine-side failure.
    Failed(String),
}

/// Read and build access to foreign-owned values.
///
/// Existing values are never mutated through this interface; builders only
/// allocate new ones.
pub trait ForeignHeap {
    fn type_of(&self, value: ForeignRef) -> ForeignType;
    fn as_int(&self, value: ForeignRef) -> i64;
    fn as_float(&self, value: ForeignRef) -> f64;
    fn as_bool(&self, value: ForeignRef) -> bool;
    fn read_string(&self, value: ForeignRef) -> String;

    fn array_size(&self, value: ForeignRef) -> usize;
    fn array_at(&self, value: ForeignRef, index: usize) -> ForeignRef;
    fn object_size(&self, value: ForeignRef) -> usize;
    fn field_name(&self, value: ForeignRef, index: usize) -> String;
    fn field_value(&self, value: ForeignRef, index: usize) -> ForeignRef;

    fn create_null(&self) -> ForeignRef;
    fn create_int(&self, value: i64) -> ForeignRef;
    fn create_float(&self, value: f64) -> ForeignRef;
    fn create_bool(&self, value: bool) -> ForeignRef;
    fn create_string(&self, value: &str) -> ForeignRef;
    fn create_array(&self, items: &[ForeignRef]) -> ForeignRef;
    fn create_object(&self, fields: &[(String, ForeignRef)]) -> ForeignRef;

    /// Opens an allocation frame and returns its mark.
    fn begin_frame(&self) -> usize;
    /// Reclaims everything allocated since `mark`. References into the frame
    /// are invalid afterwards.
    fn end_frame(&self, mark: usize);
}

/// Allocation frame scoped to one top-level call into the engine.
pub struct HeapFrame<'h> {
    heap: &'h dyn ForeignHeap,
    mark: usize,
}

impl<'h> HeapFrame<'h> {
    pub fn enter(heap: &'h dyn ForeignHeap) -> Self {
        Self {
            heap,
            mark: heap.begin_frame(),
        }
    }
}

impl Drop for HeapFrame<'_> {
    fn drop(&mut self) {
        self.heap.end_frame(self.mark);
    }
}

/// Exports of the foreign incremental engine.
pub trait ForeignEngine {
    fn heap(&self) -> &dyn ForeignHeap;

    /// Wires the engine to the host callbacks. Called once, before any other
    /// export.
    fn link(&self, host: Weak<dyn HostCallbacks>);

    /// Creates the engine state for a run and calls back
    /// [`HostCallbacks::init`] with the service handle.
    fn create_for(&self, run_id: &str, service: Handle) -> Result<(), ForeignError>;

    fn input(
        &self,
        ctx: ExecutionContext,
        name: &str,
        entries: ForeignRef,
    ) -> Result<String, ForeignError>;
    /// Derived collections are called `name` when one is given; otherwise the
    /// engine picks a fresh name. A name already in use is an error.
    fn map(
        &self,
        ctx: ExecutionContext,
        name: Option<&str>,
        source: &str,
        mapper: Handle,
    ) -> Result<String, ForeignError>;
    fn map_reduce(
        &self,
        ctx: ExecutionContext,
        name: Option<&str>,
        source: &str,
        mapper: Handle,
        accumulator: Handle,
        initial: ForeignRef,
    ) -> Result<String, ForeignError>;
    fn multimap(
        &self,
        ctx: ExecutionContext,
        name: Option<&str>,
        sources: &[(String, Handle)],
    ) -> Result<String, ForeignError>;
    fn multimap_reduce(
        &self,
        ctx: ExecutionContext,
        name: Option<&str>,
        sources: &[(String, Handle)],
        accumulator: Handle,
        initial: ForeignRef,
    ) -> Result<String, ForeignError>;
    fn lazy(&self, ctx: ExecutionContext, compute: Handle) -> Result<String, ForeignError>;
    fn async_lazy(&self, ctx: ExecutionContext, call: Handle) -> Result<String, ForeignError>;

    /// All values for `key`, as a foreign array.
    fn get_array(
        &self,
        ctx: ExecutionContext,
        collection: &str,
        key: ForeignRef,
    ) -> Result<ForeignRef, ForeignError>;
    /// All values for `key` in a lazy collection, as a foreign array.
    fn get_array_lazy(
        &self,
        ctx: ExecutionContext,
        collection: &str,
        key: ForeignRef,
    ) -> Result<ForeignRef, ForeignError>;
    fn size(&self, ctx: ExecutionContext, collection: &str) -> Result<usize, ForeignError>;

    fn iterator_first(&self, iterator: IteratorRef) -> ForeignRef;
    /// Next value, or the null pointer once exhausted.
    fn iterator_next(&self, iterator: IteratorRef) -> ForeignRef;
    fn iterator_unique_value(&self, iterator: IteratorRef) -> Result<ForeignRef, ForeignError>;
    fn clone_iterator(&self, iterator: IteratorRef) -> IteratorRef;

    fn writer_set_array(&self, writer: WriterRef, key: ForeignRef, values: ForeignRef);

    /// Accepts a settled async result. A negative return value is the
    /// negated handle of an error object describing why it was refused.
    fn async_result(
        &self,
        call_id: ForeignRef,
        collection: ForeignRef,
        key: ForeignRef,
        params: ForeignRef,
        result: ForeignRef,
    ) -> i64;

    /// Returns the reactive state blob of a resource session.
    fn create_resource(
        &self,
        name: &str,
        params: ForeignRef,
        auth: &[u8],
    ) -> Result<ForeignRef, ForeignError>;
    /// Returns `{values, reactive}`; `since` (possibly null) is a reactive
    /// token restricting `values` to the changes after it.
    fn get_all(
        &self,
        name: &str,
        params: ForeignRef,
        auth: Option<&[u8]>,
        since: ForeignRef,
    ) -> Result<ForeignRef, ForeignError>;
    /// Returns the values of one key of a resource, as a foreign array.
    fn get_one(&self, name: &str, params: ForeignRef, key: ForeignRef)
        -> Result<ForeignRef, ForeignError>;
    fn update(&self, collection: &str, entries: ForeignRef) -> Result<(), ForeignError>;

    /// Releases every collection, detaching the handles the engine holds.
    fn close(&self);
}

/// Host entry points the engine calls while it runs.
///
/// Failures of user code come back as `Err(handle)` naming a registered
/// error object; the engine hands that handle back up to the caller of the
/// export it was running.
pub trait HostCallbacks {
    /// The engine no longer references `handle`.
    fn detach_handle(&self, handle: Handle);
    /// Registers an engine-side failure and returns its handle.
    fn get_error_hdl(&self, message: &str) -> Handle;

    fn init(&self, ctx: ExecutionContext, service: Handle) -> Result<(), Handle>;
    /// Resolves a resource name and its parameters to a collection name.
    fn instantiate_resource(
        &self,
        ctx: ExecutionContext,
        service: Handle,
        name: ForeignRef,
        params: ForeignRef,
    ) -> Result<ForeignRef, Handle>;

    fn apply_map_fun(
        &self,
        ctx: ExecutionContext,
        mapper: Handle,
        writer: WriterRef,
        key: ForeignRef,
        values: IteratorRef,
    ) -> Result<(), Handle>;
    /// Returns the computed value, or the null pointer for none.
    fn apply_lazy_fun(
        &self,
        ctx: ExecutionContext,
        compute: Handle,
        collection: &str,
        key: ForeignRef,
    ) -> Result<ForeignRef, Handle>;
    fn apply_params_fun(
        &self,
        ctx: ExecutionContext,
        call: Handle,
        key: ForeignRef,
    ) -> Result<ForeignRef, Handle>;
    /// Starts an async computation; its result arrives later through
    /// [`ForeignEngine::async_result`].
    fn apply_lazy_async_fun(
        &self,
        call: Handle,
        call_id: ForeignRef,
        collection: ForeignRef,
        key: ForeignRef,
        params: ForeignRef,
    ) -> Result<(), Handle>;

    fn apply_accumulate(
        &self,
        accumulator: Handle,
        acc: ForeignRef,
        value: ForeignRef,
    ) -> Result<ForeignRef, Handle>;
    /// Returns the null pointer when the retraction empties the accumulator.
    fn apply_dismiss(
        &self,
        accumulator: Handle,
        acc: ForeignRef,
        value: ForeignRef,
    ) -> Result<ForeignRef, Handle>;
}
