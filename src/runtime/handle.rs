//! Thread-safe handle for interacting with the runtime thread.

use crate::memory::MemoryEngine;
use crate::runtime::bridge::{ResourceSnapshot, RuntimeStats};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::error::BridgeError;
use crate::runtime::foreign::ForeignEngine;
use crate::runtime::ops::Service;
use crate::runtime::runner::{spawn_runtime_thread, RuntimeCommand};
use crate::runtime::value::{Entry, Value};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use tokio::sync::mpsc as async_mpsc;
use tokio::sync::{broadcast, oneshot, watch};

#[derive(Clone)]
pub struct RuntimeHandle {
    tx: async_mpsc::UnboundedSender<RuntimeCommand>,
    changes: watch::Receiver<u64>,
    faults: broadcast::Sender<BridgeError>,
    run_id: Arc<str>,
    shutdown: Arc<AtomicBool>,
}

impl RuntimeHandle {
    /// Spawns a runtime over the in-process [`MemoryEngine`].
    pub fn spawn<S, F>(config: RuntimeConfig, make_service: F) -> Result<Self, BridgeError>
    where
        S: Service + 'static,
        F: FnOnce() -> S + Send + 'static,
    {
        Self::spawn_with_engine(
            config,
            move || Rc::new(make_service()) as Rc<dyn Service>,
            || Rc::new(MemoryEngine::new()) as Rc<dyn ForeignEngine>,
        )
    }

    pub fn spawn_with_engine<S, E>(
        config: RuntimeConfig,
        make_service: S,
        make_engine: E,
    ) -> Result<Self, BridgeError>
    where
        S: FnOnce() -> Rc<dyn Service> + Send + 'static,
        E: FnOnce() -> Rc<dyn ForeignEngine> + Send + 'static,
    {
        let channels = spawn_runtime_thread(config, make_service, make_engine)?;
        Ok(Self {
            tx: channels.commands,
            changes: channels.changes,
            faults: channels.faults,
            run_id: Arc::from(channels.run_id),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    fn sender(&self) -> Result<&async_mpsc::UnboundedSender<RuntimeCommand>, BridgeError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(BridgeError::Runtime("runtime has been shut down".to_string()));
        }
        Ok(&self.tx)
    }

    async fn request<T>(
        &self,
        what: &str,
        build: impl FnOnce(oneshot::Sender<T>) -> RuntimeCommand,
    ) -> Result<T, BridgeError> {
        let sender = self.sender()?;
        let (result_tx, result_rx) = oneshot::channel();

        sender
            .send(build(result_tx))
            .map_err(|_| BridgeError::Runtime(format!("failed to send {what} command")))?;

        result_rx
            .await
            .map_err(|_| BridgeError::Runtime(format!("failed to receive {what} result")))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn create_resource(
        &self,
        name: &str,
        params: Value,
        auth: Vec<u8>,
    ) -> Result<Value, BridgeError> {
        self.request("create_resource", |responder| RuntimeCommand::CreateResource {
            name: name.to_owned(),
            params,
            auth,
            responder,
        })
        .await?
    }

    pub async fn get_all(
        &self,
        name: &str,
        params: Value,
        auth: Option<Vec<u8>>,
        since: Option<Value>,
    ) -> Result<ResourceSnapshot, BridgeError> {
        self.request("get_all", |responder| RuntimeCommand::GetAll {
            name: name.to_owned(),
            params,
            auth,
            since,
            responder,
        })
        .await?
    }

    pub async fn get_one(
        &self,
        name: &str,
        params: Value,
        key: Value,
    ) -> Result<Option<Value>, BridgeError> {
        self.request("get_one", |responder| RuntimeCommand::GetOne {
            name: name.to_owned(),
            params,
            key,
            responder,
        })
        .await?
    }

    pub async fn update(&self, collection: &str, entries: Vec<Entry>) -> Result<(), BridgeError> {
        self.request("update", |responder| RuntimeCommand::Update {
            collection: collection.to_owned(),
            entries,
            responder,
        })
        .await?
    }

    pub async fn stats(&self) -> Result<RuntimeStats, BridgeError> {
        self.request("stats", |responder| RuntimeCommand::Stats { responder })
            .await
    }

    /// Receiver whose value is bumped after every committed change.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.clone()
    }

    /// Faults raised outside of any request, such as refused async
    /// deliveries.
    pub fn subscribe_faults(&self) -> broadcast::Receiver<BridgeError> {
        self.faults.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stops the runtime thread and waits for it to confirm. Returns the
    /// number of handles that were still registered.
    pub fn close(&self) -> Result<usize, BridgeError> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(0);
        }

        let (result_tx, result_rx) = mpsc::channel();
        self.tx
            .send(RuntimeCommand::Shutdown {
                responder: result_tx,
            })
            .map_err(|_| BridgeError::Runtime("failed to send shutdown command".to_string()))?;

        result_rx
            .recv()
            .map_err(|_| BridgeError::Runtime("failed to confirm runtime shutdown".to_string()))
    }
}
