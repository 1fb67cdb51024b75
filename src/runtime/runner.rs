//! Runtime thread hosting the bridge.
//!
//! Handles, views and execution contexts are single-threaded, so the engine
//! and its bridge live on a dedicated OS thread with a current-thread Tokio
//! runtime. Commands arrive through [`RuntimeCommand`] and run one at a time
//! on that thread; between commands the same loop delivers settled async
//! calls back into the engine.

use crate::runtime::bridge::{Bridge, ResourceSnapshot, RuntimeStats};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::error::BridgeError;
use crate::runtime::foreign::ForeignEngine;
use crate::runtime::ops::Service;
use crate::runtime::value::{Entry, Value};
use std::rc::Rc;
use std::sync::mpsc::Receiver as StdReceiver;
use std::sync::mpsc::Sender as StdSender;
use std::sync::mpsc::Sender;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

type InitSignalChannel = (
    StdSender<Result<String, BridgeError>>,
    StdReceiver<Result<String, BridgeError>>,
);

/// Commands sent to the runtime thread.
pub enum RuntimeCommand {
    CreateResource {
        name: String,
        params: Value,
        auth: Vec<u8>,
        responder: oneshot::Sender<Result<Value, BridgeError>>,
    },
    GetAll {
        name: String,
        params: Value,
        auth: Option<Vec<u8>>,
        since: Option<Value>,
        responder: oneshot::Sender<Result<ResourceSnapshot, BridgeError>>,
    },
    GetOne {
        name: String,
        params: Value,
        key: Value,
        responder: oneshot::Sender<Result<Option<Value>, BridgeError>>,
    },
    Update {
        collection: String,
        entries: Vec<Entry>,
        responder: oneshot::Sender<Result<(), BridgeError>>,
    },
    Stats {
        responder: oneshot::Sender<RuntimeStats>,
    },
    Shutdown {
        responder: Sender<usize>,
    },
}

impl RuntimeCommand {
    fn name(&self) -> &'static str {
        match self {
            RuntimeCommand::CreateResource { .. } => "create_resource",
            RuntimeCommand::GetAll { .. } => "get_all",
            RuntimeCommand::GetOne { .. } => "get_one",
            RuntimeCommand::Update { .. } => "update",
            RuntimeCommand::Stats { .. } => "stats",
            RuntimeCommand::Shutdown { .. } => "shutdown",
        }
    }
}

/// Endpoints of a running runtime thread.
pub struct RuntimeChannels {
    pub commands: mpsc::UnboundedSender<RuntimeCommand>,
    /// Bumped after every committed change to the engine's collections.
    pub changes: watch::Receiver<u64>,
    pub faults: broadcast::Sender<BridgeError>,
    pub run_id: String,
}

/// Spawns the runtime thread and waits until the service's graph is built.
///
/// Services and engines are usually not `Send`, so both are built on the
/// runtime thread from the given factories.
pub fn spawn_runtime_thread<S, E>(
    config: RuntimeConfig,
    make_service: S,
    make_engine: E,
) -> Result<RuntimeChannels, BridgeError>
where
    S: FnOnce() -> Rc<dyn Service> + Send + 'static,
    E: FnOnce() -> Rc<dyn ForeignEngine> + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<RuntimeCommand>();
    let (init_tx, init_rx): InitSignalChannel = std::sync::mpsc::channel();
    let (changes_tx, changes_rx) = watch::channel(0u64);
    let (faults_tx, _) = broadcast::channel(config.fault_capacity.max(1));
    let thread_faults = faults_tx.clone();

    std::thread::Builder::new()
        .name(config.thread_name.clone())
        .spawn(move || {
            let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init_tx.send(Err(BridgeError::Runtime(format!(
                        "failed to build tokio runtime: {err}"
                    ))));
                    return;
                }
            };

            let bridge = Bridge::new(make_engine(), &config, changes_tx, thread_faults);
            let core = match bridge.initialize(make_service()) {
                Ok(run_id) => {
                    let _ = init_tx.send(Ok(run_id));
                    RuntimeCore { bridge }
                }
                Err(err) => {
                    bridge.shutdown();
                    let _ = init_tx.send(Err(err));
                    return;
                }
            };

            tokio_rt.block_on(core.run(cmd_rx));
        })
        .map_err(|e| BridgeError::Runtime(format!("failed to spawn runtime thread: {e}")))?;

    match init_rx.recv() {
        Ok(Ok(run_id)) => Ok(RuntimeChannels {
            commands: cmd_tx,
            changes: changes_rx,
            faults: faults_tx,
            run_id,
        }),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(BridgeError::Runtime(
            "runtime thread initialization failed".to_string(),
        )),
    }
}

struct RuntimeCore {
    bridge: Rc<Bridge>,
}

impl RuntimeCore {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<RuntimeCommand>) {
        loop {
            tokio::select! {
                biased;
                command = rx.recv() => match command {
                    Some(command) => {
                        if !self.handle(command) {
                            break;
                        }
                    }
                    None => {
                        tracing::debug!("all runtime handles dropped");
                        self.bridge.shutdown();
                        break;
                    }
                },
                // Completing a delivery never spans an await point, so
                // dropping this branch when a command wins loses nothing.
                _ = self.bridge.deliver_next() => {}
            }
        }
        tracing::debug!("runtime loop stopped");
    }

    /// Runs one command; `false` stops the loop.
    fn handle(&self, command: RuntimeCommand) -> bool {
        tracing::trace!(command = command.name(), "runtime command");
        match command {
            RuntimeCommand::CreateResource {
                name,
                params,
                auth,
                responder,
            } => {
                let _ = responder.send(self.bridge.create_resource(&name, &params, &auth));
            }
            RuntimeCommand::GetAll {
                name,
                params,
                auth,
                since,
                responder,
            } => {
                let result =
                    self.bridge
                        .get_all(&name, &params, auth.as_deref(), since.as_ref());
                let _ = responder.send(result);
            }
            RuntimeCommand::GetOne {
                name,
                params,
                key,
                responder,
            } => {
                let _ = responder.send(self.bridge.get_one(&name, &params, &key));
            }
            RuntimeCommand::Update {
                collection,
                entries,
                responder,
            } => {
                let _ = responder.send(self.bridge.update(&collection, &entries));
            }
            RuntimeCommand::Stats { responder } => {
                let _ = responder.send(self.bridge.stats());
            }
            RuntimeCommand::Shutdown { responder } => {
                let leaked = self.bridge.shutdown();
                let _ = responder.send(leaked);
                return false;
            }
        }
        true
    }
}
