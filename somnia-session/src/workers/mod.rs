//! Long-lived session workers
//!
//! Each worker is a small state machine running on its own task. The
//! supervisor only ever sees two things per worker:
//! - a read-only snapshot published through a `watch` channel
//! - a bounded `mpsc` sender for commands
//!
//! User-facing output flows back over one shared `mpsc` channel as
//! [`WorkerEvent`]s. Workers are spawned once per session and stop on the
//! shutdown broadcast.

pub mod dream;
pub mod funding;
pub mod identity;
pub mod registry;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use somnia_core::inference::{HttpInferenceClient, InferenceGateway, ModelRegistry};
use somnia_core::ledger::{FundingLedger, HttpLedgerClient, Ledger};
use somnia_core::models::PersistenceStatus;
use somnia_core::selection::{FileSelectionStore, SelectionStore};
use somnia_core::storage::{ContentStore, HttpContentStore};
use somnia_core::{SomniaConfig, SomniaError};

use crate::subsystems::dream::{DreamSettings, DreamWorkflow};
use crate::subsystems::orchestrator::PersistencePipeline;

use self::dream::{DreamCommand, DreamSnapshot};
use self::funding::{FundingCommand, FundingSnapshot};
use self::identity::{IdentityCommand, IdentitySnapshot};
use self::registry::{RegistryCommand, RegistrySnapshot};

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerName {
    Dream,
    Funding,
    Registry,
    IdentitySync,
}

impl WorkerName {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerName::Dream => "dream",
            WorkerName::Funding => "funding",
            WorkerName::Registry => "models",
            WorkerName::IdentitySync => "identity",
        }
    }
}

impl fmt::Display for WorkerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Line { worker: WorkerName, text: String },
    Error { worker: WorkerName, text: String },
    ModelSelected { model_id: String },
    DreamPersisted { record_id: Option<u64>, status: PersistenceStatus },
    DreamFinished,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{0} worker is not running")]
pub struct WorkerGone(pub WorkerName);

/// Command sender plus snapshot receiver for one worker.
pub struct WorkerHandle<C, S> {
    name: WorkerName,
    commands: mpsc::Sender<C>,
    snapshot: watch::Receiver<S>,
    task: JoinHandle<()>,
}

impl<C, S> WorkerHandle<C, S>
where
    C: Send + 'static,
    S: Clone,
{
    pub fn new(
        name: WorkerName,
        commands: mpsc::Sender<C>,
        snapshot: watch::Receiver<S>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            commands,
            snapshot,
            task,
        }
    }

    pub fn name(&self) -> WorkerName {
        self.name
    }

    pub fn snapshot(&self) -> S {
        self.snapshot.borrow().clone()
    }

    /// A receiver that can wait for snapshot changes.
    pub fn watch(&self) -> watch::Receiver<S> {
        self.snapshot.clone()
    }

    pub async fn send(&self, command: C) -> Result<(), WorkerGone> {
        self.commands
            .send(command)
            .await
            .map_err(|_| WorkerGone(self.name))
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait for the task to stop, aborting it if it does not.
    pub async fn join(self) {
        let name = self.name;
        let mut task = self.task;
        if tokio::time::timeout(JOIN_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!(worker = %name, "Worker did not stop in time, aborting");
            task.abort();
        }
    }
}

/// Sends one worker's output to the supervisor.
#[derive(Clone)]
pub struct EventSink {
    worker: WorkerName,
    tx: mpsc::Sender<WorkerEvent>,
}

impl EventSink {
    pub fn new(worker: WorkerName, tx: mpsc::Sender<WorkerEvent>) -> Self {
        Self { worker, tx }
    }

    pub async fn send(&self, event: WorkerEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!(worker = %self.worker, "Supervisor gone, event dropped");
        }
    }

    pub async fn line(&self, text: impl Into<String>) {
        self.send(WorkerEvent::Line {
            worker: self.worker,
            text: text.into(),
        })
        .await
    }

    pub async fn error(&self, text: impl Into<String>) {
        self.send(WorkerEvent::Error {
            worker: self.worker,
            text: text.into(),
        })
        .await
    }

    /// Non-blocking variant for synchronous callbacks; dropped when full.
    pub fn try_line(&self, text: impl Into<String>) {
        let event = WorkerEvent::Line {
            worker: self.worker,
            text: text.into(),
        };
        if self.tx.try_send(event).is_err() {
            tracing::debug!(worker = %self.worker, "Event channel full, progress line dropped");
        }
    }
}

/// External collaborators shared by the workers.
#[derive(Clone)]
pub struct Collaborators {
    pub inference: Arc<dyn InferenceGateway>,
    pub models: Arc<dyn ModelRegistry>,
    pub store: Arc<dyn ContentStore>,
    pub ledger: Arc<dyn Ledger>,
    pub funding: Arc<dyn FundingLedger>,
    pub selection: Arc<dyn SelectionStore>,
}

impl Collaborators {
    /// HTTP-backed collaborators for a live session.
    pub fn from_config(config: &SomniaConfig) -> Result<Self, SomniaError> {
        let inference = Arc::new(HttpInferenceClient::new(&config.inference)?);
        let ledger = Arc::new(HttpLedgerClient::new(&config.ledger)?);
        Ok(Self {
            inference: inference.clone(),
            models: inference,
            store: Arc::new(HttpContentStore::new(&config.storage)?),
            ledger: ledger.clone(),
            funding: ledger,
            selection: Arc::new(FileSelectionStore::new(&config.service.selection_path)),
        })
    }
}

/// The supervision table: one handle per worker, created once.
pub struct WorkerTable {
    pub dream: WorkerHandle<DreamCommand, DreamSnapshot>,
    pub funding: WorkerHandle<FundingCommand, FundingSnapshot>,
    pub registry: WorkerHandle<RegistryCommand, RegistrySnapshot>,
    pub identity: WorkerHandle<IdentityCommand, IdentitySnapshot>,
}

impl WorkerTable {
    pub fn names(&self) -> [WorkerName; 4] {
        [
            self.dream.name(),
            self.funding.name(),
            self.registry.name(),
            self.identity.name(),
        ]
    }

    /// One status line per worker.
    pub fn status_lines(&self) -> Vec<String> {
        let running = |alive: bool| if alive { "" } else { " [stopped]" };
        vec![
            format!(
                "{}: {}{}",
                self.dream.name(),
                self.dream.snapshot().describe(),
                running(self.dream.is_running())
            ),
            format!(
                "{}: {}{}",
                self.funding.name(),
                self.funding.snapshot().describe(),
                running(self.funding.is_running())
            ),
            format!(
                "{}: {}{}",
                self.registry.name(),
                self.registry.snapshot().describe(),
                running(self.registry.is_running())
            ),
            format!(
                "{}: {}{}",
                self.identity.name(),
                self.identity.snapshot().describe(),
                running(self.identity.is_running())
            ),
        ]
    }

    pub async fn join_all(self) {
        tokio::join!(
            self.dream.join(),
            self.funding.join(),
            self.registry.join(),
            self.identity.join(),
        );
    }
}

/// Spawn the four session workers.
pub fn spawn_workers(
    config: &SomniaConfig,
    deps: Collaborators,
    events: mpsc::Sender<WorkerEvent>,
    shutdown: &broadcast::Sender<()>,
) -> WorkerTable {
    let buffer = config.workers.command_buffer.max(1);

    let pipeline = Arc::new(PersistencePipeline::from_config(
        config,
        deps.store.clone(),
        deps.ledger.clone(),
    ));
    let workflow = DreamWorkflow::new(
        deps.inference.clone(),
        deps.ledger.clone(),
        deps.store.clone(),
        pipeline,
        DreamSettings::from_config(config),
    );

    let table = WorkerTable {
        dream: dream::spawn(
            workflow,
            EventSink::new(WorkerName::Dream, events.clone()),
            shutdown.subscribe(),
            buffer,
        ),
        funding: funding::spawn(
            deps.funding.clone(),
            funding::FundingSettings::from_config(config),
            EventSink::new(WorkerName::Funding, events.clone()),
            shutdown.subscribe(),
            buffer,
        ),
        registry: registry::spawn(
            deps.models.clone(),
            deps.selection.clone(),
            config.inference.default_model.clone(),
            EventSink::new(WorkerName::Registry, events.clone()),
            shutdown.subscribe(),
            buffer,
        ),
        identity: identity::spawn(
            deps.ledger.clone(),
            identity::IdentitySettings::from_config(config),
            EventSink::new(WorkerName::IdentitySync, events),
            shutdown.subscribe(),
            buffer,
        ),
    };

    tracing::info!(workers = ?table.names(), "Session workers spawned");
    table
}
