//! Model-registry worker
//!
//! `uninitialized -> loading -> ready | failed`. Lists the models the
//! inference service offers and owns the model selection, which is loaded
//! from the [`SelectionStore`] at start and saved on every change.

use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

use somnia_core::inference::{ModelDescriptor, ModelRegistry};
use somnia_core::selection::SelectionStore;

use super::{EventSink, WorkerEvent, WorkerHandle, WorkerName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Uninitialized,
    Loading,
    Ready,
    Failed,
}

impl fmt::Display for RegistryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistryState::Uninitialized => "uninitialized",
            RegistryState::Loading => "loading",
            RegistryState::Ready => "ready",
            RegistryState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCommand {
    Refresh,
    Select { model_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub state: RegistryState,
    pub models: Vec<ModelDescriptor>,
    pub selected: Option<String>,
    pub last_error: Option<String>,
}

impl Default for RegistrySnapshot {
    fn default() -> Self {
        Self {
            state: RegistryState::Uninitialized,
            models: Vec::new(),
            selected: None,
            last_error: None,
        }
    }
}

impl RegistrySnapshot {
    pub fn describe(&self) -> String {
        let selected = self.selected.as_deref().unwrap_or("none");
        match self.state {
            RegistryState::Ready => format!(
                "{} ({} models, selected {})",
                self.state,
                self.models.len(),
                selected
            ),
            RegistryState::Failed => format!(
                "{} ({}), selected {}",
                self.state,
                self.last_error.as_deref().unwrap_or("unknown error"),
                selected
            ),
            _ => self.state.to_string(),
        }
    }

    /// Lines listing the known models, the selected one marked.
    pub fn model_lines(&self) -> Vec<String> {
        if self.models.is_empty() {
            return vec![match self.state {
                RegistryState::Loading | RegistryState::Uninitialized => {
                    "Model list is still loading.".to_string()
                }
                _ => "No models available. Try 'models refresh'.".to_string(),
            }];
        }
        let mut lines = vec![format!("{} models available:", self.models.len())];
        for model in &self.models {
            let marker = if self.selected.as_deref() == Some(model.id.as_str()) {
                "*"
            } else {
                " "
            };
            let mut line = format!(" {} {}", marker, model.id);
            if let Some(name) = &model.name {
                line.push_str(&format!(" ({})", name));
            }
            if let Some(provider) = &model.provider {
                line.push_str(&format!(" via {}", provider));
            }
            lines.push(line);
        }
        lines
    }

    fn knows(&self, model_id: &str) -> bool {
        self.models.iter().any(|m| m.id == model_id)
    }
}

struct RegistryWorker {
    registry: Arc<dyn ModelRegistry>,
    selection: Arc<dyn SelectionStore>,
    default_model: String,
    snapshot: watch::Sender<RegistrySnapshot>,
    events: EventSink,
}

pub fn spawn(
    registry: Arc<dyn ModelRegistry>,
    selection: Arc<dyn SelectionStore>,
    default_model: String,
    events: EventSink,
    shutdown: broadcast::Receiver<()>,
    buffer: usize,
) -> WorkerHandle<RegistryCommand, RegistrySnapshot> {
    let (command_tx, command_rx) = mpsc::channel(buffer);
    let (snapshot_tx, snapshot_rx) = watch::channel(RegistrySnapshot::default());
    let worker = RegistryWorker {
        registry,
        selection,
        default_model,
        snapshot: snapshot_tx,
        events,
    };
    let task = tokio::spawn(worker.run(command_rx, shutdown));
    WorkerHandle::new(WorkerName::Registry, command_tx, snapshot_rx, task)
}

impl RegistryWorker {
    async fn run(self, mut commands: mpsc::Receiver<RegistryCommand>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("Model registry worker started");

        let saved = match self.selection.load().await {
            Ok(saved) => saved,
            Err(e) => {
                tracing::warn!(error = %e, "Saved model selection unreadable, using default");
                None
            }
        };
        self.snapshot.send_modify(|s| s.selected = saved.clone());
        self.refresh(false).await;
        self.announce_selection().await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(RegistryCommand::Refresh) => {
                        self.refresh(true).await;
                        self.announce_selection().await;
                    }
                    Some(RegistryCommand::Select { model_id }) => self.select(&model_id).await,
                    None => break,
                },
                _ = shutdown.recv() => {
                    tracing::info!("Model registry worker shutting down");
                    break;
                }
            }
        }
    }

    async fn refresh(&self, announce: bool) {
        self.snapshot.send_modify(|s| s.state = RegistryState::Loading);

        match self.registry.list_models().await {
            Ok(models) => {
                tracing::info!(count = models.len(), "Model list loaded");
                let default_model = self.default_model.clone();
                self.snapshot.send_modify(|s| {
                    s.state = RegistryState::Ready;
                    s.last_error = None;
                    s.models = models;
                    let keep = s.selected.as_deref().is_some_and(|id| s.knows(id));
                    if !keep {
                        s.selected = if s.knows(&default_model) {
                            Some(default_model)
                        } else {
                            s.models.first().map(|m| m.id.clone())
                        };
                    }
                });
                if announce {
                    let lines = self.snapshot.borrow().model_lines();
                    for line in lines {
                        self.events.line(line).await;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Model list unavailable");
                let default_model = self.default_model.clone();
                self.snapshot.send_modify(|s| {
                    s.state = RegistryState::Failed;
                    s.last_error = Some(e.to_string());
                    if s.selected.is_none() {
                        s.selected = Some(default_model);
                    }
                });
                self.events.error(format!("Could not load the model list: {}", e)).await;
            }
        }
    }

    async fn announce_selection(&self) {
        let selected = self.snapshot.borrow().selected.clone();
        if let Some(model_id) = selected {
            self.events.send(WorkerEvent::ModelSelected { model_id }).await;
        }
    }

    async fn select(&self, model_id: &str) {
        let (state, known) = {
            let s = self.snapshot.borrow();
            (s.state, s.knows(model_id))
        };
        if state != RegistryState::Ready {
            self.events
                .error(format!("Model list is {}; try 'models refresh' first.", state))
                .await;
            return;
        }
        if !known {
            self.events
                .error(format!("Unknown model '{}'. Type 'models' to list them.", model_id))
                .await;
            return;
        }

        self.snapshot.send_modify(|s| s.selected = Some(model_id.to_string()));
        if let Err(e) = self.selection.save(model_id).await {
            tracing::warn!(error = %e, model = model_id, "Model selection not saved");
            self.events
                .error(format!("Model selected but not remembered: {}", e))
                .await;
        }
        tracing::info!(model = model_id, "Model selected");
        self.events
            .send(WorkerEvent::ModelSelected {
                model_id: model_id.to_string(),
            })
            .await;
        self.events.line(format!("Model set to {}", model_id)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemorySelection, MockModels};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    async fn next_event(rx: &mut mpsc::Receiver<WorkerEvent>) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_saved_selection_survives_when_listed() {
        let models = Arc::new(MockModels::with_ids(&["a", "b", "c"]));
        let selection = Arc::new(MemorySelection::default());
        selection.save("b").await.unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);

        let handle = spawn(
            models,
            selection.clone(),
            "a".into(),
            EventSink::new(WorkerName::Registry, events_tx),
            shutdown_tx.subscribe(),
            4,
        );

        assert_eq!(
            next_event(&mut events_rx).await,
            WorkerEvent::ModelSelected { model_id: "b".into() }
        );
        assert_eq!(handle.snapshot().state, RegistryState::Ready);

        handle
            .send(RegistryCommand::Select { model_id: "c".into() })
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut events_rx).await,
            WorkerEvent::ModelSelected { model_id: "c".into() }
        );
        assert_eq!(selection.load().await.unwrap().as_deref(), Some("c"));

        let _ = shutdown_tx.send(());
        handle.join().await;
    }

    #[tokio::test]
    async fn test_unknown_saved_selection_falls_back_to_default() {
        let models = Arc::new(MockModels::with_ids(&["a", "b"]));
        let selection = Arc::new(MemorySelection::default());
        selection.save("retired").await.unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);

        let handle = spawn(
            models,
            selection,
            "b".into(),
            EventSink::new(WorkerName::Registry, events_tx),
            shutdown_tx.subscribe(),
            4,
        );

        assert_eq!(
            next_event(&mut events_rx).await,
            WorkerEvent::ModelSelected { model_id: "b".into() }
        );

        handle
            .send(RegistryCommand::Select { model_id: "zzz".into() })
            .await
            .unwrap();
        assert!(matches!(next_event(&mut events_rx).await, WorkerEvent::Error { .. }));
        assert_eq!(handle.snapshot().selected.as_deref(), Some("b"));

        let _ = shutdown_tx.send(());
        handle.join().await;
    }

    #[tokio::test]
    async fn test_failed_listing_keeps_default_and_refresh_recovers() {
        let models = Arc::new(MockModels::with_ids(&["a"]));
        models.fail.store(true, Ordering::SeqCst);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);

        let handle = spawn(
            models.clone(),
            Arc::new(MemorySelection::default()),
            "a".into(),
            EventSink::new(WorkerName::Registry, events_tx),
            shutdown_tx.subscribe(),
            4,
        );

        assert!(matches!(next_event(&mut events_rx).await, WorkerEvent::Error { .. }));
        assert_eq!(
            next_event(&mut events_rx).await,
            WorkerEvent::ModelSelected { model_id: "a".into() }
        );
        assert_eq!(handle.snapshot().state, RegistryState::Failed);

        models.fail.store(false, Ordering::SeqCst);
        handle.send(RegistryCommand::Refresh).await.unwrap();
        match next_event(&mut events_rx).await {
            WorkerEvent::Line { text, .. } => assert_eq!(text, "1 models available:"),
            other => panic!("Expected model list, got {:?}", other),
        }
        assert!(handle.snapshot().model_lines()[1].starts_with(" * a"));

        let _ = shutdown_tx.send(());
        handle.join().await;
    }
}
