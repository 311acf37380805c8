//! Dream worker: runs the dream sub-workflow on its own task.

use tokio::sync::{broadcast, mpsc, watch};

use somnia_core::models::PersistenceStage;

use super::{EventSink, WorkerEvent, WorkerHandle, WorkerName};
use crate::subsystems::context::PublishedHead;
use crate::subsystems::dream::{DreamState, DreamWorkflow, Reply, StepOutcome};

#[derive(Debug, Clone, PartialEq)]
pub enum DreamCommand {
    Start { model_id: String },
    Input(String),
    Cancel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DreamSnapshot {
    pub state: DreamState,
    pub model_id: Option<String>,
    pub head: Option<PublishedHead>,
}

impl Default for DreamSnapshot {
    fn default() -> Self {
        Self {
            state: DreamState::Idle,
            model_id: None,
            head: None,
        }
    }
}

impl DreamSnapshot {
    pub fn describe(&self) -> String {
        match &self.head {
            Some(head) => format!("{} (last stored #{} at {})", self.state, head.count, head.content_address),
            None => self.state.to_string(),
        }
    }
}

pub fn spawn(
    workflow: DreamWorkflow,
    events: EventSink,
    shutdown: broadcast::Receiver<()>,
    buffer: usize,
) -> WorkerHandle<DreamCommand, DreamSnapshot> {
    let (command_tx, command_rx) = mpsc::channel(buffer);
    let (snapshot_tx, snapshot_rx) = watch::channel(DreamSnapshot::default());
    let task = tokio::spawn(run_dream_worker(
        workflow,
        command_rx,
        snapshot_tx,
        events,
        shutdown,
    ));
    WorkerHandle::new(WorkerName::Dream, command_tx, snapshot_rx, task)
}

async fn run_dream_worker(
    mut workflow: DreamWorkflow,
    mut commands: mpsc::Receiver<DreamCommand>,
    snapshot: watch::Sender<DreamSnapshot>,
    events: EventSink,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!("Dream worker started");

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                let mut last_busy: Option<DreamState> = None;
                let outcome = {
                    let mut observer = |state: &DreamState| {
                        if state.is_busy() {
                            last_busy = Some(state.clone());
                        }
                        publish_state(&snapshot, &events, state);
                    };
                    match command {
                        DreamCommand::Start { model_id } => workflow.start(model_id, &mut observer),
                        DreamCommand::Input(line) => workflow.handle_input(&line, &mut observer).await,
                        DreamCommand::Cancel => workflow.cancel(&mut observer),
                    }
                };
                // Anything queued during a busy step was sent before its result was shown.
                let stale = match &last_busy {
                    Some(_) => drain_queued(&mut commands),
                    None => Vec::new(),
                };
                snapshot.send_modify(|s| {
                    s.model_id = workflow.model_id().map(str::to_string);
                    s.head = workflow.head().cloned();
                });
                report(&events, outcome).await;
                if let Some(busy) = &last_busy {
                    for command in stale {
                        tracing::debug!(?command, state = %busy, "Rejected command queued while busy");
                        events.error(rejection(&command, busy)).await;
                    }
                }

                if workflow.state().is_finished() {
                    events.send(WorkerEvent::DreamFinished).await;
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Dream worker shutting down");
                break;
            }
        }
    }
}

fn drain_queued(commands: &mut mpsc::Receiver<DreamCommand>) -> Vec<DreamCommand> {
    let mut stale = Vec::new();
    while let Ok(command) = commands.try_recv() {
        stale.push(command);
    }
    stale
}

fn rejection(command: &DreamCommand, busy: &DreamState) -> String {
    let activity = if busy.is_persisting() {
        "being saved"
    } else {
        "being analyzed"
    };
    match command {
        DreamCommand::Input(line) => format!(
            "Ignored \"{}\": it was sent while your dream was {}.",
            line.trim(),
            activity
        ),
        DreamCommand::Cancel => format!("Cancel ignored: it was sent while your dream was {}.", activity),
        DreamCommand::Start { .. } => format!("A dream is already in progress ({}).", busy),
    }
}

/// Publish a state change; a repeated state is not announced twice.
fn publish_state(snapshot: &watch::Sender<DreamSnapshot>, events: &EventSink, state: &DreamState) {
    let changed = snapshot.send_if_modified(|s| {
        if s.state == *state {
            return false;
        }
        s.state = state.clone();
        true
    });
    if !changed {
        return;
    }
    if let DreamState::Persisting(stage) = state {
        let text = match stage {
            PersistenceStage::Validating => Some("Validating dream data..."),
            PersistenceStage::Merging => Some("Merging into the dream log..."),
            PersistenceStage::Uploading => Some("Uploading to storage..."),
            PersistenceStage::Committing => Some("Recording on the ledger..."),
            PersistenceStage::Done | PersistenceStage::Failed => None,
        };
        if let Some(text) = text {
            events.try_line(text);
        }
    }
}

async fn report(events: &EventSink, outcome: StepOutcome) {
    if let Some(result) = &outcome.persisted {
        events
            .send(WorkerEvent::DreamPersisted {
                record_id: result.record_id,
                status: result.status,
            })
            .await;
    }
    for reply in outcome.replies {
        match reply {
            Reply::Line(text) => events.line(text).await,
            Reply::Error(text) => events.error(text).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_stage_is_announced_once() {
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let events = EventSink::new(WorkerName::Dream, events_tx);
        let (snapshot, _rx) = watch::channel(DreamSnapshot::default());

        let validating = DreamState::Persisting(PersistenceStage::Validating);
        publish_state(&snapshot, &events, &validating);
        publish_state(&snapshot, &events, &validating);
        publish_state(&snapshot, &events, &DreamState::Persisting(PersistenceStage::Merging));
        drop(events);

        let mut lines = Vec::new();
        while let Some(event) = events_rx.recv().await {
            if let WorkerEvent::Line { text, .. } = event {
                lines.push(text);
            }
        }
        assert_eq!(lines, ["Validating dream data...", "Merging into the dream log..."]);
        assert_eq!(snapshot.borrow().state, DreamState::Persisting(PersistenceStage::Merging));
    }

    #[test]
    fn test_rejection_names_what_was_running() {
        let saving = DreamState::Persisting(PersistenceStage::Uploading);
        let text = rejection(&DreamCommand::Input(" yes ".into()), &saving);
        assert_eq!(text, "Ignored \"yes\": it was sent while your dream was being saved.");

        let text = rejection(&DreamCommand::Cancel, &DreamState::Analyzing);
        assert!(text.contains("being analyzed"), "{}", text);
    }
}
