//! Session supervisor
//!
//! Top-level state machine: `uninitialized -> idle <-> processing <->
//! dreamWorkflow`. Owns the input buffer and command history, spawns the
//! workers once, routes parsed commands, and turns worker events into
//! session output. It never shares mutable state with a worker; everything
//! goes through the supervision table.

use std::fmt;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use somnia_core::command::{parse_line, resolve};
use somnia_core::SomniaConfig;

use crate::router;
use crate::workers::dream::DreamCommand;
use crate::workers::identity::IdentityCommand;
use crate::workers::{spawn_workers, Collaborators, WorkerEvent, WorkerTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Idle,
    Processing,
    DreamWorkflow,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Idle => "idle",
            SessionState::Processing => "processing",
            SessionState::DreamWorkflow => "dream workflow",
        };
        f.write_str(s)
    }
}

/// One unit of output for the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutput {
    Line(String),
    Error(String),
    Clear,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session is already initialized")]
    AlreadyInitialized,
}

// ============================================================================
// Command history
// ============================================================================

/// Bounded, de-duplicated command history with a navigation cursor.
///
/// Navigation only moves the cursor; the entry list changes on `push` alone.
#[derive(Debug, Clone)]
pub struct CommandHistory {
    entries: Vec<String>,
    limit: usize,
    cursor: Option<usize>,
}

impl CommandHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            limit: limit.max(1),
            cursor: None,
        }
    }

    /// Append a line, moving an existing copy to the end.
    pub fn push(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.entries.retain(|e| e != line);
        self.entries.push(line.to_string());
        if self.entries.len() > self.limit {
            let excess = self.entries.len() - self.limit;
            self.entries.drain(..excess);
        }
        self.cursor = None;
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    /// Step back to an older entry; stays on the oldest.
    pub fn prev(&mut self) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let index = match self.cursor {
            None => self.entries.len() - 1,
            Some(i) => i.saturating_sub(1),
        };
        self.cursor = Some(index);
        self.entries.get(index).map(String::as_str)
    }

    /// Step forward; past the newest entry the cursor resets.
    pub fn next(&mut self) -> Option<&str> {
        match self.cursor {
            Some(i) if i + 1 < self.entries.len() => {
                self.cursor = Some(i + 1);
                self.entries.get(i + 1).map(String::as_str)
            }
            _ => {
                self.cursor = None;
                None
            }
        }
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = None;
    }
}

/// State owned exclusively by the supervisor.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub input: String,
    pub history: CommandHistory,
    pub initialized: bool,
    pub selected_model: Option<String>,
    pub workflow_status: Option<String>,
}

impl SessionContext {
    pub fn new(history_limit: usize) -> Self {
        Self {
            input: String::new(),
            history: CommandHistory::new(history_limit),
            initialized: false,
            selected_model: None,
            workflow_status: None,
        }
    }
}

// ============================================================================
// Supervisor
// ============================================================================

pub struct Supervisor {
    config: SomniaConfig,
    state: SessionState,
    context: SessionContext,
    workers: Option<WorkerTable>,
    shutdown: Option<broadcast::Sender<()>>,
    exit_requested: bool,
}

impl Supervisor {
    pub fn new(config: SomniaConfig) -> Self {
        let context = SessionContext::new(config.service.history_limit);
        Self {
            config,
            state: SessionState::Uninitialized,
            context,
            workers: None,
            shutdown: None,
            exit_requested: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn workers(&self) -> Option<&WorkerTable> {
        self.workers.as_ref()
    }

    /// Spawn the workers and enter `idle`. Only ever done once.
    pub fn initialize(
        &mut self,
        deps: Collaborators,
        events: mpsc::Sender<WorkerEvent>,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<(), SessionError> {
        if self.context.initialized {
            return Err(SessionError::AlreadyInitialized);
        }
        self.workers = Some(spawn_workers(&self.config, deps, events, shutdown));
        self.shutdown = Some(shutdown.clone());
        self.context.initialized = true;
        self.context.selected_model = Some(self.config.inference.default_model.clone());
        self.transition(SessionState::Idle);
        Ok(())
    }

    /// The prompt to show, when the session is waiting for a command.
    pub fn prompt(&self) -> Option<&str> {
        (self.state == SessionState::Idle).then_some(self.config.service.prompt.as_str())
    }

    pub fn is_finished(&self) -> bool {
        self.exit_requested
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            tracing::debug!(from = %self.state, to = %next, "Session transition");
            self.state = next;
        }
    }

    // ------------------------------------------------------------------------
    // Input editing
    // ------------------------------------------------------------------------

    pub fn insert_char(&mut self, c: char) {
        self.context.input.push(c);
    }

    pub fn backspace(&mut self) {
        self.context.input.pop();
    }

    pub fn history_prev(&mut self) {
        if let Some(entry) = self.context.history.prev() {
            self.context.input = entry.to_string();
        }
    }

    pub fn history_next(&mut self) {
        self.context.input = self.context.history.next().unwrap_or_default().to_string();
    }

    /// Submit the input buffer.
    pub async fn submit(&mut self) -> Vec<SessionOutput> {
        let line = std::mem::take(&mut self.context.input);
        self.context.history.reset_cursor();
        self.submit_line(&line).await
    }

    // ------------------------------------------------------------------------
    // Line handling
    // ------------------------------------------------------------------------

    /// Submit one line. While a command is being dispatched the session is
    /// `processing` and takes no further input.
    pub async fn submit_line(&mut self, line: &str) -> Vec<SessionOutput> {
        match self.state {
            SessionState::Uninitialized => {
                vec![SessionOutput::Error("Session is not initialized".to_string())]
            }
            SessionState::Processing => {
                vec![SessionOutput::Error("Still processing the previous command".to_string())]
            }
            SessionState::DreamWorkflow => self.forward_to_dream(line).await,
            SessionState::Idle => self.run_command(line).await,
        }
    }

    async fn run_command(&mut self, line: &str) -> Vec<SessionOutput> {
        if line.trim().is_empty() {
            return Vec::new();
        }
        self.context.history.push(line);

        let Some(parsed) = parse_line(line) else {
            return Vec::new();
        };
        let command = match resolve(&parsed) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(line, error = %e, "Command rejected");
                return vec![SessionOutput::Error(e.to_string())];
            }
        };
        if self.workers.is_none() {
            return vec![SessionOutput::Error("Session is not initialized".to_string())];
        }

        tracing::debug!(?command, "Dispatching command");
        self.transition(SessionState::Processing);
        let workers = self.workers.as_ref().expect("workers checked above");
        let outcome =
            router::dispatch(command, self.state, &mut self.context, workers, &self.config).await;

        if outcome.enter_dream {
            self.transition(SessionState::DreamWorkflow);
        } else {
            self.transition(SessionState::Idle);
        }
        if outcome.exit {
            self.exit_requested = true;
        }
        outcome.outputs
    }

    async fn forward_to_dream(&mut self, line: &str) -> Vec<SessionOutput> {
        let Some(workers) = self.workers.as_ref() else {
            return vec![SessionOutput::Error("Session is not initialized".to_string())];
        };

        let command = if line.trim().eq_ignore_ascii_case("cancel") {
            DreamCommand::Cancel
        } else {
            let snapshot = workers.dream.snapshot();
            if snapshot.state.is_persisting() {
                return vec![SessionOutput::Error(
                    "Your dream is being saved, please wait.".to_string(),
                )];
            }
            if snapshot.state.is_busy() {
                return vec![SessionOutput::Error(format!(
                    "Still working on your dream ({}), please wait.",
                    snapshot.state
                ))];
            }
            DreamCommand::Input(line.to_string())
        };

        if let Err(e) = workers.dream.send(command).await {
            tracing::error!(error = %e, "Dream worker unreachable");
            self.context.workflow_status = None;
            self.transition(SessionState::Idle);
            return vec![SessionOutput::Error(e.to_string())];
        }
        Vec::new()
    }

    // ------------------------------------------------------------------------
    // Worker events
    // ------------------------------------------------------------------------

    pub async fn handle_event(&mut self, event: WorkerEvent) -> Vec<SessionOutput> {
        match event {
            WorkerEvent::Line { text, .. } => vec![SessionOutput::Line(text)],
            WorkerEvent::Error { worker, text } => {
                tracing::debug!(%worker, error = %text, "Worker reported an error");
                vec![SessionOutput::Error(text)]
            }
            WorkerEvent::ModelSelected { model_id } => {
                tracing::debug!(model = %model_id, "Model selection changed");
                self.context.selected_model = Some(model_id);
                Vec::new()
            }
            WorkerEvent::DreamPersisted { record_id, status } => {
                tracing::info!(?record_id, %status, "Dream persisted, refreshing identity");
                self.context.workflow_status = Some(match record_id {
                    Some(id) => format!("dream #{}: {}", id, status),
                    None => format!("dream: {}", status),
                });
                if let Some(workers) = &self.workers {
                    if let Err(e) = workers
                        .identity
                        .send(IdentityCommand::Sync { announce: false })
                        .await
                    {
                        tracing::warn!(error = %e, "Identity refresh after dream skipped");
                    }
                }
                Vec::new()
            }
            WorkerEvent::DreamFinished => {
                if self.state == SessionState::DreamWorkflow {
                    self.context.workflow_status = None;
                    self.transition(SessionState::Idle);
                }
                Vec::new()
            }
        }
    }

    /// Stop every worker and wait for them.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(workers) = self.workers.take() {
            workers.join_all().await;
        }
        tracing::info!("Session closed");
        self.context.initialized = false;
        self.state = SessionState::Uninitialized;
    }
}
