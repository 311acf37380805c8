//! Identity-sync worker
//!
//! Keeps a copy of the agent's ledger memory. Syncs at start, on the
//! configured interval, on `sync`, and after every persisted dream.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;

use somnia_core::ledger::Ledger;
use somnia_core::models::AgentMemory;
use somnia_core::SomniaConfig;

use super::{EventSink, WorkerHandle, WorkerName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    Uninitialized,
    Syncing,
    Synced,
    Failed,
}

impl fmt::Display for IdentityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IdentityState::Uninitialized => "uninitialized",
            IdentityState::Syncing => "syncing",
            IdentityState::Synced => "synced",
            IdentityState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityCommand {
    /// `announce` reports the result to the user.
    Sync { announce: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentitySnapshot {
    pub state: IdentityState,
    pub memory: Option<AgentMemory>,
    pub last_synced: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for IdentitySnapshot {
    fn default() -> Self {
        Self {
            state: IdentityState::Uninitialized,
            memory: None,
            last_synced: None,
            last_error: None,
        }
    }
}

impl IdentitySnapshot {
    pub fn describe(&self) -> String {
        match (&self.memory, self.last_synced) {
            (Some(memory), Some(at)) => format!(
                "{} ({} dreams, synced {})",
                self.state,
                memory.dream_count,
                at.format("%H:%M:%S")
            ),
            _ => match &self.last_error {
                Some(e) => format!("{} ({})", self.state, e),
                None => self.state.to_string(),
            },
        }
    }
}

/// Lines describing an agent's memory as last seen on the ledger.
pub fn describe_identity(agent_name: &str, memory: &AgentMemory) -> Vec<String> {
    let mut lines = vec![
        format!("{} (identity #{})", agent_name, memory.identity_id),
        format!("Dreams recorded: {}", memory.dream_count),
        format!(
            "Dream log: {}",
            memory.content_address.as_deref().unwrap_or("none yet")
        ),
        format!("Traits: {}", memory.traits.describe()),
    ];
    if memory.capabilities.is_empty() {
        lines.push("Capabilities: none".to_string());
    } else {
        lines.push(format!("Capabilities: {}", memory.capabilities.join(", ")));
    }
    let next = memory.dream_count + 1;
    let until = (5 - next % 5) % 5;
    if until == 0 {
        lines.push("The next dream is an evolution dream.".to_string());
    } else {
        lines.push(format!("Next evolution in {} dreams.", until + 1));
    }
    lines
}

#[derive(Debug, Clone)]
pub struct IdentitySettings {
    pub identity_id: u64,
    pub agent_name: String,
    pub interval: Duration,
}

impl IdentitySettings {
    pub fn from_config(config: &SomniaConfig) -> Self {
        Self {
            identity_id: config.identity.agent_id,
            agent_name: config.identity.agent_name.clone(),
            interval: Duration::from_secs(config.workers.identity_sync_interval_seconds.max(1)),
        }
    }
}

struct IdentityWorker {
    ledger: Arc<dyn Ledger>,
    settings: IdentitySettings,
    snapshot: watch::Sender<IdentitySnapshot>,
    events: EventSink,
}

pub fn spawn(
    ledger: Arc<dyn Ledger>,
    settings: IdentitySettings,
    events: EventSink,
    shutdown: broadcast::Receiver<()>,
    buffer: usize,
) -> WorkerHandle<IdentityCommand, IdentitySnapshot> {
    let (command_tx, command_rx) = mpsc::channel(buffer);
    let (snapshot_tx, snapshot_rx) = watch::channel(IdentitySnapshot::default());
    let worker = IdentityWorker {
        ledger,
        settings,
        snapshot: snapshot_tx,
        events,
    };
    let task = tokio::spawn(worker.run(command_rx, shutdown));
    WorkerHandle::new(WorkerName::IdentitySync, command_tx, snapshot_rx, task)
}

impl IdentityWorker {
    async fn run(self, mut commands: mpsc::Receiver<IdentityCommand>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            identity = self.settings.identity_id,
            interval_secs = self.settings.interval.as_secs(),
            "Identity sync worker started"
        );

        // The first tick completes immediately.
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sync(false).await,
                command = commands.recv() => match command {
                    Some(IdentityCommand::Sync { announce }) => {
                        self.sync(announce).await;
                        ticker.reset();
                    }
                    None => break,
                },
                _ = shutdown.recv() => {
                    tracing::info!("Identity sync worker shutting down");
                    break;
                }
            }
        }
    }

    async fn sync(&self, announce: bool) {
        self.snapshot.send_modify(|s| s.state = IdentityState::Syncing);

        match self.ledger.read_memory(self.settings.identity_id).await {
            Ok(memory) => {
                tracing::debug!(
                    dreams = memory.dream_count,
                    address = ?memory.content_address,
                    "Identity synced"
                );
                if announce {
                    for line in describe_identity(&self.settings.agent_name, &memory) {
                        self.events.line(line).await;
                    }
                }
                self.snapshot.send_modify(|s| {
                    s.state = IdentityState::Synced;
                    s.memory = Some(memory);
                    s.last_synced = Some(Utc::now());
                    s.last_error = None;
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Identity sync failed");
                self.snapshot.send_modify(|s| {
                    s.state = IdentityState::Failed;
                    s.last_error = Some(e.to_string());
                });
                if announce {
                    self.events.error(format!("Identity sync failed: {}", e)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLedger;
    use crate::workers::WorkerEvent;
    use std::sync::atomic::Ordering;

    fn settings(interval: Duration) -> IdentitySettings {
        IdentitySettings {
            identity_id: 7,
            agent_name: "Morpheus".into(),
            interval,
        }
    }

    async fn wait_for(
        handle: &WorkerHandle<IdentityCommand, IdentitySnapshot>,
        state: IdentityState,
    ) -> IdentitySnapshot {
        let mut rx = handle.watch();
        let snapshot = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.state == state))
            .await
            .expect("state reached in time")
            .expect("worker alive")
            .clone();
        snapshot
    }

    #[test]
    fn test_describe_identity_counts_down_to_evolution() {
        let memory = AgentMemory {
            identity_id: 7,
            dream_count: 4,
            ..AgentMemory::default()
        };
        let lines = describe_identity("Morpheus", &memory);
        assert_eq!(lines[0], "Morpheus (identity #7)");
        assert_eq!(lines.last().unwrap(), "The next dream is an evolution dream.");

        let memory = AgentMemory {
            dream_count: 5,
            ..memory
        };
        assert_eq!(
            describe_identity("Morpheus", &memory).last().unwrap(),
            "Next evolution in 5 dreams."
        );
    }

    #[tokio::test]
    async fn test_syncs_at_start_and_on_command() {
        let ledger = Arc::new(MockLedger::with_count(7, 3));
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = spawn(
            ledger.clone(),
            settings(Duration::from_secs(3600)),
            EventSink::new(WorkerName::IdentitySync, events_tx),
            shutdown_tx.subscribe(),
            4,
        );

        let snapshot = wait_for(&handle, IdentityState::Synced).await;
        assert_eq!(snapshot.memory.map(|m| m.dream_count), Some(3));
        assert_eq!(ledger.reads.load(Ordering::SeqCst), 1);

        handle
            .send(IdentityCommand::Sync { announce: true })
            .await
            .unwrap();
        match events_rx.recv().await {
            Some(WorkerEvent::Line { text, .. }) => assert_eq!(text, "Morpheus (identity #7)"),
            other => panic!("Expected identity line, got {:?}", other),
        }
        assert_eq!(ledger.reads.load(Ordering::SeqCst), 2);

        let _ = shutdown_tx.send(());
        handle.join().await;
    }

    #[tokio::test]
    async fn test_failed_sync_is_silent_unless_announced() {
        let ledger = Arc::new(MockLedger::with_count(7, 0));
        ledger.failing_reads.store(2, Ordering::SeqCst);
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = spawn(
            ledger.clone(),
            settings(Duration::from_secs(3600)),
            EventSink::new(WorkerName::IdentitySync, events_tx),
            shutdown_tx.subscribe(),
            4,
        );

        let snapshot = wait_for(&handle, IdentityState::Failed).await;
        assert!(snapshot.last_error.is_some());
        assert!(events_rx.try_recv().is_err());

        handle
            .send(IdentityCommand::Sync { announce: true })
            .await
            .unwrap();
        assert!(matches!(events_rx.recv().await, Some(WorkerEvent::Error { .. })));

        handle
            .send(IdentityCommand::Sync { announce: false })
            .await
            .unwrap();
        wait_for(&handle, IdentityState::Synced).await;

        let _ = shutdown_tx.send(());
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_triggers_periodic_sync() {
        let ledger = Arc::new(MockLedger::with_count(7, 0));
        let (events_tx, _events_rx) = mpsc::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);
        let handle = spawn(
            ledger.clone(),
            settings(Duration::from_secs(60)),
            EventSink::new(WorkerName::IdentitySync, events_tx),
            shutdown_tx.subscribe(),
            4,
        );

        wait_for(&handle, IdentityState::Synced).await;
        tokio::time::sleep(Duration::from_secs(125)).await;
        assert!(ledger.reads.load(Ordering::SeqCst) >= 3);

        let _ = shutdown_tx.send(());
        handle.join().await;
    }
}
