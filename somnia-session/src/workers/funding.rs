//! Funding-ledger worker
//!
//! `uninitialized -> checking -> initialized | notInitialized -> funding ->
//! initialized`. The first funding creates the compute account, later ones
//! deposit into it. A failed call returns to the state before it.

use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};

use somnia_core::ledger::{FundingAccount, FundingLedger};
use somnia_core::SomniaConfig;

use super::{EventSink, WorkerHandle, WorkerName};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingState {
    Uninitialized,
    Checking,
    Initialized,
    NotInitialized,
    Funding,
}

impl fmt::Display for FundingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FundingState::Uninitialized => "uninitialized",
            FundingState::Checking => "checking",
            FundingState::Initialized => "initialized",
            FundingState::NotInitialized => "not initialized",
            FundingState::Funding => "funding",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FundingCommand {
    Check,
    Fund { amount: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FundingSnapshot {
    pub state: FundingState,
    pub balance: Option<f64>,
    pub last_error: Option<String>,
}

impl Default for FundingSnapshot {
    fn default() -> Self {
        Self {
            state: FundingState::Uninitialized,
            balance: None,
            last_error: None,
        }
    }
}

impl FundingSnapshot {
    pub fn describe(&self) -> String {
        match (self.balance, &self.last_error) {
            (Some(balance), _) => format!("{} (balance {})", self.state, balance),
            (None, Some(e)) => format!("{} (last error: {})", self.state, e),
            (None, None) => self.state.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FundingSettings {
    pub owner: String,
    pub minimum_balance: f64,
}

impl FundingSettings {
    pub fn from_config(config: &SomniaConfig) -> Self {
        Self {
            owner: config.identity.owner.clone(),
            minimum_balance: config.workers.funding_minimum_balance,
        }
    }
}

struct FundingWorker {
    ledger: Arc<dyn FundingLedger>,
    settings: FundingSettings,
    snapshot: watch::Sender<FundingSnapshot>,
    events: EventSink,
}

pub fn spawn(
    ledger: Arc<dyn FundingLedger>,
    settings: FundingSettings,
    events: EventSink,
    shutdown: broadcast::Receiver<()>,
    buffer: usize,
) -> WorkerHandle<FundingCommand, FundingSnapshot> {
    let (command_tx, command_rx) = mpsc::channel(buffer);
    let (snapshot_tx, snapshot_rx) = watch::channel(FundingSnapshot::default());
    let worker = FundingWorker {
        ledger,
        settings,
        snapshot: snapshot_tx,
        events,
    };
    let task = tokio::spawn(worker.run(command_rx, shutdown));
    WorkerHandle::new(WorkerName::Funding, command_tx, snapshot_rx, task)
}

impl FundingWorker {
    async fn run(self, mut commands: mpsc::Receiver<FundingCommand>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(owner = %self.settings.owner, "Funding worker started");
        self.check(false).await;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(FundingCommand::Check) => self.check(true).await,
                    Some(FundingCommand::Fund { amount }) => self.fund(amount).await,
                    None => break,
                },
                _ = shutdown.recv() => {
                    tracing::info!("Funding worker shutting down");
                    break;
                }
            }
        }
    }

    fn state(&self) -> FundingState {
        self.snapshot.borrow().state
    }

    fn set_state(&self, state: FundingState) {
        tracing::debug!(%state, "Funding worker transition");
        self.snapshot.send_modify(|s| s.state = state);
    }

    fn settle(&self, account: &FundingAccount) {
        self.snapshot.send_modify(|s| {
            s.state = FundingState::Initialized;
            s.balance = Some(account.balance);
            s.last_error = None;
        });
    }

    async fn check(&self, announce: bool) {
        let previous = self.state();
        self.set_state(FundingState::Checking);

        match self.ledger.account(&self.settings.owner).await {
            Ok(Some(account)) => {
                self.settle(&account);
                if announce {
                    self.events.line(format!("Compute balance: {}", account.balance)).await;
                }
                self.warn_if_low(account.balance).await;
            }
            Ok(None) => {
                self.snapshot.send_modify(|s| {
                    s.state = FundingState::NotInitialized;
                    s.balance = None;
                    s.last_error = None;
                });
                self.events
                    .line("Compute account not initialized. Use 'fund <amount>' to create it.")
                    .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Funding check failed");
                self.snapshot.send_modify(|s| {
                    s.state = previous;
                    s.last_error = Some(e.to_string());
                });
                self.events.error(format!("Balance check failed: {}", e)).await;
            }
        }
    }

    async fn fund(&self, amount: f64) {
        let previous = self.state();
        if previous == FundingState::Checking || previous == FundingState::Funding {
            self.events.error("Funding is busy, try again shortly.").await;
            return;
        }
        self.set_state(FundingState::Funding);

        let exists = match previous {
            FundingState::Initialized => Ok(true),
            FundingState::NotInitialized => Ok(false),
            _ => self
                .ledger
                .account(&self.settings.owner)
                .await
                .map(|a| a.is_some()),
        };

        let result = match exists {
            Ok(true) => self.ledger.deposit(&self.settings.owner, amount).await,
            Ok(false) => self.ledger.create_account(&self.settings.owner, amount).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(account) => {
                tracing::info!(amount, balance = account.balance, "Compute account funded");
                self.settle(&account);
                self.events
                    .line(format!("Added {}; compute balance is now {}", amount, account.balance))
                    .await;
            }
            Err(e) => {
                tracing::warn!(amount, error = %e, "Funding failed");
                self.snapshot.send_modify(|s| {
                    s.state = previous;
                    s.last_error = Some(e.to_string());
                });
                self.events.error(format!("Funding failed: {}", e)).await;
            }
        }
    }

    async fn warn_if_low(&self, balance: f64) {
        if balance < self.settings.minimum_balance {
            self.events
                .line(format!(
                    "Compute balance {} is below {}. Use 'fund <amount>' to top up.",
                    balance, self.settings.minimum_balance
                ))
                .await;
        }
    }
}
