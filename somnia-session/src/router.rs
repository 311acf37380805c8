use somnia_core::command::{help_lines, Command};
use somnia_core::SomniaConfig;

use crate::supervisor::{SessionContext, SessionOutput, SessionState};
use crate::workers::dream::DreamCommand;
use crate::workers::funding::{FundingCommand, FundingState};
use crate::workers::identity::{describe_identity, IdentityCommand};
use crate::workers::registry::RegistryCommand;
use crate::workers::{WorkerGone, WorkerTable};

/// What the supervisor should do after a command ran.
#[derive(Debug, Default, PartialEq)]
pub struct RouteOutcome {
    pub outputs: Vec<SessionOutput>,
    pub enter_dream: bool,
    pub exit: bool,
}

impl RouteOutcome {
    fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            outputs: lines.into_iter().map(|l| SessionOutput::Line(l.into())).collect(),
            ..Self::default()
        }
    }

    fn error(text: impl Into<String>) -> Self {
        Self {
            outputs: vec![SessionOutput::Error(text.into())],
            ..Self::default()
        }
    }

    fn sent(result: Result<(), WorkerGone>, ack: Option<String>) -> Self {
        match result {
            Ok(()) => Self::lines(ack),
            Err(e) => {
                tracing::error!(error = %e, "Command not delivered");
                Self::error(e.to_string())
            }
        }
    }
}

/// Run one resolved command against the session.
pub async fn dispatch(
    command: Command,
    state: SessionState,
    ctx: &mut SessionContext,
    workers: &WorkerTable,
    config: &SomniaConfig,
) -> RouteOutcome {
    match command {
        Command::Help { topic } => RouteOutcome::lines(help_lines(topic.as_deref())),
        Command::Clear => RouteOutcome {
            outputs: vec![SessionOutput::Clear],
            ..RouteOutcome::default()
        },
        Command::History => {
            let entries = ctx.history.entries();
            if entries.is_empty() {
                return RouteOutcome::lines(["No history yet."]);
            }
            RouteOutcome::lines(
                entries
                    .iter()
                    .enumerate()
                    .map(|(i, entry)| format!("{:>4}  {}", i + 1, entry)),
            )
        }
        Command::Dream => {
            if workers.funding.snapshot().state == FundingState::NotInitialized {
                return RouteOutcome::error(
                    "Compute account not initialized. Use 'fund <amount>' before dreaming.",
                );
            }
            let model_id = ctx
                .selected_model
                .clone()
                .unwrap_or_else(|| config.inference.default_model.clone());
            match workers.dream.send(DreamCommand::Start { model_id }).await {
                Ok(()) => {
                    ctx.workflow_status = Some("dream: awaiting input".to_string());
                    RouteOutcome {
                        enter_dream: true,
                        ..RouteOutcome::default()
                    }
                }
                Err(e) => RouteOutcome::error(e.to_string()),
            }
        }
        Command::Status => {
            let mut lines = vec![format!(
                "session: {} (model {})",
                state,
                ctx.selected_model.as_deref().unwrap_or("none")
            )];
            if let Some(status) = &ctx.workflow_status {
                lines.push(format!("last dream: {}", status));
            }
            lines.extend(workers.status_lines());
            RouteOutcome::lines(lines)
        }
        Command::Fund { amount } => RouteOutcome::sent(
            workers.funding.send(FundingCommand::Fund { amount }).await,
            Some(format!("Funding compute account with {}...", amount)),
        ),
        Command::Balance => RouteOutcome::sent(workers.funding.send(FundingCommand::Check).await, None),
        Command::Models { refresh: true } => RouteOutcome::sent(
            workers.registry.send(RegistryCommand::Refresh).await,
            Some("Refreshing model list...".to_string()),
        ),
        Command::Models { refresh: false } => RouteOutcome::lines(workers.registry.snapshot().model_lines()),
        Command::Model { id } => RouteOutcome::sent(
            workers.registry.send(RegistryCommand::Select { model_id: id }).await,
            None,
        ),
        Command::Sync => RouteOutcome::sent(
            workers.identity.send(IdentityCommand::Sync { announce: true }).await,
            Some("Syncing identity...".to_string()),
        ),
        Command::Identity => {
            let snapshot = workers.identity.snapshot();
            match &snapshot.memory {
                Some(memory) => RouteOutcome::lines(describe_identity(&config.identity.agent_name, memory)),
                None => RouteOutcome::lines([format!(
                    "Identity not synced yet ({}). Try 'sync'.",
                    snapshot.describe()
                )]),
            }
        }
        Command::Exit => RouteOutcome {
            outputs: vec![SessionOutput::Line("Goodbye.".to_string())],
            exit: true,
            ..RouteOutcome::default()
        },
    }
}
