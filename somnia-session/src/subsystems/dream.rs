//! Dream sub-workflow
//!
//! One cycle: `idle -> awaitingInput -> fetchingContext -> buildingPrompt ->
//! analyzing -> awaitingConfirmation -> persisting -> completed | error`.
//! The workflow is driven by the dream worker; every transition is reported
//! through an observer so the worker can publish it.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use somnia_core::analysis::{parse_response, ParsedResponse};
use somnia_core::config::{ContextConfig, SomniaConfig};
use somnia_core::inference::{InferenceError, InferenceGateway, InferenceRequest};
use somnia_core::ledger::Ledger;
use somnia_core::models::{PersistenceResult, PersistenceStage, PersistenceStatus};
use somnia_core::storage::ContentStore;

use super::context::{build_prompt, fetch_context, PublishedHead};
use super::orchestrator::{PersistencePipeline, PersistenceRequest};

#[derive(Debug, Clone, PartialEq)]
pub enum DreamState {
    Idle,
    AwaitingInput,
    FetchingContext,
    BuildingPrompt,
    Analyzing,
    AwaitingConfirmation,
    Persisting(PersistenceStage),
    Completed,
    Error(String),
}

impl DreamState {
    /// Working on something; user input cannot be taken right now.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            DreamState::FetchingContext
                | DreamState::BuildingPrompt
                | DreamState::Analyzing
                | DreamState::Persisting(_)
        )
    }

    pub fn is_persisting(&self) -> bool {
        matches!(self, DreamState::Persisting(_))
    }

    /// The cycle is over; a new one may start.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            DreamState::Idle | DreamState::Completed | DreamState::Error(_)
        )
    }
}

impl fmt::Display for DreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DreamState::Idle => f.write_str("idle"),
            DreamState::AwaitingInput => f.write_str("awaiting input"),
            DreamState::FetchingContext => f.write_str("fetching context"),
            DreamState::BuildingPrompt => f.write_str("building prompt"),
            DreamState::Analyzing => f.write_str("analyzing"),
            DreamState::AwaitingConfirmation => f.write_str("awaiting confirmation"),
            DreamState::Persisting(stage) => write!(f, "persisting ({})", stage),
            DreamState::Completed => f.write_str("completed"),
            DreamState::Error(e) => write!(f, "error: {}", e),
        }
    }
}

/// A user-facing reply from the workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Line(String),
    Error(String),
}

#[derive(Debug, Default)]
pub struct StepOutcome {
    pub replies: Vec<Reply>,
    /// Set when this step ran the persistence pipeline.
    pub persisted: Option<PersistenceResult>,
}

impl StepOutcome {
    fn line(mut self, text: impl Into<String>) -> Self {
        self.replies.push(Reply::Line(text.into()));
        self
    }

    fn error(mut self, text: impl Into<String>) -> Self {
        self.replies.push(Reply::Error(text.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct DreamSettings {
    pub identity_id: u64,
    pub agent_name: String,
    pub caller_identity: Option<String>,
    pub inference_timeout: Duration,
    pub context: ContextConfig,
}

impl DreamSettings {
    pub fn from_config(config: &SomniaConfig) -> Self {
        Self {
            identity_id: config.identity.agent_id,
            agent_name: config.identity.agent_name.clone(),
            caller_identity: Some(config.identity.owner.clone()).filter(|o| !o.is_empty()),
            inference_timeout: config.inference.timeout(),
            context: config.context.clone(),
        }
    }
}

pub struct DreamWorkflow {
    state: DreamState,
    model_id: Option<String>,
    pending: Option<PersistenceRequest>,
    head: Option<PublishedHead>,
    inference: Arc<dyn InferenceGateway>,
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn ContentStore>,
    pipeline: Arc<PersistencePipeline>,
    settings: DreamSettings,
}

impl DreamWorkflow {
    pub fn new(
        inference: Arc<dyn InferenceGateway>,
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn ContentStore>,
        pipeline: Arc<PersistencePipeline>,
        settings: DreamSettings,
    ) -> Self {
        Self {
            state: DreamState::Idle,
            model_id: None,
            pending: None,
            head: None,
            inference,
            ledger,
            store,
            pipeline,
            settings,
        }
    }

    pub fn state(&self) -> &DreamState {
        &self.state
    }

    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    /// Newest log published by this session.
    pub fn head(&self) -> Option<&PublishedHead> {
        self.head.as_ref()
    }

    fn transition<F>(&mut self, next: DreamState, observer: &mut F)
    where
        F: FnMut(&DreamState),
    {
        tracing::debug!(from = %self.state, to = %next, "Dream workflow transition");
        self.state = next;
        observer(&self.state);
    }

    pub fn start<F>(&mut self, model_id: String, observer: &mut F) -> StepOutcome
    where
        F: FnMut(&DreamState),
    {
        if !self.state.is_finished() {
            return StepOutcome::default().error(format!(
                "A dream is already in progress ({})",
                self.state
            ));
        }
        tracing::info!(model = %model_id, "Dream workflow started");
        self.pending = None;
        self.model_id = Some(model_id.clone());
        self.transition(DreamState::AwaitingInput, observer);
        StepOutcome::default()
            .line(format!("Describe your dream (model: {}).", model_id))
            .line("Type 'cancel' to stop.")
    }

    pub fn cancel<F>(&mut self, observer: &mut F) -> StepOutcome
    where
        F: FnMut(&DreamState),
    {
        match self.state {
            DreamState::AwaitingInput | DreamState::AwaitingConfirmation => {
                self.pending = None;
                self.transition(DreamState::Completed, observer);
                StepOutcome::default().line("Dream cancelled.")
            }
            _ => StepOutcome::default().error(format!("Nothing to cancel ({})", self.state)),
        }
    }

    pub async fn handle_input<F>(&mut self, line: &str, observer: &mut F) -> StepOutcome
    where
        F: FnMut(&DreamState) + Send,
    {
        match self.state {
            DreamState::AwaitingInput => {
                let narrative = line.trim();
                if narrative.is_empty() {
                    return StepOutcome::default().error("Please describe your dream first.");
                }
                self.analyze(narrative, observer).await
            }
            DreamState::AwaitingConfirmation => match line.trim().to_lowercase().as_str() {
                "yes" | "y" => self.persist(observer).await,
                "no" | "n" => {
                    self.pending = None;
                    self.transition(DreamState::Completed, observer);
                    StepOutcome::default().line("Dream discarded, nothing was saved.")
                }
                _ => StepOutcome::default().error("Please answer yes or no."),
            },
            ref other if other.is_persisting() => {
                StepOutcome::default().error("Your dream is being saved, please wait.")
            }
            ref other => StepOutcome::default().error(format!("No dream awaits input ({})", other)),
        }
    }

    async fn analyze<F>(&mut self, narrative: &str, observer: &mut F) -> StepOutcome
    where
        F: FnMut(&DreamState) + Send,
    {
        self.transition(DreamState::FetchingContext, observer);
        let context = match fetch_context(
            self.ledger.as_ref(),
            self.store.as_ref(),
            self.settings.identity_id,
            self.head.as_ref(),
            &self.settings.context,
        )
        .await
        {
            Ok(c) => c,
            Err(e) => return self.fail(format!("Could not load the agent context: {}", e), observer),
        };

        self.transition(DreamState::BuildingPrompt, observer);
        let prompt = build_prompt(narrative, &self.settings.agent_name, &context);
        let Some(model_id) = self.model_id.clone() else {
            return self.fail("No inference model selected".to_string(), observer);
        };

        self.transition(DreamState::Analyzing, observer);
        let request = InferenceRequest {
            prompt,
            model_id,
            caller_identity: self.settings.caller_identity.clone(),
        };
        let timeout = self.settings.inference_timeout;
        let response = match tokio::time::timeout(timeout, self.inference.infer(&request)).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return self.fail(format!("Analysis failed: {}", e), observer),
            Err(_) => {
                let e = InferenceError::Timeout {
                    seconds: timeout.as_secs(),
                };
                return self.fail(format!("Analysis failed: {}", e), observer);
            }
        };

        let structured = match parse_response(&response.text) {
            ParsedResponse::Structured(s) => s,
            ParsedResponse::Prose(text) => {
                let outcome = self.fail(
                    "The analysis did not contain structured dream data, nothing was saved"
                        .to_string(),
                    observer,
                );
                return prepend_line(outcome, text);
            }
        };
        tracing::info!(
            strategy = structured.strategy,
            evolution = context.is_evolution_turn(),
            "Analysis parsed"
        );

        let display = ParsedResponse::Structured(structured.clone())
            .display_text()
            .to_string();
        let Some(dream_data) = structured.dream_data else {
            let outcome = self.fail(
                "The analysis did not contain dreamData, nothing was saved".to_string(),
                observer,
            );
            return prepend_line(outcome, display);
        };

        let mut outcome = StepOutcome::default();
        if !display.trim().is_empty() {
            outcome = outcome.line(display);
        }
        outcome = outcome.line(preview(&dream_data, context.prior_count + 1));
        if context.is_evolution_turn() {
            outcome = outcome.line("This is an evolution dream: saving it will change the agent's traits.");
        }

        self.pending = Some(PersistenceRequest {
            dream_data,
            personality_impact: structured.personality_impact,
            analysis: structured.analysis,
            prior_count: context.prior_count,
            previous_address: context.previous_address,
        });
        self.transition(DreamState::AwaitingConfirmation, observer);
        outcome.line("Save this dream? (yes/no)")
    }

    async fn persist<F>(&mut self, observer: &mut F) -> StepOutcome
    where
        F: FnMut(&DreamState) + Send,
    {
        let Some(request) = self.pending.take() else {
            return self.fail("No analyzed dream to save".to_string(), observer);
        };

        self.transition(DreamState::Persisting(PersistenceStage::Validating), observer);
        let pipeline = Arc::clone(&self.pipeline);
        let result = pipeline
            .run(&request, |stage| observer(&DreamState::Persisting(stage)))
            .await;

        if let (Some(address), Some(id)) = (result.content_address(), result.record_id) {
            self.head = Some(PublishedHead {
                content_address: address.to_string(),
                count: id,
            });
        }

        let summary = result.summary_line();
        let outcome = match result.status {
            PersistenceStatus::Success => {
                self.transition(DreamState::Completed, observer);
                StepOutcome::default().line(summary)
            }
            PersistenceStatus::Partial => {
                self.transition(DreamState::Completed, observer);
                StepOutcome::default().error(summary)
            }
            PersistenceStatus::Failed => {
                let reason = result.error.clone().unwrap_or_else(|| "persistence failed".into());
                self.transition(DreamState::Error(reason), observer);
                StepOutcome::default().error(summary)
            }
        };
        StepOutcome {
            persisted: Some(result),
            ..outcome
        }
    }

    fn fail<F>(&mut self, message: String, observer: &mut F) -> StepOutcome
    where
        F: FnMut(&DreamState),
    {
        tracing::warn!(error = %message, "Dream workflow failed");
        self.pending = None;
        self.transition(DreamState::Error(message.clone()), observer);
        StepOutcome::default().error(message)
    }
}

fn prepend_line(mut outcome: StepOutcome, text: String) -> StepOutcome {
    if !text.trim().is_empty() {
        outcome.replies.insert(0, Reply::Line(text));
    }
    outcome
}

/// One-line summary of the structured data before it is validated.
fn preview(dream_data: &Value, next_id: u64) -> String {
    let list = |key: &str| {
        dream_data
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default()
    };
    let number = |key: &str| {
        dream_data
            .get(key)
            .map(|v| v.to_string())
            .unwrap_or_else(|| "?".to_string())
    };
    format!(
        "Dream #{}: emotions [{}], symbols [{}], intensity {}, lucidity {}",
        next_id,
        list("emotions"),
        list("symbols"),
        number("intensity"),
        number("lucidity")
    )
}
