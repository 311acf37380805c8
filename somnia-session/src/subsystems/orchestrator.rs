//! Persistence orchestrator
//!
//! Runs `validating -> merging -> uploading -> committing -> done`, one
//! component per stage, moving forward only on success. A failure jumps to
//! `failed` and keeps everything produced so far, so a content address
//! survives a later ledger failure and is reported as a partial result.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use somnia_core::config::SomniaConfig;
use somnia_core::ledger::Ledger;
use somnia_core::models::{
    PersistenceResult, PersistenceStage, PersistenceStatus, StageTiming,
};
use somnia_core::storage::ContentStore;
use somnia_core::validate::{validate_dream, ValidationInput};

use super::committer::{commit, CommitOptions};
use super::merger::merge_record;
use super::publisher::{publish, PublishOptions};

/// Everything one submission brings into the pipeline.
#[derive(Debug, Clone)]
pub struct PersistenceRequest {
    pub dream_data: Value,
    pub personality_impact: Option<Value>,
    pub analysis: Option<String>,
    pub prior_count: u64,
    pub previous_address: Option<String>,
}

/// The four persistence stages wired to their collaborators.
pub struct PersistencePipeline {
    store: Arc<dyn ContentStore>,
    ledger: Arc<dyn Ledger>,
    identity_id: u64,
    identity_name: String,
    publish: PublishOptions,
    commit: CommitOptions,
}

impl PersistencePipeline {
    pub fn new(
        store: Arc<dyn ContentStore>,
        ledger: Arc<dyn Ledger>,
        identity_id: u64,
        identity_name: impl Into<String>,
        publish: PublishOptions,
        commit: CommitOptions,
    ) -> Self {
        Self {
            store,
            ledger,
            identity_id,
            identity_name: identity_name.into(),
            publish,
            commit,
        }
    }

    pub fn from_config(
        config: &SomniaConfig,
        store: Arc<dyn ContentStore>,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        Self::new(
            store,
            ledger,
            config.identity.agent_id,
            config.identity.agent_name.clone(),
            PublishOptions::from(&config.storage),
            CommitOptions::from(&config.ledger),
        )
    }

    /// Run the pipeline, reporting each stage as it is entered.
    pub async fn run<F>(&self, request: &PersistenceRequest, mut on_stage: F) -> PersistenceResult
    where
        F: FnMut(PersistenceStage) + Send,
    {
        self.run_at(request, Utc::now(), &mut on_stage).await
    }

    async fn run_at<F>(
        &self,
        request: &PersistenceRequest,
        now: DateTime<Utc>,
        on_stage: &mut F,
    ) -> PersistenceResult
    where
        F: FnMut(PersistenceStage) + Send,
    {
        let mut result = PersistenceResult::default();

        // validating
        on_stage(PersistenceStage::Validating);
        let started = Instant::now();
        let input = ValidationInput {
            dream_data: &request.dream_data,
            personality_impact: request.personality_impact.as_ref(),
            analysis: request.analysis.as_deref(),
            prior_count: request.prior_count,
            now,
        };
        let validated = validate_dream(&input);
        record_timing(&mut result, PersistenceStage::Validating, started);
        let validated = match validated {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(errors = e.fields().len(), error = %e, "Dream failed validation");
                result.validation_errors = e.0.clone();
                return fail(result, PersistenceStage::Validating, e.to_string(), on_stage);
            }
        };
        let record_id = validated.record.id;
        result.record_id = Some(record_id);
        result.evolution = validated.evolution.clone();

        // merging
        on_stage(PersistenceStage::Merging);
        let started = Instant::now();
        let merged = merge_record(
            self.store.as_ref(),
            validated.record,
            request.previous_address.as_deref(),
            &self.identity_name,
            now,
        )
        .await;
        record_timing(&mut result, PersistenceStage::Merging, started);
        result.merge = Some(merged.summary());

        // uploading
        on_stage(PersistenceStage::Uploading);
        let started = Instant::now();
        let upload = publish(
            self.store.as_ref(),
            &merged.records,
            &merged.file_name,
            &self.publish,
        )
        .await;
        record_timing(&mut result, PersistenceStage::Uploading, started);
        let upload = match upload {
            Ok(u) => u,
            Err(e) => return fail(result, PersistenceStage::Uploading, e.to_string(), on_stage),
        };
        let content_address = upload.content_address.clone();
        result.upload = Some(upload);

        // committing
        on_stage(PersistenceStage::Committing);
        let started = Instant::now();
        let ledger = commit(
            self.ledger.as_ref(),
            self.identity_id,
            &content_address,
            result.evolution.as_ref(),
            record_id,
            &self.commit,
        )
        .await;
        record_timing(&mut result, PersistenceStage::Committing, started);
        match ledger {
            Ok(summary) => result.ledger = Some(summary),
            Err(e) => return fail(result, PersistenceStage::Committing, e.to_string(), on_stage),
        }

        on_stage(PersistenceStage::Done);
        result.status = PersistenceStatus::Success;
        tracing::info!(
            record = record_id,
            address = %content_address,
            total_ms = result.total_ms(),
            "Dream persisted"
        );
        result
    }
}

fn record_timing(result: &mut PersistenceResult, stage: PersistenceStage, started: Instant) {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    tracing::debug!(%stage, elapsed_ms, "Stage finished");
    result.timings.push(StageTiming { stage, elapsed_ms });
}

fn fail<F>(
    mut result: PersistenceResult,
    stage: PersistenceStage,
    error: String,
    on_stage: &mut F,
) -> PersistenceResult
where
    F: FnMut(PersistenceStage) + Send,
{
    // Anything that reached storage is durable even if the ledger is not.
    result.status = if result.upload.is_some() {
        PersistenceStatus::Partial
    } else {
        PersistenceStatus::Failed
    };
    tracing::error!(%stage, status = ?result.status, error = %error, "Persistence pipeline failed");
    result.failed_stage = Some(stage);
    result.error = Some(error);
    on_stage(PersistenceStage::Failed);
    result
}
