//! Ledger committer
//!
//! Every dream produces exactly one ledger write of the same shape. Non
//! evolution turns carry the neutral impact payload, so only evolution turns
//! change trait state on-ledger. The write is never retried.

use std::time::Duration;

use somnia_core::config::LedgerConfig;
use somnia_core::ledger::{write_and_confirm, Ledger, LedgerError, LedgerWrite};
use somnia_core::models::{EvolutionImpact, LedgerSummary};

#[derive(Debug, Clone)]
pub struct CommitOptions {
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
}

impl From<&LedgerConfig> for CommitOptions {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            confirmation_timeout: config.confirmation_timeout(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// The payload sent for this turn.
pub fn impact_payload(evolution: Option<&EvolutionImpact>) -> EvolutionImpact {
    evolution.cloned().unwrap_or_else(EvolutionImpact::neutral)
}

pub async fn commit(
    ledger: &dyn Ledger,
    identity_id: u64,
    content_address: &str,
    evolution: Option<&EvolutionImpact>,
    record_count: u64,
    options: &CommitOptions,
) -> Result<LedgerSummary, LedgerError> {
    let is_evolution = evolution.is_some();
    let update = LedgerWrite {
        identity_id,
        content_address: content_address.to_string(),
        evolution_impact: impact_payload(evolution),
    };

    tracing::info!(
        identity = identity_id,
        address = content_address,
        records = record_count,
        is_evolution,
        ledger = ledger.name(),
        "Committing dream log to ledger"
    );

    let receipt = write_and_confirm(
        ledger,
        &update,
        options.confirmation_timeout,
        options.poll_interval,
    )
    .await
    .map_err(|e| {
        tracing::error!(identity = identity_id, address = content_address, error = %e, "Ledger commit failed");
        e
    })?;

    tracing::info!(
        tx = %receipt.transaction_ref,
        block = receipt.confirmed_block,
        "Ledger update confirmed"
    );

    Ok(LedgerSummary {
        transaction_ref: receipt.transaction_ref,
        confirmed_block: receipt.confirmed_block,
        is_evolution,
    })
}
