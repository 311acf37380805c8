//! Dream context and prompt
//!
//! Before a dream is analyzed the agent's current state is read from the
//! ledger (retried with linear backoff) and the newest entries of its dream
//! log are fetched on a best-effort basis. The prompt builder is pure.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_retry::Retry;

use somnia_core::codec::decode_log;
use somnia_core::config::ContextConfig;
use somnia_core::ledger::{Ledger, LedgerError};
use somnia_core::models::{
    is_evolution_turn, AgentMemory, DreamRecord, Trait, EVOLUTION_INTERVAL,
};
use somnia_core::retry::linear_backoff;
use somnia_core::storage::ContentStore;

/// The newest log this session published, whether or not the ledger
/// recorded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedHead {
    pub content_address: String,
    /// Number of records in that log.
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DreamContext {
    pub memory: AgentMemory,
    pub prior_count: u64,
    pub previous_address: Option<String>,
    /// Newest first.
    pub recent: Vec<DreamRecord>,
}

impl DreamContext {
    pub fn is_evolution_turn(&self) -> bool {
        is_evolution_turn(self.prior_count)
    }
}

/// Where the next merge starts from.
///
/// A locally published head at least as new as the ledger wins, so a log
/// stored during a failed ledger update is continued rather than dropped.
pub fn resolve_head(memory: &AgentMemory, local: Option<&PublishedHead>) -> (u64, Option<String>) {
    match local {
        Some(head) if head.count >= memory.dream_count => {
            (head.count, Some(head.content_address.clone()))
        }
        _ => (memory.dream_count, memory.content_address.clone()),
    }
}

pub async fn fetch_context(
    ledger: &dyn Ledger,
    store: &dyn ContentStore,
    identity_id: u64,
    local: Option<&PublishedHead>,
    config: &ContextConfig,
) -> Result<DreamContext, LedgerError> {
    let attempts = AtomicU32::new(0);
    let memory = Retry::spawn(
        linear_backoff(config.retry_base_delay(), config.max_attempts),
        || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                ledger.read_memory(identity_id).await.map_err(|e| {
                    tracing::warn!(attempt, identity = identity_id, error = %e, "Context fetch failed");
                    e
                })
            }
        },
    )
    .await?;

    let (prior_count, previous_address) = resolve_head(&memory, local);
    let recent = match previous_address.as_deref() {
        Some(address) if config.recent_dreams > 0 => {
            recent_dreams(store, address, config.recent_dreams).await
        }
        _ => Vec::new(),
    };

    tracing::debug!(
        identity = identity_id,
        prior_count,
        recent = recent.len(),
        attempts = attempts.load(Ordering::SeqCst),
        "Dream context ready"
    );

    Ok(DreamContext {
        memory,
        prior_count,
        previous_address,
        recent,
    })
}

async fn recent_dreams(store: &dyn ContentStore, address: &str, limit: usize) -> Vec<DreamRecord> {
    match store.get(address).await.map(|bytes| decode_log(&bytes)) {
        Ok(Ok(mut records)) => {
            records.truncate(limit);
            records
        }
        Ok(Err(e)) => {
            tracing::warn!(address, error = %e, "Recent dreams not decodable");
            Vec::new()
        }
        Err(e) => {
            tracing::warn!(address, error = %e, "Recent dreams unavailable");
            Vec::new()
        }
    }
}

/// Build the analysis prompt for one narrative.
pub fn build_prompt(narrative: &str, agent_name: &str, context: &DreamContext) -> String {
    let mut prompt = String::new();
    let next_id = context.prior_count + 1;

    prompt.push_str(&format!(
        "You are {}, an agent whose personality evolves through its dreams.\n",
        agent_name
    ));
    prompt.push_str(&format!("This is dream #{}.\n\n", next_id));

    prompt.push_str("Current traits (0-100):\n");
    for t in Trait::ALL {
        prompt.push_str(&format!("- {}: {}\n", t.as_str(), context.memory.traits.get(t)));
    }
    if !context.memory.capabilities.is_empty() {
        prompt.push_str(&format!(
            "Capabilities: {}\n",
            context.memory.capabilities.join(", ")
        ));
    }

    if !context.recent.is_empty() {
        prompt.push_str("\nRecent dreams:\n");
        for record in &context.recent {
            prompt.push_str(&format!("- {}\n", record.summary()));
        }
    }

    prompt.push_str("\nDream narrative:\n");
    prompt.push_str(narrative.trim());
    prompt.push_str("\n\n");

    prompt.push_str(
        "Answer with two fenced blocks.\n\
         1. A ```full_analysis block with your interpretation in prose.\n\
         2. A ```json block shaped {\"analysis\": string, \"dreamData\": {...}",
    );
    if context.is_evolution_turn() {
        prompt.push_str(", \"personalityImpact\": {...}}.\n");
    } else {
        prompt.push_str("}.\n");
    }
    prompt.push_str(
        "dreamData fields: emotions (1-5 strings), symbols (1-5 strings), intensity (1-10), \
         lucidity (1-5), optional themes, archetypes, recurring_from (earlier dream ids), \
         sleep_quality (1-10), recall_clarity (1-10), dream_type \
         (normal, lucid, nightmare, recurring, prophetic, healing).\n",
    );
    if context.is_evolution_turn() {
        prompt.push_str(&format!(
            "Every {} dreams the personality evolves and this is such a dream. personalityImpact \
             fields: creativityChange, analyticalChange, empathyChange, intuitionChange, \
             resilienceChange, curiosityChange (each -10 to 10), moodShift (non-empty), \
             evolutionWeight (1-100), newFeatures (0-2 of {{name, description, intensity 1-100}}).\n",
            EVOLUTION_INTERVAL
        ));
    } else {
        prompt.push_str("Do not include personalityImpact.\n");
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, MockLedger};
    use chrono::NaiveDate;
    use somnia_core::codec::encode_log;
    use somnia_core::models::DREAM_SCHEMA_VERSION;

    fn config() -> ContextConfig {
        ContextConfig {
            max_attempts: 3,
            retry_base_delay_ms: 5,
            recent_dreams: 2,
        }
    }

    fn record(id: u64) -> DreamRecord {
        DreamRecord {
            id,
            date: NaiveDate::from_ymd_opt(2026, 3, 3).unwrap(),
            timestamp: "2026-03-03T07:00:00Z".parse().unwrap(),
            emotions: vec!["joy".into()],
            symbols: vec![format!("door-{}", id)],
            intensity: 3,
            lucidity: 1,
            themes: vec![],
            archetypes: vec![],
            recurring_from: vec![],
            sleep_quality: None,
            recall_clarity: None,
            dream_type: None,
            analysis: None,
            schema_version: DREAM_SCHEMA_VERSION,
        }
    }

    fn memory(count: u64, address: Option<&str>) -> AgentMemory {
        AgentMemory {
            identity_id: 7,
            content_address: address.map(str::to_string),
            dream_count: count,
            ..AgentMemory::default()
        }
    }

    #[test]
    fn test_local_head_wins_when_ledger_lags() {
        let head = PublishedHead {
            content_address: "0xlocal".into(),
            count: 5,
        };
        assert_eq!(
            resolve_head(&memory(4, Some("0xledger")), Some(&head)),
            (5, Some("0xlocal".into()))
        );
        assert_eq!(
            resolve_head(&memory(6, Some("0xledger")), Some(&head)),
            (6, Some("0xledger".into()))
        );
        assert_eq!(resolve_head(&memory(0, None), None), (0, None));
    }

    #[tokio::test]
    async fn test_fetch_retries_ledger_reads() {
        let ledger = MockLedger::with_count(7, 3);
        ledger.failing_reads.store(2, Ordering::SeqCst);
        let store = MemoryStore::default();

        let context = fetch_context(&ledger, &store, 7, None, &config()).await.unwrap();
        assert_eq!(context.prior_count, 3);
        assert_eq!(ledger.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_max_attempts() {
        let ledger = MockLedger::with_count(7, 3);
        ledger.failing_reads.store(10, Ordering::SeqCst);
        let store = MemoryStore::default();

        assert!(fetch_context(&ledger, &store, 7, None, &config()).await.is_err());
        assert_eq!(ledger.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_recent_dreams_are_best_effort() {
        let store = MemoryStore::default();
        store.insert("0xlog", encode_log(&[record(3), record(2), record(1)]).unwrap());
        let head = PublishedHead {
            content_address: "0xlog".into(),
            count: 3,
        };
        let ledger = MockLedger::with_count(7, 0);

        let context = fetch_context(&ledger, &store, 7, Some(&head), &config()).await.unwrap();
        let ids: Vec<u64> = context.recent.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2]);

        store.failing_gets.store(true, Ordering::SeqCst);
        let context = fetch_context(&ledger, &store, 7, Some(&head), &config()).await.unwrap();
        assert!(context.recent.is_empty());
        assert_eq!(context.prior_count, 3);
    }

    #[test]
    fn test_prompt_mentions_impact_only_on_evolution_turns() {
        let mut context = DreamContext {
            memory: memory(3, None),
            prior_count: 3,
            previous_address: None,
            recent: vec![record(3)],
        };
        let prompt = build_prompt("I was flying over a city.", "Luna", &context);
        assert!(prompt.contains("dream #4"));
        assert!(prompt.contains("I was flying over a city."));
        assert!(prompt.contains("door-3"));
        assert!(prompt.contains("Do not include personalityImpact"));

        context.prior_count = 4;
        let prompt = build_prompt("I was flying over a city.", "Luna", &context);
        assert!(prompt.contains("dream #5"));
        assert!(prompt.contains("curiosityChange"));
    }
}
