pub mod dream;
pub mod evolution;
pub mod memory;
pub mod persistence;

pub use dream::{DreamRecord, DreamType, DREAM_SCHEMA_VERSION};
pub use evolution::{
    is_evolution_turn, CapabilityRecord, EvolutionImpact, Trait, TraitDeltas, EVOLUTION_INTERVAL,
};
pub use memory::{is_empty_address, AgentMemory, TraitValues};
pub use persistence::{
    LedgerSummary, MergeSummary, PersistenceResult, PersistenceStage, PersistenceStatus,
    StageTiming, UploadSummary,
};
