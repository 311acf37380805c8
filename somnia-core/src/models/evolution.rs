use serde::{Deserialize, Serialize};

/// Every Nth accepted submission is an evolution turn.
pub const EVOLUTION_INTERVAL: u64 = 5;

pub const TRAIT_DELTA_MIN: i8 = -10;
pub const TRAIT_DELTA_MAX: i8 = 10;
pub const EVOLUTION_WEIGHT_MIN: u8 = 1;
pub const EVOLUTION_WEIGHT_MAX: u8 = 100;
pub const CAPABILITY_INTENSITY_MIN: u8 = 1;
pub const CAPABILITY_INTENSITY_MAX: u8 = 100;
pub const MAX_NEW_CAPABILITIES: usize = 2;

/// Mood label used by the neutral impact sent on non-evolution turns.
pub const NEUTRAL_MOOD: &str = "neutral";

/// Returns true when the submission following `prior_count` records is an
/// evolution turn.
pub fn is_evolution_turn(prior_count: u64) -> bool {
    (prior_count + 1) % EVOLUTION_INTERVAL == 0
}

/// The six bounded trait axes mutated on evolution turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trait {
    Creativity,
    Analytical,
    Empathy,
    Intuition,
    Resilience,
    Curiosity,
}

impl Trait {
    pub const ALL: [Trait; 6] = [
        Trait::Creativity,
        Trait::Analytical,
        Trait::Empathy,
        Trait::Intuition,
        Trait::Resilience,
        Trait::Curiosity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Trait::Creativity => "creativity",
            Trait::Analytical => "analytical",
            Trait::Empathy => "empathy",
            Trait::Intuition => "intuition",
            Trait::Resilience => "resilience",
            Trait::Curiosity => "curiosity",
        }
    }
}

/// Signed change per trait, each in `[-10, 10]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraitDeltas {
    pub creativity_change: i8,
    pub analytical_change: i8,
    pub empathy_change: i8,
    pub intuition_change: i8,
    pub resilience_change: i8,
    pub curiosity_change: i8,
}

impl TraitDeltas {
    pub fn get(&self, t: Trait) -> i8 {
        match t {
            Trait::Creativity => self.creativity_change,
            Trait::Analytical => self.analytical_change,
            Trait::Empathy => self.empathy_change,
            Trait::Intuition => self.intuition_change,
            Trait::Resilience => self.resilience_change,
            Trait::Curiosity => self.curiosity_change,
        }
    }

    pub fn set(&mut self, t: Trait, value: i8) {
        match t {
            Trait::Creativity => self.creativity_change = value,
            Trait::Analytical => self.analytical_change = value,
            Trait::Empathy => self.empathy_change = value,
            Trait::Intuition => self.intuition_change = value,
            Trait::Resilience => self.resilience_change = value,
            Trait::Curiosity => self.curiosity_change = value,
        }
    }

    pub fn is_zero(&self) -> bool {
        Trait::ALL.iter().all(|t| self.get(*t) == 0)
    }
}

/// A named capability unlocked on an evolution turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub name: String,
    pub description: String,
    pub intensity: u8,
}

/// Trait mutation payload attached to evolution turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionImpact {
    #[serde(flatten)]
    pub deltas: TraitDeltas,
    pub mood_shift: String,
    pub evolution_weight: u8,
    #[serde(default)]
    pub new_features: Vec<CapabilityRecord>,
}

impl EvolutionImpact {
    /// The always-present payload sent to the ledger on non-evolution turns.
    pub fn neutral() -> Self {
        Self {
            deltas: TraitDeltas::default(),
            mood_shift: NEUTRAL_MOOD.to_string(),
            evolution_weight: EVOLUTION_WEIGHT_MIN,
            new_features: Vec::new(),
        }
    }

    pub fn describe(&self) -> String {
        let changes: Vec<String> = Trait::ALL
            .iter()
            .filter(|t| self.deltas.get(**t) != 0)
            .map(|t| format!("{} {:+}", t.as_str(), self.deltas.get(*t)))
            .collect();
        let changes = if changes.is_empty() {
            "no trait changes".to_string()
        } else {
            changes.join(", ")
        };
        let features = if self.new_features.is_empty() {
            String::new()
        } else {
            let names: Vec<&str> = self.new_features.iter().map(|f| f.name.as_str()).collect();
            format!("; new capabilities: {}", names.join(", "))
        };
        format!(
            "mood {} (weight {}): {}{}",
            self.mood_shift, self.evolution_weight, changes, features
        )
    }
}
