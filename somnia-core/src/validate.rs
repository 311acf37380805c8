//! Schema validator for analysed dreams
//!
//! Checks the structured output of the inference step against the dream
//! record schema (version [`DREAM_SCHEMA_VERSION`]) before anything is
//! written anywhere. On evolution turns the personality impact block is
//! mandatory and fully range-checked; on every other turn it is dropped.
//!
//! The validator is a pure function of its input: the caller supplies the
//! prior submission count and the clock reading.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::models::dream::{DreamRecord, DreamType, DREAM_SCHEMA_VERSION};
use crate::models::evolution::{
    is_evolution_turn, CapabilityRecord, EvolutionImpact, Trait, TraitDeltas,
    CAPABILITY_INTENSITY_MAX, CAPABILITY_INTENSITY_MIN, EVOLUTION_WEIGHT_MAX,
    EVOLUTION_WEIGHT_MIN, MAX_NEW_CAPABILITIES, TRAIT_DELTA_MAX, TRAIT_DELTA_MIN,
};

pub const MIN_TAGS: usize = 1;
pub const MAX_TAGS: usize = 5;
pub const MAX_TAG_CHARS: usize = 64;
pub const MAX_ANALYSIS_CHARS: usize = 4000;
pub const MAX_MOOD_CHARS: usize = 64;

/// A single schema violation, addressed by its JSON path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} field error(s): {}", .0.len(), join_errors(.0))]
pub struct ValidationError(pub Vec<FieldError>);

impl ValidationError {
    pub fn fields(&self) -> &[FieldError] {
        &self.0
    }

    pub fn mentions(&self, field: &str) -> bool {
        self.0.iter().any(|e| e.field == field)
    }
}

fn join_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Everything the validator looks at for one submission.
#[derive(Debug, Clone)]
pub struct ValidationInput<'a> {
    pub dream_data: &'a Value,
    pub personality_impact: Option<&'a Value>,
    pub analysis: Option<&'a str>,
    pub prior_count: u64,
    pub now: DateTime<Utc>,
}

/// A record that passed validation, ready for the persistence pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedDream {
    pub record: DreamRecord,
    /// Present iff this submission is an evolution turn.
    pub evolution: Option<EvolutionImpact>,
    pub schema_version: u32,
}

impl ValidatedDream {
    pub fn is_evolution(&self) -> bool {
        self.evolution.is_some()
    }
}

pub fn validate_dream(input: &ValidationInput<'_>) -> Result<ValidatedDream, ValidationError> {
    let mut errors = Vec::new();
    let id = input.prior_count + 1;

    let Some(data) = input.dream_data.as_object() else {
        return Err(ValidationError(vec![FieldError::new(
            "dreamData",
            "must be an object",
        )]));
    };

    let emotions = required_tags(data, "emotions", &mut errors);
    let symbols = required_tags(data, "symbols", &mut errors);
    let intensity = required_int(data, &["intensity"], "intensity", 1, 10, &mut errors);
    let lucidity = required_int(data, &["lucidity"], "lucidity", 1, 5, &mut errors);
    let themes = optional_tags(data, "themes", &mut errors);
    let archetypes = optional_tags(data, "archetypes", &mut errors);
    let recurring_from = recurring_ids(data, id, &mut errors);
    let sleep_quality =
        optional_int(data, &["sleep_quality", "sleepQuality"], "sleep_quality", 1, 10, &mut errors);
    let recall_clarity = optional_int(
        data,
        &["recall_clarity", "recallClarity"],
        "recall_clarity",
        1,
        10,
        &mut errors,
    );
    let dream_type = dream_type(data, &mut errors);
    let date = dream_date(data, input.now, &mut errors);

    let analysis = match input.analysis.map(str::trim) {
        Some(a) if a.chars().count() > MAX_ANALYSIS_CHARS => {
            errors.push(FieldError::new(
                "analysis",
                format!("must be at most {} characters", MAX_ANALYSIS_CHARS),
            ));
            None
        }
        Some(a) if !a.is_empty() => Some(a.to_string()),
        _ => None,
    };

    let evolution = if is_evolution_turn(input.prior_count) {
        match input.personality_impact {
            Some(Value::Object(impact)) => evolution_impact(impact, &mut errors),
            Some(Value::Null) | None => {
                errors.push(FieldError::new(
                    "personalityImpact",
                    "is required on evolution turns",
                ));
                None
            }
            Some(_) => {
                errors.push(FieldError::new("personalityImpact", "must be an object"));
                None
            }
        }
    } else {
        None
    };

    if !errors.is_empty() {
        return Err(ValidationError(errors));
    }

    let record = DreamRecord {
        id,
        date,
        timestamp: input.now,
        emotions,
        symbols,
        // Both were checked above; an error would have returned early.
        intensity: intensity.unwrap_or_default() as u8,
        lucidity: lucidity.unwrap_or_default() as u8,
        themes,
        archetypes,
        recurring_from,
        sleep_quality: sleep_quality.map(|v| v as u8),
        recall_clarity: recall_clarity.map(|v| v as u8),
        dream_type,
        analysis,
        schema_version: DREAM_SCHEMA_VERSION,
    };

    Ok(ValidatedDream {
        record,
        evolution,
        schema_version: DREAM_SCHEMA_VERSION,
    })
}

// ============================================================================
// Field helpers
// ============================================================================

fn lookup<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .find(|v| !v.is_null())
}

fn as_integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.is_finite())
            .map(|f| f as i64)
    })
}

fn check_range(value: &Value, field: &str, min: i64, max: i64, errors: &mut Vec<FieldError>) -> Option<i64> {
    match as_integer(value) {
        Some(n) if (min..=max).contains(&n) => Some(n),
        Some(n) => {
            errors.push(FieldError::new(
                field,
                format!("must be between {} and {}, got {}", min, max, n),
            ));
            None
        }
        None => {
            errors.push(FieldError::new(field, "must be an integer"));
            None
        }
    }
}

fn required_int(
    map: &Map<String, Value>,
    keys: &[&str],
    field: &str,
    min: i64,
    max: i64,
    errors: &mut Vec<FieldError>,
) -> Option<i64> {
    match lookup(map, keys) {
        Some(v) => check_range(v, field, min, max, errors),
        None => {
            errors.push(FieldError::new(field, "is required"));
            None
        }
    }
}

fn optional_int(
    map: &Map<String, Value>,
    keys: &[&str],
    field: &str,
    min: i64,
    max: i64,
    errors: &mut Vec<FieldError>,
) -> Option<i64> {
    lookup(map, keys).and_then(|v| check_range(v, field, min, max, errors))
}

fn tag_list(value: &Value, field: &str, errors: &mut Vec<FieldError>) -> Option<Vec<String>> {
    let Some(items) = value.as_array() else {
        errors.push(FieldError::new(field, "must be an array of strings"));
        return None;
    };
    if items.len() < MIN_TAGS || items.len() > MAX_TAGS {
        errors.push(FieldError::new(
            field,
            format!(
                "must contain between {} and {} entries, got {}",
                MIN_TAGS,
                MAX_TAGS,
                items.len()
            ),
        ));
        return None;
    }
    let mut tags = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match item.as_str().map(str::trim) {
            Some(s) if !s.is_empty() && s.chars().count() <= MAX_TAG_CHARS => {
                tags.push(s.to_string())
            }
            Some(s) if !s.is_empty() => errors.push(FieldError::new(
                format!("{}[{}]", field, i),
                format!("must be at most {} characters", MAX_TAG_CHARS),
            )),
            _ => errors.push(FieldError::new(
                format!("{}[{}]", field, i),
                "must be a non-empty string",
            )),
        }
    }
    (tags.len() == items.len()).then_some(tags)
}

fn required_tags(map: &Map<String, Value>, field: &str, errors: &mut Vec<FieldError>) -> Vec<String> {
    match lookup(map, &[field]) {
        Some(v) => tag_list(v, field, errors).unwrap_or_default(),
        None => {
            errors.push(FieldError::new(field, "is required"));
            Vec::new()
        }
    }
}

fn optional_tags(map: &Map<String, Value>, field: &str, errors: &mut Vec<FieldError>) -> Vec<String> {
    match lookup(map, &[field]) {
        Some(Value::Array(items)) if items.is_empty() => Vec::new(),
        Some(v) => tag_list(v, field, errors).unwrap_or_default(),
        None => Vec::new(),
    }
}

fn recurring_ids(map: &Map<String, Value>, id: u64, errors: &mut Vec<FieldError>) -> Vec<u64> {
    let Some(value) = lookup(map, &["recurring_from", "recurringFrom"]) else {
        return Vec::new();
    };
    let Some(items) = value.as_array() else {
        errors.push(FieldError::new("recurring_from", "must be an array of dream ids"));
        return Vec::new();
    };
    let mut ids = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match as_integer(item) {
            Some(n) if n >= 1 && (n as u64) < id => {
                if !ids.contains(&(n as u64)) {
                    ids.push(n as u64);
                }
            }
            _ => errors.push(FieldError::new(
                format!("recurring_from[{}]", i),
                format!("must be an earlier dream id between 1 and {}", id.saturating_sub(1)),
            )),
        }
    }
    ids
}

fn dream_type(map: &Map<String, Value>, errors: &mut Vec<FieldError>) -> Option<DreamType> {
    let value = lookup(map, &["dream_type", "dreamType"])?;
    match value.as_str().map(str::parse::<DreamType>) {
        Some(Ok(t)) => Some(t),
        _ => {
            let allowed: Vec<&str> = DreamType::ALL.iter().map(|t| t.as_str()).collect();
            errors.push(FieldError::new(
                "dream_type",
                format!("must be one of {}", allowed.join(", ")),
            ));
            None
        }
    }
}

fn dream_date(map: &Map<String, Value>, now: DateTime<Utc>, errors: &mut Vec<FieldError>) -> NaiveDate {
    match lookup(map, &["date"]) {
        Some(Value::String(s)) => match NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
            Ok(d) => d,
            Err(_) => {
                errors.push(FieldError::new("date", "must be formatted as YYYY-MM-DD"));
                now.date_naive()
            }
        },
        Some(_) => {
            errors.push(FieldError::new("date", "must be a string"));
            now.date_naive()
        }
        None => now.date_naive(),
    }
}

fn evolution_impact(impact: &Map<String, Value>, errors: &mut Vec<FieldError>) -> Option<EvolutionImpact> {
    let before = errors.len();
    let mut deltas = TraitDeltas::default();

    for t in Trait::ALL {
        let camel = format!("{}Change", t.as_str());
        let snake = format!("{}_change", t.as_str());
        let field = format!("personalityImpact.{}", camel);
        if let Some(v) = required_int(
            impact,
            &[camel.as_str(), snake.as_str()],
            &field,
            TRAIT_DELTA_MIN as i64,
            TRAIT_DELTA_MAX as i64,
            errors,
        ) {
            deltas.set(t, v as i8);
        }
    }

    let mood_shift = match lookup(impact, &["moodShift", "mood_shift"]).map(|v| v.as_str().map(str::trim)) {
        Some(Some(s)) if !s.is_empty() && s.chars().count() <= MAX_MOOD_CHARS => s.to_string(),
        Some(Some(s)) if !s.is_empty() => {
            errors.push(FieldError::new(
                "personalityImpact.moodShift",
                format!("must be at most {} characters", MAX_MOOD_CHARS),
            ));
            String::new()
        }
        Some(_) => {
            errors.push(FieldError::new(
                "personalityImpact.moodShift",
                "must be a non-empty string",
            ));
            String::new()
        }
        None => {
            errors.push(FieldError::new("personalityImpact.moodShift", "is required"));
            String::new()
        }
    };

    let weight = required_int(
        impact,
        &["evolutionWeight", "evolution_weight"],
        "personalityImpact.evolutionWeight",
        EVOLUTION_WEIGHT_MIN as i64,
        EVOLUTION_WEIGHT_MAX as i64,
        errors,
    );

    let new_features = capabilities(impact, errors);

    if errors.len() > before {
        return None;
    }

    Some(EvolutionImpact {
        deltas,
        mood_shift,
        evolution_weight: weight.unwrap_or(EVOLUTION_WEIGHT_MIN as i64) as u8,
        new_features,
    })
}

fn capabilities(impact: &Map<String, Value>, errors: &mut Vec<FieldError>) -> Vec<CapabilityRecord> {
    let Some(value) = lookup(impact, &["newFeatures", "new_features"]) else {
        return Vec::new();
    };
    let Some(items) = value.as_array() else {
        errors.push(FieldError::new("personalityImpact.newFeatures", "must be an array"));
        return Vec::new();
    };
    if items.len() > MAX_NEW_CAPABILITIES {
        errors.push(FieldError::new(
            "personalityImpact.newFeatures",
            format!("must contain at most {} entries, got {}", MAX_NEW_CAPABILITIES, items.len()),
        ));
        return Vec::new();
    }

    let mut records = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let prefix = format!("personalityImpact.newFeatures[{}]", i);
        let Some(obj) = item.as_object() else {
            errors.push(FieldError::new(prefix, "must be an object"));
            continue;
        };
        let name = non_empty_string(obj, "name", &prefix, errors);
        let description = non_empty_string(obj, "description", &prefix, errors);
        let intensity = required_int(
            obj,
            &["intensity"],
            &format!("{}.intensity", prefix),
            CAPABILITY_INTENSITY_MIN as i64,
            CAPABILITY_INTENSITY_MAX as i64,
            errors,
        );
        if let (Some(name), Some(description), Some(intensity)) = (name, description, intensity) {
            records.push(CapabilityRecord {
                name,
                description,
                intensity: intensity as u8,
            });
        }
    }
    records
}

fn non_empty_string(
    map: &Map<String, Value>,
    key: &str,
    prefix: &str,
    errors: &mut Vec<FieldError>,
) -> Option<String> {
    match lookup(map, &[key]).and_then(|v| v.as_str()).map(str::trim) {
        Some(s) if !s.is_empty() => Some(s.to_string()),
        _ => {
            errors.push(FieldError::new(
                format!("{}.{}", prefix, key),
                "must be a non-empty string",
            ));
            None
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
