use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::evolution::Trait;

/// Current trait values of an agent, each in `[0, 100]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraitValues {
    pub creativity: u8,
    pub analytical: u8,
    pub empathy: u8,
    pub intuition: u8,
    pub resilience: u8,
    pub curiosity: u8,
}

impl TraitValues {
    pub fn get(&self, t: Trait) -> u8 {
        match t {
            Trait::Creativity => self.creativity,
            Trait::Analytical => self.analytical,
            Trait::Empathy => self.empathy,
            Trait::Intuition => self.intuition,
            Trait::Resilience => self.resilience,
            Trait::Curiosity => self.curiosity,
        }
    }

    fn set(&mut self, t: Trait, value: u8) {
        match t {
            Trait::Creativity => self.creativity = value,
            Trait::Analytical => self.analytical = value,
            Trait::Empathy => self.empathy = value,
            Trait::Intuition => self.intuition = value,
            Trait::Resilience => self.resilience = value,
            Trait::Curiosity => self.curiosity = value,
        }
    }

    pub fn describe(&self) -> String {
        Trait::ALL
            .iter()
            .map(|t| format!("{} {}", t.as_str(), self.get(*t)))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// The ledger's per-identity memory reference.
///
/// The ledger gateway answers either with named fields or with a positional
/// tuple; [`AgentMemory::from_contract_value`] is the only place that knows
/// about both shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMemory {
    pub identity_id: u64,
    /// Content address of the newest dream log, `None` when nothing has been
    /// stored yet.
    pub content_address: Option<String>,
    pub dream_count: u64,
    pub last_updated: u64,
    pub traits: TraitValues,
    pub capabilities: Vec<String>,
}

/// Sentinel values the ledger uses for "no content address yet".
pub fn is_empty_address(address: &str) -> bool {
    let trimmed = address.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("empty") {
        return true;
    }
    match trimmed.strip_prefix("0x") {
        Some(hex) => hex.chars().all(|c| c == '0'),
        None => false,
    }
}

impl AgentMemory {
    /// Normalise a ledger read response into an [`AgentMemory`].
    ///
    /// Named shape:
    /// `{"currentDreamHash": "...", "dreamCount": 4, "lastUpdated": 1700000000,
    ///   "personality": {"creativity": 50, ...}, "capabilities": ["..."]}`
    ///
    /// Positional shape:
    /// `["...", 4, 1700000000, [50, 50, 50, 50, 50, 50], ["..."]]`
    pub fn from_contract_value(identity_id: u64, value: &Value) -> Result<Self, String> {
        match value {
            Value::Object(map) => {
                let address = map
                    .get("currentDreamHash")
                    .or_else(|| map.get("contentAddress"))
                    .or_else(|| map.get("content_address"));
                let count = map.get("dreamCount").or_else(|| map.get("dream_count"));
                let updated = map.get("lastUpdated").or_else(|| map.get("last_updated"));
                let traits = map.get("personality").or_else(|| map.get("traits"));
                Ok(Self {
                    identity_id,
                    content_address: parse_address(address)?,
                    dream_count: parse_u64(count, "dreamCount")?,
                    last_updated: parse_u64(updated, "lastUpdated").unwrap_or(0),
                    traits: parse_traits(traits)?,
                    capabilities: parse_strings(map.get("capabilities")),
                })
            }
            Value::Array(items) => Ok(Self {
                identity_id,
                content_address: parse_address(items.first())?,
                dream_count: parse_u64(items.get(1), "dreamCount")?,
                last_updated: parse_u64(items.get(2), "lastUpdated").unwrap_or(0),
                traits: parse_traits(items.get(3))?,
                capabilities: parse_strings(items.get(4)),
            }),
            other => Err(format!("unexpected memory shape: {}", other)),
        }
    }
}

fn parse_address(value: Option<&Value>) -> Result<Option<String>, String> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if is_empty_address(s) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(format!("content address is not a string: {}", other)),
    }
}

// Contract integers may arrive as JSON numbers or decimal strings.
fn parse_u64(value: Option<&Value>, field: &str) -> Result<u64, String> {
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| format!("{} is not an unsigned integer: {}", field, n)),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("{} is not an unsigned integer: {}", field, s)),
        Some(other) => Err(format!("{} has unexpected type: {}", field, other)),
    }
}

fn parse_traits(value: Option<&Value>) -> Result<TraitValues, String> {
    let mut traits = TraitValues::default();
    match value {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for t in Trait::ALL {
                let v = parse_u64(map.get(t.as_str()), t.as_str())?;
                traits.set(t, v.min(100) as u8);
            }
        }
        Some(Value::Array(items)) => {
            for (t, item) in Trait::ALL.iter().zip(items.iter()) {
                let v = parse_u64(Some(item), t.as_str())?;
                traits.set(*t, v.min(100) as u8);
            }
        }
        Some(other) => return Err(format!("personality has unexpected type: {}", other)),
    }
    Ok(traits)
}

fn parse_strings(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
