use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current version of the dream record schema.
pub const DREAM_SCHEMA_VERSION: u32 = 1;

/// Classification attached to a dream by the analysis step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DreamType {
    Normal,
    Lucid,
    Nightmare,
    Recurring,
    Prophetic,
    Healing,
}

impl DreamType {
    pub const ALL: [DreamType; 6] = [
        DreamType::Normal,
        DreamType::Lucid,
        DreamType::Nightmare,
        DreamType::Recurring,
        DreamType::Prophetic,
        DreamType::Healing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DreamType::Normal => "normal",
            DreamType::Lucid => "lucid",
            DreamType::Nightmare => "nightmare",
            DreamType::Recurring => "recurring",
            DreamType::Prophetic => "prophetic",
            DreamType::Healing => "healing",
        }
    }
}

impl fmt::Display for DreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DreamType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        DreamType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == needle)
            .ok_or_else(|| format!("unknown dream type '{}'", s))
    }
}

/// One validated entry of an agent's dream log.
///
/// Records are immutable once validated; `id` is the 1-indexed position of the
/// submission in the agent's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DreamRecord {
    pub id: u64,
    pub date: NaiveDate,
    pub timestamp: DateTime<Utc>,
    pub emotions: Vec<String>,
    pub symbols: Vec<String>,
    pub intensity: u8,
    pub lucidity: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub themes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archetypes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recurring_from: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_quality: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recall_clarity: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dream_type: Option<DreamType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    DREAM_SCHEMA_VERSION
}

impl DreamRecord {
    /// Short human-readable summary used in prompts and session output.
    pub fn summary(&self) -> String {
        format!(
            "#{} ({}) emotions: {}; symbols: {}; intensity {}/10, lucidity {}/5",
            self.id,
            self.date,
            self.emotions.join(", "),
            self.symbols.join(", "),
            self.intensity,
            self.lucidity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dream_type_parses_case_insensitively() {
        assert_eq!("Lucid".parse::<DreamType>().unwrap(), DreamType::Lucid);
        assert_eq!(" NIGHTMARE ".parse::<DreamType>().unwrap(), DreamType::Nightmare);
        assert!("daydream".parse::<DreamType>().is_err());
    }

    #[test]
    fn test_optional_fields_are_omitted_when_empty() {
        let record = DreamRecord {
            id: 1,
            date: NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(),
            timestamp: "2026-01-02T03:04:05Z".parse().unwrap(),
            emotions: vec!["awe".into()],
            symbols: vec!["ocean".into()],
            intensity: 5,
            lucidity: 2,
            themes: vec![],
            archetypes: vec![],
            recurring_from: vec![],
            sleep_quality: None,
            recall_clarity: None,
            dream_type: None,
            analysis: None,
            schema_version: DREAM_SCHEMA_VERSION,
        };

        let value = serde_json::to_value(&record).unwrap();
        let obj = value.as_object().unwrap();
        assert!(!obj.contains_key("themes"));
        assert!(!obj.contains_key("sleep_quality"));
        assert_eq!(obj["schema_version"], 1);
    }
}
