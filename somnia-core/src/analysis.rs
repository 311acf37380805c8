//! Analysis response parsing
//!
//! The inference service answers with free text that should embed two fenced
//! blocks: a ```` ```full_analysis ```` block with prose and a structured
//! ```` ```json ```` block shaped `{analysis, dreamData, personalityImpact?}`.
//! Models regularly emit slightly broken JSON, so the structured block goes
//! through an ordered list of parse strategies, first success wins:
//!
//! 1. `direct`: plain `serde_json` parse
//! 2. `normalized`: strip BOM, smart quotes, NBSP, stray control chars and
//!    trailing commas
//! 3. `reescaped`: escape raw control characters, invalid backslashes and
//!    inner quotes inside string literals
//! 4. `extracted`: pull known fields out with regular expressions
//!
//! When every strategy fails the whole response is treated as prose.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// A single parse strategy: raw block text in, JSON object out.
pub type ParseStrategy = fn(&str) -> Option<Value>;

/// Strategies in the order they are tried.
pub const STRATEGIES: &[(&str, ParseStrategy)] = &[
    ("direct", parse_direct),
    ("normalized", parse_normalized),
    ("reescaped", parse_reescaped),
    ("extracted", extract_fields),
];

#[derive(Debug, Clone, PartialEq)]
pub struct StructuredAnalysis {
    pub analysis: Option<String>,
    pub full_analysis: Option<String>,
    pub dream_data: Option<Value>,
    pub personality_impact: Option<Value>,
    /// Name of the strategy that produced the structured block.
    pub strategy: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    Structured(StructuredAnalysis),
    Prose(String),
}

impl ParsedResponse {
    /// Text to show the user before asking for confirmation.
    pub fn display_text(&self) -> &str {
        match self {
            ParsedResponse::Structured(s) => s
                .full_analysis
                .as_deref()
                .or(s.analysis.as_deref())
                .unwrap_or(""),
            ParsedResponse::Prose(p) => p,
        }
    }
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[ \t]*([A-Za-z_]*)[ \t]*\r?\n(.*?)```").expect("valid fence regex")
    })
}

/// Fenced blocks as `(tag, body)` pairs in document order.
pub fn fenced_blocks(text: &str) -> Vec<(String, String)> {
    fence_regex()
        .captures_iter(text)
        .map(|c| {
            (
                c.get(1).map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default(),
                c.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
            )
        })
        .collect()
}

pub fn parse_response(text: &str) -> ParsedResponse {
    let blocks = fenced_blocks(text);

    let full_analysis = blocks
        .iter()
        .find(|(tag, _)| tag == "full_analysis")
        .map(|(_, body)| body.clone())
        .filter(|b| !b.is_empty());

    let structured_body = blocks
        .iter()
        .find(|(tag, body)| tag != "full_analysis" && body.contains("dreamData"))
        .or_else(|| {
            blocks
                .iter()
                .find(|(tag, body)| tag == "json" && body.contains('{'))
        })
        .map(|(_, body)| body.clone())
        .or_else(|| outer_braces(text).map(str::to_string));

    if let Some(body) = structured_body {
        for (name, strategy) in STRATEGIES {
            if let Some(Value::Object(map)) = strategy(&body) {
                if let Some(structured) = into_structured(map, full_analysis.clone(), name) {
                    tracing::debug!(strategy = name, "Parsed structured analysis block");
                    return ParsedResponse::Structured(structured);
                }
            }
        }
        tracing::warn!("All analysis parse strategies failed, treating response as prose");
    }

    ParsedResponse::Prose(full_analysis.unwrap_or_else(|| text.trim().to_string()))
}

fn outer_braces(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn into_structured(
    mut map: Map<String, Value>,
    full_analysis: Option<String>,
    strategy: &'static str,
) -> Option<StructuredAnalysis> {
    let analysis = match map.remove("analysis") {
        Some(Value::String(s)) => Some(s),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };
    let personality_impact = map
        .remove("personalityImpact")
        .or_else(|| map.remove("personality_impact"))
        .filter(|v| !v.is_null());
    let dream_data = match map
        .remove("dreamData")
        .or_else(|| map.remove("dream_data"))
    {
        Some(v) if !v.is_null() => Some(v),
        // Some models flatten the dream fields into the top-level object.
        _ if map.contains_key("emotions") || map.contains_key("intensity") => {
            Some(Value::Object(map))
        }
        _ => None,
    };

    if dream_data.is_none() && analysis.is_none() {
        return None;
    }

    Some(StructuredAnalysis {
        analysis,
        full_analysis,
        dream_data,
        personality_impact,
        strategy,
    })
}

// ============================================================================
// Strategies
// ============================================================================

pub fn parse_direct(raw: &str) -> Option<Value> {
    serde_json::from_str(raw.trim()).ok()
}

fn trailing_comma_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",(\s*[}\]])").expect("valid trailing comma regex"))
}

/// Unicode and control-character clean-up shared by the later strategies.
pub fn normalize(raw: &str) -> String {
    let cleaned: String = raw
        .trim_start_matches('\u{feff}')
        .chars()
        .filter_map(|c| match c {
            '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{201f}' => Some('"'),
            '\u{2018}' | '\u{2019}' => Some('\''),
            '\u{00a0}' => Some(' '),
            '\u{2028}' | '\u{2029}' => Some('\n'),
            '\n' | '\r' | '\t' => Some(c),
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect();
    trailing_comma_regex()
        .replace_all(cleaned.trim(), "$1")
        .into_owned()
}

pub fn parse_normalized(raw: &str) -> Option<Value> {
    serde_json::from_str(&normalize(raw)).ok()
}

/// Escape characters that are illegal inside JSON string literals.
///
/// A quote inside a string is treated as a terminator only when the next
/// non-whitespace character can follow a string value (`,` `:` `}` `]` or
/// end of input); otherwise it is escaped.
pub fn reescape(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len() + 16);
    let mut in_string = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            i += 1;
            continue;
        }

        match c {
            '\\' => match chars.get(i + 1) {
                Some(n) if matches!(n, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                    out.push('\\');
                    out.push(*n);
                    i += 2;
                    continue;
                }
                _ => out.push_str("\\\\"),
            },
            '"' => {
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next, None | Some(',') | Some(':') | Some('}') | Some(']')) {
                    in_string = false;
                    out.push('"');
                } else {
                    out.push_str("\\\"");
                }
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {}
            c => out.push(c),
        }
        i += 1;
    }
    out
}

pub fn parse_reescaped(raw: &str) -> Option<Value> {
    serde_json::from_str(&reescape(&normalize(raw))).ok()
}

// ============================================================================
// Manual field extraction
// ============================================================================

const STRING_ARRAY_FIELDS: &[&str] = &["emotions", "symbols", "themes", "archetypes"];
const DREAM_INT_FIELDS: &[&str] = &[
    "intensity",
    "lucidity",
    "sleep_quality",
    "sleepQuality",
    "recall_clarity",
    "recallClarity",
];
const IMPACT_INT_FIELDS: &[&str] = &[
    "creativityChange",
    "creativity_change",
    "analyticalChange",
    "analytical_change",
    "empathyChange",
    "empathy_change",
    "intuitionChange",
    "intuition_change",
    "resilienceChange",
    "resilience_change",
    "curiosityChange",
    "curiosity_change",
    "evolutionWeight",
    "evolution_weight",
];

fn string_item_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).expect("valid string regex"))
}

fn flat_object_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[^{}]*\}").expect("valid object regex"))
}

fn unescape_fragment(s: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", s)).unwrap_or_else(|_| s.replace("\\\"", "\""))
}

fn find_string(text: &str, key: &str) -> Option<String> {
    let re = Regex::new(&format!(r#""{}"\s*:\s*"((?:[^"\\]|\\.)*)""#, regex::escape(key))).ok()?;
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| unescape_fragment(m.as_str()))
}

fn find_int(text: &str, key: &str) -> Option<i64> {
    let re = Regex::new(&format!(r#""{}"\s*:\s*(-?\d+)"#, regex::escape(key))).ok()?;
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn find_array_body<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let re = Regex::new(&format!(r#"(?s)"{}"\s*:\s*\[(.*?)\]"#, regex::escape(key))).ok()?;
    re.captures(text).and_then(|c| c.get(1)).map(|m| m.as_str())
}

/// Last-resort strategy: rebuild the structured object from individually
/// matched fields.
pub fn extract_fields(raw: &str) -> Option<Value> {
    let text = normalize(raw);
    let split = text
        .find("\"personalityImpact\"")
        .or_else(|| text.find("\"personality_impact\""))
        .unwrap_or(text.len());
    let (dream_part, impact_part) = text.split_at(split);

    let mut dream = Map::new();
    for key in STRING_ARRAY_FIELDS {
        if let Some(body) = find_array_body(dream_part, key) {
            let items: Vec<Value> = string_item_regex()
                .captures_iter(body)
                .filter_map(|c| c.get(1))
                .map(|m| Value::String(unescape_fragment(m.as_str())))
                .collect();
            dream.insert((*key).to_string(), Value::Array(items));
        }
    }
    for key in DREAM_INT_FIELDS {
        if let Some(n) = find_int(dream_part, key) {
            dream.insert((*key).to_string(), Value::from(n));
        }
    }
    for key in ["recurring_from", "recurringFrom"] {
        if let Some(body) = find_array_body(dream_part, key) {
            let ids: Vec<Value> = body
                .split(',')
                .filter_map(|s| s.trim().parse::<i64>().ok())
                .map(Value::from)
                .collect();
            dream.insert(key.to_string(), Value::Array(ids));
        }
    }
    for key in ["dream_type", "dreamType", "date"] {
        if let Some(s) = find_string(dream_part, key) {
            dream.insert(key.to_string(), Value::String(s));
        }
    }

    if !dream.contains_key("emotions") && !dream.contains_key("intensity") {
        return None;
    }

    let mut root = Map::new();
    if let Some(analysis) = find_string(dream_part, "analysis") {
        root.insert("analysis".to_string(), Value::String(analysis));
    }
    root.insert("dreamData".to_string(), Value::Object(dream));

    if !impact_part.is_empty() {
        let mut impact = Map::new();
        for key in IMPACT_INT_FIELDS {
            if let Some(n) = find_int(impact_part, key) {
                impact.insert((*key).to_string(), Value::from(n));
            }
        }
        for key in ["moodShift", "mood_shift"] {
            if let Some(mood) = find_string(impact_part, key) {
                impact.insert(key.to_string(), Value::String(mood));
            }
        }
        for key in ["newFeatures", "new_features"] {
            if let Some(body) = find_array_body(impact_part, key) {
                impact.insert(key.to_string(), Value::Array(extract_features(body)));
            }
        }
        if !impact.is_empty() {
            root.insert("personalityImpact".to_string(), Value::Object(impact));
        }
    }

    Some(Value::Object(root))
}

/// Capability objects inside a `newFeatures` array; absent fields stay
/// absent so the validator can name them.
fn extract_features(body: &str) -> Vec<Value> {
    flat_object_regex()
        .find_iter(body)
        .map(|m| {
            let object = m.as_str();
            let mut feature = Map::new();
            for key in ["name", "description"] {
                if let Some(s) = find_string(object, key) {
                    feature.insert(key.to_string(), Value::String(s));
                }
            }
            if let Some(n) = find_int(object, "intensity") {
                feature.insert("intensity".to_string(), Value::from(n));
            }
            Value::Object(feature)
        })
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wrap(structured: &str) -> String {
        format!(
            "Here is the reading.\n```full_analysis\nYou climbed a staircase toward the moon.\n```\n\n```json\n{}\n```\n",
            structured
        )
    }

    fn structured(resp: ParsedResponse) -> StructuredAnalysis {
        match resp {
            ParsedResponse::Structured(s) => s,
            ParsedResponse::Prose(p) => panic!("expected structured, got prose: {}", p),
        }
    }

    #[test]
    fn test_well_formed_response_uses_direct_strategy() {
        let text = wrap(
            r#"{"analysis": "Ascent", "dreamData": {"emotions": ["awe"], "symbols": ["moon"], "intensity": 8, "lucidity": 3}}"#,
        );
        let s = structured(parse_response(&text));
        assert_eq!(s.strategy, "direct");
        assert_eq!(s.analysis.as_deref(), Some("Ascent"));
        assert_eq!(s.full_analysis.as_deref(), Some("You climbed a staircase toward the moon."));
        assert_eq!(s.dream_data.unwrap()["intensity"], 8);
        assert!(s.personality_impact.is_none());
    }

    #[test]
    fn test_smart_quotes_and_trailing_commas_are_normalized() {
        let text = wrap(
            "{\u{201c}analysis\u{201d}: \u{201c}Fall\u{201d}, \"dreamData\": {\"emotions\": [\"fear\",], \"symbols\": [\"cliff\"], \"intensity\": 9, \"lucidity\": 1,},}",
        );
        let s = structured(parse_response(&text));
        assert_eq!(s.strategy, "normalized");
        assert_eq!(s.dream_data.unwrap()["emotions"], json!(["fear"]));
    }

    #[test]
    fn test_raw_newlines_and_inner_quotes_are_reescaped() {
        let text = wrap(
            "{\"analysis\": \"Line one\nLine \"two\" here\", \"dreamData\": {\"emotions\": [\"calm\"], \"symbols\": [\"river\"], \"intensity\": 4, \"lucidity\": 2}}",
        );
        let s = structured(parse_response(&text));
        assert_eq!(s.strategy, "reescaped");
        assert_eq!(s.analysis.as_deref(), Some("Line one\nLine \"two\" here"));
    }

    #[test]
    fn test_invalid_backslash_is_reescaped() {
        let raw = r#"{"analysis": "path C:\dreams", "dreamData": {"emotions": ["x"], "symbols": ["y"], "intensity": 1, "lucidity": 1}}"#;
        assert!(parse_direct(raw).is_none());
        let value = parse_reescaped(raw).expect("reescape should repair backslash");
        assert_eq!(value["analysis"], "path C:\\dreams");
    }

    #[test]
    fn test_field_extraction_recovers_broken_block() {
        let text = wrap(
            r#"{"analysis": "Broken", "dreamData": {"emotions": ["joy", "awe"], "symbols": ["bird"] "intensity": 7, "lucidity": 4, "dreamType": "lucid"}, "personalityImpact": {"creativityChange": 3, "moodShift": "uplifted", "evolutionWeight": 20 "#,
        );
        let s = structured(parse_response(&text));
        assert_eq!(s.strategy, "extracted");
        let data = s.dream_data.unwrap();
        assert_eq!(data["emotions"], json!(["joy", "awe"]));
        assert_eq!(data["intensity"], 7);
        assert_eq!(data["dreamType"], "lucid");
        let impact = s.personality_impact.unwrap();
        assert_eq!(impact["creativityChange"], 3);
        assert_eq!(impact["moodShift"], "uplifted");
    }

    #[test]
    fn test_field_extraction_keeps_snake_case_impact_and_features() {
        let text = wrap(
            r#"{"dream_data": {"emotions": ["calm"], "symbols": ["tide"], "intensity": 5, "lucidity": 2} "personality_impact": {"curiosity_change": 4, "empathy_change": -1, "mood_shift": "curious", "evolution_weight": 35, "newFeatures": [{"name": "Tide Reading", "description": "Reads moods", "intensity": 40}, {"name": "Echo"}] "#,
        );
        let s = structured(parse_response(&text));
        assert_eq!(s.strategy, "extracted");
        assert_eq!(s.dream_data.unwrap()["symbols"], json!(["tide"]));

        let impact = s.personality_impact.unwrap();
        assert_eq!(impact["curiosity_change"], 4);
        assert_eq!(impact["empathy_change"], -1);
        assert_eq!(impact["mood_shift"], "curious");
        assert_eq!(impact["evolution_weight"], 35);
        assert_eq!(
            impact["newFeatures"],
            json!([
                {"name": "Tide Reading", "description": "Reads moods", "intensity": 40},
                {"name": "Echo"}
            ])
        );
    }

    #[test]
    fn test_unfenced_json_is_found_by_braces() {
        let text = r#"Sure! {"dreamData": {"emotions": ["awe"], "symbols": ["door"], "intensity": 2, "lucidity": 1}} Hope that helps."#;
        let s = structured(parse_response(text));
        assert_eq!(s.dream_data.unwrap()["symbols"], json!(["door"]));
    }

    #[test]
    fn test_unstructured_response_is_prose() {
        let resp = parse_response("I could not analyze this dream, sorry.");
        assert_eq!(resp, ParsedResponse::Prose("I could not analyze this dream, sorry.".into()));
        assert_eq!(resp.display_text(), "I could not analyze this dream, sorry.");
    }

    #[test]
    fn test_strategies_are_independent() {
        assert!(parse_direct("{\"a\": 1,}").is_none());
        assert_eq!(parse_normalized("{\"a\": 1,}"), Some(json!({"a": 1})));
        assert_eq!(reescape("{\"a\": \"x\ty\"}"), "{\"a\": \"x\\ty\"}");
        assert!(extract_fields("{\"nothing\": true}").is_none());
    }
}
