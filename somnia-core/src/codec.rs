//! Storage wire format for dream logs
//!
//! A dream log is stored as a JSON array of records, newest first. Older
//! blobs may hold a single bare record; [`decode_log`] accepts both.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

use crate::models::DreamRecord;

pub const LOG_FILE_SUFFIX: &str = "daily_dreams.json";

#[derive(Deserialize)]
#[serde(untagged)]
enum LogShape {
    Many(Vec<DreamRecord>),
    One(Box<DreamRecord>),
}

pub fn encode_log(records: &[DreamRecord]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(records)
}

pub fn decode_log(bytes: &[u8]) -> Result<Vec<DreamRecord>, serde_json::Error> {
    match serde_json::from_slice::<LogShape>(bytes)? {
        LogShape::Many(records) => Ok(records),
        LogShape::One(record) => Ok(vec![*record]),
    }
}

/// Canonical bytes of a log, independent of entry order and key order.
pub fn canonical_bytes(records: &[DreamRecord]) -> Result<Vec<u8>, serde_json::Error> {
    let mut sorted: Vec<&DreamRecord> = records.iter().collect();
    sorted.sort_by_key(|r| r.id);
    // serde_json::Value keeps object keys sorted, which makes key order canonical.
    let value = serde_json::to_value(&sorted)?;
    serde_json::to_vec(&value)
}

/// Byte comparison of two logs after order normalisation.
pub fn normalized_eq(a: &[DreamRecord], b: &[DreamRecord]) -> bool {
    match (canonical_bytes(a), canonical_bytes(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

fn non_alnum_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("valid sanitize regex"))
}

/// Lowercase the name and collapse every run of non-alphanumeric characters
/// into a single underscore.
pub fn sanitize_identity_name(name: &str) -> String {
    let lowered = name.to_lowercase();
    let collapsed = non_alnum_regex().replace_all(&lowered, "_");
    let trimmed = collapsed.trim_matches('_');
    if trimmed.is_empty() {
        "agent".to_string()
    } else {
        trimmed.to_string()
    }
}

/// `{sanitizedIdentityName}_{unixTimestampSeconds}_daily_dreams.json`
pub fn log_file_name(identity_name: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}",
        sanitize_identity_name(identity_name),
        at.timestamp(),
        LOG_FILE_SUFFIX
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DREAM_SCHEMA_VERSION;
    use chrono::NaiveDate;

    fn record(id: u64) -> DreamRecord {
        DreamRecord {
            id,
            date: NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
            timestamp: "2026-02-01T06:00:00Z".parse().unwrap(),
            emotions: vec!["joy".into()],
            symbols: vec![format!("symbol-{}", id)],
            intensity: 5,
            lucidity: 2,
            themes: vec![],
            archetypes: vec![],
            recurring_from: vec![],
            sleep_quality: Some(6),
            recall_clarity: None,
            dream_type: None,
            analysis: None,
            schema_version: DREAM_SCHEMA_VERSION,
        }
    }

    #[test]
    fn test_decode_accepts_single_record_and_list() {
        let single = serde_json::to_vec(&record(1)).unwrap();
        assert_eq!(decode_log(&single).unwrap(), vec![record(1)]);

        let list = encode_log(&[record(2), record(1)]).unwrap();
        assert_eq!(decode_log(&list).unwrap(), vec![record(2), record(1)]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_log(b"not json").is_err());
        assert!(decode_log(b"{\"id\": \"x\"}").is_err());
    }

    #[test]
    fn test_normalized_eq_ignores_entry_order_only() {
        assert!(normalized_eq(&[record(1), record(2)], &[record(2), record(1)]));

        let mut changed = record(2);
        changed.intensity = 9;
        assert!(!normalized_eq(&[record(1), record(2)], &[record(1), changed]));
        assert!(!normalized_eq(&[record(1)], &[record(1), record(2)]));
    }

    #[test]
    fn test_file_name_sanitizes_identity() {
        let at: DateTime<Utc> = "2026-02-01T06:00:00Z".parse().unwrap();
        assert_eq!(
            log_file_name("  Luna -- The Dreamer!! ", at),
            format!("luna_the_dreamer_{}_daily_dreams.json", at.timestamp())
        );
        assert_eq!(sanitize_identity_name("***"), "agent");
    }

    #[test]
    fn test_file_names_differ_across_timestamps() {
        let a: DateTime<Utc> = "2026-02-01T06:00:00Z".parse().unwrap();
        let b: DateTime<Utc> = "2026-02-01T06:00:01Z".parse().unwrap();
        assert_ne!(log_file_name("luna", a), log_file_name("luna", b));
    }
}
