//! Snapshot document envelope and lenient field access.
//!
//! Feeds in the wild disagree on types: booleans arrive as `0`/`1`, counts as
//! strings, ids as numbers. Field readers accept the common spellings and
//! treat anything else as null rather than failing the record.

use serde_json::{Map, Value};
use snafu::prelude::*;

use crate::error::{FeedError, JsonParseSnafu, MissingStationsSnafu, NotAnObjectSnafu};

/// Top-level metadata plus the raw station records.
#[derive(Debug)]
pub struct Envelope {
    pub last_updated: Option<i64>,
    pub ttl: Option<i64>,
    pub version: Option<String>,
    pub stations: Vec<Value>,
}

impl Envelope {
    pub fn parse(payload: &[u8]) -> Result<Self, FeedError> {
        let document: Value = serde_json::from_slice(payload).context(JsonParseSnafu)?;
        let Value::Object(mut root) = document else {
            return NotAnObjectSnafu.fail();
        };

        let stations = match root
            .get_mut("data")
            .and_then(|data| data.get_mut("stations"))
            .map(Value::take)
        {
            Some(Value::Array(stations)) => stations,
            _ => return MissingStationsSnafu.fail(),
        };

        Ok(Self {
            last_updated: int(&root, "last_updated").or_else(|| rfc3339_seconds(&root, "last_updated")),
            ttl: int(&root, "ttl"),
            version: string(&root, "version"),
            stations,
        })
    }
}

/// Integer field; accepts integral floats and numeric strings.
pub fn int(record: &Map<String, Value>, key: &str) -> Option<i64> {
    match record.get(key)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Float field; accepts numeric strings.
pub fn float(record: &Map<String, Value>, key: &str) -> Option<f64> {
    match record.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Boolean field; accepts `0`/`1` and `"true"`/`"false"`.
pub fn boolean(record: &Map<String, Value>, key: &str) -> Option<bool> {
    match record.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// String field; numbers are rendered, localized arrays yield their first text.
pub fn string(record: &Map<String, Value>, key: &str) -> Option<String> {
    match record.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items
            .iter()
            .find_map(|item| item.get("text").and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

/// Entity identifier; blank ids count as missing.
pub fn station_id(record: &Map<String, Value>) -> Option<String> {
    string(record, "station_id").filter(|id| !id.trim().is_empty())
}

fn rfc3339_seconds(record: &Map<String, Value>, key: &str) -> Option<i64> {
    let raw = record.get(key)?.as_str()?;
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|at| at.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_envelope() {
        let payload = br#"{"last_updated": 1705329000, "ttl": 5, "version": "2.3",
            "data": {"stations": [{"station_id": "a"}, {"station_id": "b"}]}}"#;
        let envelope = Envelope::parse(payload).unwrap();
        assert_eq!(envelope.last_updated, Some(1705329000));
        assert_eq!(envelope.ttl, Some(5));
        assert_eq!(envelope.version.as_deref(), Some("2.3"));
        assert_eq!(envelope.stations.len(), 2);
    }

    #[test]
    fn test_envelope_v3_timestamp() {
        let payload = br#"{"last_updated": "2024-01-15T14:30:00Z", "ttl": 0,
            "version": "3.0", "data": {"stations": []}}"#;
        let envelope = Envelope::parse(payload).unwrap();
        assert_eq!(envelope.last_updated, Some(1705329000));
        assert!(envelope.stations.is_empty());
    }

    #[test]
    fn test_envelope_rejects_bad_documents() {
        assert!(matches!(
            Envelope::parse(b"{not json").unwrap_err(),
            FeedError::JsonParse { .. }
        ));
        assert!(matches!(
            Envelope::parse(b"[1, 2]").unwrap_err(),
            FeedError::NotAnObject
        ));
        assert!(matches!(
            Envelope::parse(br#"{"data": {"bikes": []}}"#).unwrap_err(),
            FeedError::MissingStations
        ));
        assert!(matches!(
            Envelope::parse(br#"{"data": {"stations": {}}}"#).unwrap_err(),
            FeedError::MissingStations
        ));
    }

    #[test]
    fn test_lenient_fields() {
        let record = map(json!({
            "station_id": 72,
            "num_bikes_available": "5",
            "capacity": 30.0,
            "is_renting": 1,
            "is_returning": "false",
            "is_installed": true,
            "lat": "40.7",
            "name": [{"text": "W 52 St & 11 Ave", "language": "en"}],
            "bogus": {"nested": true},
        }));

        assert_eq!(station_id(&record).as_deref(), Some("72"));
        assert_eq!(int(&record, "num_bikes_available"), Some(5));
        assert_eq!(int(&record, "capacity"), Some(30));
        assert_eq!(boolean(&record, "is_renting"), Some(true));
        assert_eq!(boolean(&record, "is_returning"), Some(false));
        assert_eq!(boolean(&record, "is_installed"), Some(true));
        assert_eq!(float(&record, "lat"), Some(40.7));
        assert_eq!(string(&record, "name").as_deref(), Some("W 52 St & 11 Ave"));
        assert_eq!(int(&record, "bogus"), None);
        assert_eq!(int(&record, "absent"), None);
    }

    #[test]
    fn test_blank_station_id_is_missing() {
        assert_eq!(station_id(&map(json!({"station_id": "  "}))), None);
        assert_eq!(station_id(&map(json!({"station_id": null}))), None);
        assert_eq!(station_id(&map(json!({}))), None);
    }
}
