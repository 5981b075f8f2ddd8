//! Collaborators consumed by discovery and ingestion.
//!
//! The core never decides which stream a device uuid maps to, nor what a value
//! token means. Those decisions belong to a [`DeviceDirectory`] and a
//! [`RecordDecoder`] supplied by the surrounding application.
//!
//! Two ready-made implementations are provided:
//! - [`StaticDirectory`]: the `[[devices]]` table from configuration.
//! - [`JsonDecoder`]: turns records into `serde_json::Value` documents.

use crate::config::{DaqConfig, DeviceBinding};
use crate::error::{AppResult, DaqError};
use crate::stream::shdr::{DataRecord, RecordCategory};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

pub use crate::stream::shdr::UNAVAILABLE;

/// Device registry lookup by uuid.
pub trait DeviceDirectory: Send + Sync {
    /// Binding for `uuid`, if the device is known.
    fn lookup(&self, uuid: &str) -> Option<DeviceBinding>;
}

/// Directory backed by a fixed set of bindings.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    by_uuid: HashMap<String, DeviceBinding>,
}

impl StaticDirectory {
    /// Build from bindings. Later bindings replace earlier ones with the same uuid.
    pub fn new(bindings: impl IntoIterator<Item = DeviceBinding>) -> Self {
        Self {
            by_uuid: bindings
                .into_iter()
                .map(|binding| (binding.uuid.clone(), binding))
                .collect(),
        }
    }

    /// Build from the `[[devices]]` table.
    pub fn from_config(config: &DaqConfig) -> Self {
        Self::new(config.devices.iter().cloned())
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    /// Whether no device is known.
    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }
}

impl DeviceDirectory for StaticDirectory {
    fn lookup(&self, uuid: &str) -> Option<DeviceBinding> {
        self.by_uuid.get(uuid).cloned()
    }
}

/// Turns a tokenized record into typed device state.
pub trait RecordDecoder: Send + Sync {
    /// Decoded representation
    type Output;

    /// Decode one record.
    fn decode(&self, record: &DataRecord) -> AppResult<Self::Output>;
}

/// Decoder producing one JSON object per record.
///
/// ```text
/// {"device_id":"mill-1","timestamp":"2024-01-01T00:00:00Z","key":"Xact","category":"sample","value":500.0}
/// ```
///
/// `UNAVAILABLE` values decode to `null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonDecoder;

impl RecordDecoder for JsonDecoder {
    type Output = Value;

    fn decode(&self, record: &DataRecord) -> AppResult<Value> {
        let value = match record.category {
            RecordCategory::Sample => sample_value(record.value().unwrap_or(UNAVAILABLE)),
            RecordCategory::Event => text_value(record.value().unwrap_or(UNAVAILABLE)),
            RecordCategory::Condition => json!({
                "level": field(record, 0),
                "native_code": field(record, 1),
                "native_severity": field(record, 2),
                "qualifier": field(record, 3),
                "message": field(record, 4),
            }),
            RecordCategory::Message => json!({
                "native_code": field(record, 0),
                "text": field(record, 1),
            }),
            RecordCategory::TimeSeries => time_series_value(record)?,
            RecordCategory::Asset => asset_value(record),
        };

        let mut doc = Map::new();
        doc.insert("device_id".into(), json!(record.device_id));
        doc.insert("timestamp".into(), json!(record.timestamp));
        if let Some(time) = record.parsed_timestamp() {
            doc.insert("time".into(), json!(time.to_rfc3339()));
        }
        doc.insert("key".into(), json!(record.key));
        doc.insert("category".into(), serde_json::to_value(record.category)?);
        doc.insert("value".into(), value);
        Ok(Value::Object(doc))
    }
}

fn field(record: &DataRecord, index: usize) -> Value {
    record
        .values
        .get(index)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map_or(Value::Null, |v| json!(v))
}

fn text_value(token: &str) -> Value {
    if token == UNAVAILABLE {
        Value::Null
    } else {
        json!(token)
    }
}

fn sample_value(token: &str) -> Value {
    let token = token.trim();
    if token == UNAVAILABLE {
        return Value::Null;
    }
    let numbers: Option<Vec<f64>> = token.split_whitespace().map(|t| t.parse().ok()).collect();
    match numbers {
        Some(numbers) if numbers.len() == 1 => json!(numbers[0]),
        Some(numbers) if !numbers.is_empty() => json!(numbers),
        _ => json!(token),
    }
}

fn time_series_value(record: &DataRecord) -> AppResult<Value> {
    let count = record.values.first().map(|c| c.trim()).unwrap_or_default();
    if count == UNAVAILABLE {
        return Ok(Value::Null);
    }
    let count: usize = count
        .parse()
        .map_err(|_| DaqError::Protocol(format!("Bad time series count for '{}'", record.key)))?;
    let rate = record
        .values
        .get(1)
        .and_then(|r| r.trim().parse::<f64>().ok());
    let samples: Vec<f64> = record
        .values
        .get(2)
        .map(|s| s.split_whitespace().filter_map(|v| v.parse().ok()).collect())
        .unwrap_or_default();
    if samples.len() != count {
        return Err(DaqError::Protocol(format!(
            "Time series '{}' declares {} samples, carries {}",
            record.key,
            count,
            samples.len()
        )));
    }
    Ok(json!({ "count": count, "rate": rate, "samples": samples }))
}

fn asset_value(record: &DataRecord) -> Value {
    match record.key.as_str() {
        "@REMOVE_ASSET@" => json!({ "asset_id": field(record, 0) }),
        "@REMOVE_ALL_ASSETS@" => json!({ "asset_type": field(record, 0) }),
        _ => json!({
            "asset_id": field(record, 0),
            "asset_type": field(record, 1),
            "body": record.values.get(2).cloned().unwrap_or_default(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(category: RecordCategory, key: &str, values: &[&str]) -> DataRecord {
        DataRecord {
            category,
            device_id: "mill-1".into(),
            timestamp: Some("2024-01-01T00:00:00Z".into()),
            key: key.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn static_directory_lookup() {
        let dir = StaticDirectory::new(vec![DeviceBinding {
            uuid: "ABC".into(),
            id: "mill-1".into(),
            stream_uri: "shdr://127.0.0.1:7878".into(),
        }]);
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.lookup("ABC").map(|b| b.id), Some("mill-1".into()));
        assert!(dir.lookup("XYZ").is_none());
    }

    #[test]
    fn decodes_sample() {
        let doc = JsonDecoder
            .decode(&record(RecordCategory::Sample, "Xact", &["500"]))
            .unwrap();
        assert_eq!(doc["value"], json!(500.0));
        assert_eq!(doc["category"], json!("sample"));
        assert_eq!(doc["key"], json!("Xact"));
        assert_eq!(doc["time"], json!("2024-01-01T00:00:00+00:00"));
    }

    #[test]
    fn unavailable_is_null() {
        let doc = JsonDecoder
            .decode(&record(RecordCategory::Event, "mode", &[UNAVAILABLE]))
            .unwrap();
        assert!(doc["value"].is_null());
    }

    #[test]
    fn decodes_vector_sample() {
        let doc = JsonDecoder
            .decode(&record(RecordCategory::Sample, "pos", &["1 2.5 3"]))
            .unwrap();
        assert_eq!(doc["value"], json!([1.0, 2.5, 3.0]));
    }

    #[test]
    fn decodes_condition() {
        let doc = JsonDecoder
            .decode(&record(
                RecordCategory::Condition,
                "logic",
                &["FAULT", "E42", "", "HIGH", "Overtemp"],
            ))
            .unwrap();
        assert_eq!(doc["value"]["level"], json!("FAULT"));
        assert!(doc["value"]["native_severity"].is_null());
        assert_eq!(doc["value"]["message"], json!("Overtemp"));
    }

    #[test]
    fn time_series_count_mismatch_is_protocol_error() {
        let err = JsonDecoder
            .decode(&record(RecordCategory::TimeSeries, "amps", &["3", "100", "1 2"]))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);

        let doc = JsonDecoder
            .decode(&record(RecordCategory::TimeSeries, "amps", &["2", "", "1 2"]))
            .unwrap();
        assert!(doc["value"]["rate"].is_null());
        assert_eq!(doc["value"]["samples"], json!([1.0, 2.0]));
    }

    #[test]
    fn decodes_asset() {
        let doc = JsonDecoder
            .decode(&record(
                RecordCategory::Asset,
                "@ASSET@",
                &["T1", "CuttingTool", "<CuttingTool/>"],
            ))
            .unwrap();
        assert_eq!(doc["value"]["asset_id"], json!("T1"));
        assert_eq!(doc["value"]["body"], json!("<CuttingTool/>"));
    }
}
