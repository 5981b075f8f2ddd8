//! SHDR line tokenization.
//!
//! An SHDR line is a `|`-delimited sequence: an optional leading timestamp
//! followed by observations, each a key and one or more value tokens.
//!
//! ```text
//! 2024-01-01T00:00:00Z|Xact|500|mode|AUTOMATIC
//! 2024-01-01T00:00:00Z|logic|FAULT|E42|2|HIGH|Overtemp
//! 2024-01-01T00:00:00Z|@ASSET@|T1|CuttingTool|--multiline--0FED07ACED
//! * PONG 10000
//! ```
//!
//! The tokenizer splits lines and tags each observation with a
//! [`RecordCategory`]. It does not interpret values; that is left to a
//! [`RecordDecoder`](crate::collab::RecordDecoder).
//!
//! Multi-line assets start with a `--multiline--<TAG>` body and always end at
//! the first line equal to the full marker. A numeric `TAG` also caps the block
//! at that many body lines.
//!
//! A condition reported as `key|UNAVAILABLE||||` is recognised from its four
//! empty trailing fields. Any other layout needs a `category_hints` entry.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

static PONG: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^\*\s*PONG\s+(\d+)\s*$"));

static TIMESTAMP: Lazy<Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}T"));

const MULTILINE_PREFIX: &str = "--multiline--";

const ASSET_KEYS: &[&str] = &[
    "@ASSET@",
    "@UPDATE_ASSET@",
    "@REMOVE_ASSET@",
    "@REMOVE_ALL_ASSETS@",
];

const CONDITION_LEVELS: &[&str] = &["NORMAL", "WARNING", "FAULT"];

/// Value reported for an observation the adapter cannot currently supply.
pub const UNAVAILABLE: &str = "UNAVAILABLE";

/// Observation category inferred from the line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCategory {
    /// Numeric key/value pair
    Sample,
    /// Non-numeric key/value pair
    Event,
    /// `level|native_code|native_severity|qualifier|message`
    Condition,
    /// Asset command; values hold the rest of the line (or the multi-line body)
    Asset,
    /// `count|rate|values`
    TimeSeries,
    /// `native_code|text`
    Message,
}

impl RecordCategory {
    /// Number of value tokens that follow the key.
    fn arity(self) -> usize {
        match self {
            RecordCategory::Sample | RecordCategory::Event => 1,
            RecordCategory::Message => 2,
            RecordCategory::TimeSeries => 3,
            RecordCategory::Condition => 5,
            RecordCategory::Asset => usize::MAX,
        }
    }
}

impl std::str::FromStr for RecordCategory {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "sample" => Ok(RecordCategory::Sample),
            "event" => Ok(RecordCategory::Event),
            "condition" => Ok(RecordCategory::Condition),
            "asset" => Ok(RecordCategory::Asset),
            "timeseries" => Ok(RecordCategory::TimeSeries),
            "message" => Ok(RecordCategory::Message),
            _ => Err(DaqError::Config(format!("Unknown record category '{}'", s))),
        }
    }
}

/// One tokenized observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataRecord {
    /// Inferred category
    pub category: RecordCategory,
    /// Device the stream belongs to
    pub device_id: String,
    /// Raw timestamp token; `None` for legacy lines without one
    pub timestamp: Option<String>,
    /// Data item key (may carry a `device:` prefix)
    pub key: String,
    /// Value tokens in line order
    pub values: Vec<String>,
}

impl DataRecord {
    /// First value token.
    pub fn value(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }

    /// The raw timestamp parsed as UTC, ignoring any `@duration` suffix.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.timestamp.as_deref()?;
        let raw = raw.split('@').next().unwrap_or(raw);
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|t| t.and_utc())
            })
    }
}

/// What a single input line turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShdrLine {
    /// Observations carried by the line
    Records(Vec<DataRecord>),
    /// Heartbeat reply with the adapter's period
    Pong(Duration),
    /// `* name: value` adapter command
    Command {
        /// Command name
        name: String,
        /// Command argument
        value: String,
    },
    /// Line consumed by an open multi-line asset
    Pending,
    /// Blank line
    Empty,
}

#[derive(Debug)]
struct PendingAsset {
    timestamp: Option<String>,
    key: String,
    head: Vec<String>,
    marker: String,
    max_lines: Option<usize>,
    body: Vec<String>,
}

impl PendingAsset {
    fn into_record(self, device_id: &str) -> DataRecord {
        let mut values = self.head;
        values.push(self.body.join("\n"));
        DataRecord {
            category: RecordCategory::Asset,
            device_id: device_id.to_string(),
            timestamp: self.timestamp,
            key: self.key,
            values,
        }
    }
}

/// Stateful tokenizer for one stream.
///
/// State is only carried between lines while a multi-line asset is open.
#[derive(Debug)]
pub struct LineTokenizer {
    device_id: String,
    hints: HashMap<String, RecordCategory>,
    pending: Option<PendingAsset>,
}

impl LineTokenizer {
    /// Create a tokenizer tagging records with `device_id`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            hints: HashMap::new(),
            pending: None,
        }
    }

    /// Force a category for `key`, overriding inference.
    pub fn with_hint(mut self, key: impl Into<String>, category: RecordCategory) -> Self {
        self.hints.insert(key.into(), category);
        self
    }

    /// Force categories for several keys at once.
    pub fn with_hints<I, K>(mut self, hints: I) -> Self
    where
        I: IntoIterator<Item = (K, RecordCategory)>,
        K: Into<String>,
    {
        self.hints
            .extend(hints.into_iter().map(|(key, category)| (key.into(), category)));
        self
    }

    /// Device id attached to emitted records.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether a multi-line asset is still collecting lines.
    pub fn in_multiline(&self) -> bool {
        self.pending.is_some()
    }

    /// Tokenize one line (without its terminating newline).
    pub fn feed(&mut self, line: &str) -> AppResult<ShdrLine> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(mut pending) = self.pending.take() {
            if line.trim() != pending.marker {
                pending.body.push(line.to_string());
                if pending.max_lines.map_or(true, |max| pending.body.len() < max) {
                    self.pending = Some(pending);
                    return Ok(ShdrLine::Pending);
                }
            }
            return Ok(ShdrLine::Records(vec![pending.into_record(&self.device_id)]));
        }

        if line.trim().is_empty() {
            return Ok(ShdrLine::Empty);
        }
        if line.starts_with('*') {
            return Ok(parse_command(line));
        }

        let tokens: Vec<&str> = line.split('|').collect();
        let (timestamp, rest) = match tokens.split_first() {
            Some((first, rest)) if is_timestamp(first.trim()) => (Some(first.trim().to_string()), rest),
            _ => (None, tokens.as_slice()),
        };

        self.tokenize_records(timestamp, rest)
    }

    fn tokenize_records(&mut self, timestamp: Option<String>, tokens: &[&str]) -> AppResult<ShdrLine> {
        let mut records = Vec::new();
        let mut i = 0;

        while i < tokens.len() {
            let key = tokens[i].trim();
            i += 1;

            if key.is_empty() {
                if i == tokens.len() {
                    break;
                }
                return Err(DaqError::Protocol(format!(
                    "Empty key at token {} of SHDR line",
                    i
                )));
            }

            if ASSET_KEYS.contains(&key) {
                let asset = self.asset_record(timestamp.clone(), key, &tokens[i..]);
                if let Some(record) = asset {
                    records.push(record);
                }
                break;
            }

            let category = match self.hints.get(key) {
                Some(hint) => *hint,
                None => infer_category(&tokens[i..]).ok_or_else(|| {
                    DaqError::Protocol(format!("Key '{}' has no value", key))
                })?,
            };

            let take = category.arity().min(tokens.len() - i);
            if take == 0 {
                return Err(DaqError::Protocol(format!("Key '{}' has no value", key)));
            }
            let values = tokens[i..i + take].iter().map(|v| v.to_string()).collect();
            i += take;

            records.push(DataRecord {
                category,
                device_id: self.device_id.clone(),
                timestamp: timestamp.clone(),
                key: key.to_string(),
                values,
            });
        }

        Ok(ShdrLine::Records(records))
    }

    /// Build an asset record, or open a multi-line block and return `None`.
    fn asset_record(
        &mut self,
        timestamp: Option<String>,
        key: &str,
        tokens: &[&str],
    ) -> Option<DataRecord> {
        let carries_body = matches!(key, "@ASSET@" | "@UPDATE_ASSET@");
        let values: Vec<String> = if carries_body && tokens.len() > 2 {
            let mut head: Vec<String> = tokens[..2].iter().map(|t| t.to_string()).collect();
            head.push(tokens[2..].join("|"));
            head
        } else {
            tokens.iter().map(|t| t.to_string()).collect()
        };

        if carries_body && values.len() == 3 {
            let body = values[2].trim();
            if let Some(tag) = body.strip_prefix(MULTILINE_PREFIX) {
                let max_lines = tag.parse::<usize>().ok();
                let pending = PendingAsset {
                    timestamp,
                    key: key.to_string(),
                    head: values[..2].to_vec(),
                    marker: body.to_string(),
                    max_lines,
                    body: Vec::new(),
                };
                if pending.max_lines == Some(0) {
                    return Some(pending.into_record(&self.device_id));
                }
                self.pending = Some(pending);
                return None;
            }
        }

        Some(DataRecord {
            category: RecordCategory::Asset,
            device_id: self.device_id.clone(),
            timestamp,
            key: key.to_string(),
            values,
        })
    }
}

fn is_timestamp(token: &str) -> bool {
    matches!(&*TIMESTAMP, Ok(re) if re.is_match(token))
}

fn parse_command(line: &str) -> ShdrLine {
    if let Ok(re) = &*PONG {
        if let Some(period) = re
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
        {
            return ShdrLine::Pong(Duration::from_millis(period));
        }
    }

    let body = line.trim_start_matches('*').trim();
    let (name, value) = body.split_once(':').unwrap_or((body, ""));
    ShdrLine::Command {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
    }
}

fn is_numeric(token: &str) -> bool {
    let mut parts = token.split_whitespace().peekable();
    parts.peek().is_some() && parts.all(|p| p.parse::<f64>().is_ok())
}

fn is_unavailable_condition(tokens: &[&str]) -> bool {
    match tokens {
        [level, rest @ ..] if rest.len() >= 4 => {
            level.trim() == UNAVAILABLE && rest[..4].iter().all(|t| t.trim().is_empty())
        }
        _ => false,
    }
}

fn is_time_series(tokens: &[&str]) -> bool {
    let [count, rate, samples, ..] = tokens else {
        return false;
    };
    let Ok(count) = count.trim().parse::<usize>() else {
        return false;
    };
    let rate = rate.trim();
    if count == 0 || !(rate.is_empty() || rate.parse::<f64>().is_ok()) {
        return false;
    }
    let samples: Vec<&str> = samples.split_whitespace().collect();
    samples.len() == count && samples.iter().all(|s| s.parse::<f64>().is_ok())
}

/// Category for the observation whose value tokens start at `tokens[0]`.
fn infer_category(tokens: &[&str]) -> Option<RecordCategory> {
    let first = tokens.first()?.trim();
    let category = if CONDITION_LEVELS.contains(&first) || is_unavailable_condition(tokens) {
        RecordCategory::Condition
    } else if is_time_series(tokens) {
        RecordCategory::TimeSeries
    } else if is_numeric(first) {
        RecordCategory::Sample
    } else {
        RecordCategory::Event
    };
    Some(category)
}
