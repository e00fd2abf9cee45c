use std::fmt::Display;

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// One raw sample as returned by `GET /channels/{id}/feeds.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub entry_id: u64,
    #[serde(default, deserialize_with = "numeric_field")]
    pub field1: Option<String>,
    #[serde(default, deserialize_with = "text_field")]
    pub field2: Option<String>,
    #[serde(default, deserialize_with = "numeric_field")]
    pub field3: Option<String>,
    #[serde(default, deserialize_with = "text_field")]
    pub field4: Option<String>,
    #[serde(default, deserialize_with = "text_field")]
    pub field5: Option<String>,
    #[serde(default, deserialize_with = "text_field")]
    pub field6: Option<String>,
    #[serde(default, deserialize_with = "text_field")]
    pub field7: Option<String>,
    #[serde(default, deserialize_with = "numeric_field")]
    pub field8: Option<String>,
}

impl FeedRecord {
    pub fn field(&self, index: usize) -> Option<&str> {
        let raw = match index {
            0 => &self.field1,
            1 => &self.field2,
            2 => &self.field3,
            3 => &self.field4,
            4 => &self.field5,
            5 => &self.field6,
            6 => &self.field7,
            7 => &self.field8,
            _ => return None,
        };
        raw.as_deref()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedResponse {
    #[serde(default)]
    pub channel: serde_json::Value,
    pub feeds: Vec<FeedRecord>,
}

// Numeric slots also accept JSON numbers, which hand-written proxies send.
fn numeric_field<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// Binary slots only ever carry the text "1" when set; anything that is not a string is unset.
fn text_field<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Numeric,
    Binary,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub key: &'static str,
    pub label: &'static str,
    pub unit: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    const fn numeric(key: &'static str, label: &'static str, unit: &'static str) -> Self {
        Self {
            key,
            label,
            unit,
            kind: FieldKind::Numeric,
        }
    }

    const fn binary(key: &'static str, label: &'static str) -> Self {
        Self {
            key,
            label,
            unit: "",
            kind: FieldKind::Binary,
        }
    }
}

pub const FIELD_TABLE: [FieldSpec; 8] = [
    FieldSpec::numeric("level_cm", "Level", "cm"),
    FieldSpec::binary("object_detected", "Object"),
    FieldSpec::numeric("distance_cm", "Distance", "cm"),
    FieldSpec::binary("pump_on", "Pump"),
    FieldSpec::binary("level_ok", "Level OK"),
    FieldSpec::binary("storage_ok", "Storage OK"),
    FieldSpec::binary("buzzer_active", "Buzzer"),
    FieldSpec::numeric("pump_runtime_hours", "Pump Runtime", "h"),
];

/// A feed record coerced into the fixed eight-channel model. Every channel is always set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedSample {
    pub time: String,
    pub created_at: Option<DateTime<Utc>>,
    pub entry_id: u64,
    pub level_cm: f64,
    pub object_detected: bool,
    pub distance_cm: f64,
    pub pump_on: bool,
    pub level_ok: bool,
    pub storage_ok: bool,
    pub buzzer_active: bool,
    pub pump_runtime_hours: f64,
}

impl NormalizedSample {
    /// Channel `index` (0-based) as a plottable number; binary channels become 0 or 1.
    pub fn value(&self, index: usize) -> Option<f64> {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        Some(match index {
            0 => self.level_cm,
            1 => flag(self.object_detected),
            2 => self.distance_cm,
            3 => flag(self.pump_on),
            4 => flag(self.level_ok),
            5 => flag(self.storage_ok),
            6 => flag(self.buzzer_active),
            7 => self.pump_runtime_hours,
            _ => return None,
        })
    }
}

/// Reads the leading decimal number of `raw`, ignoring trailing text such as units or
/// line endings. Missing, unparsable and non-finite values become 0.
pub fn parse_numeric(raw: Option<&str>) -> f64 {
    raw.map(str::trim_start)
        .and_then(|v| v.get(..leading_number_len(v)))
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

// Length of `[+-]digits[.digits][(e|E)[+-]digits]`; 0 when no mantissa digit is present.
fn leading_number_len(raw: &str) -> usize {
    let bytes = raw.as_bytes();
    let digits_from = |start: usize| {
        bytes[start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };

    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let int_digits = digits_from(end);
    end += int_digits;

    let mut frac_digits = 0;
    if bytes.get(end) == Some(&b'.') {
        frac_digits = digits_from(end + 1);
        if int_digits > 0 || frac_digits > 0 {
            end += 1 + frac_digits;
        }
    }
    if int_digits == 0 && frac_digits == 0 {
        return 0;
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let sign = usize::from(matches!(bytes.get(end + 1), Some(b'+' | b'-')));
        let exp_digits = digits_from(end + 1 + sign);
        if exp_digits > 0 {
            end += 1 + sign + exp_digits;
        }
    }

    end
}

pub fn parse_binary(raw: Option<&str>) -> bool {
    raw == Some("1")
}

pub fn normalize_record(record: &FeedRecord) -> NormalizedSample {
    normalize_record_in(record, &Local)
}

pub fn normalize_record_in<Tz>(record: &FeedRecord, tz: &Tz) -> NormalizedSample
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let (time, created_at) = display_time(&record.created_at, tz);

    NormalizedSample {
        time,
        created_at,
        entry_id: record.entry_id,
        level_cm: parse_numeric(record.field(0)),
        object_detected: parse_binary(record.field(1)),
        distance_cm: parse_numeric(record.field(2)),
        pump_on: parse_binary(record.field(3)),
        level_ok: parse_binary(record.field(4)),
        storage_ok: parse_binary(record.field(5)),
        buzzer_active: parse_binary(record.field(6)),
        pump_runtime_hours: parse_numeric(record.field(7)),
    }
}

/// Normalizes every record, keeping upstream order.
pub fn normalize_feeds(feeds: &[FeedRecord]) -> Vec<NormalizedSample> {
    feeds.iter().map(normalize_record).collect()
}

pub fn latest_metrics(series: &[NormalizedSample]) -> NormalizedSample {
    series.last().cloned().unwrap_or_default()
}

fn display_time<Tz>(created_at: &str, tz: &Tz) -> (String, Option<DateTime<Utc>>)
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    match DateTime::parse_from_rfc3339(created_at.trim()) {
        Ok(parsed) => {
            let utc = parsed.with_timezone(&Utc);
            let shown = utc.with_timezone(tz).format("%H:%M:%S").to_string();
            (shown, Some(utc))
        }
        Err(_) => (created_at.to_string(), None),
    }
}
