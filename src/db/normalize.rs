//! Conversion of raw column values into JSON-safe values.
//!
//! Every cell leaving the executor goes through [`normalize`]. The rules are fixed:
//! decimals become floats (or exact strings in [`NumericMode::Exact`]), temporal values become
//! ISO-8601 strings and integers beyond the range a JSON consumer can hold in an `f64` become
//! strings.

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Largest integer magnitude an IEEE-754 double represents exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: i128 = 9_007_199_254_740_991;

/// How arbitrary-precision decimals are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericMode {
    /// Lossy conversion to a JSON number.
    #[default]
    Float,
    /// Decimal-preserving string.
    Exact,
}

/// A column value as decoded from a database row.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i128),
    Float(f64),
    Decimal(BigDecimal),
    Text(String),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(Value),
    Uuid(uuid::Uuid),
    Bytes(Vec<u8>),
    Interval {
        months: i32,
        days: i32,
        microseconds: i64,
    },
    /// Elements are normalized one by one, without a declared type.
    Array(Vec<RawValue>),
}

/// A result row keyed by column name, in the order the engine returned the columns.
pub type NormalizedRow = Map<String, Value>;

pub fn normalize(value: RawValue, declared_type: Option<&str>, mode: NumericMode) -> Value {
    match value {
        RawValue::Null => Value::Null,
        RawValue::Bool(b) => Value::Bool(b),
        RawValue::Int(i) => normalize_int(i),
        RawValue::Float(f) => float_value(f),
        RawValue::Decimal(d) => match mode {
            NumericMode::Float => decimal_to_float(&d),
            NumericMode::Exact => Value::String(d.to_plain_string()),
        },
        RawValue::Text(s) => {
            if declared_type.is_some_and(|t| t.to_ascii_lowercase().contains("json")) {
                serde_json::from_str(&s).unwrap_or(Value::String(s))
            } else {
                Value::String(s)
            }
        }
        RawValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        RawValue::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
        RawValue::Timestamp(ts) => Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        RawValue::TimestampTz(ts) => Value::String(ts.to_rfc3339()),
        RawValue::Json(v) => v,
        RawValue::Uuid(u) => Value::String(u.to_string()),
        RawValue::Bytes(b) => Value::String(format!("\\x{}", hex::encode(b))),
        RawValue::Interval {
            months,
            days,
            microseconds,
        } => Value::String(iso8601_duration(months, days, microseconds)),
        RawValue::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| normalize(item, None, mode))
                .collect(),
        ),
    }
}

/// Builds one row, normalizing each `(column, declared type, value)` cell.
pub fn normalize_row<I>(cells: I, mode: NumericMode) -> NormalizedRow
where
    I: IntoIterator<Item = (String, String, RawValue)>,
{
    cells
        .into_iter()
        .map(|(name, declared, value)| {
            let normalized = normalize(value, Some(&declared), mode);
            (name, normalized)
        })
        .collect()
}

/// ISO-8601 duration with signed components, e.g. `P1Y2M3DT4H5M6.5S`.
fn iso8601_duration(months: i32, days: i32, microseconds: i64) -> String {
    const MICROS_PER_SECOND: i64 = 1_000_000;
    const MICROS_PER_MINUTE: i64 = 60 * MICROS_PER_SECOND;
    const MICROS_PER_HOUR: i64 = 60 * MICROS_PER_MINUTE;

    let mut out = String::from("P");
    let (years, months) = (months / 12, months % 12);
    for (amount, unit) in [(years as i64, 'Y'), (months as i64, 'M'), (days as i64, 'D')] {
        if amount != 0 {
            out.push_str(&format!("{}{}", amount, unit));
        }
    }

    let hours = microseconds / MICROS_PER_HOUR;
    let minutes = (microseconds % MICROS_PER_HOUR) / MICROS_PER_MINUTE;
    let micros = microseconds % MICROS_PER_MINUTE;
    if hours != 0 || minutes != 0 || micros != 0 {
        out.push('T');
        if hours != 0 {
            out.push_str(&format!("{}H", hours));
        }
        if minutes != 0 {
            out.push_str(&format!("{}M", minutes));
        }
        if micros != 0 {
            let sign = if micros < 0 { "-" } else { "" };
            let abs = micros.unsigned_abs();
            let whole = abs / MICROS_PER_SECOND as u64;
            let fraction = abs % MICROS_PER_SECOND as u64;
            if fraction == 0 {
                out.push_str(&format!("{}{}S", sign, whole));
            } else {
                let digits = format!("{:06}", fraction);
                out.push_str(&format!("{}{}.{}S", sign, whole, digits.trim_end_matches('0')));
            }
        }
    }

    if out == "P" { "PT0S".to_string() } else { out }
}

fn normalize_int(i: i128) -> Value {
    if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i) {
        // In range, so it fits an i64
        Value::Number(Number::from(i as i64))
    } else {
        Value::String(i.to_string())
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(f.to_string()))
}

fn decimal_to_float(d: &BigDecimal) -> Value {
    let rendered = d.to_string();
    match rendered.parse::<f64>() {
        Ok(f) => float_value(f),
        Err(_) => Value::String(rendered),
    }
}
