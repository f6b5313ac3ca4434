//! Column type inference from a single sampled value.
//!
//! Inference is heuristic: one JSON value says little about a column's
//! declared type. The name-pattern table below is the primary signal and
//! every rule can be overridden through `RECONCILER_TYPE_HINTS`.

use crate::models::ColumnType;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::Value;

/// Name tokens that mark a money-like column.
const NUMERIC_TOKENS: &[&str] = &[
    "amount", "fee", "rate", "balance", "price", "cost", "charge", "deposit", "total",
];

/// Name suffixes that mark a point in time.
const TIME_SUFFIXES: &[&str] = &["_at", "_time", "_timestamp"];

/// An override: column names matching `pattern` are always `column_type`.
#[derive(Debug, Clone)]
pub struct TypeHintRule {
    pub pattern: String,
    pub column_type: ColumnType,
    matcher: Regex,
}

impl TypeHintRule {
    /// Builds a rule from a glob pattern where `*` matches any run of characters.
    pub fn new(pattern: &str, column_type: ColumnType) -> Result<Self, String> {
        let pattern = pattern.trim().to_lowercase();
        if pattern.is_empty() {
            return Err("type hint pattern cannot be empty".to_string());
        }
        let source = format!("^{}$", regex::escape(&pattern).replace(r"\*", ".*"));
        let matcher = Regex::new(&source)
            .map_err(|e| format!("invalid type hint pattern '{}': {}", pattern, e))?;
        Ok(Self {
            pattern,
            column_type,
            matcher,
        })
    }

    pub fn matches(&self, column: &str) -> bool {
        self.matcher.is_match(&column.to_lowercase())
    }
}

/// Name-pattern driven type inference with configurable overrides.
#[derive(Debug, Clone, Default)]
pub struct TypeHints {
    overrides: Vec<TypeHintRule>,
}

impl TypeHints {
    pub fn new(overrides: Vec<TypeHintRule>) -> Self {
        Self { overrides }
    }

    /// Parses `pattern=type` pairs separated by commas, e.g.
    /// `bed_no=integer,discharge_*=timestamp`.
    pub fn parse_overrides(raw: &str) -> Result<Vec<TypeHintRule>, String> {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (pattern, ty) = entry
                    .split_once('=')
                    .ok_or_else(|| format!("type hint '{}' must look like pattern=type", entry))?;
                let column_type = ty.parse::<ColumnType>()?;
                TypeHintRule::new(pattern, column_type)
            })
            .collect()
    }

    /// Infers a column type from its name and one sampled value.
    ///
    /// Precedence: configured override, then unambiguous JSON kinds (arrays,
    /// booleans), then name heuristics, then the value's runtime type.
    pub fn infer(&self, column: &str, value: &Value) -> ColumnType {
        if let Some(rule) = self.overrides.iter().find(|rule| rule.matches(column)) {
            return rule.column_type;
        }

        match value {
            Value::Array(_) => return ColumnType::ArrayOfText,
            Value::Bool(_) => return ColumnType::Boolean,
            _ => {}
        }

        if let Some(ty) = name_hint(column) {
            return ty;
        }

        value_type(value)
    }
}

/// Type suggested by the column name alone.
pub fn name_hint(column: &str) -> Option<ColumnType> {
    let lower = column.to_lowercase();
    let tokens: Vec<&str> = lower.split(|c: char| c == '_' || c == '-').collect();

    if tokens.iter().any(|t| t.contains("date"))
        || TIME_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
        || tokens.iter().any(|t| *t == "dob" || *t == "timestamp")
    {
        return Some(ColumnType::Timestamp);
    }

    let is_numeric_token = |token: &str| {
        let singular = token.strip_suffix('s').unwrap_or(token);
        NUMERIC_TOKENS.contains(&token) || NUMERIC_TOKENS.contains(&singular)
    };
    if tokens.iter().any(|t| is_numeric_token(t)) {
        return Some(ColumnType::Numeric);
    }

    None
}

/// Type suggested by the runtime type of a JSON value.
pub fn value_type(value: &Value) -> ColumnType {
    match value {
        Value::Bool(_) => ColumnType::Boolean,
        Value::Array(_) => ColumnType::ArrayOfText,
        Value::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Integer,
        Value::Number(_) => ColumnType::Numeric,
        Value::String(s) if uuid::Uuid::parse_str(s).is_ok() => ColumnType::Uuid,
        Value::String(s) if looks_like_timestamp(s) => ColumnType::Timestamp,
        _ => ColumnType::Text,
    }
}

fn looks_like_timestamp(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}
