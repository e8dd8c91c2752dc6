//! Core data model for the ecosystem catalog harvester.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ecat-core";

/// Sentinel the upstream release scrapers emit instead of a null.
pub const NO_RELEASES: &str = "No releases";

/// Stable merge key for one tracked entity (a repository URL or a site URL).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Scalar value held by a record field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Converts a JSON scalar; arrays and objects have no field representation.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => Some(Self::Null),
            JsonValue::Bool(b) => Some(Self::Bool(*b)),
            JsonValue::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            JsonValue::String(s) => Some(Self::Text(s.clone())),
            JsonValue::Array(_) | JsonValue::Object(_) => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Null => JsonValue::Null,
            Self::Bool(b) => JsonValue::Bool(*b),
            Self::Int(i) => JsonValue::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Self::Text(s) => JsonValue::String(s.clone()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => format!("boolean {b}"),
            Self::Int(i) => format!("integer {i}"),
            Self::Float(f) => format!("float {f}"),
            Self::Text(s) => format!("text {s:?}"),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
    /// ISO date or RFC 3339 timestamp, stored as normalized text.
    Date,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Date => "date",
        };
        f.write_str(name)
    }
}

impl FieldKind {
    /// Coerces `value` into this kind. `None` means the value cannot be represented.
    pub fn normalize(self, value: &FieldValue) -> Option<FieldValue> {
        if let FieldValue::Text(s) = value {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed == NO_RELEASES {
                return Some(FieldValue::Null);
            }
        }

        match (self, value) {
            (_, FieldValue::Null) => Some(FieldValue::Null),

            (Self::Text, FieldValue::Text(s)) => Some(FieldValue::Text(s.trim().to_string())),
            (Self::Text, other) => Some(FieldValue::Text(other.to_string())),

            (Self::Integer, FieldValue::Int(i)) => Some(FieldValue::Int(*i)),
            (Self::Integer, FieldValue::Float(f)) => exact_int(*f).map(FieldValue::Int),
            (Self::Integer, FieldValue::Text(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(exact_int))
                    .map(FieldValue::Int)
            }

            (Self::Float, FieldValue::Float(f)) => Some(FieldValue::Float(*f)),
            (Self::Float, FieldValue::Int(i)) => Some(FieldValue::Float(*i as f64)),
            (Self::Float, FieldValue::Text(s)) => s.trim().parse::<f64>().ok().map(FieldValue::Float),

            (Self::Boolean, FieldValue::Bool(b)) => Some(FieldValue::Bool(*b)),
            (Self::Boolean, FieldValue::Int(0)) => Some(FieldValue::Bool(false)),
            (Self::Boolean, FieldValue::Int(1)) => Some(FieldValue::Bool(true)),
            (Self::Boolean, FieldValue::Text(s)) => parse_bool(s).map(FieldValue::Bool),

            (Self::Date, FieldValue::Text(s)) => normalize_date(s).map(FieldValue::Text),

            _ => None,
        }
    }

    /// True when `value` already has the representation `normalize` produces.
    pub fn accepts(self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (_, FieldValue::Null)
                | (Self::Text, FieldValue::Text(_))
                | (Self::Date, FieldValue::Text(_))
                | (Self::Integer, FieldValue::Int(_))
                | (Self::Float, FieldValue::Float(_))
                | (Self::Boolean, FieldValue::Bool(_))
        )
    }
}

/// Whole floats inside the `i64` range; `i64::MAX as f64` rounds up to 2^63.
fn exact_int(f: f64) -> Option<i64> {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    (f.is_finite() && f.fract() == 0.0 && (-LIMIT..LIMIT).contains(&f)).then(|| f as i64)
}

fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// One text form per instant: whole-second UTC, with midnight written as a bare date.
fn normalize_date(input: &str) -> Option<String> {
    let input = input.trim();
    let instant = if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        date.and_time(NaiveTime::MIN).and_utc()
    } else if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        ts.with_timezone(&Utc)
    } else {
        ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())?
            .and_utc()
    };
    let instant = instant.trunc_subsecs(0);
    if instant.time() == NaiveTime::MIN {
        Some(instant.format("%Y-%m-%d").to_string())
    } else {
        Some(instant.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    /// Always overwritten by the latest fetch.
    SourceOwned,
    /// Kept across fetches unless the source supplies a non-null replacement.
    Curated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub ownership: Ownership,
}

impl FieldSpec {
    pub fn source(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            ownership: Ownership::SourceOwned,
        }
    }

    pub fn curated(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            ownership: Ownership::Curated,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("field `{field}` expects {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: FieldKind,
        found: String,
    },
    #[error("field `{0}` is not a scalar")]
    NotScalar(String),
    #[error("row is missing identifier column `{0}`")]
    MissingIdentifier(String),
}

/// Explicit set of known fields for one dataset, with declared type and ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub id_column: String,
    pub fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn new(name: impl Into<String>, id_column: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            id_column: id_column.into(),
            fields,
        }
    }

    /// Extension repositories tracked through the GitHub API.
    pub fn extensions() -> Self {
        use FieldKind::*;
        Self::new(
            "extensions",
            "url",
            vec![
                FieldSpec::source("repository_name", Text),
                FieldSpec::source("stars", Integer),
                FieldSpec::source("forks_count", Integer),
                FieldSpec::source("open_issues", Integer),
                FieldSpec::source("contributors_count", Integer),
                FieldSpec::source("total_releases", Integer),
                FieldSpec::source("latest_release", Text),
                FieldSpec::source("release_date", Date),
                FieldSpec::source("discussions", Boolean),
                FieldSpec::source("last_update", Date),
                FieldSpec::curated("title", Text),
                FieldSpec::curated("category", Text),
                FieldSpec::curated("maintainer", Text),
                FieldSpec::curated("notes", Text),
            ],
        )
    }

    /// Live deployments tracked through their own action API.
    pub fn sites() -> Self {
        use FieldKind::*;
        Self::new(
            "sites",
            "url",
            vec![
                FieldSpec::source("ckan_version", Text),
                FieldSpec::source("api_title", Text),
                FieldSpec::source("description", Text),
                FieldSpec::source("contact_email", Text),
                FieldSpec::source("primary_language", Text),
                FieldSpec::source("extensions", Text),
                FieldSpec::source("num_datasets", Integer),
                FieldSpec::source("num_organizations", Integer),
                FieldSpec::source("num_groups", Integer),
                FieldSpec::curated("title", Text),
                FieldSpec::curated("region", Text),
                FieldSpec::curated("location", Text),
                FieldSpec::curated("latitude", Float),
                FieldSpec::curated("longitude", Float),
                FieldSpec::curated("site_type", Text),
                FieldSpec::curated("status", Text),
                FieldSpec::curated("is_featured", Boolean),
                FieldSpec::curated("topic_id", Text),
            ],
        )
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields_owned_by(&self, ownership: Ownership) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(move |f| f.ownership == ownership)
    }

    /// Normalizes one value. `Ok(None)` means the field is not part of the schema.
    pub fn normalize_value(&self, name: &str, value: &FieldValue) -> Result<Option<FieldValue>, SchemaError> {
        let Some(spec) = self.field(name) else {
            return Ok(None);
        };
        spec.kind
            .normalize(value)
            .map(Some)
            .ok_or_else(|| SchemaError::TypeMismatch {
                field: name.to_string(),
                expected: spec.kind,
                found: value.describe(),
            })
    }

    /// Builds a record from loosely typed JSON, dropping unknown fields and the id column.
    pub fn record_from_json(&self, row: &JsonMap<String, JsonValue>) -> Result<Record, SchemaError> {
        let mut record = Record::new();
        for (name, raw) in row {
            if name == &self.id_column || self.field(name).is_none() {
                continue;
            }
            let value = FieldValue::from_json(raw).ok_or_else(|| SchemaError::NotScalar(name.clone()))?;
            if let Some(value) = self.normalize_value(name, &value)? {
                record.set(name.clone(), value);
            }
        }
        Ok(record)
    }

    /// Splits a catalog row into its identifier and normalized record.
    pub fn row_to_entry(&self, row: &JsonMap<String, JsonValue>) -> Result<(Identifier, Record), SchemaError> {
        let id = row
            .get(&self.id_column)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SchemaError::MissingIdentifier(self.id_column.clone()))?;
        Ok((Identifier::new(id), self.record_from_json(row)?))
    }

    pub fn entry_to_row(&self, id: &Identifier, record: &Record) -> JsonMap<String, JsonValue> {
        let mut row = JsonMap::new();
        row.insert(self.id_column.clone(), JsonValue::String(id.to_string()));
        for (name, value) in record.iter() {
            row.insert(name.to_string(), value.to_json());
        }
        row
    }

    /// Verifies every field of `record` is known and already in normalized form.
    pub fn check_record(&self, record: &Record) -> Result<(), SchemaError> {
        for (name, value) in record.iter() {
            let Some(spec) = self.field(name) else {
                continue;
            };
            if !spec.kind.accepts(value) {
                return Err(SchemaError::TypeMismatch {
                    field: name.to_string(),
                    expected: spec.kind,
                    found: value.describe(),
                });
            }
        }
        Ok(())
    }
}

/// One entity's known metadata. Absent and null fields are the same thing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, FieldValue>", into = "BTreeMap<String, FieldValue>")]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

static NULL: FieldValue = FieldValue::Null;

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.set(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> &FieldValue {
        self.fields.get(name).unwrap_or(&NULL)
    }

    /// Setting `Null` removes the field.
    pub fn set(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        if value.is_null() {
            self.fields.remove(&name);
        } else {
            self.fields.insert(name, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<BTreeMap<String, FieldValue>> for Record {
    fn from(mut fields: BTreeMap<String, FieldValue>) -> Self {
        fields.retain(|_, v| !v.is_null());
        Self { fields }
    }
}

impl From<Record> for BTreeMap<String, FieldValue> {
    fn from(record: Record) -> Self {
        record.fields
    }
}

/// Full state of a dataset keyed by identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    records: BTreeMap<Identifier, Record>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Identifier) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &Identifier) -> bool {
        self.records.contains_key(id)
    }

    pub fn insert(&mut self, id: Identifier, record: Record) -> Option<Record> {
        self.records.insert(id, record)
    }

    pub fn remove(&mut self, id: &Identifier) -> Option<Record> {
        self.records.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identifier, &Record)> {
        self.records.iter()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &Identifier> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<(Identifier, Record)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (Identifier, Record)>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::Removed => "removed",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "added" => Some(Self::Added),
            "updated" => Some(Self::Updated),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }
}

/// Append-only entry of the time-series log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub identifier: Identifier,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub changed_fields: Vec<String>,
    pub before: Option<Record>,
    pub after: Option<Record>,
}

impl ChangeEvent {
    pub fn added(identifier: Identifier, timestamp: DateTime<Utc>, after: Record) -> Self {
        Self {
            identifier,
            kind: ChangeKind::Added,
            timestamp,
            changed_fields: after.iter().map(|(k, _)| k.to_string()).collect(),
            before: None,
            after: Some(after),
        }
    }

    /// `before` and `after` hold only the fields named in `changed_fields`.
    pub fn updated(
        identifier: Identifier,
        timestamp: DateTime<Utc>,
        changed_fields: Vec<String>,
        before: Record,
        after: Record,
    ) -> Self {
        Self {
            identifier,
            kind: ChangeKind::Updated,
            timestamp,
            changed_fields,
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn removed(identifier: Identifier, timestamp: DateTime<Utc>, before: Record) -> Self {
        Self {
            identifier,
            kind: ChangeKind::Removed,
            timestamp,
            changed_fields: Vec::new(),
            before: Some(before),
            after: None,
        }
    }

    /// Timestamps compare at whole-second precision, the finest the catalog stores.
    pub fn dedup_key(&self) -> (Identifier, ChangeKind, i64) {
        (self.identifier.clone(), self.kind, self.timestamp.timestamp())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchFailureKind {
    /// Network, 5xx or rate limiting; retries exhausted.
    Transient,
    /// 4xx or a malformed response; never retried.
    Permanent,
    Timeout,
    /// Never dispatched because the run was cancelled.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct FetchFailure {
    pub kind: FetchFailureKind,
    pub message: String,
}

impl FetchFailure {
    pub fn new(kind: FetchFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Exactly one per requested identifier. `correlation` is the input position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchOutcome {
    pub correlation: usize,
    pub identifier: Identifier,
    pub attempts: u32,
    pub result: Result<Record, FetchFailure>,
}

impl FetchOutcome {
    pub fn success(correlation: usize, identifier: Identifier, attempts: u32, record: Record) -> Self {
        Self {
            correlation,
            identifier,
            attempts,
            result: Ok(record),
        }
    }

    pub fn failure(correlation: usize, identifier: Identifier, attempts: u32, failure: FetchFailure) -> Self {
        Self {
            correlation,
            identifier,
            attempts,
            result: Err(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching,
    Merging,
    Publishing,
    Succeeded,
    PartiallyFailed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::PartiallyFailed | Self::Aborted)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Fetching)
                | (Idle, Aborted)
                | (Fetching, Merging)
                | (Fetching, Aborted)
                | (Merging, Publishing)
                | (Merging, Aborted)
                | (Publishing, Succeeded)
                | (Publishing, PartiallyFailed)
                | (Publishing, Aborted)
        )
    }
}

/// Structured report written at the end of every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub dataset_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_state: RunState,
    pub requested: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub failed: usize,
    pub applied: usize,
    pub rolled_back: bool,
    pub requires_intervention: bool,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, dataset_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            dataset_id: dataset_id.into(),
            started_at,
            finished_at: started_at,
            final_state: RunState::Idle,
            requested: 0,
            added: 0,
            updated: 0,
            removed: 0,
            failed: 0,
            applied: 0,
            rolled_back: false,
            requires_intervention: false,
            error: None,
        }
    }

    pub fn count_events(&mut self, events: &[ChangeEvent]) {
        for event in events {
            match event.kind {
                ChangeKind::Added => self.added += 1,
                ChangeKind::Updated => self.updated += 1,
                ChangeKind::Removed => self.removed += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_strings_normalize_to_declared_kind() {
        let schema = Schema::extensions();
        assert_eq!(
            schema.normalize_value("stars", &FieldValue::text("42")).unwrap(),
            Some(FieldValue::Int(42))
        );
        assert_eq!(
            schema.normalize_value("stars", &FieldValue::Float(7.0)).unwrap(),
            Some(FieldValue::Int(7))
        );
        assert_eq!(
            schema.normalize_value("discussions", &FieldValue::text("TRUE")).unwrap(),
            Some(FieldValue::Bool(true))
        );
        assert_eq!(schema.normalize_value("unknown_column", &FieldValue::Int(1)).unwrap(), None);
    }

    #[test]
    fn type_mismatch_is_reported() {
        let schema = Schema::extensions();
        let err = schema
            .normalize_value("stars", &FieldValue::text("lots"))
            .unwrap_err();
        assert!(matches!(err, SchemaError::TypeMismatch { ref field, .. } if field == "stars"));
    }

    #[test]
    fn release_sentinel_and_blank_text_become_null() {
        let schema = Schema::extensions();
        assert_eq!(
            schema.normalize_value("release_date", &FieldValue::text(NO_RELEASES)).unwrap(),
            Some(FieldValue::Null)
        );
        assert_eq!(
            schema.normalize_value("category", &FieldValue::text("   ")).unwrap(),
            Some(FieldValue::Null)
        );
    }

    #[test]
    fn dates_are_normalized() {
        assert_eq!(
            FieldKind::Date.normalize(&FieldValue::text("2024-03-01 10:20:30")),
            Some(FieldValue::text("2024-03-01T10:20:30Z"))
        );
        assert_eq!(
            FieldKind::Date.normalize(&FieldValue::text("2024-03-01T12:20:30+02:00")),
            Some(FieldValue::text("2024-03-01T10:20:30Z"))
        );
        assert_eq!(
            FieldKind::Date.normalize(&FieldValue::text("2024-03-01")),
            Some(FieldValue::text("2024-03-01"))
        );
        assert_eq!(FieldKind::Date.normalize(&FieldValue::text("last tuesday")), None);
    }

    #[test]
    fn out_of_range_floats_are_not_integers() {
        assert_eq!(FieldKind::Integer.normalize(&FieldValue::Float(1e20)), None);
        assert_eq!(FieldKind::Integer.normalize(&FieldValue::Float(-1e19)), None);
        assert_eq!(FieldKind::Integer.normalize(&FieldValue::text("1e20")), None);
        assert_eq!(FieldKind::Integer.normalize(&FieldValue::Float(f64::NAN)), None);
        assert_eq!(
            FieldKind::Integer.normalize(&FieldValue::Float(-9_223_372_036_854_775_808.0)),
            Some(FieldValue::Int(i64::MIN))
        );
        assert_eq!(FieldKind::Integer.normalize(&FieldValue::text("2.0e3")), Some(FieldValue::Int(2000)));

        let err = Schema::extensions()
            .normalize_value("stars", &FieldValue::Float(1e20))
            .unwrap_err();
        assert!(matches!(err, SchemaError::TypeMismatch { .. }));
    }

    #[test]
    fn same_instant_has_one_date_form() {
        let bare = FieldKind::Date.normalize(&FieldValue::text("2025-11-20"));
        for spelling in [
            "2025-11-20T00:00:00",
            "2025-11-20 00:00:00",
            "2025-11-20T00:00:00Z",
            "2025-11-20T00:00:00.000+00:00",
            "2025-11-20T02:00:00+02:00",
        ] {
            assert_eq!(FieldKind::Date.normalize(&FieldValue::text(spelling)), bare, "{spelling}");
        }
        assert_eq!(
            FieldKind::Date.normalize(&FieldValue::text("2025-11-20T10:00:00.750Z")),
            FieldKind::Date.normalize(&FieldValue::text("2025-11-20 10:00:00"))
        );
    }

    #[test]
    fn record_treats_null_as_absent() {
        let a = Record::new().with("stars", 5).with("region", FieldValue::Null);
        let b = Record::new().with("stars", 5);
        assert_eq!(a, b);
        assert_eq!(a.get("region"), &FieldValue::Null);

        let parsed: Record = serde_json::from_value(json!({"stars": 5, "region": null})).unwrap();
        assert_eq!(parsed, b);
    }

    #[test]
    fn catalog_rows_round_trip_through_schema() {
        let schema = Schema::sites();
        let row = json!({
            "url": "https://data.example.org",
            "num_datasets": "120",
            "region": "EU",
            "_full_text": "ignored",
        });
        let (id, record) = schema.row_to_entry(row.as_object().unwrap()).unwrap();
        assert_eq!(id.as_str(), "https://data.example.org");
        assert_eq!(record.get("num_datasets"), &FieldValue::Int(120));
        assert_eq!(record.len(), 2);

        let back = schema.entry_to_row(&id, &record);
        assert_eq!(back.get("url"), Some(&json!("https://data.example.org")));
        assert_eq!(back.get("num_datasets"), Some(&json!(120)));
    }

    #[test]
    fn row_without_identifier_is_rejected() {
        let schema = Schema::sites();
        let row = json!({"num_datasets": 1});
        assert_eq!(
            schema.row_to_entry(row.as_object().unwrap()).unwrap_err(),
            SchemaError::MissingIdentifier("url".into())
        );
    }

    #[test]
    fn run_state_machine_only_allows_forward_edges() {
        assert!(RunState::Idle.can_transition_to(RunState::Fetching));
        assert!(RunState::Publishing.can_transition_to(RunState::PartiallyFailed));
        assert!(!RunState::Fetching.can_transition_to(RunState::Publishing));
        assert!(!RunState::Succeeded.can_transition_to(RunState::Fetching));
        assert!(RunState::Aborted.is_terminal());
    }
}
