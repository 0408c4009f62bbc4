//! Decision records as returned by the Diavgeia search API.
//!
//! A record is kept as its raw JSON object so every passthrough field ends up
//! in the exported metadata; the handful of fields the pipeline relies on are
//! extracted once, at validation time.

use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use serde_json::{Map, Value};

/// Why a raw record was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidDecision {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record carries errorCode {0}")]
    ErrorCode(String),
    #[error("record has no ada")]
    MissingAda,
    #[error("ada {0:?} cannot be used as a path component")]
    UnsafeAda(String),
    #[error("record has no documentUrl key")]
    MissingDocumentUrl,
}

/// A validated decision.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    ada: String,
    document_url: String,
    submission_timestamp: Option<i64>,
    raw: Map<String, Value>,
}

impl Decision {
    /// Checks the validity invariant: no `errorCode`, an `ada`, and a
    /// `documentUrl` key (whose value may be empty).
    pub fn validate(value: &Value) -> Result<(), InvalidDecision> {
        let obj = value.as_object().ok_or(InvalidDecision::NotAnObject)?;
        if let Some(code) = obj.get("errorCode") {
            let code = match code {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Err(InvalidDecision::ErrorCode(code));
        }
        let ada = obj
            .get("ada")
            .and_then(Value::as_str)
            .filter(|ada| !ada.is_empty())
            .ok_or(InvalidDecision::MissingAda)?;
        if ada == "." || ada == ".." || ada.contains(['/', '\\']) {
            return Err(InvalidDecision::UnsafeAda(ada.to_string()));
        }
        if !obj.contains_key("documentUrl") {
            return Err(InvalidDecision::MissingDocumentUrl);
        }
        Ok(())
    }

    pub fn from_value(value: Value) -> Result<Self, InvalidDecision> {
        Self::validate(&value)?;
        let Value::Object(raw) = value else {
            return Err(InvalidDecision::NotAnObject);
        };
        let ada = raw
            .get("ada")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let document_url = raw
            .get("documentUrl")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let submission_timestamp = raw.get("submissionTimestamp").and_then(|ts| {
            ts.as_i64()
                .or_else(|| ts.as_f64().map(|f| f as i64))
                .or_else(|| ts.as_str().and_then(|s| s.parse().ok()))
        });
        Ok(Self {
            ada,
            document_url,
            submission_timestamp,
            raw,
        })
    }

    /// The record's self-link, used for the corrective re-fetch of invalid records.
    pub fn self_link(value: &Value) -> Option<&str> {
        value
            .get("url")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
    }

    pub fn ada(&self) -> &str {
        &self.ada
    }

    /// Empty when the API listed the key without a document.
    pub fn document_url(&self) -> &str {
        &self.document_url
    }

    /// Epoch milliseconds.
    pub fn submission_timestamp(&self) -> Option<i64> {
        self.submission_timestamp
    }

    /// Submission time in whole epoch seconds, used as the gzip mtime.
    pub fn submission_secs(&self) -> Option<i64> {
        self.submission_timestamp.map(|ms| ms.div_euclid(1000))
    }

    /// Calendar date of submission in `tz`.
    pub fn submission_date(&self, tz: Tz) -> Option<NaiveDate> {
        let secs = self.submission_secs()?;
        DateTime::from_timestamp(secs, 0).map(|dt| dt.with_timezone(&tz).date_naive())
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    /// UTF-8 JSON with keys sorted at every level and non-ASCII left unescaped.
    pub fn metadata_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&canonical(&Value::Object(self.raw.clone())))
    }
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut entries: Vec<_> = obj.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key.clone(), canonical(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}
