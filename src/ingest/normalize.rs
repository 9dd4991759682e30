//! Payload normalization.
//!
//! Executors disagree on field names, status words, number encodings and
//! timestamp formats. [`normalize`] is the one place that knows all of the
//! variants and produces a canonical [`StatusUpdate`].

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::{JobStatus, StatusUpdate};

/// Envelope keys that may wrap the actual status object.
const ENVELOPE_FIELDS: &[&str] = &["data", "payload", "message"];

/// Field synonyms, in preference order.
const ENTITY_ID_FIELDS: &[&str] = &["entityId", "entity_id", "videoId", "video_id", "id"];
const ALTERNATE_ID_FIELDS: &[&str] = &[
    "alternateId",
    "alternate_id",
    "jobId",
    "job_id",
    "kernelId",
    "kernel_id",
    "requestId",
    "request_id",
];
const STATUS_FIELDS: &[&str] = &["status", "state"];
const PROGRESS_FIELDS: &[&str] = &[
    "progress",
    "progress_percent",
    "progressPercent",
    "percent",
    "percentage",
];
const STAGE_FIELDS: &[&str] = &["stage", "step", "phase", "current_stage", "currentStage"];
const ERROR_FIELDS: &[&str] = &[
    "error",
    "error_message",
    "errorMessage",
    "failure_reason",
    "reason",
];
const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "ts", "updatedAt", "updated_at", "eventTime"];

/// Map an executor payload onto the canonical update shape.
pub fn normalize(payload: &Value) -> Result<StatusUpdate> {
    let fields = unwrap_envelope(payload)?;

    let identifiers = identifiers(fields)?;

    let status = match first(fields, STATUS_FIELDS) {
        Some(Value::String(s)) => parse_status(s)
            .ok_or_else(|| Error::Malformed(format!("unknown status {s:?}")))?,
        Some(other) => return Err(Error::Malformed(format!("status is not a string: {other}"))),
        None => return Err(Error::Malformed("no status field".to_string())),
    };

    let progress = first(fields, PROGRESS_FIELDS)
        .filter(|v| !v.is_null())
        .map(parse_progress)
        .transpose()?;

    let stage = first(fields, STAGE_FIELDS).and_then(non_empty_string);
    let error = first(fields, ERROR_FIELDS).and_then(error_text);

    let mut update = StatusUpdate {
        identifiers,
        status,
        progress,
        stage,
        error,
        timestamp: None,
    };
    if let Some(ts) = first(fields, TIMESTAMP_FIELDS).filter(|v| !v.is_null()) {
        update = update.at(parse_timestamp(ts)?);
    }
    Ok(update)
}

/// Map a producer's status word onto the lifecycle. Case-insensitive.
pub fn parse_status(raw: &str) -> Option<JobStatus> {
    let word = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    let status = match word.as_str() {
        "pending" | "queued" | "waiting" | "submitted" | "created" | "scheduled" => {
            JobStatus::Pending
        }
        "active" | "running" | "processing" | "in_progress" | "started" | "provisioning"
        | "transcribing" | "embedding" => JobStatus::Active,
        "completed" | "complete" | "done" | "success" | "succeeded" | "finished" | "ready" => {
            JobStatus::Completed
        }
        "failed" | "failure" | "error" | "errored" | "cancelled" | "canceled" | "timeout"
        | "timed_out" => JobStatus::Failed,
        _ => return None,
    };
    Some(status)
}

fn unwrap_envelope(payload: &Value) -> Result<&Map<String, Value>> {
    let Value::Object(top) = payload else {
        return Err(Error::Malformed("payload is not a JSON object".to_string()));
    };
    // An envelope only counts if the wrapper itself carries no status.
    if first(top, STATUS_FIELDS).is_none() {
        for key in ENVELOPE_FIELDS {
            if let Some(Value::Object(inner)) = top.get(*key) {
                return Ok(inner);
            }
        }
    }
    Ok(top)
}

fn first<'a>(fields: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| fields.get(*name))
}

fn identifiers(fields: &Map<String, Value>) -> Result<Vec<String>> {
    let mut ids: Vec<String> = Vec::new();
    for name in ENTITY_ID_FIELDS.iter().chain(ALTERNATE_ID_FIELDS) {
        let id = match fields.get(*name) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Err(Error::Malformed("no job identifier".to_string()));
    }
    Ok(ids)
}

fn parse_progress(value: &Value) -> Result<u8> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
    .ok_or_else(|| Error::Malformed(format!("progress is not a number: {value}")))?;
    Ok(n.round().clamp(0.0, 100.0) as u8)
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::Malformed(format!("bad timestamp {s:?}: {e}"))),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| Error::Malformed(format!("bad epoch timestamp {n}"))),
        other => Err(Error::Malformed(format!("bad timestamp {other}"))),
    }
}

fn non_empty_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

// Some producers send `error: {"message": "..."}`.
fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::Object(obj) => obj.get("message").and_then(non_empty_string),
        other => non_empty_string(other),
    }
}
