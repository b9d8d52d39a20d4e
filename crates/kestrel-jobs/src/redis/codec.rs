//! Job record hash encoding.
//!
//! Fields are stored as plain values: timestamps as epoch milliseconds, the
//! payload as raw bytes. Optional fields are absent when unset.

use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState, Priority};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;

pub(crate) type Fields = HashMap<String, Vec<u8>>;

/// Field/value pairs for `HSET`.
pub(crate) fn encode(record: &JobRecord) -> Vec<(&'static str, Vec<u8>)> {
    let mut fields = vec![
        ("id", record.id.as_str().as_bytes().to_vec()),
        ("job_type", record.job_type.as_bytes().to_vec()),
        ("payload", record.payload.clone()),
        ("priority", record.priority.as_str().as_bytes().to_vec()),
        ("max_retries", record.max_retries.to_string().into_bytes()),
        ("retry_count", record.retry_count.to_string().into_bytes()),
        ("attempts", record.attempts.to_string().into_bytes()),
        ("not_before", millis(record.not_before)),
        ("state", record.state.as_str().as_bytes().to_vec()),
        ("created_at", millis(record.created_at)),
    ];

    if let Some(at) = record.retention_until {
        fields.push(("retention_until", millis(at)));
    }
    if let Some(owner) = &record.lease_owner {
        fields.push(("lease_owner", owner.as_bytes().to_vec()));
    }
    if let Some(at) = record.lease_expiry {
        fields.push(("lease_expiry", millis(at)));
    }
    if let Some(error) = &record.last_error {
        fields.push(("last_error", error.as_bytes().to_vec()));
    }

    fields
}

/// Rebuilds a record from `HGETALL` output.
pub(crate) fn decode(mut fields: Fields) -> JobResult<JobRecord> {
    Ok(JobRecord {
        id: JobId::from(text(&fields, "id")?),
        job_type: text(&fields, "job_type")?,
        payload: fields.remove("payload").unwrap_or_default(),
        priority: parse::<Priority>(&fields, "priority")?,
        max_retries: parse(&fields, "max_retries")?,
        retry_count: parse(&fields, "retry_count")?,
        attempts: parse(&fields, "attempts")?,
        not_before: timestamp(&fields, "not_before")?,
        retention_until: optional_timestamp(&fields, "retention_until")?,
        state: parse::<JobState>(&fields, "state")?,
        lease_owner: optional_text(&fields, "lease_owner")?,
        lease_expiry: optional_timestamp(&fields, "lease_expiry")?,
        last_error: optional_text(&fields, "last_error")?,
        created_at: timestamp(&fields, "created_at")?,
    })
}

/// Pairs a flat `[field, value, ...]` reply into a map.
pub(crate) fn pairs(flat: Vec<Vec<u8>>) -> JobResult<Fields> {
    if flat.len() % 2 != 0 {
        return Err(JobError::Store("odd number of hash reply elements".to_string()));
    }

    let mut fields = HashMap::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(field), Some(value)) = (iter.next(), iter.next()) {
        let field = String::from_utf8(field)
            .map_err(|e| JobError::Store(format!("non-UTF-8 hash field: {e}")))?;
        fields.insert(field, value);
    }
    Ok(fields)
}

pub(crate) fn millis(at: DateTime<Utc>) -> Vec<u8> {
    at.timestamp_millis().to_string().into_bytes()
}

fn optional_text(fields: &Fields, name: &str) -> JobResult<Option<String>> {
    fields
        .get(name)
        .map(|raw| {
            String::from_utf8(raw.clone())
                .map_err(|e| JobError::Store(format!("field {name} is not UTF-8: {e}")))
        })
        .transpose()
}

fn text(fields: &Fields, name: &str) -> JobResult<String> {
    optional_text(fields, name)?.ok_or_else(|| JobError::Store(format!("missing field {name}")))
}

fn parse<T>(fields: &Fields, name: &str) -> JobResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    text(fields, name)?
        .parse()
        .map_err(|e| JobError::Store(format!("invalid field {name}: {e}")))
}

fn optional_timestamp(fields: &Fields, name: &str) -> JobResult<Option<DateTime<Utc>>> {
    optional_text(fields, name)?
        .map(|raw| {
            raw.parse::<i64>()
                .ok()
                .and_then(DateTime::from_timestamp_millis)
                .ok_or_else(|| JobError::Store(format!("invalid timestamp in field {name}: {raw}")))
        })
        .transpose()
}

fn timestamp(fields: &Fields, name: &str) -> JobResult<DateTime<Utc>> {
    optional_timestamp(fields, name)?.ok_or_else(|| JobError::Store(format!("missing field {name}")))
}
