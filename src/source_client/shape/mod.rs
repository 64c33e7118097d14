//! Response-shape parsers. Each source is configured with one [`ResponseShape`]
//! and its payloads are normalized by the matching [`ShapeParser`].

mod bmlt;
mod typed;

pub use bmlt::BmltParser;
pub use typed::TypedParser;

use super::fields::{optional_str, required_int, required_str, Entry};
use crate::model::{
    Format, FormatTranslation, ImportProblem, Meeting, ResponseShape, ServiceBody, SourceId,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Service bodies parsed from one payload.
#[derive(Debug, Default)]
pub struct ParsedServiceBodies {
    pub service_bodies: Vec<ServiceBody>,
    pub problems: Vec<ImportProblem>,
}

/// Meetings parsed from one payload.
#[derive(Debug, Default)]
pub struct ParsedMeetings {
    pub meetings: Vec<Meeting>,
    /// Local ids the source flagged as deleted.
    pub deleted_ids: Vec<i64>,
    pub problems: Vec<ImportProblem>,
    /// Change cutoff stated explicitly by the source, if it states one.
    pub reported_cutoff: Option<DateTime<Utc>>,
}

/// Formats parsed from one payload, translations merged per format id.
#[derive(Debug, Default)]
pub struct ParsedFormats {
    pub formats: Vec<Format>,
    pub problems: Vec<ImportProblem>,
}

/// Normalizes one source dialect into internal records.
///
/// An `Err` means the payload as a whole is unusable. Individual malformed
/// entries are reported as problems and skipped.
pub trait ShapeParser: Send + Sync {
    fn service_bodies(
        &self,
        source_id: SourceId,
        payload: &Value,
    ) -> Result<ParsedServiceBodies, String>;

    fn meetings(&self, source_id: SourceId, payload: &Value) -> Result<ParsedMeetings, String>;

    fn formats(&self, source_id: SourceId, payload: &Value) -> Result<ParsedFormats, String>;
}

pub fn parser_for(shape: ResponseShape) -> &'static dyn ShapeParser {
    match shape {
        ResponseShape::Bmlt => &BmltParser,
        ResponseShape::Typed => &TypedParser,
    }
}

/// Accepts either a bare array or an object carrying the array under `key`.
fn entries_array<'a>(payload: &'a Value, key: &str) -> Result<&'a Vec<Value>, String> {
    match payload {
        Value::Array(entries) => Ok(entries),
        Value::Object(map) => match map.get(key) {
            Some(Value::Array(entries)) => Ok(entries),
            _ => Err(format!("expected an array or an object with a '{}' array", key)),
        },
        _ => Err("expected a JSON array".to_string()),
    }
}

/// Runs `parse_entry` over every entry, collecting failures as problems.
fn parse_entries<T>(
    source_id: SourceId,
    kind: &str,
    entries: &[Value],
    mut parse_entry: impl FnMut(&Entry) -> Result<T, String>,
) -> (Vec<T>, Vec<ImportProblem>) {
    let mut parsed = Vec::with_capacity(entries.len());
    let mut problems = Vec::new();
    for value in entries {
        let result = match value.as_object() {
            Some(entry) => parse_entry(entry),
            None => Err("entry is not a JSON object".to_string()),
        };
        match result {
            Ok(item) => parsed.push(item),
            Err(message) => problems.push(ImportProblem::new(
                source_id,
                format!("skipped {}: {}", kind, message),
                Some(value.to_string()),
            )),
        }
    }
    (parsed, problems)
}

/// Where a dialect keeps the translated parts of a format entry.
struct FormatFields {
    language: &'static str,
    key_string: &'static str,
    name: &'static str,
    description: &'static str,
    kind: &'static str,
}

/// Format payloads list one entry per (format, language). Entries sharing an
/// id are folded into one [`Format`]; type and world id come from the first.
fn parse_format_entries(
    source_id: SourceId,
    payload: &Value,
    fields: &FormatFields,
) -> Result<ParsedFormats, String> {
    let entries = entries_array(payload, "formats")?;
    let (rows, problems) = parse_entries(source_id, "format", entries, |entry| {
        let local_id = required_int(entry, "id")?;
        let translation = FormatTranslation {
            language: required_str(entry, fields.language)?,
            key_string: required_str(entry, fields.key_string)?,
            name: required_str(entry, fields.name)?,
            description: optional_str(entry, fields.description),
        };
        Ok((
            local_id,
            optional_str(entry, fields.kind),
            optional_str(entry, "world_id"),
            translation,
        ))
    });

    let mut formats: Vec<Format> = Vec::new();
    let mut positions: HashMap<i64, usize> = HashMap::new();
    for (local_id, kind, world_id, translation) in rows {
        let position = *positions.entry(local_id).or_insert_with(|| {
            formats.push(Format {
                kind,
                world_id,
                ..Format::new(source_id, local_id)
            });
            formats.len() - 1
        });
        formats[position].set_translation(translation);
    }
    Ok(ParsedFormats { formats, problems })
}

/// One parsed meeting entry: either a live record or a deletion marker.
enum MeetingEntry {
    Live(Meeting),
    Deleted(i64),
}

fn split_deleted(entries: Vec<MeetingEntry>) -> (Vec<Meeting>, Vec<i64>) {
    let mut meetings = Vec::with_capacity(entries.len());
    let mut deleted = Vec::new();
    for entry in entries {
        match entry {
            MeetingEntry::Live(meeting) => meetings.push(meeting),
            MeetingEntry::Deleted(id) => deleted.push(id),
        }
    }
    (meetings, deleted)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", value, e))
}
