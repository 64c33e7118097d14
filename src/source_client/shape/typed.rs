use super::{
    entries_array, parse_entries, parse_format_entries, parse_timestamp, split_deleted,
    FormatFields, MeetingEntry, ParsedFormats, ParsedMeetings, ParsedServiceBodies, ShapeParser,
};
use crate::model::{
    Coordinates, Meeting, MeetingDetails, ServiceBody, ServiceBodyType, SourceId, Weekday,
};
use crate::source_client::fields::{
    flag, optional_int, optional_str, parse_clock_time, required_decimal, required_int,
    required_str, Entry, MAX_DURATION_MINUTES,
};
use serde_json::Value;
use std::collections::BTreeSet;

const FORMAT_FIELDS: FormatFields = FormatFields {
    language: "language",
    key_string: "key",
    name: "name",
    description: "description",
    kind: "type",
};

/// Natively typed JSON: numbers are numbers, booleans are booleans and
/// formats arrive as an array.
pub struct TypedParser;

impl ShapeParser for TypedParser {
    fn service_bodies(
        &self,
        source_id: SourceId,
        payload: &Value,
    ) -> Result<ParsedServiceBodies, String> {
        let entries = entries_array(payload, "service_bodies")?;
        let (service_bodies, problems) =
            parse_entries(source_id, "service body", entries, |entry| {
                Ok(ServiceBody {
                    source_id,
                    local_id: required_int(entry, "id")?,
                    parent_id: optional_int(entry, "parent_id")?.filter(|id| *id > 0),
                    name: required_str(entry, "name")?,
                    kind: optional_str(entry, "type").map(|code| ServiceBodyType::from_code(&code)),
                    description: optional_str(entry, "description"),
                    url: optional_str(entry, "url"),
                    helpline: optional_str(entry, "helpline"),
                    world_id: optional_str(entry, "world_id"),
                })
            });
        Ok(ParsedServiceBodies {
            service_bodies,
            problems,
        })
    }

    fn meetings(&self, source_id: SourceId, payload: &Value) -> Result<ParsedMeetings, String> {
        let entries = entries_array(payload, "meetings")?;
        let reported_cutoff = match payload.get("change_cutoff").and_then(Value::as_str) {
            Some(raw) => Some(parse_timestamp(raw)?),
            None => None,
        };

        let (parsed, problems) = parse_entries(source_id, "meeting", entries, |entry| {
            parse_meeting(source_id, entry)
        });
        let (meetings, deleted_ids) = split_deleted(parsed);
        Ok(ParsedMeetings {
            meetings,
            deleted_ids,
            problems,
            reported_cutoff,
        })
    }

    fn formats(&self, source_id: SourceId, payload: &Value) -> Result<ParsedFormats, String> {
        parse_format_entries(source_id, payload, &FORMAT_FIELDS)
    }
}

fn parse_meeting(source_id: SourceId, entry: &Entry) -> Result<MeetingEntry, String> {
    let local_id = required_int(entry, "id")?;
    if flag(entry, "deleted").unwrap_or(false) {
        return Ok(MeetingEntry::Deleted(local_id));
    }

    let day = required_int(entry, "day")?;
    let weekday =
        Weekday::from_zero_based(day).ok_or_else(|| format!("day {} is out of range", day))?;

    let duration_minutes = match optional_int(entry, "duration_minutes")? {
        Some(minutes) => u32::try_from(minutes)
            .ok()
            .filter(|m| *m <= MAX_DURATION_MINUTES)
            .ok_or_else(|| format!("duration_minutes {} is out of range", minutes))?,
        None => 60,
    };

    let latitude = required_decimal(entry, "latitude")?;
    let longitude = required_decimal(entry, "longitude")?;
    let coordinates = Coordinates::new(latitude, longitude)
        .ok_or_else(|| format!("coordinates ({}, {}) are out of range", latitude, longitude))?;

    let last_changed = match optional_str(entry, "updated_at") {
        Some(raw) => Some(parse_timestamp(&raw)?),
        None => None,
    };

    let details: MeetingDetails = serde_json::from_value(Value::Object(entry.clone()))
        .map_err(|e| format!("invalid location details: {}", e))?;

    Ok(MeetingEntry::Live(Meeting {
        source_id,
        local_id,
        name: required_str(entry, "name")?,
        service_body_id: required_int(entry, "service_body_id")?,
        weekday,
        start_time: parse_clock_time(&required_str(entry, "start_time")?)?,
        duration_minutes,
        coordinates,
        formats: parse_formats(entry)?,
        published: flag(entry, "published").unwrap_or(false),
        venue_type: optional_int(entry, "venue_type")?,
        language: optional_str(entry, "language"),
        last_changed,
        details,
    }))
}

fn parse_formats(entry: &Entry) -> Result<BTreeSet<String>, String> {
    match entry.get("formats") {
        None | Some(Value::Null) => Ok(BTreeSet::new()),
        Some(Value::Array(codes)) => codes
            .iter()
            .map(|code| {
                code.as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| format!("format code is not a string: {}", code))
            })
            .filter(|code| !matches!(code, Ok(s) if s.is_empty()))
            .collect(),
        Some(other) => Err(format!("formats is not an array: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn meeting_json(id: i64) -> Value {
        json!({
            "id": id,
            "service_body_id": 9,
            "name": "Morning Light",
            "day": 0,
            "start_time": "07:00",
            "duration_minutes": 75,
            "latitude": 51.5072,
            "longitude": -0.1276,
            "formats": ["O", "ES"],
            "published": false,
            "updated_at": "2024-03-01T10:00:00Z",
            "location_street": "1 High Street"
        })
    }

    #[test]
    fn parses_native_types() {
        let parsed = TypedParser
            .meetings(SourceId(2), &json!({"meetings": [meeting_json(5)]}))
            .unwrap();
        assert!(parsed.problems.is_empty(), "{:?}", parsed.problems);
        let m = &parsed.meetings[0];
        assert_eq!(m.weekday, Weekday::Sunday);
        assert_eq!(m.duration_minutes, 75);
        assert!(!m.published);
        assert_eq!(
            m.last_changed,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(m.details.location_street.as_deref(), Some("1 High Street"));
        assert_eq!(
            m.formats.iter().cloned().collect::<Vec<_>>(),
            vec!["ES".to_string(), "O".to_string()]
        );
    }

    #[test]
    fn reads_reported_cutoff_and_deletions() {
        let payload = json!({
            "change_cutoff": "2024-03-02T00:00:00Z",
            "meetings": [meeting_json(5), {"id": 6, "deleted": true}]
        });
        let parsed = TypedParser.meetings(SourceId(2), &payload).unwrap();
        assert_eq!(parsed.deleted_ids, vec![6]);
        assert_eq!(
            parsed.reported_cutoff,
            Some(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn absent_published_and_huge_durations() {
        let mut quiet = meeting_json(9);
        quiet.as_object_mut().unwrap().remove("published");
        let mut endless = meeting_json(10);
        endless["duration_minutes"] = json!(5_000_000_000i64);

        let parsed = TypedParser
            .meetings(SourceId(2), &json!([quiet, endless]))
            .unwrap();
        assert_eq!(parsed.meetings.len(), 1);
        assert!(!parsed.meetings[0].published);
        assert_eq!(parsed.problems.len(), 1);
    }

    #[test]
    fn parses_formats_with_native_fields() {
        let payload = json!({"formats": [
            {"id": 2, "language": "en", "key": "W", "name": "Women", "type": "FC3"},
            {"id": 2, "language": "fr", "key": "F", "name": "Femmes"}
        ]});
        let parsed = TypedParser.formats(SourceId(2), &payload).unwrap();
        assert_eq!(parsed.formats.len(), 1);
        assert_eq!(parsed.formats[0].kind.as_deref(), Some("FC3"));
        assert_eq!(parsed.formats[0].translation("fr").unwrap().key_string, "F");
    }

    #[test]
    fn bad_formats_or_timestamps_skip_the_entry() {
        let mut bad_formats = meeting_json(7);
        bad_formats["formats"] = json!("O,D");
        let mut bad_stamp = meeting_json(8);
        bad_stamp["updated_at"] = json!("yesterday");

        let parsed = TypedParser
            .meetings(SourceId(2), &json!([bad_formats, bad_stamp]))
            .unwrap();
        assert!(parsed.meetings.is_empty());
        assert_eq!(parsed.problems.len(), 2);
    }
}
