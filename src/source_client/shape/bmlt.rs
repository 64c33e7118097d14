use super::{
    entries_array, parse_entries, parse_format_entries, split_deleted, FormatFields,
    MeetingEntry, ParsedFormats, ParsedMeetings, ParsedServiceBodies, ShapeParser,
};
use crate::model::{Coordinates, Meeting, MeetingDetails, ServiceBody, ServiceBodyType, SourceId, Weekday};
use crate::source_client::fields::{
    comma_list, flag, optional_int, optional_str, parse_clock_time, parse_duration_minutes,
    required_decimal, required_int, required_str, Entry,
};
use serde_json::Value;

const DEFAULT_DURATION_MINUTES: u32 = 60;

const FORMAT_FIELDS: FormatFields = FormatFields {
    language: "lang",
    key_string: "key_string",
    name: "name_string",
    description: "description_string",
    kind: "format_type_enum",
};

/// Classic `client_interface/json` output, where every value is a string.
pub struct BmltParser;

impl ShapeParser for BmltParser {
    fn service_bodies(
        &self,
        source_id: SourceId,
        payload: &Value,
    ) -> Result<ParsedServiceBodies, String> {
        let entries = entries_array(payload, "service_bodies")?;
        let (service_bodies, problems) =
            parse_entries(source_id, "service body", entries, |entry| {
                parse_service_body(source_id, entry)
            });
        Ok(ParsedServiceBodies {
            service_bodies,
            problems,
        })
    }

    fn meetings(&self, source_id: SourceId, payload: &Value) -> Result<ParsedMeetings, String> {
        let entries = entries_array(payload, "meetings")?;
        let (parsed, problems) = parse_entries(source_id, "meeting", entries, |entry| {
            parse_meeting(source_id, entry)
        });
        let (meetings, deleted_ids) = split_deleted(parsed);
        Ok(ParsedMeetings {
            meetings,
            deleted_ids,
            problems,
            reported_cutoff: None,
        })
    }

    fn formats(&self, source_id: SourceId, payload: &Value) -> Result<ParsedFormats, String> {
        parse_format_entries(source_id, payload, &FORMAT_FIELDS)
    }
}

fn parse_service_body(source_id: SourceId, entry: &Entry) -> Result<ServiceBody, String> {
    let local_id = required_int(entry, "id")?;
    // BMLT reports root service bodies with parent_id "0".
    let parent_id = optional_int(entry, "parent_id")?.filter(|id| *id > 0);
    Ok(ServiceBody {
        source_id,
        local_id,
        parent_id,
        name: required_str(entry, "name")?,
        kind: optional_str(entry, "type").map(|code| ServiceBodyType::from_code(&code)),
        description: optional_str(entry, "description"),
        url: optional_str(entry, "url"),
        helpline: optional_str(entry, "helpline"),
        world_id: optional_str(entry, "world_id"),
    })
}

fn parse_meeting(source_id: SourceId, entry: &Entry) -> Result<MeetingEntry, String> {
    let local_id = required_int(entry, "id_bigint")?;
    if flag(entry, "deleted").unwrap_or(false) {
        return Ok(MeetingEntry::Deleted(local_id));
    }

    let weekday_raw = required_int(entry, "weekday_tinyint")?;
    let weekday = Weekday::from_bmlt(weekday_raw)
        .ok_or_else(|| format!("weekday_tinyint {} is out of range", weekday_raw))?;

    let start_time = parse_clock_time(&required_str(entry, "start_time")?)?;
    let duration_minutes = match optional_str(entry, "duration_time") {
        Some(raw) => parse_duration_minutes(&raw)?,
        None => DEFAULT_DURATION_MINUTES,
    };

    let latitude = required_decimal(entry, "latitude")?;
    let longitude = required_decimal(entry, "longitude")?;
    let coordinates = Coordinates::new(latitude, longitude)
        .ok_or_else(|| format!("coordinates ({}, {}) are out of range", latitude, longitude))?;

    let formats = optional_str(entry, "formats")
        .map(|raw| comma_list(&raw).into_iter().collect())
        .unwrap_or_default();

    let meeting = Meeting {
        source_id,
        local_id,
        name: required_str(entry, "meeting_name")?,
        service_body_id: required_int(entry, "service_body_bigint")?,
        weekday,
        start_time,
        duration_minutes,
        coordinates,
        formats,
        // Only an explicit "1" publishes a meeting.
        published: flag(entry, "published").unwrap_or(false),
        venue_type: optional_int(entry, "venue_type")?,
        language: optional_str(entry, "lang_enum").or_else(|| Some("en".to_string())),
        last_changed: None,
        details: MeetingDetails {
            location_text: optional_str(entry, "location_text"),
            location_info: optional_str(entry, "location_info"),
            location_street: optional_str(entry, "location_street"),
            location_neighborhood: optional_str(entry, "location_neighborhood"),
            location_city_subsection: optional_str(entry, "location_city_subsection"),
            location_municipality: optional_str(entry, "location_municipality"),
            location_sub_province: optional_str(entry, "location_sub_province"),
            location_province: optional_str(entry, "location_province"),
            location_postal_code_1: optional_str(entry, "location_postal_code_1"),
            location_nation: optional_str(entry, "location_nation"),
            comments: optional_str(entry, "comments"),
            virtual_meeting_link: optional_str(entry, "virtual_meeting_link"),
            phone_meeting_number: optional_str(entry, "phone_meeting_number"),
            virtual_meeting_additional_info: optional_str(entry, "virtual_meeting_additional_info"),
            email_contact: optional_str(entry, "email_contact"),
            train_lines: optional_str(entry, "train_lines"),
            bus_lines: optional_str(entry, "bus_lines"),
            world_id: optional_str(entry, "worldid_mixed"),
        },
    };
    Ok(MeetingEntry::Live(meeting))
}
