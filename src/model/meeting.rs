use super::{RecordKey, SourceId};
use chrono::{DateTime, NaiveTime, Timelike, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

/// Day of the week in BMLT numbering (1 = Sunday .. 7 = Saturday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(into = "u8")]
pub enum Weekday {
    Sunday = 1,
    Monday = 2,
    Tuesday = 3,
    Wednesday = 4,
    Thursday = 5,
    Friday = 6,
    Saturday = 7,
}

impl Weekday {
    pub const ALL: [Weekday; 7] = [
        Weekday::Sunday,
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
    ];

    pub fn from_bmlt(day: i64) -> Option<Self> {
        if (1..=7).contains(&day) {
            Some(Self::ALL[(day - 1) as usize])
        } else {
            None
        }
    }

    /// Zero-based numbering (0 = Sunday), as used by typed sources.
    pub fn from_zero_based(day: i64) -> Option<Self> {
        Self::from_bmlt(day + 1)
    }

    pub fn bmlt(&self) -> u8 {
        *self as u8
    }
}

impl From<Weekday> for u8 {
    fn from(day: Weekday) -> Self {
        day.bmlt()
    }
}

/// Mean Earth radius used for every distance computation.
pub const EARTH_RADIUS_KM: f64 = 6371.0088;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self {
            latitude,
            longitude,
        })
    }

    /// Great-circle distance in kilometers.
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        let (lat1, lat2) = (self.latitude.to_radians(), other.latitude.to_radians());
        let d_lat = lat2 - lat1;
        let d_lng = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// Free-form location and contact attributes carried through verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MeetingDetails {
    pub location_text: Option<String>,
    pub location_info: Option<String>,
    pub location_street: Option<String>,
    pub location_neighborhood: Option<String>,
    pub location_city_subsection: Option<String>,
    pub location_municipality: Option<String>,
    pub location_sub_province: Option<String>,
    pub location_province: Option<String>,
    pub location_postal_code_1: Option<String>,
    pub location_nation: Option<String>,
    pub comments: Option<String>,
    pub virtual_meeting_link: Option<String>,
    pub phone_meeting_number: Option<String>,
    pub virtual_meeting_additional_info: Option<String>,
    pub email_contact: Option<String>,
    pub train_lines: Option<String>,
    pub bus_lines: Option<String>,
    pub world_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Meeting {
    pub source_id: SourceId,
    pub local_id: i64,
    pub name: String,
    /// Local id of the owning service body within the same source.
    pub service_body_id: i64,
    pub weekday: Weekday,
    pub start_time: NaiveTime,
    pub duration_minutes: u32,
    pub coordinates: Coordinates,
    pub formats: BTreeSet<String>,
    pub published: bool,
    pub venue_type: Option<i64>,
    pub language: Option<String>,
    pub last_changed: Option<DateTime<Utc>>,
    pub details: MeetingDetails,
}

impl Meeting {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.source_id, self.local_id)
    }

    /// Field-by-field comparison of everything a client can observe, ignoring
    /// the source-reported last-changed marker.
    pub fn same_content(&self, other: &Meeting) -> bool {
        self.name == other.name
            && self.service_body_id == other.service_body_id
            && self.weekday == other.weekday
            && self.start_time.num_seconds_from_midnight()
                == other.start_time.num_seconds_from_midnight()
            && self.duration_minutes == other.duration_minutes
            && self.coordinates == other.coordinates
            && self.formats == other.formats
            && self.published == other.published
            && self.venue_type == other.venue_type
            && self.language == other.language
            && self.details == other.details
    }
}

#[cfg(test)]
pub(crate) fn test_meeting(source_id: i64, local_id: i64, service_body_id: i64) -> Meeting {
    Meeting {
        source_id: SourceId(source_id),
        local_id,
        name: format!("Meeting {}", local_id),
        service_body_id,
        weekday: Weekday::Monday,
        start_time: NaiveTime::from_hms_opt(19, 30, 0).unwrap(),
        duration_minutes: 60,
        coordinates: Coordinates::new(40.7128, -74.006).unwrap(),
        formats: ["O", "D"].iter().map(|s| s.to_string()).collect(),
        published: true,
        venue_type: Some(1),
        language: Some("en".to_string()),
        last_changed: None,
        details: MeetingDetails::default(),
    }
}
