use crate::model::{Coordinates, SourceId, Weekday, EARTH_RADIUS_KM};
use chrono::NaiveTime;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeoFilter {
    BoundingBox {
        south: f64,
        west: f64,
        north: f64,
        east: f64,
    },
    Radius {
        center: Coordinates,
        radius_km: f64,
    },
}

impl GeoFilter {
    /// A box containing every point the filter can accept, used to narrow the
    /// SQL scan before the exact check.
    pub fn bounding_box(&self) -> (f64, f64, f64, f64) {
        match *self {
            GeoFilter::BoundingBox {
                south,
                west,
                north,
                east,
            } => (south, west, north, east),
            GeoFilter::Radius { center, radius_km } => {
                // Slack so points exactly on the circle survive float rounding.
                const PAD_DEGREES: f64 = 1e-6;
                let angular = radius_km / EARTH_RADIUS_KM;
                let lat_delta = angular.to_degrees() + PAD_DEGREES;
                let south = center.latitude - lat_delta;
                let north = center.latitude + lat_delta;
                if south <= -90.0 || north >= 90.0 {
                    // The circle covers a pole, so every longitude is in reach.
                    return (south.max(-90.0), -180.0, north.min(90.0), 180.0);
                }

                // Widest longitude span of a spherical cap around the center.
                let ratio = angular.sin() / center.latitude.to_radians().cos();
                if ratio >= 1.0 {
                    return (south, -180.0, north, 180.0);
                }
                let lng_delta = ratio.asin().to_degrees() + PAD_DEGREES;
                if lng_delta >= 180.0 {
                    return (south, -180.0, north, 180.0);
                }
                let mut west = center.longitude - lng_delta;
                let mut east = center.longitude + lng_delta;
                // Wrap across the antimeridian; the box then has west > east.
                if west < -180.0 {
                    west += 360.0;
                }
                if east > 180.0 {
                    east -= 360.0;
                }
                (south, west, north, east)
            }
        }
    }

    pub fn contains(&self, point: &Coordinates) -> bool {
        match self {
            GeoFilter::BoundingBox {
                south,
                west,
                north,
                east,
            } => {
                let in_lat = point.latitude >= *south && point.latitude <= *north;
                // A west edge greater than the east edge crosses the antimeridian.
                let in_lng = if west <= east {
                    point.longitude >= *west && point.longitude <= *east
                } else {
                    point.longitude >= *west || point.longitude <= *east
                };
                in_lat && in_lng
            }
            GeoFilter::Radius { center, radius_km } => center.distance_km(point) <= *radius_km,
        }
    }
}

/// Read-side query over stored formats.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormatFilter {
    pub sources: Vec<SourceId>,
    pub exclude_sources: Vec<SourceId>,
    /// Only translations in this language.
    pub language: Option<String>,
}

/// Read-side query over the committed store.
#[derive(Debug, Clone, PartialEq)]
pub struct MeetingFilter {
    pub geo: Option<GeoFilter>,
    /// Surrogate service body ids.
    pub service_bodies: Vec<i64>,
    pub exclude_service_bodies: Vec<i64>,
    /// Expand `service_bodies` to all their descendants.
    pub include_descendants: bool,
    pub weekdays: Vec<Weekday>,
    pub exclude_weekdays: Vec<Weekday>,
    /// Strictly after.
    pub starts_after: Option<NaiveTime>,
    /// Strictly before.
    pub starts_before: Option<NaiveTime>,
    pub sources: Vec<SourceId>,
    pub exclude_sources: Vec<SourceId>,
    pub published_only: bool,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl Default for MeetingFilter {
    fn default() -> Self {
        Self {
            geo: None,
            service_bodies: Vec::new(),
            exclude_service_bodies: Vec::new(),
            include_descendants: false,
            weekdays: Vec::new(),
            exclude_weekdays: Vec::new(),
            starts_after: None,
            starts_before: None,
            sources: Vec::new(),
            exclude_sources: Vec::new(),
            published_only: true,
            offset: 0,
            limit: None,
        }
    }
}
