//! BMLT `client_interface` compatible read API.
//!
//! Parameters follow the BMLT semantic interface: list parameters accept both
//! `key=1,2` and repeated `key[]=1&key[]=2`, and negative ids exclude instead
//! of include. Every value in a meeting object is a string, as BMLT clients
//! expect. Ids exposed to clients are the aggregator's surrogate ids; the
//! source-local ids travel alongside as `source_id`.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveTime;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, error, warn};

use super::metrics::record_query_error;
use super::state::GuardedMeetingStore;
use crate::model::{Coordinates, SourceId, Weekday};
use crate::store::{
    FormatFilter, GeoFilter, MeetingFilter, MeetingQueryResult, StoreError, StoredFormat,
    StoredMeeting, StoredServiceBody,
};

const KM_PER_MILE: f64 = 1.609344;
const DEFAULT_JSONP_CALLBACK: &str = "callback";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unsupported output format {0:?}")]
    UnsupportedFormat(String),

    #[error("missing switcher")]
    MissingSwitcher,

    #[error("unsupported switcher {0:?}")]
    UnknownSwitcher(String),

    #[error("invalid {name}: {message}")]
    InvalidParameter { name: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("query task failed: {0}")]
    Task(String),
}

impl QueryError {
    fn invalid(name: &str, message: impl Into<String>) -> Self {
        QueryError::InvalidParameter {
            name: name.to_string(),
            message: message.into(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            QueryError::UnsupportedFormat(_) => "unsupported_format",
            QueryError::MissingSwitcher | QueryError::UnknownSwitcher(_) => "switcher",
            QueryError::InvalidParameter { .. } => "invalid_parameter",
            QueryError::Store(_) => "store_unavailable",
            QueryError::Task(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            QueryError::UnsupportedFormat(_)
            | QueryError::MissingSwitcher
            | QueryError::UnknownSwitcher(_)
            | QueryError::InvalidParameter { .. } => StatusCode::BAD_REQUEST,
            QueryError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        record_query_error(self.kind());
        let status = self.status();
        if status.is_server_error() {
            error!("Query failed: {}", self);
        } else {
            debug!("Rejected query: {}", self);
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputFormat {
    Json,
    Jsonp { callback: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switcher {
    GetSearchResults,
    GetServiceBodies,
    GetFormats,
}

impl Switcher {
    fn parse(s: &str) -> Result<Self, QueryError> {
        match s {
            "GetSearchResults" => Ok(Switcher::GetSearchResults),
            "GetServiceBodies" => Ok(Switcher::GetServiceBodies),
            "GetFormats" => Ok(Switcher::GetFormats),
            other => Err(QueryError::UnknownSwitcher(other.to_string())),
        }
    }
}

/// A fully validated client request.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientQuery {
    pub switcher: Switcher,
    pub filter: MeetingFilter,
    /// When set, only these keys are kept in each meeting object.
    pub data_field_keys: Option<Vec<String>>,
    /// `lang_enum` of a `GetFormats` request.
    pub language: Option<String>,
}

/// Query parameters grouped by name. `key[]` and `key` are the same parameter,
/// and comma separated values are split.
struct Params<'a> {
    values: HashMap<&'a str, Vec<&'a str>>,
}

impl<'a> Params<'a> {
    fn new(pairs: &'a [(String, String)]) -> Self {
        let mut values: HashMap<&str, Vec<&str>> = HashMap::new();
        for (key, value) in pairs {
            let key = key.strip_suffix("[]").unwrap_or(key);
            let entry = values.entry(key).or_default();
            entry.extend(value.split(',').map(str::trim).filter(|v| !v.is_empty()));
        }
        Self { values }
    }

    fn list(&self, name: &str) -> &[&'a str] {
        self.values.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    fn single(&self, name: &str) -> Result<Option<&'a str>, QueryError> {
        match self.list(name) {
            [] => Ok(None),
            [value] => Ok(Some(*value)),
            _ => Err(QueryError::invalid(name, "expected a single value")),
        }
    }

    fn int(&self, name: &str) -> Result<Option<i64>, QueryError> {
        self.single(name)?
            .map(|v| {
                v.parse::<i64>()
                    .map_err(|_| QueryError::invalid(name, format!("{:?} is not an integer", v)))
            })
            .transpose()
    }

    fn float(&self, name: &str) -> Result<Option<f64>, QueryError> {
        self.single(name)?
            .map(|v| match v.parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(f),
                _ => Err(QueryError::invalid(name, format!("{:?} is not a number", v))),
            })
            .transpose()
    }

    fn ints(&self, name: &str) -> Result<Vec<i64>, QueryError> {
        self.list(name)
            .iter()
            .map(|v| {
                v.parse::<i64>()
                    .map_err(|_| QueryError::invalid(name, format!("{:?} is not an integer", v)))
            })
            .collect()
    }

    fn flag(&self, name: &str) -> Result<bool, QueryError> {
        match self.single(name)? {
            None => Ok(false),
            Some("1") | Some("true") => Ok(true),
            Some("0") | Some("false") => Ok(false),
            Some(other) => Err(QueryError::invalid(name, format!("{:?} is not a flag", other))),
        }
    }
}

/// Splits signed ids into (included, excluded). Zero is rejected.
fn signed_ids(name: &str, values: Vec<i64>) -> Result<(Vec<i64>, Vec<i64>), QueryError> {
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    for value in values {
        match value {
            0 => return Err(QueryError::invalid(name, "ids must not be zero")),
            v if v > 0 => include.push(v),
            v => exclude.push(-v),
        }
    }
    Ok((include, exclude))
}

fn weekdays(params: &Params) -> Result<(Vec<Weekday>, Vec<Weekday>), QueryError> {
    let (include, exclude) = signed_ids("weekdays", params.ints("weekdays")?)?;
    let to_weekday = |day: i64| {
        Weekday::from_bmlt(day)
            .ok_or_else(|| QueryError::invalid("weekdays", format!("{} is not a weekday", day)))
    };
    Ok((
        include.into_iter().map(to_weekday).collect::<Result<_, _>>()?,
        exclude.into_iter().map(to_weekday).collect::<Result<_, _>>()?,
    ))
}

fn time_bound(params: &Params, hour_key: &str, minute_key: &str) -> Result<Option<NaiveTime>, QueryError> {
    let hour = params.int(hour_key)?;
    let minute = params.int(minute_key)?;
    if hour.is_none() && minute.is_none() {
        return Ok(None);
    }
    let hour = hour.unwrap_or(0);
    let minute = minute.unwrap_or(0);
    if !(0..24).contains(&hour) {
        return Err(QueryError::invalid(hour_key, "hour must be between 0 and 23"));
    }
    if !(0..60).contains(&minute) {
        return Err(QueryError::invalid(minute_key, "minute must be between 0 and 59"));
    }
    Ok(NaiveTime::from_hms_opt(hour as u32, minute as u32, 0))
}

fn geo_filter(params: &Params) -> Result<Option<GeoFilter>, QueryError> {
    let lat = params.float("lat_val")?;
    let lng = params.float("long_val")?;
    let width_km = match (params.float("geo_width_km")?, params.float("geo_width")?) {
        (Some(km), _) => Some(("geo_width_km", km)),
        (None, Some(miles)) => Some(("geo_width", miles * KM_PER_MILE)),
        (None, None) => None,
    };
    let bounds = params.list("bounds");

    let radius = match (lat, lng, width_km) {
        (None, None, None) => None,
        (Some(lat), Some(lng), Some((name, radius_km))) => {
            if radius_km <= 0.0 {
                return Err(QueryError::invalid(name, "search radius must be positive"));
            }
            let center = Coordinates::new(lat, lng)
                .ok_or_else(|| QueryError::invalid("lat_val", "coordinates out of range"))?;
            Some(GeoFilter::Radius { center, radius_km })
        }
        _ => {
            return Err(QueryError::invalid(
                "lat_val",
                "lat_val, long_val and geo_width or geo_width_km go together",
            ))
        }
    };

    if bounds.is_empty() {
        return Ok(radius);
    }
    if radius.is_some() {
        return Err(QueryError::invalid("bounds", "cannot be combined with a radius search"));
    }
    let corners = bounds
        .iter()
        .map(|v| v.parse::<f64>().ok().filter(|f| f.is_finite()))
        .collect::<Option<Vec<f64>>>()
        .ok_or_else(|| QueryError::invalid("bounds", format!("{:?} is not a list of numbers", bounds)))?;
    let [north, east, south, west] = corners[..] else {
        return Err(QueryError::invalid("bounds", "expected north,east,south,west"));
    };
    if Coordinates::new(north, east).is_none() || Coordinates::new(south, west).is_none() {
        return Err(QueryError::invalid("bounds", "coordinates out of range"));
    }
    if south > north {
        return Err(QueryError::invalid("bounds", "south edge is north of the north edge"));
    }
    Ok(Some(GeoFilter::BoundingBox {
        south,
        west,
        north,
        east,
    }))
}

/// Validates the query parameters of a `client_interface` request.
pub fn parse_client_query(pairs: &[(String, String)]) -> Result<ClientQuery, QueryError> {
    let params = Params::new(pairs);
    let switcher = params
        .single("switcher")?
        .ok_or(QueryError::MissingSwitcher)
        .and_then(Switcher::parse)?;

    let mut filter = MeetingFilter::default();
    let (sources, exclude_sources) = signed_ids("root_server_ids", params.ints("root_server_ids")?)?;
    filter.sources = sources.into_iter().map(SourceId).collect();
    filter.exclude_sources = exclude_sources.into_iter().map(SourceId).collect();

    match switcher {
        Switcher::GetServiceBodies => {
            return Ok(ClientQuery {
                switcher,
                filter,
                data_field_keys: None,
                language: None,
            })
        }
        Switcher::GetFormats => {
            let language = params.single("lang_enum")?.map(str::to_string);
            return Ok(ClientQuery {
                switcher,
                filter,
                data_field_keys: None,
                language,
            });
        }
        Switcher::GetSearchResults => {}
    }

    (filter.weekdays, filter.exclude_weekdays) = weekdays(&params)?;
    (filter.service_bodies, filter.exclude_service_bodies) =
        signed_ids("services", params.ints("services")?)?;
    filter.include_descendants = params.flag("recursive")?;
    filter.geo = geo_filter(&params)?;
    filter.starts_after = time_bound(&params, "StartsAfterH", "StartsAfterM")?;
    filter.starts_before = time_bound(&params, "StartsBeforeH", "StartsBeforeM")?;

    if let Some(page_size) = params.int("page_size")? {
        if page_size <= 0 {
            return Err(QueryError::invalid("page_size", "must be positive"));
        }
        let page_num = params.int("page_num")?.unwrap_or(1);
        if page_num <= 0 {
            return Err(QueryError::invalid("page_num", "pages are numbered from 1"));
        }
        filter.limit = Some(page_size as usize);
        filter.offset = (page_num as usize - 1).saturating_mul(page_size as usize);
    }

    let data_field_keys = match params.list("data_field_key") {
        [] => None,
        keys => Some(keys.iter().map(|k| k.to_string()).collect()),
    };

    Ok(ClientQuery {
        switcher,
        filter,
        data_field_keys,
        language: None,
    })
}

fn is_valid_callback(callback: &str) -> bool {
    let mut chars = callback.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.')
}

/// Resolves the `{format}` path segment.
pub fn parse_output_format(
    format: &str,
    pairs: &[(String, String)],
) -> Result<OutputFormat, QueryError> {
    match format {
        "json" => Ok(OutputFormat::Json),
        "jsonp" => {
            let callback = pairs
                .iter()
                .find(|(k, _)| k == "callback")
                .map(|(_, v)| v.as_str())
                .unwrap_or(DEFAULT_JSONP_CALLBACK);
            if !is_valid_callback(callback) {
                return Err(QueryError::invalid("callback", "not a valid JavaScript identifier"));
            }
            Ok(OutputFormat::Jsonp {
                callback: callback.to_string(),
            })
        }
        other => Err(QueryError::UnsupportedFormat(other.to_string())),
    }
}

fn text(value: &Option<String>) -> Value {
    Value::String(value.clone().unwrap_or_default())
}

fn format_duration(minutes: u32) -> String {
    format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
}

fn meeting_json(result: &MeetingQueryResult, stored: &StoredMeeting) -> Map<String, Value> {
    let meeting = &stored.meeting;
    let details = &meeting.details;
    let chain = result.service_body_chain(stored);
    let mut m = Map::new();
    let mut put = |key: &str, value: Value| {
        m.insert(key.to_string(), value);
    };
    put("id_bigint", stored.id.to_string().into());
    put("source_id", meeting.local_id.to_string().into());
    put("root_server_id", meeting.source_id.to_string().into());
    put("service_body_bigint", stored.service_body.to_string().into());
    put(
        "service_body_name",
        chain.first().map(|b| b.body.name.clone()).unwrap_or_default().into(),
    );
    put(
        "service_body_chain",
        Value::Array(chain.iter().map(|b| b.id.to_string().into()).collect()),
    );
    put("meeting_name", meeting.name.clone().into());
    put("weekday_tinyint", meeting.weekday.bmlt().to_string().into());
    put("start_time", meeting.start_time.format("%H:%M:%S").to_string().into());
    put("duration_time", format_duration(meeting.duration_minutes).into());
    put(
        "formats",
        meeting.formats.iter().cloned().collect::<Vec<_>>().join(",").into(),
    );
    put("latitude", meeting.coordinates.latitude.to_string().into());
    put("longitude", meeting.coordinates.longitude.to_string().into());
    put("published", if meeting.published { "1" } else { "0" }.into());
    put(
        "venue_type",
        meeting.venue_type.map(|v| v.to_string()).unwrap_or_default().into(),
    );
    put("lang_enum", text(&meeting.language));
    put("worldid_mixed", text(&details.world_id));
    put("location_text", text(&details.location_text));
    put("location_info", text(&details.location_info));
    put("location_street", text(&details.location_street));
    put("location_neighborhood", text(&details.location_neighborhood));
    put("location_city_subsection", text(&details.location_city_subsection));
    put("location_municipality", text(&details.location_municipality));
    put("location_sub_province", text(&details.location_sub_province));
    put("location_province", text(&details.location_province));
    put("location_postal_code_1", text(&details.location_postal_code_1));
    put("location_nation", text(&details.location_nation));
    put("comments", text(&details.comments));
    put("virtual_meeting_link", text(&details.virtual_meeting_link));
    put("phone_meeting_number", text(&details.phone_meeting_number));
    put(
        "virtual_meeting_additional_info",
        text(&details.virtual_meeting_additional_info),
    );
    put("email_contact", text(&details.email_contact));
    put("train_lines", text(&details.train_lines));
    put("bus_lines", text(&details.bus_lines));
    m
}

fn service_body_json(stored: &StoredServiceBody) -> Value {
    let body = &stored.body;
    serde_json::json!({
        "id": stored.id.to_string(),
        "parent_id": stored.parent.unwrap_or(0).to_string(),
        "source_id": body.local_id.to_string(),
        "root_server_id": body.source_id.to_string(),
        "name": body.name,
        "description": body.description.clone().unwrap_or_default(),
        "type": body.kind.as_ref().map(|k| k.code().to_string()).unwrap_or_default(),
        "url": body.url.clone().unwrap_or_default(),
        "helpline": body.helpline.clone().unwrap_or_default(),
        "world_id": body.world_id.clone().unwrap_or_default(),
    })
}

/// One object per translation, in store order. With a language filter the
/// store only returns that translation.
pub fn formats_json(formats: &[StoredFormat]) -> Value {
    let objects = formats
        .iter()
        .flat_map(|stored| {
            let format = &stored.format;
            format.translations.iter().map(move |t| {
                serde_json::json!({
                    "key_string": t.key_string,
                    "name_string": t.name,
                    "description_string": t.description.clone().unwrap_or_default(),
                    "lang": t.language,
                    "id": stored.id.to_string(),
                    "source_id": format.local_id.to_string(),
                    "root_server_id": format.source_id.to_string(),
                    "world_id": format.world_id.clone().unwrap_or_default(),
                    "format_type_enum": format.kind.clone().unwrap_or_default(),
                })
            })
        })
        .collect();
    Value::Array(objects)
}

/// Serializes a search result in store order, keeping only `keys` when given.
pub fn search_results_json(result: &MeetingQueryResult, keys: Option<&[String]>) -> Value {
    let wanted: Option<HashSet<&str>> = keys.map(|keys| keys.iter().map(String::as_str).collect());
    let meetings = result
        .meetings
        .iter()
        .map(|stored| {
            let mut m = meeting_json(result, stored);
            if let Some(wanted) = &wanted {
                m.retain(|k, _| wanted.contains(k.as_str()));
            }
            Value::Object(m)
        })
        .collect();
    Value::Array(meetings)
}

fn render(format: &OutputFormat, body: Value) -> Response {
    match format {
        OutputFormat::Json => Json(body).into_response(),
        OutputFormat::Jsonp { callback } => (
            [(header::CONTENT_TYPE, "application/javascript")],
            format!("{}({});", callback, body),
        )
            .into_response(),
    }
}

async fn execute(
    store: GuardedMeetingStore,
    query: ClientQuery,
) -> Result<Value, QueryError> {
    tokio::task::spawn_blocking(move || match query.switcher {
        Switcher::GetSearchResults => {
            let result = store.query(&query.filter)?;
            Ok(search_results_json(&result, query.data_field_keys.as_deref()))
        }
        Switcher::GetServiceBodies => {
            let excluded: HashSet<SourceId> = query.filter.exclude_sources.iter().copied().collect();
            let bodies = store.service_bodies(&query.filter.sources)?;
            Ok(Value::Array(
                bodies
                    .iter()
                    .filter(|b| !excluded.contains(&b.body.source_id))
                    .map(service_body_json)
                    .collect(),
            ))
        }
        Switcher::GetFormats => {
            let filter = FormatFilter {
                sources: query.filter.sources,
                exclude_sources: query.filter.exclude_sources,
                language: query.language,
            };
            Ok(formats_json(&store.formats(&filter)?))
        }
    })
    .await
    .map_err(|e| QueryError::Task(e.to_string()))?
}

/// `GET /client_interface/{format}/?switcher=...`
pub async fn client_interface(
    State(store): State<GuardedMeetingStore>,
    Path(format): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let parsed = parse_output_format(&format, &pairs)
        .and_then(|format| Ok((format, parse_client_query(&pairs)?)));
    let (format, query) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => return e.into_response(),
    };

    match execute(store, query).await {
        Ok(body) => render(&format, body),
        Err(e) => {
            if matches!(e, QueryError::Store(_)) {
                warn!("Query rejected, store unavailable: {}", e);
            }
            e.into_response()
        }
    }
}
