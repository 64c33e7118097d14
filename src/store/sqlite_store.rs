use super::schema::MEETING_DB_SCHEMAS;
use super::{
    ApplySummary, FormatFilter, GeoFilter, MeetingFilter, MeetingQueryResult, MeetingStore,
    StoreError, StoredFormat, StoredMeeting, StoredServiceBody,
};
use crate::model::{
    Coordinates, Format, FormatTranslation, ImportProblem, LastError, Meeting, MeetingDetails,
    ServiceBody, ServiceBodyType, SourceId, SourceSnapshot, SyncErrorKind, SyncState, Weekday,
};
use crate::reconcile::{PlanMode, SourcePlan};
use crate::sqlite_persistence::prepare_database;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row, TransactionBehavior};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_READ_POOL_SIZE: usize = 4;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const TIME_FORMAT: &str = "%H:%M:%S";

const SERVICE_BODY_COLUMNS: &str = "sb.id, sb.source_id, sb.local_id, sb.parent_local_id, \
    sb.name, sb.type, sb.description, sb.url, sb.helpline, sb.world_id, p.id";

const SERVICE_BODY_FROM: &str = "FROM service_bodies sb \
    LEFT JOIN service_bodies p ON p.source_id = sb.source_id AND p.local_id = sb.parent_local_id";

const MEETING_COLUMNS: &str = "m.id, m.source_id, m.local_id, m.service_body_local_id, m.name, \
    m.weekday, m.start_time, m.duration_minutes, m.latitude, m.longitude, m.formats, \
    m.published, m.venue_type, m.language, m.last_changed, m.details, sb.id";

const MEETING_FROM: &str = "FROM meetings m \
    JOIN service_bodies sb ON sb.source_id = m.source_id AND sb.local_id = m.service_body_local_id";

const FORMAT_SELECT: &str = "SELECT f.id, f.source_id, f.local_id, f.type, f.world_id, \
    t.language, t.key_string, t.name, t.description \
    FROM formats f LEFT JOIN format_translations t ON t.format_id = f.id";

const MEETING_ORDER: &str = "ORDER BY m.weekday, m.start_time, m.source_id, m.local_id";

/// SQLite-backed [`MeetingStore`].
///
/// Every write opens its own connection and runs in a `BEGIN IMMEDIATE`
/// transaction, so SQLite itself serializes concurrent writers. Reads go
/// through a small pool of read-only WAL connections and only ever see
/// committed data.
#[derive(Clone)]
pub struct SqliteMeetingStore {
    db_path: PathBuf,
    read_pool: Vec<Arc<Mutex<Connection>>>,
    read_index: Arc<AtomicUsize>,
}

impl SqliteMeetingStore {
    pub fn new<P: AsRef<Path>>(db_path: P, read_pool_size: usize) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        let mut write_conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open meeting database {}", db_path.display()))?;
        write_conn.pragma_update(None, "journal_mode", "WAL")?;
        write_conn.execute("PRAGMA foreign_keys = ON;", [])?;
        prepare_database(&mut write_conn, MEETING_DB_SCHEMAS)
            .context("Failed to prepare meeting database schema")?;

        let meeting_count: i64 =
            write_conn.query_row("SELECT COUNT(*) FROM meetings", [], |r| r.get(0))?;
        let service_body_count: i64 =
            write_conn.query_row("SELECT COUNT(*) FROM service_bodies", [], |r| r.get(0))?;
        info!(
            "Opened meeting database {}: {} meetings, {} service bodies",
            db_path.display(),
            meeting_count,
            service_body_count
        );

        let mut read_pool = Vec::with_capacity(read_pool_size.max(1));
        for _ in 0..read_pool_size.max(1) {
            let read_conn = Connection::open_with_flags(
                &db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .context("Failed to open read connection")?;
            read_conn.busy_timeout(BUSY_TIMEOUT)?;
            read_pool.push(Arc::new(Mutex::new(read_conn)));
        }

        Ok(Self {
            db_path,
            read_pool,
            read_index: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn write_conn(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        Ok(conn)
    }

    fn with_read_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let index = self.read_index.fetch_add(1, Ordering::Relaxed) % self.read_pool.len();
        let mut conn: MutexGuard<'_, Connection> = self.read_pool[index]
            .lock()
            .map_err(|_| StoreError::Unavailable("read connection poisoned".to_string()))?;
        f(&mut conn)
    }
}

fn corrupt(column: usize, message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, message.into().into())
}

fn encode_time(time: &NaiveTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

fn encode_timestamp(at: &Option<DateTime<Utc>>) -> Option<String> {
    at.map(|t| t.to_rfc3339())
}

fn decode_timestamp(column: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| corrupt(column, format!("bad timestamp {:?}: {}", s, e)))
    })
    .transpose()
}

fn encode_formats(formats: &BTreeSet<String>) -> String {
    formats.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

fn encode_details(details: &MeetingDetails) -> Result<String, StoreError> {
    serde_json::to_string(details).map_err(|e| StoreError::Unavailable(e.to_string()))
}

fn row_to_service_body(row: &Row) -> rusqlite::Result<StoredServiceBody> {
    let kind: Option<String> = row.get(5)?;
    Ok(StoredServiceBody {
        id: row.get(0)?,
        parent: row.get(10)?,
        body: ServiceBody {
            source_id: SourceId(row.get(1)?),
            local_id: row.get(2)?,
            parent_id: row.get(3)?,
            name: row.get(4)?,
            kind: kind.as_deref().map(ServiceBodyType::from_code),
            description: row.get(6)?,
            url: row.get(7)?,
            helpline: row.get(8)?,
            world_id: row.get(9)?,
        },
    })
}

fn row_to_meeting(row: &Row) -> rusqlite::Result<StoredMeeting> {
    let weekday: i64 = row.get(5)?;
    let start_time: String = row.get(6)?;
    let duration: i64 = row.get(7)?;
    let latitude: f64 = row.get(8)?;
    let longitude: f64 = row.get(9)?;
    let formats: String = row.get(10)?;
    let details: String = row.get(15)?;

    Ok(StoredMeeting {
        id: row.get(0)?,
        service_body: row.get(16)?,
        meeting: Meeting {
            source_id: SourceId(row.get(1)?),
            local_id: row.get(2)?,
            service_body_id: row.get(3)?,
            name: row.get(4)?,
            weekday: Weekday::from_bmlt(weekday)
                .ok_or_else(|| corrupt(5, format!("bad weekday {}", weekday)))?,
            start_time: NaiveTime::parse_from_str(&start_time, TIME_FORMAT)
                .map_err(|e| corrupt(6, format!("bad start time {:?}: {}", start_time, e)))?,
            duration_minutes: u32::try_from(duration)
                .map_err(|_| corrupt(7, format!("bad duration {}", duration)))?,
            coordinates: Coordinates::new(latitude, longitude)
                .ok_or_else(|| corrupt(8, format!("bad coordinates {},{}", latitude, longitude)))?,
            formats: formats
                .split(',')
                .filter(|f| !f.is_empty())
                .map(str::to_string)
                .collect(),
            published: row.get(11)?,
            venue_type: row.get(12)?,
            language: row.get(13)?,
            last_changed: decode_timestamp(14, row.get(14)?)?,
            details: serde_json::from_str(&details)
                .map_err(|e| corrupt(15, format!("bad details: {}", e)))?,
        },
    })
}

fn row_to_sync_state(row: &Row) -> rusqlite::Result<SyncState> {
    let error_kind: Option<String> = row.get(3)?;
    let error_message: Option<String> = row.get(4)?;
    let error_at = decode_timestamp(5, row.get(5)?)?;
    let last_error = match (error_kind, error_at) {
        (Some(kind), Some(at)) => Some(LastError {
            kind: SyncErrorKind::parse(&kind)
                .ok_or_else(|| corrupt(3, format!("bad error kind {:?}", kind)))?,
            message: error_message.unwrap_or_default(),
            at,
        }),
        _ => None,
    };
    let count = |idx: usize| -> rusqlite::Result<usize> {
        let value: i64 = row.get(idx)?;
        usize::try_from(value).map_err(|_| corrupt(idx, format!("bad count {}", value)))
    };
    let failures: i64 = row.get(7)?;

    Ok(SyncState {
        source_id: SourceId(row.get(0)?),
        last_success_at: decode_timestamp(1, row.get(1)?)?,
        last_attempt_at: decode_timestamp(2, row.get(2)?)?,
        last_error,
        change_cutoff: decode_timestamp(6, row.get(6)?)?,
        consecutive_failures: u32::try_from(failures)
            .map_err(|_| corrupt(7, format!("bad failure count {}", failures)))?,
        meeting_count: count(8)?,
        service_body_count: count(9)?,
        skipped_count: count(10)?,
    })
}

const SYNC_STATE_COLUMNS: &str = "source_id, last_success_at, last_attempt_at, last_error_kind, \
    last_error_message, last_error_at, change_cutoff, consecutive_failures, meeting_count, \
    service_body_count, skipped_count";

fn write_service_body(
    tx: &rusqlite::Transaction,
    body: &ServiceBody,
    update: bool,
) -> Result<(), StoreError> {
    let sql = if update {
        "UPDATE service_bodies SET parent_local_id = ?3, name = ?4, type = ?5, description = ?6, \
         url = ?7, helpline = ?8, world_id = ?9 WHERE source_id = ?1 AND local_id = ?2"
    } else {
        "INSERT INTO service_bodies (source_id, local_id, parent_local_id, name, type, \
         description, url, helpline, world_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
    };
    let changed = tx.prepare_cached(sql)?.execute(params![
        body.source_id.get(),
        body.local_id,
        body.parent_id,
        body.name,
        body.kind.as_ref().map(|k| k.code()),
        body.description,
        body.url,
        body.helpline,
        body.world_id,
    ])?;
    if changed != 1 {
        return Err(StoreError::ConstraintViolation(format!(
            "service body {} is not stored",
            body.key()
        )));
    }
    Ok(())
}

fn write_meeting(
    tx: &rusqlite::Transaction,
    meeting: &Meeting,
    update: bool,
) -> Result<(), StoreError> {
    let sql = if update {
        "UPDATE meetings SET service_body_local_id = ?3, name = ?4, weekday = ?5, \
         start_time = ?6, duration_minutes = ?7, latitude = ?8, longitude = ?9, formats = ?10, \
         published = ?11, venue_type = ?12, language = ?13, last_changed = ?14, details = ?15 \
         WHERE source_id = ?1 AND local_id = ?2"
    } else {
        "INSERT INTO meetings (source_id, local_id, service_body_local_id, name, weekday, \
         start_time, duration_minutes, latitude, longitude, formats, published, venue_type, \
         language, last_changed, details) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
    };
    let changed = tx.prepare_cached(sql)?.execute(params![
        meeting.source_id.get(),
        meeting.local_id,
        meeting.service_body_id,
        meeting.name,
        meeting.weekday.bmlt(),
        encode_time(&meeting.start_time),
        meeting.duration_minutes,
        meeting.coordinates.latitude,
        meeting.coordinates.longitude,
        encode_formats(&meeting.formats),
        meeting.published,
        meeting.venue_type,
        meeting.language,
        encode_timestamp(&meeting.last_changed),
        encode_details(&meeting.details)?,
    ])?;
    if changed != 1 {
        return Err(StoreError::ConstraintViolation(format!(
            "meeting {} is not stored",
            meeting.key()
        )));
    }
    Ok(())
}

fn write_format(
    tx: &rusqlite::Transaction,
    format: &Format,
    update: bool,
) -> Result<(), StoreError> {
    let sql = if update {
        "UPDATE formats SET type = ?3, world_id = ?4 WHERE source_id = ?1 AND local_id = ?2"
    } else {
        "INSERT INTO formats (source_id, local_id, type, world_id) VALUES (?1, ?2, ?3, ?4)"
    };
    let changed = tx.prepare_cached(sql)?.execute(params![
        format.source_id.get(),
        format.local_id,
        format.kind,
        format.world_id,
    ])?;
    if changed != 1 {
        return Err(StoreError::ConstraintViolation(format!(
            "format {} is not stored",
            format.key()
        )));
    }

    let format_id: i64 = tx
        .prepare_cached("SELECT id FROM formats WHERE source_id = ?1 AND local_id = ?2")?
        .query_row(params![format.source_id.get(), format.local_id], |r| r.get(0))?;
    if update {
        tx.prepare_cached("DELETE FROM format_translations WHERE format_id = ?1")?
            .execute(params![format_id])?;
    }
    let mut insert = tx.prepare_cached(
        "INSERT INTO format_translations (format_id, language, key_string, name, description) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for t in &format.translations {
        insert.execute(params![format_id, t.language, t.key_string, t.name, t.description])?;
    }
    Ok(())
}

/// Reads formats with their translations. Rows arrive ordered by format, so
/// translations of one format are adjacent.
fn read_formats(
    conn: &Connection,
    sql: &str,
    args: &[Value],
) -> Result<Vec<StoredFormat>, StoreError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut rows = stmt.query(params_from_iter(args.iter()))?;
    let mut formats: Vec<StoredFormat> = Vec::new();
    while let Some(row) = rows.next()? {
        let id: i64 = row.get(0)?;
        if formats.last().map(|f| f.id) != Some(id) {
            formats.push(StoredFormat {
                id,
                format: Format {
                    kind: row.get(3)?,
                    world_id: row.get(4)?,
                    ..Format::new(SourceId(row.get(1)?), row.get(2)?)
                },
            });
        }
        let language: Option<String> = row.get(5)?;
        if let (Some(language), Some(last)) = (language, formats.last_mut()) {
            last.format.set_translation(FormatTranslation {
                language,
                key_string: row.get(6)?,
                name: row.get(7)?,
                description: row.get(8)?,
            });
        }
    }
    Ok(formats)
}

/// SQLite reads a negative OFFSET as zero, so out-of-range offsets saturate.
fn sql_offset(offset: usize) -> i64 {
    i64::try_from(offset).unwrap_or(i64::MAX)
}

fn delete_source_rows(tx: &rusqlite::Transaction, source_id: SourceId) -> Result<usize, StoreError> {
    let meetings = tx.execute(
        "DELETE FROM meetings WHERE source_id = ?1",
        params![source_id.get()],
    )?;
    let service_bodies = tx.execute(
        "DELETE FROM service_bodies WHERE source_id = ?1",
        params![source_id.get()],
    )?;
    let formats = tx.execute(
        "DELETE FROM formats WHERE source_id = ?1",
        params![source_id.get()],
    )?;
    tx.execute(
        "DELETE FROM import_problems WHERE source_id = ?1",
        params![source_id.get()],
    )?;
    Ok(meetings + service_bodies + formats)
}

fn count_rows(conn: &Connection, table: &str, source_id: SourceId) -> Result<usize, StoreError> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE source_id = ?1", table),
        params![source_id.get()],
        |r| r.get(0),
    )?;
    Ok(count.max(0) as usize)
}

/// Appends `id IN (...)` semantics as a CTE named `name`, optionally closed
/// over the service body tree.
fn service_body_set_cte(
    name: &str,
    ids: &[i64],
    recursive: bool,
    args: &mut Vec<Value>,
) -> String {
    let placeholders = vec!["?"; ids.len()].join(", ");
    args.extend(ids.iter().map(|id| Value::Integer(*id)));
    if recursive {
        format!(
            "{name}(id) AS (SELECT id FROM service_bodies WHERE id IN ({placeholders}) \
             UNION SELECT c.id FROM service_bodies c \
             JOIN service_bodies p ON c.source_id = p.source_id AND c.parent_local_id = p.local_id \
             JOIN {name} ON p.id = {name}.id)"
        )
    } else {
        format!("{name}(id) AS (SELECT id FROM service_bodies WHERE id IN ({placeholders}))")
    }
}

fn in_list<T: Copy>(
    column: &str,
    values: &[T],
    negate: bool,
    args: &mut Vec<Value>,
    to_value: impl Fn(T) -> Value,
) -> String {
    let placeholders = vec!["?"; values.len()].join(", ");
    args.extend(values.iter().copied().map(to_value));
    format!(
        "{} {}IN ({})",
        column,
        if negate { "NOT " } else { "" },
        placeholders
    )
}

/// SQL for a meeting query. Paging is only pushed into SQL when no exact
/// geographic check has to run afterwards.
fn build_meeting_query(filter: &MeetingFilter) -> (String, Vec<Value>) {
    let mut args: Vec<Value> = Vec::new();
    let mut ctes = Vec::new();
    let mut clauses = Vec::new();

    if !filter.service_bodies.is_empty() {
        ctes.push(service_body_set_cte(
            "included",
            &filter.service_bodies,
            filter.include_descendants,
            &mut args,
        ));
        clauses.push("sb.id IN (SELECT id FROM included)".to_string());
    }
    if !filter.exclude_service_bodies.is_empty() {
        ctes.push(service_body_set_cte(
            "excluded",
            &filter.exclude_service_bodies,
            filter.include_descendants,
            &mut args,
        ));
        clauses.push("sb.id NOT IN (SELECT id FROM excluded)".to_string());
    }
    if !filter.weekdays.is_empty() {
        clauses.push(in_list("m.weekday", &filter.weekdays, false, &mut args, |d| {
            Value::Integer(d.bmlt() as i64)
        }));
    }
    if !filter.exclude_weekdays.is_empty() {
        clauses.push(in_list("m.weekday", &filter.exclude_weekdays, true, &mut args, |d| {
            Value::Integer(d.bmlt() as i64)
        }));
    }
    if let Some(after) = filter.starts_after {
        clauses.push("m.start_time > ?".to_string());
        args.push(Value::Text(encode_time(&after)));
    }
    if let Some(before) = filter.starts_before {
        clauses.push("m.start_time < ?".to_string());
        args.push(Value::Text(encode_time(&before)));
    }
    if !filter.sources.is_empty() {
        clauses.push(in_list("m.source_id", &filter.sources, false, &mut args, |s| {
            Value::Integer(s.get())
        }));
    }
    if !filter.exclude_sources.is_empty() {
        clauses.push(in_list("m.source_id", &filter.exclude_sources, true, &mut args, |s| {
            Value::Integer(s.get())
        }));
    }
    if filter.published_only {
        clauses.push("m.published = 1".to_string());
    }
    if let Some(geo) = &filter.geo {
        let (south, west, north, east) = geo.bounding_box();
        clauses.push("m.latitude BETWEEN ? AND ?".to_string());
        args.push(Value::Real(south));
        args.push(Value::Real(north));
        if west <= east {
            clauses.push("m.longitude BETWEEN ? AND ?".to_string());
        } else {
            clauses.push("(m.longitude >= ? OR m.longitude <= ?)".to_string());
        }
        args.push(Value::Real(west));
        args.push(Value::Real(east));
    }

    let mut sql = String::new();
    if !ctes.is_empty() {
        sql.push_str("WITH RECURSIVE ");
        sql.push_str(&ctes.join(", "));
        sql.push(' ');
    }
    sql.push_str(&format!("SELECT {} {}", MEETING_COLUMNS, MEETING_FROM));
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push(' ');
    sql.push_str(MEETING_ORDER);

    if filter.geo.is_none() {
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ? OFFSET ?");
            args.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
            args.push(Value::Integer(sql_offset(filter.offset)));
        } else if filter.offset > 0 {
            sql.push_str(" LIMIT -1 OFFSET ?");
            args.push(Value::Integer(sql_offset(filter.offset)));
        }
    }
    (sql, args)
}

fn apply_exact_geo(
    filter: &MeetingFilter,
    geo: &GeoFilter,
    meetings: Vec<StoredMeeting>,
) -> Vec<StoredMeeting> {
    let matching = meetings
        .into_iter()
        .filter(|m| geo.contains(&m.meeting.coordinates))
        .skip(filter.offset);
    match filter.limit {
        Some(limit) => matching.take(limit).collect(),
        None => matching.collect(),
    }
}

impl MeetingStore for SqliteMeetingStore {
    fn apply(&self, plan: &SourcePlan) -> Result<ApplySummary, StoreError> {
        let source_id = plan.source_id;
        let mut conn = self.write_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if plan.mode == PlanMode::Reset {
            let removed = delete_source_rows(&tx, source_id)?;
            debug!("Reset source {}: removed {} stored rows", source_id, removed);
        }

        for body in &plan.service_bodies.to_insert {
            write_service_body(&tx, body, false)?;
        }
        for body in &plan.service_bodies.to_update {
            write_service_body(&tx, body, true)?;
        }
        for meeting in &plan.meetings.to_insert {
            write_meeting(&tx, meeting, false)?;
        }
        for meeting in &plan.meetings.to_update {
            write_meeting(&tx, meeting, true)?;
        }
        for format in &plan.formats.to_insert {
            write_format(&tx, format, false)?;
        }
        for format in &plan.formats.to_update {
            write_format(&tx, format, true)?;
        }
        {
            let mut delete_meeting = tx
                .prepare_cached("DELETE FROM meetings WHERE source_id = ?1 AND local_id = ?2")?;
            for key in &plan.meetings.to_delete {
                delete_meeting.execute(params![key.source_id.get(), key.local_id])?;
            }
            let mut delete_body = tx.prepare_cached(
                "DELETE FROM service_bodies WHERE source_id = ?1 AND local_id = ?2",
            )?;
            for key in &plan.service_bodies.to_delete {
                delete_body.execute(params![key.source_id.get(), key.local_id])?;
            }
            let mut delete_format = tx
                .prepare_cached("DELETE FROM formats WHERE source_id = ?1 AND local_id = ?2")?;
            for key in &plan.formats.to_delete {
                delete_format.execute(params![key.source_id.get(), key.local_id])?;
            }
        }

        tx.execute(
            "DELETE FROM import_problems WHERE source_id = ?1",
            params![source_id.get()],
        )?;
        {
            let mut insert_problem = tx.prepare_cached(
                "INSERT INTO import_problems (source_id, message, data) VALUES (?1, ?2, ?3)",
            )?;
            for problem in &plan.problems {
                insert_problem.execute(params![source_id.get(), problem.message, problem.data])?;
            }
        }

        let summary = ApplySummary {
            service_bodies_inserted: plan.service_bodies.to_insert.len(),
            service_bodies_updated: plan.service_bodies.to_update.len(),
            service_bodies_deleted: plan.service_bodies.to_delete.len(),
            meetings_inserted: plan.meetings.to_insert.len(),
            meetings_updated: plan.meetings.to_update.len(),
            meetings_deleted: plan.meetings.to_delete.len(),
            formats_inserted: plan.formats.to_insert.len(),
            formats_updated: plan.formats.to_update.len(),
            formats_deleted: plan.formats.to_delete.len(),
            meeting_count: count_rows(&tx, "meetings", source_id)?,
            service_body_count: count_rows(&tx, "service_bodies", source_id)?,
            problem_count: plan.problems.len(),
        };
        tx.commit()?;
        Ok(summary)
    }

    fn query(&self, filter: &MeetingFilter) -> Result<MeetingQueryResult, StoreError> {
        let (sql, args) = build_meeting_query(filter);
        self.with_read_conn(|conn| {
            // One read transaction, so meetings and service bodies come from the
            // same committed snapshot.
            let tx = conn.transaction()?;
            let meetings = {
                let mut stmt = tx.prepare_cached(&sql)?;
                let rows = stmt.query_map(params_from_iter(args.iter()), row_to_meeting)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let meetings = match &filter.geo {
                Some(geo) => apply_exact_geo(filter, geo, meetings),
                None => meetings,
            };

            let sources: BTreeSet<i64> = meetings.iter().map(|m| m.meeting.source_id.get()).collect();
            let mut service_bodies = HashMap::new();
            if !sources.is_empty() {
                let placeholders = vec!["?"; sources.len()].join(", ");
                let sql = format!(
                    "SELECT {} {} WHERE sb.source_id IN ({})",
                    SERVICE_BODY_COLUMNS, SERVICE_BODY_FROM, placeholders
                );
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(sources.iter()), row_to_service_body)?;
                for row in rows {
                    let body = row?;
                    service_bodies.insert(body.id, body);
                }
            }
            tx.commit()?;
            Ok(MeetingQueryResult {
                meetings,
                service_bodies,
            })
        })
    }

    fn service_bodies(&self, sources: &[SourceId]) -> Result<Vec<StoredServiceBody>, StoreError> {
        self.with_read_conn(|conn| {
            let mut args = Vec::new();
            let mut sql = format!("SELECT {} {}", SERVICE_BODY_COLUMNS, SERVICE_BODY_FROM);
            if !sources.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&in_list("sb.source_id", sources, false, &mut args, |s| {
                    Value::Integer(s.get())
                }));
            }
            sql.push_str(" ORDER BY sb.source_id, sb.local_id");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), row_to_service_body)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn formats(&self, filter: &FormatFilter) -> Result<Vec<StoredFormat>, StoreError> {
        let mut args = Vec::new();
        let mut clauses = Vec::new();
        if !filter.sources.is_empty() {
            clauses.push(in_list("f.source_id", &filter.sources, false, &mut args, |s| {
                Value::Integer(s.get())
            }));
        }
        if !filter.exclude_sources.is_empty() {
            clauses.push(in_list("f.source_id", &filter.exclude_sources, true, &mut args, |s| {
                Value::Integer(s.get())
            }));
        }
        if let Some(language) = &filter.language {
            clauses.push("t.language = ?".to_string());
            args.push(Value::Text(language.clone()));
        }
        let mut sql = FORMAT_SELECT.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY f.source_id, f.local_id, t.language");
        self.with_read_conn(|conn| read_formats(conn, &sql, &args))
    }

    fn load_source(&self, source_id: SourceId) -> Result<SourceSnapshot, StoreError> {
        self.with_read_conn(|conn| {
            let tx = conn.transaction()?;
            let service_bodies = {
                let mut stmt = tx.prepare_cached(&format!(
                    "SELECT {} {} WHERE sb.source_id = ?1 ORDER BY sb.local_id",
                    SERVICE_BODY_COLUMNS, SERVICE_BODY_FROM
                ))?;
                let rows = stmt.query_map(params![source_id.get()], row_to_service_body)?;
                rows.map(|r| r.map(|b| b.body))
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            let meetings = {
                let mut stmt = tx.prepare_cached(&format!(
                    "SELECT {} {} WHERE m.source_id = ?1 ORDER BY m.local_id",
                    MEETING_COLUMNS, MEETING_FROM
                ))?;
                let rows = stmt.query_map(params![source_id.get()], row_to_meeting)?;
                rows.map(|r| r.map(|m| m.meeting))
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            let formats = read_formats(
                &tx,
                &format!(
                    "{} WHERE f.source_id = ? ORDER BY f.local_id, t.language",
                    FORMAT_SELECT
                ),
                &[Value::Integer(source_id.get())],
            )?
            .into_iter()
            .map(|f| f.format)
            .collect();
            tx.commit()?;
            Ok(SourceSnapshot {
                service_bodies,
                meetings,
                formats,
            })
        })
    }

    fn stored_sources(&self) -> Result<Vec<SourceId>, StoreError> {
        self.with_read_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT source_id FROM service_bodies \
                 UNION SELECT source_id FROM meetings \
                 UNION SELECT source_id FROM formats \
                 UNION SELECT source_id FROM import_problems \
                 UNION SELECT source_id FROM sync_state \
                 ORDER BY 1",
            )?;
            let rows = stmt.query_map([], |r| r.get::<_, i64>(0).map(SourceId))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn purge_source(&self, source_id: SourceId) -> Result<usize, StoreError> {
        let mut conn = self.write_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = delete_source_rows(&tx, source_id)?;
        tx.execute(
            "DELETE FROM sync_state WHERE source_id = ?1",
            params![source_id.get()],
        )?;
        tx.commit()?;
        info!("Purged source {}: {} rows removed", source_id, removed);
        Ok(removed)
    }

    fn sync_state(&self, source_id: SourceId) -> Result<Option<SyncState>, StoreError> {
        self.with_read_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM sync_state WHERE source_id = ?1",
                SYNC_STATE_COLUMNS
            ))?;
            match stmt.query_row(params![source_id.get()], row_to_sync_state) {
                Ok(state) => Ok(Some(state)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn sync_states(&self) -> Result<Vec<SyncState>, StoreError> {
        self.with_read_conn(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM sync_state ORDER BY source_id",
                SYNC_STATE_COLUMNS
            ))?;
            let rows = stmt.query_map([], row_to_sync_state)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn record_sync_state(&self, state: &SyncState) -> Result<(), StoreError> {
        let conn = self.write_conn()?;
        let error = state.last_error.as_ref();
        conn.execute(
            &format!(
                "INSERT INTO sync_state ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT(source_id) DO UPDATE SET \
                 last_success_at = excluded.last_success_at, \
                 last_attempt_at = excluded.last_attempt_at, \
                 last_error_kind = excluded.last_error_kind, \
                 last_error_message = excluded.last_error_message, \
                 last_error_at = excluded.last_error_at, \
                 change_cutoff = excluded.change_cutoff, \
                 consecutive_failures = excluded.consecutive_failures, \
                 meeting_count = excluded.meeting_count, \
                 service_body_count = excluded.service_body_count, \
                 skipped_count = excluded.skipped_count",
                SYNC_STATE_COLUMNS
            ),
            params![
                state.source_id.get(),
                encode_timestamp(&state.last_success_at),
                encode_timestamp(&state.last_attempt_at),
                error.map(|e| e.kind.as_str()),
                error.map(|e| e.message.as_str()),
                error.map(|e| e.at.to_rfc3339()),
                encode_timestamp(&state.change_cutoff),
                state.consecutive_failures,
                state.meeting_count as i64,
                state.service_body_count as i64,
                state.skipped_count as i64,
            ],
        )?;
        Ok(())
    }

    fn import_problems(
        &self,
        source_id: SourceId,
        limit: usize,
    ) -> Result<Vec<ImportProblem>, StoreError> {
        self.with_read_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT source_id, message, data FROM import_problems \
                 WHERE source_id = ?1 ORDER BY id LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![source_id.get(), limit as i64], |row| {
                Ok(ImportProblem {
                    source_id: SourceId(row.get(0)?),
                    message: row.get(1)?,
                    data: row.get(2)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{test_format, test_meeting, RecordKey};
    use crate::reconcile::EntityPlan;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, SqliteMeetingStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteMeetingStore::new(temp_dir.path().join("meetings.db"), 2).unwrap();
        (temp_dir, store)
    }

    fn body(source: i64, id: i64, parent: Option<i64>) -> ServiceBody {
        let mut b = ServiceBody::new(SourceId(source), id, format!("SB {}", id));
        b.parent_id = parent;
        b.kind = Some(ServiceBodyType::Area);
        b
    }

    fn plan(source: i64) -> SourcePlan {
        SourcePlan {
            source_id: SourceId(source),
            mode: PlanMode::Full,
            service_bodies: EntityPlan::default(),
            meetings: EntityPlan::default(),
            formats: EntityPlan::default(),
            problems: Vec::new(),
            errors: Vec::new(),
            change_cutoff: None,
        }
    }

    fn insert_plan(source: i64, bodies: Vec<ServiceBody>, meetings: Vec<Meeting>) -> SourcePlan {
        let mut p = plan(source);
        p.service_bodies.to_insert = bodies;
        p.meetings.to_insert = meetings;
        p
    }

    fn all(store: &SqliteMeetingStore) -> MeetingQueryResult {
        store
            .query(&MeetingFilter {
                published_only: false,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn apply_then_load_round_trips_records() {
        let (_dir, store) = open_store();
        let mut meeting = test_meeting(1, 10, 5);
        meeting.details.location_text = Some("Church hall".to_string());
        meeting.last_changed = Some(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());

        let summary = store
            .apply(&insert_plan(1, vec![body(1, 5, None)], vec![meeting.clone()]))
            .unwrap();
        assert_eq!(summary.meetings_inserted, 1);
        assert_eq!(summary.meeting_count, 1);
        assert_eq!(summary.service_body_count, 1);

        let snapshot = store.load_source(SourceId(1)).unwrap();
        assert_eq!(snapshot.meetings, vec![meeting]);
        assert_eq!(snapshot.service_bodies, vec![body(1, 5, None)]);
    }

    #[test]
    fn query_orders_by_weekday_time_source_and_id() {
        let (_dir, store) = open_store();
        let mut late = test_meeting(1, 1, 5);
        late.start_time = NaiveTime::from_hms_opt(21, 0, 0).unwrap();
        let mut sunday = test_meeting(1, 2, 5);
        sunday.weekday = Weekday::Sunday;
        let early = test_meeting(1, 3, 5);
        let other_source = test_meeting(2, 1, 5);

        store
            .apply(&insert_plan(1, vec![body(1, 5, None)], vec![late, sunday, early]))
            .unwrap();
        store
            .apply(&insert_plan(2, vec![body(2, 5, None)], vec![other_source]))
            .unwrap();

        let keys: Vec<RecordKey> = all(&store).meetings.iter().map(|m| m.meeting.key()).collect();
        assert_eq!(
            keys,
            vec![
                RecordKey::new(SourceId(1), 2),
                RecordKey::new(SourceId(1), 3),
                RecordKey::new(SourceId(2), 1),
                RecordKey::new(SourceId(1), 1),
            ]
        );
    }

    #[test]
    fn updates_keep_surrogate_ids() {
        let (_dir, store) = open_store();
        store
            .apply(&insert_plan(1, vec![body(1, 5, None)], vec![test_meeting(1, 10, 5)]))
            .unwrap();
        let before = all(&store).meetings[0].id;

        let mut changed = test_meeting(1, 10, 5);
        changed.name = "Renamed".to_string();
        let mut update = plan(1);
        update.meetings.to_update = vec![changed];
        store.apply(&update).unwrap();

        let after = all(&store);
        assert_eq!(after.meetings[0].id, before);
        assert_eq!(after.meetings[0].meeting.name, "Renamed");
    }

    #[test]
    fn failed_plan_leaves_nothing_behind() {
        let (_dir, store) = open_store();
        store
            .apply(&insert_plan(1, vec![body(1, 5, None)], vec![test_meeting(1, 10, 5)]))
            .unwrap();

        // second meeting is fine, the duplicate insert is not
        let bad = insert_plan(
            1,
            vec![body(1, 6, None)],
            vec![test_meeting(1, 11, 6), test_meeting(1, 10, 5)],
        );
        let err = store.apply(&bad).unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)), "{:?}", err);

        let snapshot = store.load_source(SourceId(1)).unwrap();
        assert_eq!(snapshot.meetings.len(), 1);
        assert_eq!(snapshot.service_bodies.len(), 1);
    }

    #[test]
    fn meeting_cannot_outlive_its_service_body() {
        let (_dir, store) = open_store();
        store
            .apply(&insert_plan(1, vec![body(1, 5, None)], vec![test_meeting(1, 10, 5)]))
            .unwrap();

        let mut orphaning = plan(1);
        orphaning.service_bodies.to_delete = vec![RecordKey::new(SourceId(1), 5)];
        assert!(matches!(
            store.apply(&orphaning),
            Err(StoreError::ConstraintViolation(_))
        ));

        let dangling = insert_plan(1, vec![], vec![test_meeting(1, 11, 99)]);
        assert!(matches!(
            store.apply(&dangling),
            Err(StoreError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn updating_a_missing_row_is_a_violation() {
        let (_dir, store) = open_store();
        let mut update = plan(1);
        update.service_bodies.to_update = vec![body(1, 5, None)];
        assert!(matches!(
            store.apply(&update),
            Err(StoreError::ConstraintViolation(_))
        ));
    }

    #[test]
    fn reset_plan_replaces_everything() {
        let (_dir, store) = open_store();
        store
            .apply(&insert_plan(
                1,
                vec![body(1, 5, None)],
                vec![test_meeting(1, 10, 5), test_meeting(1, 11, 5)],
            ))
            .unwrap();

        let mut reset = insert_plan(1, vec![body(1, 5, None)], vec![test_meeting(1, 12, 5)]);
        reset.mode = PlanMode::Reset;
        let summary = store.apply(&reset).unwrap();
        assert_eq!(summary.meeting_count, 1);

        let ids: Vec<i64> = all(&store).meetings.iter().map(|m| m.meeting.local_id).collect();
        assert_eq!(ids, vec![12]);
    }

    #[test]
    fn filters_by_weekday_time_and_source() {
        let (_dir, store) = open_store();
        let mut tuesday = test_meeting(1, 1, 5);
        tuesday.weekday = Weekday::Tuesday;
        let mut morning = test_meeting(1, 2, 5);
        morning.start_time = NaiveTime::from_hms_opt(7, 0, 0).unwrap();
        let mut hidden = test_meeting(1, 3, 5);
        hidden.published = false;
        store
            .apply(&insert_plan(1, vec![body(1, 5, None)], vec![tuesday, morning, hidden]))
            .unwrap();
        store
            .apply(&insert_plan(2, vec![body(2, 5, None)], vec![test_meeting(2, 4, 5)]))
            .unwrap();

        let ids = |filter: MeetingFilter| -> Vec<i64> {
            store
                .query(&filter)
                .unwrap()
                .meetings
                .iter()
                .map(|m| m.meeting.local_id)
                .collect()
        };

        assert_eq!(
            ids(MeetingFilter {
                weekdays: vec![Weekday::Tuesday],
                ..Default::default()
            }),
            vec![1]
        );
        assert_eq!(
            ids(MeetingFilter {
                starts_before: NaiveTime::from_hms_opt(12, 0, 0),
                ..Default::default()
            }),
            vec![2]
        );
        assert_eq!(
            ids(MeetingFilter {
                exclude_weekdays: vec![Weekday::Tuesday],
                exclude_sources: vec![SourceId(2)],
                ..Default::default()
            }),
            vec![2]
        );
        assert_eq!(
            ids(MeetingFilter {
                sources: vec![SourceId(2)],
                ..Default::default()
            }),
            vec![4]
        );
        assert_eq!(ids(MeetingFilter::default()).len(), 3);
        assert_eq!(
            ids(MeetingFilter {
                published_only: false,
                offset: 1,
                limit: Some(2),
                ..Default::default()
            }),
            vec![3, 4]
        );
    }

    #[test]
    fn service_body_filter_expands_descendants() {
        let (_dir, store) = open_store();
        store
            .apply(&insert_plan(
                1,
                vec![body(1, 1, None), body(1, 2, Some(1)), body(1, 3, Some(2))],
                vec![test_meeting(1, 10, 1), test_meeting(1, 20, 2), test_meeting(1, 30, 3)],
            ))
            .unwrap();
        let region = store
            .service_bodies(&[SourceId(1)])
            .unwrap()
            .into_iter()
            .find(|b| b.body.local_id == 2)
            .unwrap();

        let direct = store
            .query(&MeetingFilter {
                service_bodies: vec![region.id],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(direct.meetings.len(), 1);
        assert_eq!(direct.meetings[0].meeting.local_id, 20);

        let recursive = store
            .query(&MeetingFilter {
                service_bodies: vec![region.id],
                include_descendants: true,
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<i64> = recursive.meetings.iter().map(|m| m.meeting.local_id).collect();
        assert_eq!(ids, vec![20, 30]);

        let chain: Vec<i64> = recursive
            .service_body_chain(&recursive.meetings[1])
            .iter()
            .map(|b| b.body.local_id)
            .collect();
        assert_eq!(chain, vec![3, 2, 1]);
    }

    #[test]
    fn radius_filter_checks_exact_distance() {
        let (_dir, store) = open_store();
        let mut near = test_meeting(1, 1, 5);
        near.coordinates = Coordinates::new(40.72, -74.0).unwrap();
        let mut corner = test_meeting(1, 2, 5);
        // inside the bounding box, outside the circle
        corner.coordinates = Coordinates::new(40.7128 + 0.085, -74.006 + 0.11).unwrap();
        store
            .apply(&insert_plan(1, vec![body(1, 5, None)], vec![near, corner]))
            .unwrap();

        let result = store
            .query(&MeetingFilter {
                geo: Some(GeoFilter::Radius {
                    center: Coordinates::new(40.7128, -74.006).unwrap(),
                    radius_km: 10.0,
                }),
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<i64> = result.meetings.iter().map(|m| m.meeting.local_id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn radius_search_reaches_across_the_antimeridian() {
        let (_dir, store) = open_store();
        let mut west_of_line = test_meeting(1, 1, 5);
        west_of_line.coordinates = Coordinates::new(-17.0, 179.8).unwrap();
        let mut east_of_line = test_meeting(1, 2, 5);
        east_of_line.coordinates = Coordinates::new(-17.0, -179.5).unwrap();
        let mut far_away = test_meeting(1, 3, 5);
        far_away.coordinates = Coordinates::new(-17.0, 170.0).unwrap();
        store
            .apply(&insert_plan(
                1,
                vec![body(1, 5, None)],
                vec![west_of_line, east_of_line, far_away],
            ))
            .unwrap();

        let result = store
            .query(&MeetingFilter {
                geo: Some(GeoFilter::Radius {
                    center: Coordinates::new(-17.0, 179.5).unwrap(),
                    radius_km: 200.0,
                }),
                ..Default::default()
            })
            .unwrap();
        let ids: Vec<i64> = result.meetings.iter().map(|m| m.meeting.local_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn paging_far_past_the_end_is_empty() {
        let (_dir, store) = open_store();
        store
            .apply(&insert_plan(1, vec![body(1, 5, None)], vec![test_meeting(1, 1, 5)]))
            .unwrap();
        let result = store
            .query(&MeetingFilter {
                offset: usize::MAX,
                limit: Some(10),
                ..Default::default()
            })
            .unwrap();
        assert!(result.meetings.is_empty());
        assert_eq!(sql_offset(usize::MAX), i64::MAX);
    }

    #[test]
    fn formats_round_trip_and_update_in_place() {
        let (_dir, store) = open_store();
        let mut open = test_format(1, 1, "O");
        open.set_translation(FormatTranslation {
            language: "es".to_string(),
            key_string: "A".to_string(),
            name: "Abierta".to_string(),
            description: Some("Para todos".to_string()),
        });
        let mut first = plan(1);
        first.formats.to_insert = vec![open.clone(), test_format(1, 2, "C")];
        let summary = store.apply(&first).unwrap();
        assert_eq!(summary.formats_inserted, 2);

        let snapshot = store.load_source(SourceId(1)).unwrap();
        assert_eq!(snapshot.formats, vec![open.clone(), test_format(1, 2, "C")]);
        let before = store.formats(&FormatFilter::default()).unwrap();

        let mut renamed = open.clone();
        renamed.translations.retain(|t| t.language == "en");
        renamed.translations[0].name = "Open meeting".to_string();
        let mut second = plan(1);
        second.formats.to_update = vec![renamed.clone()];
        second.formats.to_delete = vec![RecordKey::new(SourceId(1), 2)];
        store.apply(&second).unwrap();

        let after = store.formats(&FormatFilter::default()).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, before[0].id);
        assert_eq!(after[0].format, renamed);
    }

    #[test]
    fn formats_filter_by_source_and_language() {
        let (_dir, store) = open_store();
        let mut spanish = test_format(1, 1, "O");
        spanish.set_translation(FormatTranslation {
            language: "es".to_string(),
            key_string: "A".to_string(),
            name: "Abierta".to_string(),
            description: None,
        });
        let mut one = plan(1);
        one.formats.to_insert = vec![spanish, test_format(1, 2, "C")];
        store.apply(&one).unwrap();
        let mut two = plan(2);
        two.formats.to_insert = vec![test_format(2, 1, "O")];
        store.apply(&two).unwrap();

        let spanish_only = store
            .formats(&FormatFilter {
                language: Some("es".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(spanish_only.len(), 1);
        assert_eq!(spanish_only[0].format.translations.len(), 1);
        assert_eq!(spanish_only[0].format.translations[0].key_string, "A");

        let second_source = store
            .formats(&FormatFilter {
                sources: vec![SourceId(2)],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(second_source.len(), 1);
        assert_eq!(second_source[0].format.source_id, SourceId(2));

        let excluded = store
            .formats(&FormatFilter {
                exclude_sources: vec![SourceId(2)],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(excluded.len(), 2);

        store.purge_source(SourceId(1)).unwrap();
        assert_eq!(store.formats(&FormatFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn problems_are_replaced_per_plan() {
        let (_dir, store) = open_store();
        let mut first = plan(1);
        first.problems = vec![
            ImportProblem::new(SourceId(1), "skipped meeting: bad weekday", Some("{}".into())),
            ImportProblem::new(SourceId(1), "skipped meeting: no name", None),
        ];
        store.apply(&first).unwrap();
        assert_eq!(store.import_problems(SourceId(1), 10).unwrap().len(), 2);
        assert_eq!(store.import_problems(SourceId(1), 1).unwrap().len(), 1);

        store.apply(&plan(1)).unwrap();
        assert!(store.import_problems(SourceId(1), 10).unwrap().is_empty());
    }

    #[test]
    fn sync_state_upserts() {
        let (_dir, store) = open_store();
        assert!(store.sync_state(SourceId(3)).unwrap().is_none());

        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let mut state = SyncState::new(SourceId(3));
        state.record_failure(at, SyncErrorKind::Timeout, "timed out".to_string());
        store.record_sync_state(&state).unwrap();
        assert_eq!(store.sync_state(SourceId(3)).unwrap(), Some(state.clone()));

        state.record_success(at, Some(at), 4, 2, 1);
        store.record_sync_state(&state).unwrap();
        assert_eq!(store.sync_states().unwrap(), vec![state]);
    }

    #[test]
    fn purge_removes_everything_for_one_source() {
        let (_dir, store) = open_store();
        store
            .apply(&insert_plan(1, vec![body(1, 5, None)], vec![test_meeting(1, 10, 5)]))
            .unwrap();
        store
            .apply(&insert_plan(2, vec![body(2, 5, None)], vec![test_meeting(2, 10, 5)]))
            .unwrap();
        store.record_sync_state(&SyncState::new(SourceId(1))).unwrap();
        assert_eq!(store.stored_sources().unwrap(), vec![SourceId(1), SourceId(2)]);

        assert_eq!(store.purge_source(SourceId(1)).unwrap(), 2);
        assert_eq!(store.stored_sources().unwrap(), vec![SourceId(2)]);
        assert!(store.sync_state(SourceId(1)).unwrap().is_none());
        assert_eq!(all(&store).meetings.len(), 1);
    }

    #[test]
    fn readers_never_see_half_applied_plans() {
        let (_dir, store) = open_store();
        let meetings = |name: &str| -> Vec<Meeting> {
            (1..=20)
                .map(|id| {
                    let mut m = test_meeting(1, id, 5);
                    m.name = name.to_string();
                    m
                })
                .collect()
        };
        store
            .apply(&insert_plan(1, vec![body(1, 5, None)], meetings("A")))
            .unwrap();

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..30 {
                    let mut p = plan(1);
                    p.meetings.to_update = meetings(if i % 2 == 0 { "B" } else { "A" });
                    store.apply(&p).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let result = all(&store);
                        assert_eq!(result.meetings.len(), 20);
                        let first = &result.meetings[0].meeting.name;
                        assert!(result.meetings.iter().all(|m| &m.meeting.name == first));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
