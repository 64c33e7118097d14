//! SQLite schema for the aggregated meeting database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, ForeignKey, OnDelete, SqlType, Table, VersionedSchema};
use anyhow::Result;
use rusqlite::Connection;

/// Service bodies of every source. `id` is the surrogate exposed to clients.
const SERVICE_BODIES_TABLE_V1: Table = Table {
    name: "service_bodies",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("source_id", SqlType::Integer, non_null = true),
        sqlite_column!("local_id", SqlType::Integer, non_null = true),
        sqlite_column!("parent_local_id", SqlType::Integer),
        sqlite_column!("name", SqlType::Text, non_null = true),
        sqlite_column!("type", SqlType::Text),
        sqlite_column!("description", SqlType::Text),
        sqlite_column!("url", SqlType::Text),
        sqlite_column!("helpline", SqlType::Text),
        sqlite_column!("world_id", SqlType::Text),
    ],
    indices: &[(
        "idx_service_bodies_parent",
        "source_id, parent_local_id",
    )],
    unique_constraints: &[&["source_id", "local_id"]],
    foreign_keys: &[],
};

/// Meetings of every source. The composite foreign key keeps a meeting from
/// outliving its service body.
const MEETINGS_TABLE_V1: Table = Table {
    name: "meetings",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("source_id", SqlType::Integer, non_null = true),
        sqlite_column!("local_id", SqlType::Integer, non_null = true),
        sqlite_column!("service_body_local_id", SqlType::Integer, non_null = true),
        sqlite_column!("name", SqlType::Text, non_null = true),
        sqlite_column!("weekday", SqlType::Integer, non_null = true),
        // "HH:MM:SS", sorts lexicographically
        sqlite_column!("start_time", SqlType::Text, non_null = true),
        sqlite_column!("duration_minutes", SqlType::Integer, non_null = true),
        sqlite_column!("latitude", SqlType::Real, non_null = true),
        sqlite_column!("longitude", SqlType::Real, non_null = true),
        // comma separated, sorted
        sqlite_column!("formats", SqlType::Text, non_null = true),
        sqlite_column!("published", SqlType::Integer, non_null = true),
        sqlite_column!("venue_type", SqlType::Integer),
        sqlite_column!("language", SqlType::Text),
        sqlite_column!("last_changed", SqlType::Text),
        // JSON object of location/contact details
        sqlite_column!("details", SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_meetings_order", "weekday, start_time, source_id, local_id"),
        ("idx_meetings_location", "latitude, longitude"),
        ("idx_meetings_service_body", "source_id, service_body_local_id"),
    ],
    unique_constraints: &[&["source_id", "local_id"]],
    foreign_keys: &[ForeignKey {
        columns: &["source_id", "service_body_local_id"],
        foreign_table: "service_bodies",
        foreign_columns: &["source_id", "local_id"],
        on_delete: OnDelete::Restrict,
    }],
};

const SYNC_STATE_TABLE_V1: Table = Table {
    name: "sync_state",
    columns: &[
        sqlite_column!("source_id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("last_success_at", SqlType::Text),
        sqlite_column!("last_attempt_at", SqlType::Text),
        sqlite_column!("last_error_kind", SqlType::Text),
        sqlite_column!("last_error_message", SqlType::Text),
        sqlite_column!("last_error_at", SqlType::Text),
        sqlite_column!("change_cutoff", SqlType::Text),
        sqlite_column!(
            "consecutive_failures",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "meeting_count",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "service_body_count",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "skipped_count",
            SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[],
    unique_constraints: &[],
    foreign_keys: &[],
};

const IMPORT_PROBLEMS_TABLE_V1: Table = Table {
    name: "import_problems",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("source_id", SqlType::Integer, non_null = true),
        sqlite_column!("message", SqlType::Text, non_null = true),
        sqlite_column!("data", SqlType::Text),
    ],
    indices: &[("idx_import_problems_source", "source_id")],
    unique_constraints: &[],
    foreign_keys: &[],
};

/// Formats of every source. `id` is the surrogate exposed to clients.
const FORMATS_TABLE_V2: Table = Table {
    name: "formats",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("source_id", SqlType::Integer, non_null = true),
        sqlite_column!("local_id", SqlType::Integer, non_null = true),
        sqlite_column!("type", SqlType::Text),
        sqlite_column!("world_id", SqlType::Text),
    ],
    indices: &[],
    unique_constraints: &[&["source_id", "local_id"]],
    foreign_keys: &[],
};

const FORMAT_TRANSLATIONS_TABLE_V2: Table = Table {
    name: "format_translations",
    columns: &[
        sqlite_column!("id", SqlType::Integer, is_primary_key = true),
        sqlite_column!("format_id", SqlType::Integer, non_null = true),
        sqlite_column!("language", SqlType::Text, non_null = true),
        sqlite_column!("key_string", SqlType::Text, non_null = true),
        sqlite_column!("name", SqlType::Text, non_null = true),
        sqlite_column!("description", SqlType::Text),
    ],
    indices: &[("idx_format_translations_language", "language")],
    unique_constraints: &[&["format_id", "language"]],
    foreign_keys: &[ForeignKey {
        columns: &["format_id"],
        foreign_table: "formats",
        foreign_columns: &["id"],
        on_delete: OnDelete::Cascade,
    }],
};

fn add_format_tables(conn: &Connection) -> Result<()> {
    FORMATS_TABLE_V2.create(conn)?;
    FORMAT_TRANSLATIONS_TABLE_V2.create(conn)?;
    Ok(())
}

pub const MEETING_DB_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[
            SERVICE_BODIES_TABLE_V1,
            MEETINGS_TABLE_V1,
            SYNC_STATE_TABLE_V1,
            IMPORT_PROBLEMS_TABLE_V1,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[
            SERVICE_BODIES_TABLE_V1,
            MEETINGS_TABLE_V1,
            SYNC_STATE_TABLE_V1,
            IMPORT_PROBLEMS_TABLE_V1,
            FORMATS_TABLE_V2,
            FORMAT_TRANSLATIONS_TABLE_V2,
        ],
        migration: Some(add_format_tables),
    },
];
