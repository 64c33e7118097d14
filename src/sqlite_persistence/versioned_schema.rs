use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use tracing::info;

/// Offset added to schema versions stored in `PRAGMA user_version`, so that a
/// database created by something else is never mistaken for one of ours.
pub const BASE_DB_VERSION: usize = 77000;

#[macro_export]
macro_rules! sqlite_column {
    ($name:expr, $sql_type:expr $(, $field:ident = $value:expr)*) => {
        {
            #[allow(unused_mut)]
            let mut column = Column {
                name: $name,
                sql_type: $sql_type,
                is_primary_key: false,
                non_null: false,
                default_value: None,
            };
            $(
                column.$field = $value;
            )*
            column
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Real,
}

impl SqlType {
    fn sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
        }
    }

    fn from_sql(s: &str) -> Option<Self> {
        match s {
            "TEXT" => Some(SqlType::Text),
            "INTEGER" => Some(SqlType::Integer),
            "REAL" => Some(SqlType::Real),
            _ => None,
        }
    }
}

#[allow(unused)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    NoAction,
    Restrict,
    Cascade,
}

impl OnDelete {
    fn sql(&self) -> &'static str {
        match self {
            OnDelete::NoAction => "NO ACTION",
            OnDelete::Restrict => "RESTRICT",
            OnDelete::Cascade => "CASCADE",
        }
    }
}

pub struct Column {
    pub name: &'static str,
    pub sql_type: SqlType,
    pub is_primary_key: bool,
    pub non_null: bool,
    pub default_value: Option<&'static str>,
}

/// A possibly composite foreign key declared at table level.
pub struct ForeignKey {
    pub columns: &'static [&'static str],
    pub foreign_table: &'static str,
    pub foreign_columns: &'static [&'static str],
    pub on_delete: OnDelete,
}

pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    /// (index name, indexed column list)
    pub indices: &'static [(&'static str, &'static str)],
    pub unique_constraints: &'static [&'static [&'static str]],
    pub foreign_keys: &'static [ForeignKey],
}

impl Table {
    fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|column| {
                let mut def = format!("{} {}", column.name, column.sql_type.sql());
                if column.is_primary_key {
                    def.push_str(" PRIMARY KEY");
                }
                if column.non_null {
                    def.push_str(" NOT NULL");
                }
                if let Some(default_value) = column.default_value {
                    def.push_str(&format!(" DEFAULT {}", default_value));
                }
                def
            })
            .collect();

        for unique in self.unique_constraints {
            parts.push(format!("UNIQUE ({})", unique.join(", ")));
        }
        for fk in self.foreign_keys {
            parts.push(format!(
                "FOREIGN KEY ({}) REFERENCES {}({}) ON DELETE {}",
                fk.columns.join(", "),
                fk.foreign_table,
                fk.foreign_columns.join(", "),
                fk.on_delete.sql()
            ));
        }
        format!("CREATE TABLE {} ({});", self.name, parts.join(", "))
    }

    pub fn create(&self, conn: &Connection) -> Result<()> {
        conn.execute(&self.create_sql(), params![])
            .with_context(|| format!("Failed to create table {}", self.name))?;
        for (index_name, columns) in self.indices {
            conn.execute(
                &format!("CREATE INDEX {} ON {}({});", index_name, self.name, columns),
                params![],
            )?;
        }
        Ok(())
    }

    fn validate_columns(&self, conn: &Connection) -> Result<()> {
        struct ActualColumn {
            name: String,
            sql_type: String,
            non_null: bool,
            default_value: Option<String>,
            is_primary_key: bool,
        }

        let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", self.name))?;
        let actual: Vec<ActualColumn> = stmt
            .query_map(params![], |row| {
                Ok(ActualColumn {
                    name: row.get(1)?,
                    sql_type: row.get(2)?,
                    non_null: row.get::<_, i32>(3)? == 1,
                    default_value: row.get(4)?,
                    is_primary_key: row.get::<_, i32>(5)? >= 1,
                })
            })?
            .collect::<rusqlite::Result<_>>()?;

        if actual.len() != self.columns.len() {
            bail!(
                "Table {} has columns [{}], expected [{}]",
                self.name,
                actual.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", "),
                self.columns.iter().map(|c| c.name).collect::<Vec<_>>().join(", ")
            );
        }

        for (actual, expected) in actual.iter().zip(self.columns.iter()) {
            if actual.name != expected.name {
                bail!(
                    "Table {} column name mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    actual.name
                );
            }
            if SqlType::from_sql(&actual.sql_type) != Some(expected.sql_type) {
                bail!(
                    "Table {} column {} type mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    expected.sql_type.sql(),
                    actual.sql_type
                );
            }
            if actual.non_null != expected.non_null {
                bail!(
                    "Table {} column {} non-null mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    expected.non_null,
                    actual.non_null
                );
            }
            if actual.is_primary_key != expected.is_primary_key {
                bail!(
                    "Table {} column {} primary key mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    expected.is_primary_key,
                    actual.is_primary_key
                );
            }
            let actual_default = actual.default_value.as_deref().map(strip_parentheses);
            let expected_default = expected.default_value.map(strip_parentheses);
            if actual_default != expected_default {
                bail!(
                    "Table {} column {} default mismatch: expected {:?}, got {:?}",
                    self.name,
                    expected.name,
                    expected.default_value,
                    actual.default_value
                );
            }
        }
        Ok(())
    }

    fn validate_indices(&self, conn: &Connection) -> Result<()> {
        for (index_name, _) in self.indices {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1 AND tbl_name = ?2",
                    params![index_name, self.name],
                    |_| Ok(()),
                )
                .is_ok();
            if !exists {
                bail!("Table {} is missing index '{}'", self.name, index_name);
            }
        }

        if self.unique_constraints.is_empty() {
            return Ok(());
        }
        let mut list = conn.prepare(&format!("PRAGMA index_list({})", self.name))?;
        let unique_indices: Vec<String> = list
            .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i32>(2)?)))?
            .filter_map(|r| r.ok())
            .filter(|(_, unique)| *unique == 1)
            .map(|(name, _)| name)
            .collect();

        let mut unique_column_sets: Vec<Vec<String>> = Vec::with_capacity(unique_indices.len());
        for index_name in &unique_indices {
            let mut info = conn.prepare(&format!("PRAGMA index_info({})", index_name))?;
            let mut columns: Vec<String> = info
                .query_map([], |row| row.get::<_, String>(2))?
                .filter_map(|r| r.ok())
                .collect();
            columns.sort();
            unique_column_sets.push(columns);
        }

        for expected in self.unique_constraints {
            let mut expected_sorted: Vec<&str> = expected.to_vec();
            expected_sorted.sort();
            let found = unique_column_sets
                .iter()
                .any(|actual| actual.iter().map(String::as_str).eq(expected_sorted.iter().copied()));
            if !found {
                bail!(
                    "Table {} is missing unique constraint on ({})",
                    self.name,
                    expected.join(", ")
                );
            }
        }
        Ok(())
    }

    fn validate_foreign_keys(&self, conn: &Connection) -> Result<()> {
        // PRAGMA foreign_key_list: id, seq, table, from, to, on_update, on_delete, match
        #[derive(Default)]
        struct ActualFk {
            table: String,
            from: Vec<String>,
            to: Vec<String>,
            on_delete: String,
        }

        let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", self.name))?;
        let rows: Vec<(i64, String, String, String, String)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(6)?))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let mut actual: BTreeMap<i64, ActualFk> = BTreeMap::new();
        for (id, table, from, to, on_delete) in rows {
            let fk = actual.entry(id).or_default();
            fk.table = table;
            fk.from.push(from);
            fk.to.push(to);
            fk.on_delete = on_delete;
        }

        for expected in self.foreign_keys {
            let found = actual.values().any(|fk| {
                fk.table == expected.foreign_table
                    && fk.from.iter().map(String::as_str).eq(expected.columns.iter().copied())
                    && fk
                        .to
                        .iter()
                        .map(String::as_str)
                        .eq(expected.foreign_columns.iter().copied())
                    && fk.on_delete == expected.on_delete.sql()
            });
            if !found {
                bail!(
                    "Table {} is missing foreign key ({}) REFERENCES {}({}) ON DELETE {}",
                    self.name,
                    expected.columns.join(", "),
                    expected.foreign_table,
                    expected.foreign_columns.join(", "),
                    expected.on_delete.sql()
                );
            }
        }
        Ok(())
    }

    pub fn validate(&self, conn: &Connection) -> Result<()> {
        self.validate_columns(conn)?;
        self.validate_indices(conn)?;
        self.validate_foreign_keys(conn)
    }
}

fn strip_parentheses(s: &str) -> &str {
    s.strip_prefix('(')
        .and_then(|inner| inner.strip_suffix(')'))
        .unwrap_or(s)
}

pub struct VersionedSchema {
    pub version: usize,
    pub tables: &'static [Table],
    /// Brings a database at the previous version up to this one.
    pub migration: Option<fn(&Connection) -> Result<()>>,
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.create(conn)?;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + self.version),
            [],
        )?;
        Ok(())
    }

    pub fn validate(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.validate(conn)?;
        }
        Ok(())
    }
}

/// Creates the latest schema on an empty database, or validates and migrates
/// an existing one.
pub fn prepare_database(conn: &mut Connection, schemas: &[VersionedSchema]) -> Result<()> {
    let latest = schemas.last().context("No schema versions defined")?;

    let table_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
        [],
        |row| row.get(0),
    )?;
    if table_count == 0 {
        info!("Creating database schema version {}", latest.version);
        let tx = conn.transaction()?;
        latest.create(&tx)?;
        tx.commit()?;
        return Ok(());
    }

    let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    let version = raw_version - BASE_DB_VERSION as i64;
    let position = schemas
        .iter()
        .position(|s| s.version as i64 == version)
        .with_context(|| format!("Unknown database version {}", raw_version))?;
    schemas[position]
        .validate(conn)
        .with_context(|| format!("Database schema validation failed for version {}", version))?;

    if position + 1 == schemas.len() {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for schema in &schemas[position + 1..] {
        info!("Migrating database to version {}", schema.version);
        if let Some(migration) = schema.migration {
            migration(&tx)
                .with_context(|| format!("Failed to migrate to version {}", schema.version))?;
        }
    }
    tx.execute(
        &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest.version),
        [],
    )?;
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARENTS: Table = Table {
        name: "parents",
        columns: &[
            sqlite_column!("id", SqlType::Integer, is_primary_key = true),
            sqlite_column!("scope", SqlType::Integer, non_null = true),
            sqlite_column!("code", SqlType::Integer, non_null = true),
        ],
        indices: &[],
        unique_constraints: &[&["scope", "code"]],
        foreign_keys: &[],
    };

    const CHILDREN: Table = Table {
        name: "children",
        columns: &[
            sqlite_column!("id", SqlType::Integer, is_primary_key = true),
            sqlite_column!("scope", SqlType::Integer, non_null = true),
            sqlite_column!("parent_code", SqlType::Integer, non_null = true),
            sqlite_column!("label", SqlType::Text, default_value = Some("''")),
        ],
        indices: &[("idx_children_label", "label")],
        unique_constraints: &[],
        foreign_keys: &[ForeignKey {
            columns: &["scope", "parent_code"],
            foreign_table: "parents",
            foreign_columns: &["scope", "code"],
            on_delete: OnDelete::Restrict,
        }],
    };

    const V1: VersionedSchema = VersionedSchema {
        version: 1,
        tables: &[PARENTS, CHILDREN],
        migration: None,
    };

    #[test]
    fn created_schema_validates() {
        let mut conn = Connection::open_in_memory().unwrap();
        prepare_database(&mut conn, &[V1]).unwrap();
        V1.validate(&conn).unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, (BASE_DB_VERSION + 1) as i64);

        // Reopening an existing database only validates.
        prepare_database(&mut conn, &[V1]).unwrap();
    }

    #[test]
    fn composite_foreign_key_is_enforced() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA foreign_keys = ON;", []).unwrap();
        prepare_database(&mut conn, &[V1]).unwrap();

        conn.execute("INSERT INTO parents (scope, code) VALUES (1, 10)", [])
            .unwrap();
        conn.execute(
            "INSERT INTO children (scope, parent_code) VALUES (1, 10)",
            [],
        )
        .unwrap();
        assert!(conn
            .execute("INSERT INTO children (scope, parent_code) VALUES (2, 10)", [])
            .is_err());
        assert!(conn.execute("DELETE FROM parents", []).is_err());
    }

    #[test]
    fn detects_missing_foreign_key() {
        let conn = Connection::open_in_memory().unwrap();
        PARENTS.create(&conn).unwrap();
        conn.execute(
            "CREATE TABLE children (id INTEGER PRIMARY KEY, scope INTEGER NOT NULL, parent_code INTEGER NOT NULL, label TEXT DEFAULT '')",
            [],
        )
        .unwrap();
        conn.execute("CREATE INDEX idx_children_label ON children(label)", [])
            .unwrap();

        let err = CHILDREN.validate(&conn).unwrap_err().to_string();
        assert!(err.contains("missing foreign key"), "{}", err);
    }

    #[test]
    fn detects_missing_unique_constraint_and_index() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE parents (id INTEGER PRIMARY KEY, scope INTEGER NOT NULL, code INTEGER NOT NULL)",
            [],
        )
        .unwrap();
        let err = PARENTS.validate(&conn).unwrap_err().to_string();
        assert!(err.contains("unique constraint"), "{}", err);

        let conn = Connection::open_in_memory().unwrap();
        PARENTS.create(&conn).unwrap();
        conn.execute(
            "CREATE TABLE children (id INTEGER PRIMARY KEY, scope INTEGER NOT NULL, parent_code INTEGER NOT NULL, label TEXT DEFAULT '', FOREIGN KEY (scope, parent_code) REFERENCES parents(scope, code) ON DELETE RESTRICT)",
            [],
        )
        .unwrap();
        let err = CHILDREN.validate(&conn).unwrap_err().to_string();
        assert!(err.contains("missing index"), "{}", err);
    }

    #[test]
    fn detects_column_mismatch() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE parents (id INTEGER PRIMARY KEY, scope TEXT NOT NULL, code INTEGER NOT NULL, UNIQUE (scope, code))",
            [],
        )
        .unwrap();
        let err = PARENTS.validate(&conn).unwrap_err().to_string();
        assert!(err.contains("type mismatch"), "{}", err);
    }

    #[test]
    fn runs_migrations_in_order() {
        fn add_notes(conn: &Connection) -> Result<()> {
            conn.execute("ALTER TABLE parents ADD COLUMN notes TEXT", [])?;
            Ok(())
        }
        const PARENTS_V2: Table = Table {
            name: "parents",
            columns: &[
                sqlite_column!("id", SqlType::Integer, is_primary_key = true),
                sqlite_column!("scope", SqlType::Integer, non_null = true),
                sqlite_column!("code", SqlType::Integer, non_null = true),
                sqlite_column!("notes", SqlType::Text),
            ],
            indices: &[],
            unique_constraints: &[&["scope", "code"]],
            foreign_keys: &[],
        };
        let v1 = VersionedSchema {
            version: 1,
            tables: &[PARENTS],
            migration: None,
        };
        let v2 = VersionedSchema {
            version: 2,
            tables: &[PARENTS_V2],
            migration: Some(add_notes),
        };

        let mut conn = Connection::open_in_memory().unwrap();
        prepare_database(&mut conn, std::slice::from_ref(&v1)).unwrap();
        prepare_database(&mut conn, &[v1, v2]).unwrap();
        PARENTS_V2.validate(&conn).unwrap();
    }
}
