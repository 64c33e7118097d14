mod versioned_schema;

pub use versioned_schema::{
    prepare_database, Column, ForeignKey, OnDelete, SqlType, Table, VersionedSchema,
    BASE_DB_VERSION,
};
