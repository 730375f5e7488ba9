//! Versioned schema migrations.
//!
//! The schema version lives in `PRAGMA user_version`. Each step is an
//! additive SQL file applied inside one transaction, so initialization is
//! idempotent and never destroys data.

use super::StoreError;
use rusqlite::{Connection, Transaction};

pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Core tables in drop order (children first).
pub const CORE_TABLES: &[&str] = &[
    "key_events",
    "pointer_events",
    "switches",
    "applications",
    "sessions",
];

pub const CORE_VIEWS: &[&str] = &[
    "vw_session_summary",
    "vw_top_applications",
    "vw_moves_share_by_app",
    "vw_clicks_by_app",
    "vw_best_kpm_window",
    "vw_kpm_rolling_60s",
    "vw_kpm_per_minute",
    "vw_switches_per_minute",
    "vw_activity_per_minute",
];

pub fn schema_version(conn: &Connection) -> Result<i32, StoreError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Bring the schema up to [`CURRENT_SCHEMA_VERSION`].
///
/// Returns the number of migration steps applied (zero when already current).
pub fn run_migrations(conn: &mut Connection) -> Result<u32, StoreError> {
    let mut version = schema_version(conn)?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::Migration(format!(
            "database version ({version}) is newer than supported schema ({CURRENT_SCHEMA_VERSION})"
        )));
    }

    if version == CURRENT_SCHEMA_VERSION {
        return Ok(0);
    }

    let tx = conn.transaction()?;
    let mut applied = 0;

    while version < CURRENT_SCHEMA_VERSION {
        let next_version = version + 1;
        apply_migration(&tx, next_version)?;
        tracing::info!(version = next_version, "applied schema migration");
        version = next_version;
        applied += 1;
    }

    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;

    Ok(applied)
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<(), StoreError> {
    let sql = match version {
        1 => include_str!("schemas/v1.sql"),
        2 => include_str!("schemas/v2.sql"),
        _ => {
            return Err(StoreError::Migration(format!(
                "unknown migration target version: {version}"
            )))
        }
    };
    tx.execute_batch(sql).map_err(|e| {
        StoreError::Migration(format!("migration to version {version} failed: {e}"))
    })
}

/// Drop every core view and table and clear the version.
pub(crate) fn drop_core_schema(tx: &Transaction<'_>) -> Result<(), StoreError> {
    for view in CORE_VIEWS {
        tx.execute_batch(&format!("DROP VIEW IF EXISTS {view};"))?;
    }
    for table in CORE_TABLES {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {table};"))?;
    }
    tx.pragma_update(None, "user_version", 0)?;
    Ok(())
}

/// The DDL of all user objects, in creation order.
pub fn schema_text(conn: &Connection) -> Result<String, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT sql FROM sqlite_master
         WHERE sql IS NOT NULL AND name NOT LIKE 'sqlite_%'
         ORDER BY rowid",
    )?;
    let statements = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(statements
        .into_iter()
        .map(|sql| format!("{sql};"))
        .collect::<Vec<_>>()
        .join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_once() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(run_migrations(&mut conn).unwrap(), 2);
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
        assert_eq!(run_migrations(&mut conn).unwrap(), 0);
    }

    #[test]
    fn test_newer_database_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION + 1)
            .unwrap();
        assert!(matches!(
            run_migrations(&mut conn),
            Err(StoreError::Migration(_))
        ));
    }

    #[test]
    fn test_schema_text_lists_tables_and_views() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        let ddl = schema_text(&conn).unwrap();
        for table in CORE_TABLES {
            assert!(ddl.contains(&format!("CREATE TABLE {table}")), "{table}");
        }
        for view in CORE_VIEWS {
            assert!(ddl.contains(&format!("CREATE VIEW {view}")), "{view}");
        }
        assert!(ddl.contains("STRICT"));
    }

    #[test]
    fn test_drop_core_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        let tx = conn.transaction().unwrap();
        drop_core_schema(&tx).unwrap();
        tx.commit().unwrap();

        let remaining: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(remaining, 0);
        assert_eq!(schema_version(&conn).unwrap(), 0);
    }
}
