use rusqlite::Connection;

/// Schema version the code expects. Opening an older database runs every
/// migration between its stored version and this one, in order.
pub const EXPECTED_SCHEMA_VERSION: u32 = 2;

/// Run all pending migrations on `conn`.
///
/// Safe to call on every open: each step only runs when the stored version
/// is below it, and a fresh database walks the whole chain.
pub fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        );
        INSERT INTO schema_version SELECT 0
            WHERE NOT EXISTS (SELECT 1 FROM schema_version);",
    )?;

    let version = schema_version(conn)?;

    if version < 1 {
        migrate_v1_base_schema(conn)?;
        set_version(conn, 1)?;
    }
    if version < 2 {
        migrate_v2_counters(conn)?;
        set_version(conn, 2)?;
    }

    Ok(())
}

/// v1: all object stores and their secondary indexes.
fn migrate_v1_base_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS photos (
            id             TEXT PRIMARY KEY,
            blob           BLOB NOT NULL,
            media_type     TEXT NOT NULL,
            date_taken     TEXT NOT NULL,
            timestamp      INTEGER NOT NULL,
            has_embedding  INTEGER NOT NULL DEFAULT 0,
            group_id       TEXT REFERENCES groups(id),
            ai_reason      TEXT,
            ai_confidence  TEXT
        );

        CREATE TABLE IF NOT EXISTS embeddings (
            photo_id    TEXT PRIMARY KEY REFERENCES photos(id),
            vector      BLOB NOT NULL,
            created_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS groups (
            id                TEXT PRIMARY KEY,
            photo_ids         TEXT NOT NULL,
            similarity_score  REAL NOT NULL,
            created_at        INTEGER NOT NULL,
            review_status     TEXT NOT NULL DEFAULT 'pending'
        );

        CREATE TABLE IF NOT EXISTS selected_photos (
            photo_id     TEXT PRIMARY KEY,
            selected_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS metadata (
            key    TEXT PRIMARY KEY,
            value  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_photos_timestamp      ON photos(timestamp);
        CREATE INDEX IF NOT EXISTS idx_photos_has_embedding  ON photos(has_embedding);
        CREATE INDEX IF NOT EXISTS idx_photos_group          ON photos(group_id);
        CREATE INDEX IF NOT EXISTS idx_photos_embed_group    ON photos(has_embedding, group_id);
        CREATE INDEX IF NOT EXISTS idx_groups_created        ON groups(created_at);
        CREATE INDEX IF NOT EXISTS idx_groups_status         ON groups(review_status);
        CREATE INDEX IF NOT EXISTS idx_selected_at           ON selected_photos(selected_at);
        ",
    )?;
    Ok(())
}

/// v2: record counters in metadata, rebuilt from the live tables so a store
/// created before counters existed comes up consistent.
fn migrate_v2_counters(conn: &Connection) -> anyhow::Result<()> {
    for (key, table) in [
        ("photos:count", "photos"),
        ("embeddings:count", "embeddings"),
        ("groups:count", "groups"),
    ] {
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, count.to_string()],
        )?;
    }
    Ok(())
}

pub fn schema_version(conn: &Connection) -> anyhow::Result<u32> {
    let version: u32 = conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
        row.get(0)
    })?;
    Ok(version)
}

fn set_version(conn: &Connection, version: u32) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE schema_version SET version = ?1",
        rusqlite::params![version],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn in_memory() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_run_migrations_succeeds() {
        let conn = in_memory();
        assert!(run_migrations(&conn).is_ok());
    }

    #[test]
    fn test_schema_version_after_migration() {
        let conn = in_memory();
        run_migrations(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), EXPECTED_SCHEMA_VERSION);
    }

    #[test]
    fn test_all_tables_exist() {
        let conn = in_memory();
        run_migrations(&conn).unwrap();
        let tables = [
            "schema_version",
            "photos",
            "embeddings",
            "groups",
            "selected_photos",
            "metadata",
        ];
        for table in &tables {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    rusqlite::params![table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_run_migrations_is_idempotent() {
        let conn = in_memory();
        run_migrations(&conn).unwrap();
        assert!(run_migrations(&conn).is_ok());
        assert_eq!(schema_version(&conn).unwrap(), EXPECTED_SCHEMA_VERSION);
    }

    #[test]
    fn test_photos_column_set() {
        let conn = in_memory();
        run_migrations(&conn).unwrap();

        let mut stmt = conn.prepare("PRAGMA table_info(photos)").unwrap();
        let cols: Vec<String> = stmt
            .query_map([], |r| r.get(1))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for col in &[
            "id",
            "blob",
            "media_type",
            "date_taken",
            "timestamp",
            "has_embedding",
            "group_id",
            "ai_reason",
            "ai_confidence",
        ] {
            assert!(
                cols.contains(&col.to_string()),
                "photos must have column {}",
                col
            );
        }
    }

    #[test]
    fn test_secondary_indexes_exist() {
        let conn = in_memory();
        run_migrations(&conn).unwrap();
        let indexes = [
            "idx_photos_timestamp",
            "idx_photos_has_embedding",
            "idx_photos_group",
            "idx_photos_embed_group",
            "idx_groups_created",
            "idx_groups_status",
            "idx_selected_at",
        ];
        for idx in &indexes {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name=?1",
                    rusqlite::params![idx],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "Index {} should exist", idx);
        }
    }

    #[test]
    fn test_counters_rebuilt_from_existing_rows() {
        // A database stuck at v1 with data in it must come up with accurate
        // counters after the v2 migration runs.
        let conn = in_memory();
        conn.execute_batch(
            "CREATE TABLE schema_version (version INTEGER NOT NULL);
             INSERT INTO schema_version VALUES (0);",
        )
        .unwrap();
        migrate_v1_base_schema(&conn).unwrap();
        set_version(&conn, 1).unwrap();
        conn.execute(
            "INSERT INTO photos (id, blob, media_type, date_taken, timestamp)
             VALUES ('a', x'00', 'photo', '2024-01-01T00:00:00Z', 1000)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO photos (id, blob, media_type, date_taken, timestamp)
             VALUES ('b', x'00', 'photo', '2024-01-01T00:00:00Z', 2000)",
            [],
        )
        .unwrap();

        run_migrations(&conn).unwrap();

        let value: String = conn
            .query_row(
                "SELECT value FROM metadata WHERE key = 'photos:count'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, "2");
        assert_eq!(schema_version(&conn).unwrap(), 2);
    }
}
