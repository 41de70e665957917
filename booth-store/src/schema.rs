use rusqlite::{Connection, Result};

/// Initialize the key/value store schema
pub fn init_store_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS store_schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT version FROM store_schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        create_store_schema_v1(conn)?;
        conn.execute("INSERT INTO store_schema_version (version) VALUES (1)", [])?;
    }

    Ok(())
}

/// Schema version 1: one JSON document per key
fn create_store_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS update_kv_store_timestamp
         AFTER UPDATE OF value ON kv_store
         BEGIN
            UPDATE kv_store SET updated_at = CURRENT_TIMESTAMP WHERE key = NEW.key;
         END",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_store_schema(&conn).unwrap();
        init_store_schema(&conn).unwrap();

        let versions: i32 = conn
            .query_row("SELECT COUNT(*) FROM store_schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(versions, 1);

        conn.execute(
            "INSERT INTO kv_store (key, value) VALUES ('k', '1')",
            [],
        )
        .unwrap();
    }
}
