use std::time::Duration;

use rusqlite::Connection;

/// How long a writer waits on another process holding the registry lock.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry connections: WAL so pollers never block the worker, and
/// enforced foreign keys so sink outcomes follow their task.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA foreign_keys = ON;\n",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_keys_are_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("ers.db")).unwrap();
        configure_connection(&conn).unwrap();
        let enabled: i64 = conn
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }
}
