use rusqlite::Connection;
use warden_core::{Result, WardenError};

/// Opens (creating parent directories and the schema if needed) the reply
/// archive database at `path`, with WAL journaling and NORMAL durability —
/// the standard tradeoff for a single-writer, append-heavy table.
pub fn open(path: &str) -> Result<Connection> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent).map_err(WardenError::Io)?;
    }
    let conn = Connection::open(path).map_err(|e| WardenError::Database(e.to_string()))?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;

        CREATE TABLE IF NOT EXISTS inbound_messages (
            channel     TEXT NOT NULL,
            chat_id     TEXT NOT NULL,
            message_id  TEXT NOT NULL,
            participant TEXT,
            sender_id   TEXT,
            content     TEXT NOT NULL,
            is_group    INTEGER NOT NULL DEFAULT 0,
            timestamp   TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (channel, chat_id, message_id)
        );

        CREATE INDEX IF NOT EXISTS idx_inbound_messages_chat_created
        ON inbound_messages (channel, chat_id, created_at);
        ",
    )
    .map_err(|e| WardenError::Database(e.to_string()))?;
    Ok(())
}
