use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id INTEGER,
    chat_id   INTEGER,
    operation TEXT NOT NULL,
    outcome   TEXT NOT NULL,
    attempt   INTEGER NOT NULL DEFAULT 0,
    detail    TEXT,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_log_timestamp ON audit_log(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_audit_log_person ON audit_log(person_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS alerts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id   INTEGER NOT NULL,
    chat_id     INTEGER NOT NULL,
    kind        TEXT NOT NULL,
    message     TEXT NOT NULL,
    raised_at   TEXT NOT NULL,
    resolved_at TEXT
);

-- One standing alert per (person, chat, kind).
CREATE UNIQUE INDEX IF NOT EXISTS idx_alerts_open
    ON alerts(person_id, chat_id, kind) WHERE resolved_at IS NULL;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
