//! v003 -- Outstanding invitation per membership.
//!
//! An admission that delivers an invitation stores a handle to it so the
//! invitation can be withdrawn when the pair is evicted or re-admitted.

use rusqlite::Connection;

const UP_SQL: &str = r#"
ALTER TABLE memberships ADD COLUMN invitation TEXT;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
