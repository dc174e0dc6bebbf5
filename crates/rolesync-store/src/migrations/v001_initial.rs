//! v001 -- Initial schema creation.
//!
//! Creates the entitlement tables (`roles`, `chats`, `role_chats`), the
//! person workflow tables (`persons`, `access_requests`) and the per-pair
//! `memberships` cache.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Roles
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS roles (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    description TEXT,
    created_at  TEXT NOT NULL                 -- RFC-3339
);

-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id       INTEGER NOT NULL UNIQUE,   -- platform chat id
    title             TEXT NOT NULL,
    invite_link       TEXT,
    agent_is_admin    INTEGER NOT NULL DEFAULT 0, -- boolean 0/1, cached
    rights_checked_at TEXT,
    created_at        TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Role <-> Chat entitlement edges
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS role_chats (
    role_id INTEGER NOT NULL,
    chat_id INTEGER NOT NULL,

    PRIMARY KEY (role_id, chat_id),
    FOREIGN KEY (role_id) REFERENCES roles(id) ON DELETE CASCADE,
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_role_chats_chat_id ON role_chats(chat_id);

-- ----------------------------------------------------------------
-- Persons (never hard-deleted)
-- ----------------------------------------------------------------
-- role_id carries no foreign key: a concurrently deleted role must stay
-- visible as a dangling reference so the resolver can report it.
CREATE TABLE IF NOT EXISTS persons (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id           INTEGER NOT NULL UNIQUE,  -- platform user id
    username              TEXT,
    first_name            TEXT,
    last_name             TEXT,
    phone                 TEXT,
    lifecycle             TEXT NOT NULL,
    role_id               INTEGER,
    role_version          INTEGER NOT NULL DEFAULT 0,
    termination_requested INTEGER NOT NULL DEFAULT 0,
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_persons_lifecycle ON persons(lifecycle);

-- ----------------------------------------------------------------
-- Access requests
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS access_requests (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id  INTEGER NOT NULL,
    state      TEXT NOT NULL,
    role_id    INTEGER,                       -- role granted at decision time
    created_at TEXT NOT NULL,
    decided_at TEXT,

    FOREIGN KEY (person_id) REFERENCES persons(id)
);

-- At most one open request per person.
CREATE UNIQUE INDEX IF NOT EXISTS idx_access_requests_open
    ON access_requests(person_id) WHERE state = 'pending';

-- ----------------------------------------------------------------
-- Membership cache, one row per (person, chat)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS memberships (
    person_id  INTEGER NOT NULL,
    chat_id    INTEGER NOT NULL,
    state      TEXT NOT NULL,
    version    INTEGER NOT NULL,              -- bumped on every write
    last_error TEXT,
    updated_at TEXT NOT NULL,

    PRIMARY KEY (person_id, chat_id),
    FOREIGN KEY (person_id) REFERENCES persons(id),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_memberships_state ON memberships(state);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
