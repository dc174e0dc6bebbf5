//! CRUD operations for [`AccessRequest`] records.
//!
//! A decided request is never reopened; a new registration cycle is a new
//! row.

use chrono::Utc;
use rolesync_shared::{PersonId, RequestId, RequestState, RoleId};
use rusqlite::{params, OptionalExtension};

use crate::database::{not_found, parse_enum, parse_opt_timestamp, parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::AccessRequest;

const REQUEST_COLUMNS: &str = "id, person_id, state, role_id, created_at, decided_at";

impl Database {
    /// Open a new pending request for a person.
    pub fn create_request(&self, person: PersonId) -> Result<AccessRequest> {
        self.conn().execute(
            "INSERT INTO access_requests (person_id, state, created_at) VALUES (?1, ?2, ?3)",
            params![
                person.0,
                RequestState::Pending.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        self.get_request(RequestId(self.conn().last_insert_rowid()))
    }

    pub fn get_request(&self, id: RequestId) -> Result<AccessRequest> {
        self.conn()
            .query_row(
                &format!("SELECT {REQUEST_COLUMNS} FROM access_requests WHERE id = ?1"),
                params![id.0],
                row_to_request,
            )
            .map_err(not_found)
    }

    pub fn open_request_for_person(&self, person: PersonId) -> Result<Option<AccessRequest>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {REQUEST_COLUMNS} FROM access_requests
                     WHERE person_id = ?1 AND state = 'pending'"
                ),
                params![person.0],
                row_to_request,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn list_requests_for_person(&self, person: PersonId) -> Result<Vec<AccessRequest>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM access_requests
             WHERE person_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![person.0], row_to_request)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Close a pending request. Returns `false` if it was already decided.
    pub fn decide_request(
        &self,
        id: RequestId,
        state: RequestState,
        role: Option<RoleId>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE access_requests SET state = ?1, role_id = ?2, decided_at = ?3
             WHERE id = ?4 AND state = 'pending'",
            params![
                state.as_str(),
                role.map(|r| r.0),
                Utc::now().to_rfc3339(),
                id.0
            ],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccessRequest> {
    let state: String = row.get(2)?;
    let created: String = row.get(4)?;
    let decided: Option<String> = row.get(5)?;

    Ok(AccessRequest {
        id: RequestId(row.get(0)?),
        person_id: PersonId(row.get(1)?),
        state: parse_enum(2, &state)?,
        role_id: row.get::<_, Option<i64>>(3)?.map(RoleId),
        created_at: parse_timestamp(4, &created)?,
        decided_at: parse_opt_timestamp(5, decided)?,
    })
}
