//! CRUD operations for [`Chat`] records.

use chrono::{DateTime, Utc};
use rolesync_shared::{ChatId, ExternalChatId};
use rusqlite::{params, OptionalExtension};

use crate::database::{not_found, parse_opt_timestamp, parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::{Chat, NewChat};

pub(crate) const CHAT_COLUMNS: &str =
    "id, external_id, title, invite_link, agent_is_admin, rights_checked_at, created_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    pub fn create_chat(&self, chat: &NewChat) -> Result<Chat> {
        self.conn().execute(
            "INSERT INTO chats (external_id, title, invite_link, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                chat.external_id.0,
                chat.title,
                chat.invite_link,
                Utc::now().to_rfc3339(),
            ],
        )?;
        self.get_chat(ChatId(self.conn().last_insert_rowid()))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_chat(&self, id: ChatId) -> Result<Chat> {
        self.conn()
            .query_row(
                &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
                params![id.0],
                row_to_chat,
            )
            .map_err(not_found)
    }

    pub fn find_chat_by_external(&self, external_id: ExternalChatId) -> Result<Option<Chat>> {
        self.conn()
            .query_row(
                &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE external_id = ?1"),
                params![external_id.0],
                row_to_chat,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn list_chats(&self) -> Result<Vec<Chat>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {CHAT_COLUMNS} FROM chats ORDER BY id ASC"))?;
        let rows = stmt.query_map([], row_to_chat)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Record the outcome of an agent rights check.
    pub fn set_chat_agent_rights(
        &self,
        id: ChatId,
        is_admin: bool,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE chats SET agent_is_admin = ?1, rights_checked_at = ?2 WHERE id = ?3",
            params![is_admin, checked_at.to_rfc3339(), id.0],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

/// Map a `rusqlite::Row` to a [`Chat`].
pub(crate) fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let checked: Option<String> = row.get(5)?;
    let created: String = row.get(6)?;

    Ok(Chat {
        id: ChatId(row.get(0)?),
        external_id: ExternalChatId(row.get(1)?),
        title: row.get(2)?,
        invite_link: row.get(3)?,
        agent_is_admin: row.get(4)?,
        rights_checked_at: parse_opt_timestamp(5, checked)?,
        created_at: parse_timestamp(6, &created)?,
    })
}
