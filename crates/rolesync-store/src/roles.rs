//! CRUD operations for [`Role`] records and the role/chat entitlement edges.

use chrono::Utc;
use rolesync_shared::{ChatId, RoleId};
use rusqlite::{params, OptionalExtension};

use crate::chats::{row_to_chat, CHAT_COLUMNS};
use crate::database::{not_found, parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::{Chat, Role};

impl Database {
    // ------------------------------------------------------------------
    // Roles
    // ------------------------------------------------------------------

    pub fn create_role(&self, name: &str, description: Option<&str>) -> Result<Role> {
        self.conn().execute(
            "INSERT INTO roles (name, description, created_at) VALUES (?1, ?2, ?3)",
            params![name, description, Utc::now().to_rfc3339()],
        )?;
        self.get_role(RoleId(self.conn().last_insert_rowid()))
    }

    pub fn get_role(&self, id: RoleId) -> Result<Role> {
        self.conn()
            .query_row(
                "SELECT id, name, description, created_at FROM roles WHERE id = ?1",
                params![id.0],
                row_to_role,
            )
            .map_err(not_found)
    }

    pub fn role_exists(&self, id: RoleId) -> Result<bool> {
        let n: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM roles WHERE id = ?1",
            params![id.0],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    pub fn find_role_by_name(&self, name: &str) -> Result<Option<Role>> {
        self.conn()
            .query_row(
                "SELECT id, name, description, created_at FROM roles WHERE name = ?1",
                params![name],
                row_to_role,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    pub fn list_roles(&self) -> Result<Vec<Role>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, name, description, created_at FROM roles ORDER BY name ASC")?;
        let rows = stmt.query_map([], row_to_role)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    // ON DELETE CASCADE: role_chats edges go with it. Persons keep the
    // dangling role id.
    pub fn delete_role(&self, id: RoleId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM roles WHERE id = ?1", params![id.0])?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Role <-> Chat edges
    // ------------------------------------------------------------------

    /// Replace the whole chat set of a role in one transaction.
    pub fn set_role_chats(&self, role: RoleId, chats: &[ChatId]) -> Result<()> {
        if !self.role_exists(role)? {
            return Err(StoreError::NotFound);
        }

        let tx = self.conn().unchecked_transaction()?;
        tx.execute("DELETE FROM role_chats WHERE role_id = ?1", params![role.0])?;
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO role_chats (role_id, chat_id) VALUES (?1, ?2)")?;
            for chat in chats {
                stmt.execute(params![role.0, chat.0])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Chats a role entitles its holders to, ordered by chat id.
    pub fn chats_for_role(&self, role: RoleId) -> Result<Vec<Chat>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats
             WHERE id IN (SELECT chat_id FROM role_chats WHERE role_id = ?1)
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![role.0], row_to_chat)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

fn row_to_role(row: &rusqlite::Row<'_>) -> rusqlite::Result<Role> {
    let created: String = row.get(3)?;
    Ok(Role {
        id: RoleId(row.get(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: parse_timestamp(3, &created)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewChat;
    use rolesync_shared::ExternalChatId;

    fn chat(db: &Database, external: i64) -> ChatId {
        db.create_chat(&NewChat {
            external_id: ExternalChatId(external),
            title: format!("chat {external}"),
            invite_link: None,
        })
        .unwrap()
        .id
    }

    #[test]
    fn set_role_chats_replaces_edges() {
        let db = Database::open_in_memory().unwrap();
        let role = db.create_role("sales", Some("sales team")).unwrap();
        let (a, b, c) = (chat(&db, -1), chat(&db, -2), chat(&db, -3));

        db.set_role_chats(role.id, &[a, b, b]).unwrap();
        db.set_role_chats(role.id, &[b, c]).unwrap();

        let ids: Vec<ChatId> = db
            .chats_for_role(role.id)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec![b, c]);
    }

    #[test]
    fn roles_are_found_by_name() {
        let db = Database::open_in_memory().unwrap();
        let role = db.create_role("support", None).unwrap();
        assert_eq!(db.find_role_by_name("support").unwrap(), Some(role));
        assert_eq!(db.find_role_by_name("sales").unwrap(), None);
        assert_eq!(db.list_roles().unwrap().len(), 1);
    }

    #[test]
    fn set_role_chats_on_missing_role_fails() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.set_role_chats(RoleId(5), &[]),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn deleting_role_drops_edges() {
        let db = Database::open_in_memory().unwrap();
        let role = db.create_role("ops", None).unwrap();
        let a = chat(&db, -1);
        db.set_role_chats(role.id, &[a]).unwrap();

        assert!(db.delete_role(role.id).unwrap());
        assert!(!db.role_exists(role.id).unwrap());
        assert!(db.chats_for_role(role.id).unwrap().is_empty());
    }
}
