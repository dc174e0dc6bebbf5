//! Per-pair membership cache.
//!
//! Every write is a compare-and-set against the version the writer read. A
//! pair with no row reads as `Absent` at version 0, and the first write for
//! it is an insert that only succeeds if nobody else inserted first.

use chrono::Utc;
use rolesync_shared::{ChatId, MemberState, PairKey, PersonId};
use rusqlite::{params, OptionalExtension};

use crate::database::{parse_enum, parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::MembershipRecord;

const MEMBERSHIP_COLUMNS: &str =
    "person_id, chat_id, state, version, last_error, invitation, updated_at";

impl Database {
    /// Read the record for a pair, or an `Absent` placeholder at version 0.
    pub fn get_membership(&self, pair: PairKey) -> Result<MembershipRecord> {
        let record = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MEMBERSHIP_COLUMNS} FROM memberships
                     WHERE person_id = ?1 AND chat_id = ?2"
                ),
                params![pair.person.0, pair.chat.0],
                row_to_membership,
            )
            .optional()?;
        Ok(record.unwrap_or_else(|| MembershipRecord::absent(pair)))
    }

    pub fn memberships_for_person(&self, person: PersonId) -> Result<Vec<MembershipRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM memberships
             WHERE person_id = ?1 ORDER BY chat_id ASC"
        ))?;
        let rows = stmt.query_map(params![person.0], row_to_membership)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Write a new state for a pair if its stored version is still
    /// `expected_version`. The stored invitation is left as it is.
    pub fn write_membership(
        &self,
        pair: PairKey,
        expected_version: i64,
        state: MemberState,
        last_error: Option<&str>,
    ) -> Result<MembershipRecord> {
        self.put_membership(pair, expected_version, state, last_error, None)
    }

    /// Like [`Database::write_membership`], but also replaces the stored
    /// invitation (`None` clears it).
    pub fn write_membership_invitation(
        &self,
        pair: PairKey,
        expected_version: i64,
        state: MemberState,
        last_error: Option<&str>,
        invitation: Option<&str>,
    ) -> Result<MembershipRecord> {
        self.put_membership(pair, expected_version, state, last_error, Some(invitation))
    }

    fn put_membership(
        &self,
        pair: PairKey,
        expected_version: i64,
        state: MemberState,
        last_error: Option<&str>,
        invitation: Option<Option<&str>>,
    ) -> Result<MembershipRecord> {
        let now = Utc::now().to_rfc3339();
        let affected = if expected_version == 0 {
            self.conn().execute(
                "INSERT OR IGNORE INTO memberships
                     (person_id, chat_id, state, version, last_error, invitation, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)",
                params![
                    pair.person.0,
                    pair.chat.0,
                    state.as_str(),
                    last_error,
                    invitation.flatten(),
                    now,
                ],
            )?
        } else {
            self.conn().execute(
                "UPDATE memberships
                 SET state = ?1, version = version + 1, last_error = ?2, updated_at = ?3,
                     invitation = CASE WHEN ?4 THEN ?5 ELSE invitation END
                 WHERE person_id = ?6 AND chat_id = ?7 AND version = ?8",
                params![
                    state.as_str(),
                    last_error,
                    now,
                    invitation.is_some(),
                    invitation.flatten(),
                    pair.person.0,
                    pair.chat.0,
                    expected_version,
                ],
            )?
        };

        if affected == 0 {
            return Err(StoreError::StaleVersion {
                pair,
                expected: expected_version,
            });
        }
        self.get_membership(pair)
    }
}

fn row_to_membership(row: &rusqlite::Row<'_>) -> rusqlite::Result<MembershipRecord> {
    let state: String = row.get(2)?;
    let updated: String = row.get(6)?;

    Ok(MembershipRecord {
        person_id: PersonId(row.get(0)?),
        chat_id: ChatId(row.get(1)?),
        state: parse_enum(2, &state)?,
        version: row.get(3)?,
        last_error: row.get(4)?,
        invitation: row.get(5)?,
        updated_at: Some(parse_timestamp(6, &updated)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewChat, NewPerson};
    use rolesync_shared::{ExternalChatId, ExternalUserId};

    fn pair(db: &Database) -> PairKey {
        let person = db
            .create_person(&NewPerson {
                external_id: ExternalUserId(10),
                username: None,
                first_name: None,
                last_name: None,
                phone: None,
            })
            .unwrap();
        let chat = db
            .create_chat(&NewChat {
                external_id: ExternalChatId(-10),
                title: "t".into(),
                invite_link: None,
            })
            .unwrap();
        PairKey::new(person.id, chat.id)
    }

    #[test]
    fn unknown_pair_reads_absent_at_version_zero() {
        let db = Database::open_in_memory().unwrap();
        let pair = pair(&db);
        let record = db.get_membership(pair).unwrap();
        assert_eq!(record.state, MemberState::Absent);
        assert_eq!(record.version, 0);
    }

    #[test]
    fn versions_increase_on_every_write() {
        let db = Database::open_in_memory().unwrap();
        let pair = pair(&db);

        let r1 = db.write_membership(pair, 0, MemberState::Member, None).unwrap();
        assert_eq!(r1.version, 1);
        let r2 = db
            .write_membership(pair, r1.version, MemberState::PartiallyRemoved, Some("release failed"))
            .unwrap();
        assert_eq!(r2.version, 2);

        let stored = db.get_membership(pair).unwrap();
        assert_eq!(stored.state, MemberState::PartiallyRemoved);
        assert_eq!(stored.last_error.as_deref(), Some("release failed"));
        assert_eq!(stored.version, 2);
    }

    #[test]
    fn stale_writes_are_rejected() {
        let db = Database::open_in_memory().unwrap();
        let pair = pair(&db);

        db.write_membership(pair, 0, MemberState::Invited, None).unwrap();
        // A second writer that also read version 0.
        assert!(matches!(
            db.write_membership(pair, 0, MemberState::Member, None),
            Err(StoreError::StaleVersion { expected: 0, .. })
        ));
        assert!(matches!(
            db.write_membership(pair, 7, MemberState::Member, None),
            Err(StoreError::StaleVersion { expected: 7, .. })
        ));
        assert_eq!(db.get_membership(pair).unwrap().state, MemberState::Invited);
    }

    #[test]
    fn invitation_survives_plain_writes_until_replaced() {
        let db = Database::open_in_memory().unwrap();
        let pair = pair(&db);

        let r1 = db
            .write_membership_invitation(pair, 0, MemberState::Invited, None, Some("link-1"))
            .unwrap();
        assert_eq!(r1.invitation.as_deref(), Some("link-1"));

        let r2 = db
            .write_membership(pair, r1.version, MemberState::Invited, Some("timeout"))
            .unwrap();
        assert_eq!(r2.invitation.as_deref(), Some("link-1"));
        assert_eq!(r2.last_error.as_deref(), Some("timeout"));

        let r3 = db
            .write_membership_invitation(pair, r2.version, MemberState::Absent, None, None)
            .unwrap();
        assert_eq!(r3.invitation, None);
        assert_eq!(r3.version, 3);
        assert_eq!(db.get_membership(pair).unwrap(), r3);
    }

    #[test]
    fn pairs_with_unfinished_work_are_swept() {
        let db = Database::open_in_memory().unwrap();
        let pair = pair(&db);
        db.write_membership(pair, 0, MemberState::PartiallyRemoved, None)
            .unwrap();
        assert_eq!(db.persons_needing_sweep().unwrap(), vec![pair.person]);
    }
}
