//! CRUD operations for [`Person`] records.
//!
//! Persons are never deleted. Lifecycle writes are conditional on the state
//! the caller read, so two triggers racing on the same person cannot both
//! apply a transition.

use chrono::Utc;
use rolesync_shared::{ExternalUserId, LifecycleState, PersonId, RoleId};
use rusqlite::{params, OptionalExtension};

use crate::database::{not_found, parse_enum, parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::{NewPerson, Person, Statistics};

const PERSON_COLUMNS: &str = "id, external_id, username, first_name, last_name, phone,
     lifecycle, role_id, role_version, termination_requested, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new person in the `Pending` state.
    pub fn create_person(&self, new: &NewPerson) -> Result<Person> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO persons (external_id, username, first_name, last_name, phone,
                                  lifecycle, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                new.external_id.0,
                new.username,
                new.first_name,
                new.last_name,
                new.phone,
                LifecycleState::Pending.as_str(),
                now,
            ],
        )?;
        self.get_person(PersonId(self.conn().last_insert_rowid()))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_person(&self, id: PersonId) -> Result<Person> {
        self.conn()
            .query_row(
                &format!("SELECT {PERSON_COLUMNS} FROM persons WHERE id = ?1"),
                params![id.0],
                row_to_person,
            )
            .map_err(not_found)
    }

    pub fn find_person_by_external(&self, external_id: ExternalUserId) -> Result<Option<Person>> {
        self.conn()
            .query_row(
                &format!("SELECT {PERSON_COLUMNS} FROM persons WHERE external_id = ?1"),
                params![external_id.0],
                row_to_person,
            )
            .optional()
            .map_err(StoreError::Sqlite)
    }

    /// Persons whose entitlement follows `role`: approved or active and not
    /// on their way out.
    pub fn persons_with_role(&self, role: RoleId) -> Result<Vec<PersonId>> {
        let mut stmt = self.conn().prepare(
            "SELECT id FROM persons
             WHERE role_id = ?1
               AND lifecycle IN ('approved', 'active')
               AND termination_requested = 0
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![role.0], |row| row.get::<_, i64>(0).map(PersonId))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Persons the background sweeper should run a pass for: stuck in
    /// `Approved`, waiting on termination, holding a pair whose eviction
    /// never released, holding an invitation not yet accepted, or holding a
    /// pair whose last operation failed.
    pub fn persons_needing_sweep(&self) -> Result<Vec<PersonId>> {
        let mut stmt = self.conn().prepare(
            "SELECT id FROM persons
             WHERE (lifecycle = 'approved' OR termination_requested = 1)
               AND lifecycle NOT IN ('rejected', 'terminated')
             UNION
             SELECT DISTINCT person_id FROM memberships
             WHERE state IN ('partially_removed', 'invited') OR last_error IS NOT NULL
             ORDER BY 1 ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0).map(PersonId))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Move a person from `from` to `to`. Returns `false` when the stored
    /// state was no longer `from`.
    pub fn update_person_lifecycle(
        &self,
        id: PersonId,
        from: LifecycleState,
        to: LifecycleState,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE persons SET lifecycle = ?1, updated_at = ?2
             WHERE id = ?3 AND lifecycle = ?4",
            params![to.as_str(), Utc::now().to_rfc3339(), id.0, from.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// Assign a role and bump `role_version`. Returns the new version.
    pub fn assign_person_role(&self, id: PersonId, role: RoleId) -> Result<i64> {
        let affected = self.conn().execute(
            "UPDATE persons SET role_id = ?1, role_version = role_version + 1, updated_at = ?2
             WHERE id = ?3",
            params![role.0, Utc::now().to_rfc3339(), id.0],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(self.get_person(id)?.role_version)
    }

    pub fn request_person_termination(&self, id: PersonId) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE persons SET termination_requested = 1, updated_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.0],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn statistics(&self) -> Result<Statistics> {
        let mut stats = Statistics::default();

        let mut stmt = self
            .conn()
            .prepare("SELECT lifecycle, COUNT(*) FROM persons GROUP BY lifecycle")?;
        let rows = stmt.query_map([], |row| {
            let state: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((parse_enum::<LifecycleState>(0, &state)?, count as u64))
        })?;
        for row in rows {
            let (state, count) = row?;
            stats.total_persons += count;
            match state {
                LifecycleState::Pending => stats.pending = count,
                LifecycleState::Approved => stats.approved = count,
                LifecycleState::Rejected => stats.rejected = count,
                LifecycleState::Active => stats.active = count,
                LifecycleState::Terminated => stats.terminated = count,
            }
        }

        stats.total_roles = self.count("SELECT COUNT(*) FROM roles")?;
        stats.total_chats = self.count("SELECT COUNT(*) FROM chats")?;
        stats.open_alerts = self.count("SELECT COUNT(*) FROM alerts WHERE resolved_at IS NULL")?;
        Ok(stats)
    }

    fn count(&self, sql: &str) -> Result<u64> {
        let n: i64 = self.conn().query_row(sql, [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

fn row_to_person(row: &rusqlite::Row<'_>) -> rusqlite::Result<Person> {
    let lifecycle: String = row.get(6)?;
    let created: String = row.get(10)?;
    let updated: String = row.get(11)?;

    Ok(Person {
        id: PersonId(row.get(0)?),
        external_id: ExternalUserId(row.get(1)?),
        username: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        phone: row.get(5)?,
        lifecycle: parse_enum(6, &lifecycle)?,
        role_id: row.get::<_, Option<i64>>(7)?.map(RoleId),
        role_version: row.get(8)?,
        termination_requested: row.get(9)?,
        created_at: parse_timestamp(10, &created)?,
        updated_at: parse_timestamp(11, &updated)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_person(external: i64) -> NewPerson {
        NewPerson {
            external_id: ExternalUserId(external),
            username: Some(format!("user{external}")),
            first_name: None,
            last_name: None,
            phone: None,
        }
    }

    #[test]
    fn created_person_is_pending_without_role() {
        let db = Database::open_in_memory().unwrap();
        let person = db.create_person(&new_person(42)).unwrap();
        assert_eq!(person.lifecycle, LifecycleState::Pending);
        assert_eq!(person.role_id, None);
        assert_eq!(person.role_version, 0);
        assert!(!person.termination_requested);

        let found = db.find_person_by_external(ExternalUserId(42)).unwrap();
        assert_eq!(found, Some(person));
        assert_eq!(db.find_person_by_external(ExternalUserId(7)).unwrap(), None);
    }

    #[test]
    fn lifecycle_update_is_conditional() {
        let db = Database::open_in_memory().unwrap();
        let person = db.create_person(&new_person(1)).unwrap();

        assert!(db
            .update_person_lifecycle(person.id, LifecycleState::Pending, LifecycleState::Approved)
            .unwrap());
        // Second writer still believes the person is pending.
        assert!(!db
            .update_person_lifecycle(person.id, LifecycleState::Pending, LifecycleState::Rejected)
            .unwrap());
        assert_eq!(
            db.get_person(person.id).unwrap().lifecycle,
            LifecycleState::Approved
        );
    }

    #[test]
    fn role_assignment_bumps_version() {
        let db = Database::open_in_memory().unwrap();
        let person = db.create_person(&new_person(1)).unwrap();
        assert_eq!(db.assign_person_role(person.id, RoleId(3)).unwrap(), 1);
        assert_eq!(db.assign_person_role(person.id, RoleId(4)).unwrap(), 2);
        assert_eq!(db.get_person(person.id).unwrap().role_id, Some(RoleId(4)));
    }

    #[test]
    fn missing_person_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_person(PersonId(99)),
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            db.request_person_termination(PersonId(99)),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn sweep_selects_approved_and_terminating() {
        let db = Database::open_in_memory().unwrap();
        let pending = db.create_person(&new_person(1)).unwrap();
        let approved = db.create_person(&new_person(2)).unwrap();
        let leaving = db.create_person(&new_person(3)).unwrap();

        db.update_person_lifecycle(approved.id, LifecycleState::Pending, LifecycleState::Approved)
            .unwrap();
        db.update_person_lifecycle(leaving.id, LifecycleState::Pending, LifecycleState::Approved)
            .unwrap();
        db.update_person_lifecycle(leaving.id, LifecycleState::Approved, LifecycleState::Active)
            .unwrap();
        db.request_person_termination(leaving.id).unwrap();

        let ids = db.persons_needing_sweep().unwrap();
        assert_eq!(ids, vec![approved.id, leaving.id]);
        assert!(!ids.contains(&pending.id));
    }

    #[test]
    fn role_holders_exclude_pending_and_leaving() {
        let db = Database::open_in_memory().unwrap();
        let pending = db.create_person(&new_person(1)).unwrap();
        let active = db.create_person(&new_person(2)).unwrap();
        let leaving = db.create_person(&new_person(3)).unwrap();
        for p in [&pending, &active, &leaving] {
            db.assign_person_role(p.id, RoleId(7)).unwrap();
        }
        for p in [&active, &leaving] {
            db.update_person_lifecycle(p.id, LifecycleState::Pending, LifecycleState::Approved)
                .unwrap();
        }
        db.request_person_termination(leaving.id).unwrap();

        assert_eq!(db.persons_with_role(RoleId(7)).unwrap(), vec![active.id]);
        assert!(db.persons_with_role(RoleId(8)).unwrap().is_empty());
    }

    #[test]
    fn statistics_count_by_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        db.create_person(&new_person(1)).unwrap();
        let p = db.create_person(&new_person(2)).unwrap();
        db.update_person_lifecycle(p.id, LifecycleState::Pending, LifecycleState::Rejected)
            .unwrap();

        let stats = db.statistics().unwrap();
        assert_eq!(stats.total_persons, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.open_alerts, 0);
    }
}
