//! Append-only audit log and standing alerts.
//!
//! Audit rows are only ever inserted (and pruned past retention). Alerts are
//! raised at most once per (person, chat, kind) while open and resolved when
//! the pair later succeeds.

use chrono::{DateTime, Duration, Utc};
use rolesync_shared::{AlertKind, ChatId, PairKey, PersonId};
use rusqlite::params;
use rusqlite::types::Value;

use crate::database::{parse_enum, parse_opt_timestamp, parse_timestamp, Database};
use crate::error::{Result, StoreError};
use crate::models::{Alert, AuditQuery, AuditRecord, AuditStats, NewAuditRecord};

const ALERT_COLUMNS: &str = "id, person_id, chat_id, kind, message, raised_at, resolved_at";

impl Database {
    // ------------------------------------------------------------------
    // Audit log
    // ------------------------------------------------------------------

    pub fn append_audit(&self, record: &NewAuditRecord) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO audit_log (person_id, chat_id, operation, outcome, attempt, detail, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.person_id.map(|p| p.0),
                record.chat_id.map(|c| c.0),
                record.operation.as_str(),
                record.outcome.as_str(),
                record.attempt,
                record.detail,
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// List audit records matching `query`, newest first.
    pub fn list_audit(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let (filter, mut values) = audit_filter(query);
        let sql = format!(
            "SELECT id, person_id, chat_id, operation, outcome, attempt, detail, timestamp
             FROM audit_log {filter}
             ORDER BY timestamp DESC, id DESC
             LIMIT ? OFFSET ?"
        );
        values.push(Value::Integer(i64::from(query.limit.unwrap_or(100))));
        values.push(Value::Integer(i64::from(query.offset.unwrap_or(0))));

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), row_to_audit)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn count_audit(&self, query: &AuditQuery) -> Result<u64> {
        let (filter, values) = audit_filter(query);
        let n: i64 = self.conn().query_row(
            &format!("SELECT COUNT(*) FROM audit_log {filter}"),
            rusqlite::params_from_iter(values),
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn audit_stats(&self) -> Result<AuditStats> {
        let now = Utc::now();
        let since = |from: DateTime<Utc>| AuditQuery {
            since: Some(from),
            ..AuditQuery::default()
        };
        Ok(AuditStats {
            total: self.count_audit(&AuditQuery::default())?,
            last_24h: self.count_audit(&since(now - Duration::days(1)))?,
            last_7d: self.count_audit(&since(now - Duration::days(7)))?,
        })
    }

    /// Delete audit records older than `cutoff`. Returns how many were removed.
    pub fn prune_audit(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM audit_log WHERE timestamp < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(affected)
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    /// Raise an alert. Returns `false` if an identical alert is already open.
    pub fn raise_alert(&self, pair: PairKey, kind: AlertKind, message: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO alerts (person_id, chat_id, kind, message, raised_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pair.person.0,
                pair.chat.0,
                kind.as_str(),
                message,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(affected > 0)
    }

    /// Resolve every open alert for a pair. Returns how many were closed.
    pub fn resolve_alerts(&self, pair: PairKey) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE alerts SET resolved_at = ?1
             WHERE person_id = ?2 AND chat_id = ?3 AND resolved_at IS NULL",
            params![Utc::now().to_rfc3339(), pair.person.0, pair.chat.0],
        )?;
        Ok(affected)
    }

    pub fn open_alerts(&self) -> Result<Vec<Alert>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts WHERE resolved_at IS NULL ORDER BY raised_at DESC"
        ))?;
        let rows = stmt.query_map([], row_to_alert)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    pub fn open_alerts_for_person(&self, person: PersonId) -> Result<Vec<Alert>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM alerts
             WHERE person_id = ?1 AND resolved_at IS NULL ORDER BY chat_id ASC"
        ))?;
        let rows = stmt.query_map(params![person.0], row_to_alert)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

/// Build the `WHERE` clause and its positional values for an audit query.
fn audit_filter(query: &AuditQuery) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(person) = query.person_id {
        clauses.push("person_id = ?");
        values.push(Value::Integer(person.0));
    }
    if let Some(chat) = query.chat_id {
        clauses.push("chat_id = ?");
        values.push(Value::Integer(chat.0));
    }
    if let Some(op) = query.operation {
        clauses.push("operation = ?");
        values.push(Value::Text(op.as_str().to_string()));
    }
    if let Some(outcome) = query.outcome {
        clauses.push("outcome = ?");
        values.push(Value::Text(outcome.as_str().to_string()));
    }
    if let Some(since) = query.since {
        clauses.push("timestamp >= ?");
        values.push(Value::Text(since.to_rfc3339()));
    }

    if clauses.is_empty() {
        (String::new(), values)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), values)
    }
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let operation: String = row.get(3)?;
    let outcome: String = row.get(4)?;
    let ts: String = row.get(7)?;

    Ok(AuditRecord {
        id: row.get(0)?,
        person_id: row.get::<_, Option<i64>>(1)?.map(PersonId),
        chat_id: row.get::<_, Option<i64>>(2)?.map(ChatId),
        operation: parse_enum(3, &operation)?,
        outcome: parse_enum(4, &outcome)?,
        attempt: row.get(5)?,
        detail: row.get(6)?,
        timestamp: parse_timestamp(7, &ts)?,
    })
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alert> {
    let kind: String = row.get(3)?;
    let raised: String = row.get(5)?;
    let resolved: Option<String> = row.get(6)?;

    Ok(Alert {
        id: row.get(0)?,
        person_id: PersonId(row.get(1)?),
        chat_id: ChatId(row.get(2)?),
        kind: parse_enum(3, &kind)?,
        message: row.get(4)?,
        raised_at: parse_timestamp(5, &raised)?,
        resolved_at: parse_opt_timestamp(6, resolved)?,
    })
}
