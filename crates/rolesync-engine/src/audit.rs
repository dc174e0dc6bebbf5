//! Audit recorder: every attempt goes to the `audit_log` table and to the
//! `tracing` output.

use std::sync::Arc;

use chrono::Utc;
use rolesync_shared::{AlertKind, AuditOperation, AuditOutcome, ChatId, PairKey, PersonId};
use rolesync_store::{Database, NewAuditRecord};
use tokio::sync::Mutex;

/// One entry to record. Lifecycle triggers carry no chat.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub person: Option<PersonId>,
    pub chat: Option<ChatId>,
    pub operation: AuditOperation,
    pub outcome: AuditOutcome,
    pub attempt: u32,
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn pair(pair: PairKey, operation: AuditOperation, outcome: AuditOutcome) -> Self {
        Self {
            person: Some(pair.person),
            chat: Some(pair.chat),
            operation,
            outcome,
            attempt: 0,
            detail: None,
        }
    }

    pub fn person(person: PersonId, operation: AuditOperation, outcome: AuditOutcome) -> Self {
        Self {
            person: Some(person),
            chat: None,
            operation,
            outcome,
            attempt: 0,
            detail: None,
        }
    }

    pub fn chat(chat: ChatId, operation: AuditOperation, outcome: AuditOutcome) -> Self {
        Self {
            person: None,
            chat: Some(chat),
            operation,
            outcome,
            attempt: 0,
            detail: None,
        }
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Clone)]
pub struct AuditRecorder {
    db: Arc<Mutex<Database>>,
}

impl AuditRecorder {
    pub fn new(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    /// Append an entry. A failing audit sink is logged, never propagated.
    pub async fn record(&self, entry: AuditEntry) {
        let person = entry.person.map(|p| p.0);
        let chat = entry.chat.map(|c| c.0);
        let detail = entry.detail.as_deref().unwrap_or("");
        match entry.outcome {
            AuditOutcome::Success | AuditOutcome::Noop | AuditOutcome::Invited => {
                tracing::info!(
                    person,
                    chat,
                    operation = entry.operation.as_str(),
                    outcome = entry.outcome.as_str(),
                    attempt = entry.attempt,
                    detail,
                    "audit"
                );
            }
            _ => {
                tracing::warn!(
                    person,
                    chat,
                    operation = entry.operation.as_str(),
                    outcome = entry.outcome.as_str(),
                    attempt = entry.attempt,
                    detail,
                    "audit"
                );
            }
        }

        let record = NewAuditRecord {
            person_id: entry.person,
            chat_id: entry.chat,
            operation: entry.operation,
            outcome: entry.outcome,
            attempt: entry.attempt,
            detail: entry.detail,
            timestamp: Utc::now(),
        };
        let db = self.db.lock().await;
        if let Err(e) = db.append_audit(&record) {
            tracing::error!(error = %e, "failed to append audit record");
        }
    }

    /// Raise a standing alert for a pair. Duplicate open alerts collapse.
    pub async fn alert(&self, pair: PairKey, kind: AlertKind, message: &str) {
        let raised = {
            let db = self.db.lock().await;
            db.raise_alert(pair, kind, message)
        };
        match raised {
            Ok(true) => tracing::error!(
                person = %pair.person,
                chat = %pair.chat,
                kind = kind.as_str(),
                message,
                "alert raised"
            ),
            Ok(false) => {}
            Err(e) => tracing::error!(
                person = %pair.person,
                chat = %pair.chat,
                kind = kind.as_str(),
                error = %e,
                "failed to raise alert"
            ),
        }
    }

    /// Close every open alert for a pair.
    pub async fn resolve(&self, pair: PairKey) {
        let resolved = {
            let db = self.db.lock().await;
            db.resolve_alerts(pair)
        };
        match resolved {
            Ok(0) => {}
            Ok(n) => tracing::info!(person = %pair.person, chat = %pair.chat, n, "alerts resolved"),
            Err(e) => tracing::error!(error = %e, "failed to resolve alerts"),
        }
    }
}
