//! The synchronization engine: lifecycle triggers in, reconciliation passes
//! out.
//!
//! A pass for one person reads the person's role once, observes the pairs
//! that need it, then diffs and executes. Pairs run concurrently, each on
//! its own task; the operations of one pair run in order. A pass makes at
//! most [`MAX_ROUNDS`] diff rounds: a second round only happens when an
//! operation found the cache out of date and corrected it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use rolesync_shared::{
    AuditOperation, AuditOutcome, ChatId, Decision, FailureClass, MemberState, PairKey, PersonId,
    RequestId, RoleId,
};
use rolesync_store::{Chat, Database, NewChat, NewPerson, Person, Role, StoreError};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::api::ChatApi;
use crate::audit::{AuditEntry, AuditRecorder};
use crate::config::EngineConfig;
use crate::coordinator::PassCoordinator;
use crate::entitlement::entitled_chats;
use crate::error::{EngineError, LifecycleError, Result};
use crate::gate::RateGate;
use crate::lease::LeaseTable;
use crate::lifecycle::{self, Registration};
use crate::operator::MembershipOperator;
use crate::reconciler::{self, diff, observed_states, Operation};
use crate::report::{
    ChatRights, OpReport, PassReport, PassTally, RoleUpdate, SweepReport, TriggerReport,
};
use crate::status::{person_status, PersonStatus};

/// Diff rounds per pass.
pub const MAX_ROUNDS: u32 = 2;

#[derive(Clone)]
pub struct SyncEngine {
    db: Arc<Mutex<Database>>,
    operator: MembershipOperator,
    recorder: AuditRecorder,
    passes: PassCoordinator,
    config: EngineConfig,
}

impl SyncEngine {
    pub fn new(db: Arc<Mutex<Database>>, api: Arc<dyn ChatApi>, config: EngineConfig) -> Self {
        let recorder = AuditRecorder::new(db.clone());
        let gate = RateGate::new(
            config.max_concurrent_ops,
            config.api_rate_per_sec,
            config.api_burst,
        );
        let operator = MembershipOperator::new(
            db.clone(),
            api,
            gate,
            LeaseTable::new(),
            recorder.clone(),
            config.retry,
            config.call_timeout,
        );
        Self {
            db,
            operator,
            recorder,
            passes: PassCoordinator::new(),
            config,
        }
    }

    pub fn database(&self) -> &Arc<Mutex<Database>> {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn operator(&self) -> &MembershipOperator {
        &self.operator
    }

    // ------------------------------------------------------------------
    // Lifecycle triggers
    // ------------------------------------------------------------------

    /// Record a registration request. No pass runs for a pending person.
    pub async fn register(&self, new: NewPerson) -> Result<Registration> {
        let result = {
            let db = self.db.lock().await;
            lifecycle::register(&db, &new)
        };
        match result {
            Ok(registration) => {
                let (outcome, detail) = if registration.created {
                    (AuditOutcome::Success, "request opened")
                } else {
                    (AuditOutcome::Noop, "open request returned")
                };
                self.recorder
                    .record(
                        AuditEntry::person(registration.person.id, AuditOperation::Register, outcome)
                            .detail(format!("{detail}: {}", registration.request.id)),
                    )
                    .await;
                Ok(registration)
            }
            Err(e) => {
                self.trigger_failed(AuditOperation::Register, None, &e).await;
                Err(e.into())
            }
        }
    }

    /// Approve or reject a pending request. Approval runs the first pass.
    pub async fn decide_request(
        &self,
        request: RequestId,
        decision: Decision,
        role: Option<RoleId>,
    ) -> Result<TriggerReport> {
        let result = {
            let db = self.db.lock().await;
            lifecycle::decide(&db, request, decision, role)
        };
        let person = match result {
            Ok(person) => person,
            Err(e) => {
                self.trigger_failed(AuditOperation::Decide, None, &e).await;
                return Err(e.into());
            }
        };

        let detail = match role {
            Some(role) => format!("request {request} {decision:?} with role {role}"),
            None => format!("request {request} {decision:?}"),
        };
        self.recorder
            .record(
                AuditEntry::person(person.id, AuditOperation::Decide, AuditOutcome::Success)
                    .detail(detail),
            )
            .await;

        self.after_trigger(person, decision == Decision::Approved)
            .await
    }

    pub async fn reassign_role(&self, person: PersonId, role: RoleId) -> Result<TriggerReport> {
        let result = {
            let db = self.db.lock().await;
            lifecycle::reassign(&db, person, role)
        };
        let updated = match result {
            Ok(updated) => updated,
            Err(e) => {
                self.trigger_failed(AuditOperation::Reassign, Some(person), &e)
                    .await;
                return Err(e.into());
            }
        };
        self.recorder
            .record(
                AuditEntry::person(person, AuditOperation::Reassign, AuditOutcome::Success)
                    .detail(format!("role {role}, version {}", updated.role_version)),
            )
            .await;

        self.after_trigger(updated, true).await
    }

    /// Mark the person for termination and evict them everywhere. The
    /// lifecycle reaches `Terminated` once no pair is held.
    pub async fn terminate(&self, person: PersonId) -> Result<TriggerReport> {
        let result = {
            let db = self.db.lock().await;
            lifecycle::request_termination(&db, person)
        };
        let updated = match result {
            Ok(updated) => updated,
            Err(e) => {
                self.trigger_failed(AuditOperation::Terminate, Some(person), &e)
                    .await;
                return Err(e.into());
            }
        };
        self.recorder
            .record(AuditEntry::person(
                person,
                AuditOperation::Terminate,
                AuditOutcome::Success,
            ))
            .await;

        self.after_trigger(updated, true).await
    }

    async fn after_trigger(&self, person: Person, run_pass: bool) -> Result<TriggerReport> {
        let (pass, pass_error) = if run_pass {
            match self.reconcile_person(person.id, false).await {
                Ok(report) => (Some(report), None),
                Err(e) => {
                    tracing::warn!(person = %person.id, error = %e, "pass after trigger failed");
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        let running = self.passes.is_running(person.id);
        let (person, status) = {
            let db = self.db.lock().await;
            let person = db.get_person(person.id)?;
            let status = person_status(&db, person.id, running)?;
            (person, status)
        };
        Ok(TriggerReport {
            person,
            pass,
            pass_error,
            status,
        })
    }

    async fn trigger_failed(
        &self,
        operation: AuditOperation,
        person: Option<PersonId>,
        error: &LifecycleError,
    ) {
        self.recorder
            .record(AuditEntry {
                person,
                chat: None,
                operation,
                outcome: AuditOutcome::Failed,
                attempt: 0,
                detail: Some(error.to_string()),
            })
            .await;
    }

    // ------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------

    /// Run a pass for `person`, or wait for the next one if a pass is
    /// already running. With `verify` every known or entitled pair is
    /// checked against the platform first.
    pub async fn reconcile_person(&self, person: PersonId, verify: bool) -> Result<PassReport> {
        {
            let db = self.db.lock().await;
            db.get_person(person).map_err(|e| person_error(person, e))?;
        }

        let ticket = self.passes.join(person, verify);
        if let Some(generation) = ticket.lead {
            tokio::spawn(self.clone().drive(person, generation, verify));
        }
        ticket.wait().await.map_err(EngineError::PassFailed)
    }

    /// Run passes for `person` until no trigger is queued behind them.
    async fn drive(self, person: PersonId, mut generation: u64, mut verify: bool) {
        loop {
            let engine = self.clone();
            let outcome = match tokio::spawn(async move { engine.run_pass(person, verify).await })
                .await
            {
                Ok(Ok(report)) => Ok(report),
                Ok(Err(e)) => {
                    tracing::warn!(person = %person, generation, error = %e, "pass failed");
                    Err(e.to_string())
                }
                Err(e) => {
                    tracing::error!(person = %person, generation, error = %e, "pass task aborted");
                    Err(format!("pass task aborted: {e}"))
                }
            };

            match self.passes.finish(person, generation, outcome) {
                Some((next, next_verify)) => {
                    tracing::debug!(person = %person, generation = next, "running queued pass");
                    generation = next;
                    verify = next_verify;
                }
                None => break,
            }
        }
    }

    async fn run_pass(&self, person: PersonId, verify: bool) -> Result<PassReport> {
        let pass_id = Uuid::new_v4();
        let started_at = Utc::now();

        // The role is read once. A change after this point queues a new pass.
        let (snapshot, entitled, to_observe) = {
            let db = self.db.lock().await;
            let snapshot = db.get_person(person)?;
            let entitled = entitled_chats(&db, &snapshot)?;
            let mut to_observe: BTreeSet<ChatId> = db
                .memberships_for_person(person)?
                .into_iter()
                .filter(|record| verify || record.state == MemberState::Invited)
                .map(|record| record.chat_id)
                .collect();
            if verify {
                to_observe.extend(entitled.iter().copied());
            }
            (snapshot, entitled, to_observe)
        };
        tracing::info!(
            pass = %pass_id,
            person = %person,
            role_version = snapshot.role_version,
            entitled = entitled.len(),
            verify,
            "pass started"
        );

        let observed = self.observe_all(person, &to_observe).await;

        let mut operations = Vec::new();
        let mut rounds = 0;
        while rounds < MAX_ROUNDS {
            let ops = {
                let db = self.db.lock().await;
                diff(&entitled, &observed_states(&db, person)?).operations(person)
            };
            if ops.is_empty() {
                break;
            }
            rounds += 1;

            let reports = self.execute_all(ops).await;
            let stale = reports
                .iter()
                .any(|r| !r.skipped && r.class == Some(FailureClass::Inconsistent));
            operations.extend(reports);
            if !stale {
                break;
            }
        }

        let lifecycle = {
            let db = self.db.lock().await;
            lifecycle::settle(&db, person)?;
            db.get_person(person)?.lifecycle
        };

        let report = PassReport {
            pass_id,
            person,
            role_version: snapshot.role_version,
            verified: verify,
            observed,
            rounds,
            operations,
            lifecycle,
            started_at,
            finished_at: Utc::now(),
        };

        let failures = report.failures().count();
        if failures == 0 {
            tracing::info!(
                pass = %pass_id,
                person = %person,
                operations = report.operations.len(),
                rounds,
                lifecycle = %lifecycle,
                "pass finished"
            );
        } else {
            tracing::warn!(
                pass = %pass_id,
                person = %person,
                operations = report.operations.len(),
                failures,
                rounds,
                lifecycle = %lifecycle,
                "pass finished with failures"
            );
        }
        Ok(report)
    }

    /// Observe the given chats concurrently. Returns how many succeeded.
    async fn observe_all(&self, person: PersonId, chats: &BTreeSet<ChatId>) -> usize {
        let results = join_all(
            chats
                .iter()
                .map(|&chat| self.operator.observe(PairKey::new(person, chat))),
        )
        .await;

        results
            .into_iter()
            .zip(chats)
            .filter(|(result, chat)| match result {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(person = %person, chat = %chat, error = %e, "observation failed");
                    false
                }
            })
            .count()
    }

    /// One task per pair; operations of one pair run in order.
    async fn execute_all(&self, ops: Vec<Operation>) -> Vec<OpReport> {
        let mut by_pair: BTreeMap<PairKey, Vec<Operation>> = BTreeMap::new();
        for op in ops {
            by_pair.entry(op.pair()).or_default().push(op);
        }

        let mut tasks = JoinSet::new();
        for (_, ops) in by_pair {
            let operator = self.operator.clone();
            tasks.spawn(async move { execute_pair(&operator, ops).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(pair_reports) => reports.extend(pair_reports),
                Err(e) => tracing::error!(error = %e, "operation task aborted"),
            }
        }
        reports.sort_by_key(|r| (r.operation.pair().chat, r.operation));
        reports
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Operations a pass would issue right now, from the cache alone.
    pub async fn plan(&self, person: PersonId) -> Result<Vec<Operation>> {
        let db = self.db.lock().await;
        reconciler::reconcile(&db, person).map_err(|e| person_error(person, e))
    }

    pub async fn status(&self, person: PersonId) -> Result<PersonStatus> {
        let running = self.passes.is_running(person);
        let db = self.db.lock().await;
        person_status(&db, person, running).map_err(|e| person_error(person, e))
    }

    // ------------------------------------------------------------------
    // Catalog
    // ------------------------------------------------------------------

    pub async fn create_role(&self, name: &str, description: Option<&str>) -> Result<Role> {
        let role = {
            let db = self.db.lock().await;
            if db.find_role_by_name(name)?.is_some() {
                return Err(EngineError::Duplicate(format!("role {name:?}")));
            }
            db.create_role(name, description)?
        };
        tracing::info!(role = %role.id, name, "role created");
        Ok(role)
    }

    /// Replace the chats a role grants, then run a pass for every holder so
    /// membership follows the new set.
    pub async fn set_role_chats(&self, role: RoleId, chats: &[ChatId]) -> Result<RoleUpdate> {
        let holders = {
            let db = self.db.lock().await;
            if !db.role_exists(role)? {
                return Err(LifecycleError::RoleNotFound(role).into());
            }
            for &chat in chats {
                db.get_chat(chat).map_err(|e| chat_error(chat, e))?;
            }
            db.set_role_chats(role, chats)?;
            db.persons_with_role(role)?
        };
        tracing::info!(
            role = %role,
            chats = chats.len(),
            holders = holders.len(),
            "role chats replaced"
        );

        let passes = self.reconcile_many(holders).await;
        let chats = {
            let db = self.db.lock().await;
            db.chats_for_role(role)?.into_iter().map(|chat| chat.id).collect()
        };
        Ok(RoleUpdate {
            role,
            chats,
            passes,
        })
    }

    /// Delete a role. Its holders keep the dangling reference, entitle no
    /// chat, and are evicted by the passes run here.
    pub async fn delete_role(&self, role: RoleId) -> Result<RoleUpdate> {
        let holders = {
            let db = self.db.lock().await;
            let holders = db.persons_with_role(role)?;
            if !db.delete_role(role)? {
                return Err(LifecycleError::RoleNotFound(role).into());
            }
            holders
        };
        tracing::info!(role = %role, holders = holders.len(), "role deleted");

        let passes = self.reconcile_many(holders).await;
        Ok(RoleUpdate {
            role,
            chats: Vec::new(),
            passes,
        })
    }

    /// Register a chat the agent manages and check its rights there. A
    /// failed rights check does not undo the registration.
    pub async fn register_chat(&self, new: NewChat) -> Result<ChatRights> {
        let chat = {
            let db = self.db.lock().await;
            if db.find_chat_by_external(new.external_id)?.is_some() {
                return Err(EngineError::Duplicate(format!("chat {}", new.external_id)));
            }
            db.create_chat(&new)?
        };
        tracing::info!(chat = %chat.id, external = %chat.external_id, "chat registered");
        Ok(self.rights_of(&chat).await)
    }

    pub async fn list_roles(&self) -> Result<Vec<Role>> {
        let db = self.db.lock().await;
        Ok(db.list_roles()?)
    }

    pub async fn list_chats(&self) -> Result<Vec<Chat>> {
        let db = self.db.lock().await;
        Ok(db.list_chats()?)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Check the agent's rights in every known chat and refresh the cache.
    pub async fn refresh_chat_rights(&self) -> Result<Vec<ChatRights>> {
        let chats = {
            let db = self.db.lock().await;
            db.list_chats()?
        };

        Ok(join_all(chats.iter().map(|chat| self.rights_of(chat))).await)
    }

    async fn rights_of(&self, chat: &Chat) -> ChatRights {
        match self.operator.check_rights(chat.id).await {
            Ok(rights) => ChatRights {
                chat: chat.id,
                external_id: chat.external_id,
                rights: Some(rights),
                error: None,
            },
            Err(e) => {
                tracing::warn!(chat = %chat.id, error = %e, "agent rights check failed");
                ChatRights {
                    chat: chat.id,
                    external_id: chat.external_id,
                    rights: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Re-run passes for every person with unfinished work, then prune the
    /// audit log.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let persons = {
            let db = self.db.lock().await;
            db.persons_needing_sweep()?
        };

        let passes = self.reconcile_many(persons).await;
        let mut report = SweepReport {
            persons: passes.persons,
            clean: passes.clean,
            with_failures: passes.with_failures,
            errors: passes.errors,
            pruned: 0,
        };

        let cutoff = Utc::now() - chrono::Duration::days(self.config.audit_retention_days);
        report.pruned = {
            let db = self.db.lock().await;
            db.prune_audit(cutoff)?
        };

        if report.persons > 0 || report.pruned > 0 {
            tracing::info!(
                persons = report.persons,
                clean = report.clean,
                with_failures = report.with_failures,
                errors = report.errors,
                pruned = report.pruned,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Run a pass for each person concurrently.
    async fn reconcile_many(&self, persons: Vec<PersonId>) -> PassTally {
        let mut tally = PassTally {
            persons: persons.len(),
            ..Default::default()
        };

        let mut tasks = JoinSet::new();
        for person in persons {
            let engine = self.clone();
            tasks.spawn(async move { engine.reconcile_person(person, false).await });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(pass)) if pass.is_clean() => tally.clean += 1,
                Ok(Ok(_)) => tally.with_failures += 1,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "pass failed");
                    tally.errors += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "pass task aborted");
                    tally.errors += 1;
                }
            }
        }
        tally
    }
}

async fn execute_pair(operator: &MembershipOperator, ops: Vec<Operation>) -> Vec<OpReport> {
    let mut reports = Vec::with_capacity(ops.len());
    let mut evict_pending = false;

    for op in ops {
        if evict_pending && matches!(op, Operation::Admit(_)) {
            reports.push(OpReport::skipped(op, "eviction did not complete"));
            continue;
        }
        let result = operator.execute(op).await;
        if let Operation::Evict(_) = op {
            evict_pending = !matches!(result, Ok(state) if state.is_clear());
        }
        reports.push(OpReport::from_result(op, result));
    }
    reports
}

fn chat_error(chat: ChatId, e: StoreError) -> EngineError {
    match e {
        StoreError::NotFound => EngineError::ChatNotFound(chat),
        other => other.into(),
    }
}

fn person_error(person: PersonId, e: StoreError) -> EngineError {
    match e {
        StoreError::NotFound => LifecycleError::PersonNotFound(person).into(),
        other => other.into(),
    }
}
