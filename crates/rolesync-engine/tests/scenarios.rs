//! End-to-end passes against the scripted chat API.

use std::sync::Arc;
use std::time::Duration;

use rolesync_engine::reconciler::Operation;
use rolesync_engine::testing::{CallKind, FakeChatApi};
use rolesync_engine::{
    ApiError, EngineConfig, Presence, RetryPolicy, SyncEngine, SyncStatus,
    TriggerReport,
};
use rolesync_shared::{
    AgentRights, AlertKind, AuditOperation, AuditOutcome, ChatId, Decision, ExternalChatId,
    ExternalUserId, FailureClass, LifecycleState, MemberState, PairKey, PersonId, RoleId,
};
use rolesync_store::{AuditQuery, Database, NewChat, NewPerson};
use tokio::sync::Mutex;

struct Harness {
    engine: SyncEngine,
    api: Arc<FakeChatApi>,
    db: Arc<Mutex<Database>>,
}

fn config() -> EngineConfig {
    EngineConfig {
        max_concurrent_ops: 4,
        api_rate_per_sec: 0.0,
        api_burst: 1.0,
        retry: RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
        },
        call_timeout: Duration::from_secs(1),
        audit_retention_days: 90,
    }
}

fn harness_with(db: Database) -> Harness {
    let db = Arc::new(Mutex::new(db));
    let api = Arc::new(FakeChatApi::new());
    let engine = SyncEngine::new(db.clone(), api.clone(), config());
    Harness { engine, api, db }
}

fn harness() -> Harness {
    harness_with(Database::open_in_memory().unwrap())
}

const USER: ExternalUserId = ExternalUserId(4242);

fn ext(chat: i64) -> ExternalChatId {
    ExternalChatId(-1000 - chat)
}

impl Harness {
    async fn chat(&self, n: i64) -> ChatId {
        self.db
            .lock()
            .await
            .create_chat(&NewChat {
                external_id: ext(n),
                title: format!("chat {n}"),
                invite_link: None,
            })
            .unwrap()
            .id
    }

    async fn role(&self, name: &str, chats: &[ChatId]) -> RoleId {
        let db = self.db.lock().await;
        let role = db.create_role(name, None).unwrap();
        db.set_role_chats(role.id, chats).unwrap();
        role.id
    }

    async fn approve(&self, role: RoleId) -> (PersonId, TriggerReport) {
        let registration = self
            .engine
            .register(NewPerson {
                external_id: USER,
                username: Some("grace".into()),
                first_name: Some("Grace".into()),
                last_name: None,
                phone: None,
            })
            .await
            .unwrap();
        let report = self
            .engine
            .decide_request(registration.request.id, Decision::Approved, Some(role))
            .await
            .unwrap();
        (registration.person.id, report)
    }

    async fn state(&self, person: PersonId, chat: ChatId) -> MemberState {
        self.db
            .lock()
            .await
            .get_membership(PairKey::new(person, chat))
            .unwrap()
            .state
    }

    async fn lifecycle(&self, person: PersonId) -> LifecycleState {
        self.db.lock().await.get_person(person).unwrap().lifecycle
    }
}

#[tokio::test]
async fn approval_admits_everywhere_and_second_pass_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_with(Database::open_at(&dir.path().join("rolesync.db")).unwrap());
    let (a, b) = (h.chat(1).await, h.chat(2).await);
    let role = h.role("staff", &[a, b]).await;

    let (person, report) = h.approve(role).await;
    let pass = report.pass.unwrap();
    assert!(pass.is_clean());
    assert_eq!(pass.operations.len(), 2);
    assert_eq!(report.person.lifecycle, LifecycleState::Active);
    assert_eq!(report.status.status, SyncStatus::Converged);
    assert_eq!(h.state(person, a).await, MemberState::Member);
    assert_eq!(h.state(person, b).await, MemberState::Member);
    assert_eq!(h.api.count(CallKind::Admit), 2);
    // One rights check per operation.
    assert_eq!(h.api.count(CallKind::CheckRights), 2);

    assert!(h.engine.plan(person).await.unwrap().is_empty());
    let again = h.engine.reconcile_person(person, false).await.unwrap();
    assert!(again.operations.is_empty());
    assert_eq!(again.rounds, 0);
    assert_eq!(h.api.count(CallKind::Admit), 2);

    let db = h.db.lock().await;
    let triggers = db
        .list_audit(&AuditQuery {
            person_id: Some(person),
            operation: Some(AuditOperation::Register),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].chat_id, None);
}

#[tokio::test]
async fn evicted_person_can_be_admitted_again() {
    let h = harness();
    let a = h.chat(1).await;
    let with_chat = h.role("staff", &[a]).await;
    let without_chat = h.role("guest", &[]).await;
    let (person, _) = h.approve(with_chat).await;

    let report = h.engine.reassign_role(person, without_chat).await.unwrap();
    assert!(report.pass.unwrap().is_clean());
    assert_eq!(h.state(person, a).await, MemberState::Removed);
    assert_eq!(h.api.presence(ext(1), USER), Presence::Absent);
    assert_eq!(h.api.count(CallKind::Exclude), 1);
    assert_eq!(h.api.count(CallKind::Release), 1);

    h.engine.reassign_role(person, with_chat).await.unwrap();
    assert_eq!(h.state(person, a).await, MemberState::Member);
    assert_eq!(h.api.presence(ext(1), USER), Presence::Member);
}

#[tokio::test]
async fn missing_admin_rights_block_every_mutation() {
    let h = harness();
    let a = h.chat(1).await;
    let role = h.role("staff", &[a]).await;
    h.api.set_rights(ext(1), AgentRights::None);

    let (person, report) = h.approve(role).await;
    let pass = report.pass.unwrap();
    assert_eq!(pass.operations.len(), 1);
    assert_eq!(pass.operations[0].class, Some(FailureClass::Permission));
    assert_eq!(h.api.count(CallKind::Admit), 0);
    assert_eq!(h.state(person, a).await, MemberState::Absent);
    assert_eq!(report.person.lifecycle, LifecycleState::Approved);

    assert_eq!(report.status.status, SyncStatus::NeedsAttention);
    assert_eq!(
        report.status.failing[0].alerts,
        vec![AlertKind::InsufficientPrivilege]
    );
    assert!(!h.db.lock().await.get_chat(a).unwrap().agent_is_admin);

    h.api.set_rights(ext(1), AgentRights::Administrator);
    h.engine.reconcile_person(person, false).await.unwrap();
    assert_eq!(h.state(person, a).await, MemberState::Member);
    assert_eq!(h.lifecycle(person).await, LifecycleState::Active);
    assert!(h.db.lock().await.open_alerts().unwrap().is_empty());
}

#[tokio::test]
async fn failing_release_is_retried_without_excluding_again() {
    let h = harness();
    let a = h.chat(1).await;
    let role = h.role("staff", &[a]).await;
    let (person, _) = h.approve(role).await;

    h.api.fail_next(CallKind::Release, 3);
    let report = h.engine.terminate(person).await.unwrap();

    assert!(report.pass.unwrap().is_clean());
    assert_eq!(h.state(person, a).await, MemberState::Removed);
    assert_eq!(h.api.count(CallKind::Exclude), 1);
    assert_eq!(h.api.count(CallKind::Release), 4);
    assert_eq!(report.person.lifecycle, LifecycleState::Terminated);

    let transient = h
        .db
        .lock()
        .await
        .list_audit(&AuditQuery {
            operation: Some(AuditOperation::Release),
            outcome: Some(AuditOutcome::Transient),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(transient.len(), 3);
}

#[tokio::test]
async fn exhausted_release_alerts_and_sweep_finishes_it() {
    let h = harness();
    let a = h.chat(1).await;
    let role = h.role("staff", &[a]).await;
    let (person, _) = h.approve(role).await;

    h.api.fail_next(CallKind::Release, 5);
    let report = h.engine.terminate(person).await.unwrap();
    let pass = report.pass.unwrap();
    assert_eq!(pass.failures().count(), 1);
    assert_eq!(h.state(person, a).await, MemberState::PartiallyRemoved);
    assert_eq!(report.person.lifecycle, LifecycleState::Active);
    assert_eq!(report.status.status, SyncStatus::NeedsAttention);
    assert_eq!(
        report.status.failing[0].alerts,
        vec![AlertKind::PartialRemoval]
    );
    assert_eq!(h.api.presence(ext(1), USER), Presence::Excluded);

    let sweep = h.engine.sweep().await.unwrap();
    assert_eq!(sweep.persons, 1);
    assert_eq!(sweep.clean, 1);

    assert_eq!(h.state(person, a).await, MemberState::Removed);
    assert_eq!(h.api.count(CallKind::Exclude), 1);
    assert_eq!(h.api.presence(ext(1), USER), Presence::Absent);
    assert_eq!(h.lifecycle(person).await, LifecycleState::Terminated);
    assert!(h.db.lock().await.open_alerts().unwrap().is_empty());
}

#[tokio::test]
async fn role_change_moves_only_the_difference() {
    let h = harness();
    let (a, b, c) = (h.chat(1).await, h.chat(2).await, h.chat(3).await);
    let first = h.role("first", &[a, b]).await;
    let second = h.role("second", &[b, c]).await;
    let (person, _) = h.approve(first).await;

    h.db.lock()
        .await
        .assign_person_role(person, second)
        .unwrap();
    assert_eq!(
        h.engine.plan(person).await.unwrap(),
        vec![
            Operation::Evict(PairKey::new(person, a)),
            Operation::Admit(PairKey::new(person, c)),
        ]
    );

    let report = h.engine.reassign_role(person, second).await.unwrap();
    assert!(report.pass.unwrap().is_clean());
    assert_eq!(h.state(person, a).await, MemberState::Removed);
    assert_eq!(h.state(person, b).await, MemberState::Member);
    assert_eq!(h.state(person, c).await, MemberState::Member);
    assert_eq!(h.api.count_for(CallKind::Admit, ext(2)), 1);
}

#[tokio::test]
async fn termination_evicts_everything_before_terminating() {
    let h = harness();
    let (a, b) = (h.chat(1).await, h.chat(2).await);
    let role = h.role("staff", &[a, b]).await;
    let (person, _) = h.approve(role).await;

    let report = h.engine.terminate(person).await.unwrap();
    let pass = report.pass.unwrap();
    assert_eq!(pass.operations.len(), 2);
    assert!(pass
        .operations
        .iter()
        .all(|op| matches!(op.operation, Operation::Evict(_))));
    assert_eq!(h.state(person, a).await, MemberState::Removed);
    assert_eq!(h.state(person, b).await, MemberState::Removed);
    assert_eq!(report.person.lifecycle, LifecycleState::Terminated);
    assert_eq!(report.status.status, SyncStatus::Converged);

    assert!(h.engine.terminate(person).await.is_err());
    assert!(h.engine.reassign_role(person, role).await.is_err());
}

#[tokio::test]
async fn verify_pass_repairs_drift() {
    let h = harness();
    let (a, b) = (h.chat(1).await, h.chat(2).await);
    let role = h.role("staff", &[a, b]).await;
    let (person, _) = h.approve(role).await;

    // Someone removed the person from b outside the engine.
    h.api.set_presence(ext(2), USER, Presence::Absent);
    assert!(h.engine.plan(person).await.unwrap().is_empty());

    let pass = h.engine.reconcile_person(person, true).await.unwrap();
    assert_eq!(pass.observed, 2);
    assert_eq!(pass.operations.len(), 1);
    assert_eq!(h.state(person, b).await, MemberState::Member);
    assert_eq!(h.api.presence(ext(2), USER), Presence::Member);

    let pass = h.engine.reconcile_person(person, true).await.unwrap();
    assert!(pass.operations.is_empty());
}

#[tokio::test]
async fn invitation_is_promoted_once_accepted() {
    let h = harness();
    let a = h.chat(1).await;
    let role = h.role("staff", &[a]).await;
    h.api.set_invite_only(true);

    let (person, report) = h.approve(role).await;
    assert_eq!(h.state(person, a).await, MemberState::Invited);
    assert_eq!(report.person.lifecycle, LifecycleState::Approved);
    assert_eq!(report.status.status, SyncStatus::InProgress);

    // Not accepted yet: nothing changes and nothing is re-sent.
    h.engine.reconcile_person(person, false).await.unwrap();
    assert_eq!(h.state(person, a).await, MemberState::Invited);
    assert_eq!(h.api.count(CallKind::Admit), 1);

    assert!(h.api.join(ext(1), USER));
    let pass = h.engine.reconcile_person(person, false).await.unwrap();
    assert_eq!(pass.observed, 1);
    assert_eq!(h.state(person, a).await, MemberState::Member);
    assert_eq!(h.lifecycle(person).await, LifecycleState::Active);
}

#[tokio::test]
async fn terminated_person_cannot_use_an_outstanding_invitation() {
    let h = harness();
    let a = h.chat(1).await;
    let role = h.role("staff", &[a]).await;
    h.api.set_invite_only(true);

    let (person, _) = h.approve(role).await;
    assert_eq!(h.state(person, a).await, MemberState::Invited);
    assert_eq!(h.api.usable_invitations(ext(1), USER), 1);

    let report = h.engine.terminate(person).await.unwrap();
    assert!(report.pass.unwrap().is_clean());
    assert_eq!(report.person.lifecycle, LifecycleState::Terminated);
    assert_eq!(h.api.count(CallKind::Revoke), 1);
    assert_eq!(h.api.usable_invitations(ext(1), USER), 0);

    assert!(!h.api.join(ext(1), USER));
    h.engine.sweep().await.unwrap();
    assert_eq!(h.api.presence(ext(1), USER), Presence::Absent);
    assert_eq!(h.state(person, a).await, MemberState::Removed);
    assert_eq!(h.lifecycle(person).await, LifecycleState::Terminated);

    let db = h.db.lock().await;
    let record = db.get_membership(PairKey::new(person, a)).unwrap();
    assert_eq!(record.invitation, None);
    let revoked = db
        .list_audit(&AuditQuery {
            operation: Some(AuditOperation::Revoke),
            outcome: Some(AuditOutcome::Success),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(revoked.len(), 1);
}

#[tokio::test]
async fn readmission_withdraws_the_previous_invitation() {
    let h = harness();
    let a = h.chat(1).await;
    let role = h.role("staff", &[a]).await;
    h.api.set_invite_only(true);

    let (person, _) = h.approve(role).await;
    assert!(h.api.join(ext(1), USER));
    h.engine.reconcile_person(person, false).await.unwrap();
    assert_eq!(h.state(person, a).await, MemberState::Member);

    // The person leaves on their own and is invited again.
    h.api.set_presence(ext(1), USER, Presence::Absent);
    let pass = h.engine.reconcile_person(person, true).await.unwrap();
    assert!(pass.is_clean());
    assert_eq!(h.state(person, a).await, MemberState::Invited);
    assert_eq!(h.api.count(CallKind::Admit), 2);
    assert_eq!(h.api.count(CallKind::Revoke), 1);
    assert_eq!(h.api.usable_invitations(ext(1), USER), 1);
}

#[tokio::test]
async fn exhausted_admission_alerts_and_sweep_retries_it() {
    let h = harness();
    let a = h.chat(1).await;
    let role = h.role("staff", &[a]).await;
    h.api.fail_next(CallKind::Admit, 5);

    let (person, report) = h.approve(role).await;
    assert_eq!(h.api.count(CallKind::Admit), 5);
    assert_eq!(h.state(person, a).await, MemberState::Absent);
    assert_eq!(report.person.lifecycle, LifecycleState::Approved);
    assert_eq!(report.status.status, SyncStatus::NeedsAttention);
    assert_eq!(
        report.status.failing[0].alerts,
        vec![AlertKind::RetriesExhausted]
    );

    let sweep = h.engine.sweep().await.unwrap();
    assert_eq!(sweep.clean, 1);
    assert_eq!(h.state(person, a).await, MemberState::Member);
    assert_eq!(h.lifecycle(person).await, LifecycleState::Active);
    assert!(h.db.lock().await.open_alerts().unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_removal_of_active_person_is_swept() {
    let h = harness();
    let a = h.chat(1).await;
    let with_chat = h.role("staff", &[a]).await;
    let without_chat = h.role("guest", &[]).await;
    let (person, _) = h.approve(with_chat).await;

    h.api.fail_next(CallKind::Exclude, 5);
    let report = h.engine.reassign_role(person, without_chat).await.unwrap();
    assert_eq!(h.state(person, a).await, MemberState::Member);
    assert_eq!(report.person.lifecycle, LifecycleState::Active);
    assert_eq!(
        report.status.failing[0].alerts,
        vec![AlertKind::RetriesExhausted]
    );

    let sweep = h.engine.sweep().await.unwrap();
    assert_eq!(sweep.persons, 1);
    assert_eq!(sweep.clean, 1);
    assert_eq!(h.state(person, a).await, MemberState::Removed);
    assert_eq!(h.api.presence(ext(1), USER), Presence::Absent);
    assert_eq!(h.api.count(CallKind::Exclude), 6);
    assert!(h.db.lock().await.open_alerts().unwrap().is_empty());

    // Nothing left to retry.
    assert_eq!(h.engine.sweep().await.unwrap().persons, 0);
}

#[tokio::test]
async fn banned_person_is_released_then_admitted() {
    let h = harness();
    let a = h.chat(1).await;
    let role = h.role("staff", &[a]).await;
    // A leftover ban the cache knows nothing about.
    h.api.set_presence(ext(1), USER, Presence::Excluded);

    let (person, report) = h.approve(role).await;
    let pass = report.pass.unwrap();
    assert_eq!(pass.rounds, 2);
    assert_eq!(h.state(person, a).await, MemberState::Member);
    assert_eq!(h.api.count(CallKind::Exclude), 0);
    assert_eq!(h.api.count(CallKind::Release), 1);
    assert_eq!(h.api.count(CallKind::Admit), 2);
    assert_eq!(report.person.lifecycle, LifecycleState::Active);
}

#[tokio::test]
async fn timed_out_admission_is_checked_before_retrying() {
    let h = harness();
    let a = h.chat(1).await;
    let role = h.role("staff", &[a]).await;
    h.api.push_failure(CallKind::Admit, ApiError::Timeout);

    let (person, report) = h.approve(role).await;
    assert!(report.pass.unwrap().is_clean());
    assert_eq!(h.state(person, a).await, MemberState::Member);
    assert_eq!(h.api.count(CallKind::Admit), 2);
    assert_eq!(h.api.count(CallKind::Observe), 1);
}

#[tokio::test]
async fn concurrent_triggers_do_not_duplicate_work() {
    let h = harness();
    let (a, b) = (h.chat(1).await, h.chat(2).await);
    let role = h.role("staff", &[a, b]).await;
    h.api.set_rights(ext(1), AgentRights::None);
    let (person, _) = h.approve(role).await;
    h.api.set_rights(ext(1), AgentRights::Administrator);

    let (first, second) = tokio::join!(
        h.engine.reconcile_person(person, false),
        h.engine.reconcile_person(person, false),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(h.state(person, a).await, MemberState::Member);
    assert_eq!(h.api.count_for(CallKind::Admit, ext(1)), 1);
    assert_eq!(h.api.count_for(CallKind::Admit, ext(2)), 1);
    assert_eq!(h.engine.status(person).await.unwrap().status, SyncStatus::Converged);
}

#[tokio::test]
async fn refresh_reports_rights_per_chat() {
    let h = harness();
    let (a, b) = (h.chat(1).await, h.chat(2).await);
    h.api.set_rights(ext(2), AgentRights::Member);

    let rights = h.engine.refresh_chat_rights().await.unwrap();
    assert_eq!(rights.len(), 2);
    let db = h.db.lock().await;
    assert!(db.get_chat(a).unwrap().agent_is_admin);
    assert!(!db.get_chat(b).unwrap().agent_is_admin);
    assert!(db.get_chat(b).unwrap().rights_checked_at.is_some());
}

#[tokio::test]
async fn unknown_person_is_reported() {
    let h = harness();
    assert!(h.engine.status(PersonId(77)).await.is_err());
    assert!(h.engine.reconcile_person(PersonId(77), false).await.is_err());
}
