//! Membership operator: executes one admit, evict or observation against the
//! external API for a single (person, chat) pair.
//!
//! Every operation runs under the pair's lease and takes one operation slot
//! from the rate gate. Each external call is bounded by the call timeout,
//! retried on transient failures with backoff, and audited per attempt.
//!
//! Eviction is always exclusion followed by release. The pair is persisted
//! as `PartiallyRemoved` the moment exclusion succeeds, so a crash or a
//! failing release can only ever leave it in a state the next pass resumes
//! with release alone. Exclusion is never issued for a pair already in
//! that state.
//!
//! An invitation handed out by an admission stays on the record until it is
//! revoked. Eviction revokes it before anything else, and so does a fresh
//! admission, so at most one usable invitation exists per pair and none
//! survives an eviction.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rolesync_shared::{
    AgentRights, AlertKind, AuditOperation, AuditOutcome, ChatId, ExternalChatId, ExternalUserId,
    FailureClass, MemberState, PairKey, SyncError,
};
use rolesync_store::{Database, MembershipRecord, StoreError};
use tokio::sync::Mutex;

use crate::api::{classify, AdmitOutcome, ApiError, ChatApi, Presence};
use crate::audit::{AuditEntry, AuditRecorder};
use crate::error::Result;
use crate::gate::RateGate;
use crate::lease::LeaseTable;
use crate::reconciler::Operation;
use crate::retry::RetryPolicy;

/// A pair with everything an operation needs, read under its lease.
struct Target {
    pair: PairKey,
    chat: ExternalChatId,
    user: ExternalUserId,
    record: MembershipRecord,
}

/// A call that ended without success after its attempts.
#[derive(Debug)]
struct CallFailure {
    error: ApiError,
    class: FailureClass,
    attempts: u32,
}

struct Settled<T> {
    value: T,
    attempt: u32,
    /// Success was inferred from an observation after a timeout.
    observed: bool,
}

/// Maps an observation taken after a timed-out call to the call's result,
/// or `None` if the call evidently did not take effect.
type Settle<T> = fn(Presence) -> Option<T>;

#[derive(Clone)]
pub struct MembershipOperator {
    db: Arc<Mutex<Database>>,
    api: Arc<dyn ChatApi>,
    gate: RateGate,
    leases: LeaseTable,
    recorder: AuditRecorder,
    retry: RetryPolicy,
    call_timeout: Duration,
}

impl MembershipOperator {
    pub fn new(
        db: Arc<Mutex<Database>>,
        api: Arc<dyn ChatApi>,
        gate: RateGate,
        leases: LeaseTable,
        recorder: AuditRecorder,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            db,
            api,
            gate,
            leases,
            recorder,
            retry,
            call_timeout,
        }
    }

    pub async fn execute(&self, op: Operation) -> Result<MemberState> {
        match op {
            Operation::Admit(pair) => self.admit(pair).await,
            Operation::Evict(pair) => self.evict(pair).await,
        }
    }

    // ------------------------------------------------------------------
    // Admit
    // ------------------------------------------------------------------

    pub async fn admit(&self, pair: PairKey) -> Result<MemberState> {
        let _lease = self.leases.acquire(pair).await;
        let _slot = self.gate.operation().await;
        let mut target = self.load(pair).await?;

        match target.record.state {
            MemberState::Member | MemberState::Invited => {
                let state = target.record.state;
                self.recorder
                    .record(
                        AuditEntry::pair(pair, AuditOperation::Admit, AuditOutcome::Noop)
                            .detail(format!("already {state}")),
                    )
                    .await;
                return Ok(state);
            }
            MemberState::PartiallyRemoved => return Err(SyncError::EvictionPending.into()),
            MemberState::Absent | MemberState::Removed => {}
        }

        if let Err(failure) = self.preflight(&target).await {
            return self.admit_failed(&mut target, failure).await;
        }
        if let Err(failure) = self.revoke_outstanding(&mut target).await? {
            return self.admit_failed(&mut target, failure).await;
        }

        let (chat, user) = (target.chat, target.user);
        let settle: Settle<AdmitOutcome> =
            |presence| (presence == Presence::Member).then_some(AdmitOutcome::Joined);
        let entry = AuditEntry::pair(pair, AuditOperation::Admit, AuditOutcome::Success);

        match self
            .call(entry.clone(), Some((&target, settle)), || self.api.admit(chat, user))
            .await
        {
            Ok(settled) => {
                let (state, outcome, invitation) = match &settled.value {
                    AdmitOutcome::Joined => (MemberState::Member, AuditOutcome::Success, None),
                    AdmitOutcome::Invited { invitation } => (
                        MemberState::Invited,
                        AuditOutcome::Invited,
                        Some(invitation.as_str()),
                    ),
                };
                self.write_invitation(&mut target, state, None, invitation)
                    .await?;
                self.recorder
                    .record(settled_entry(entry, outcome, &settled))
                    .await;
                self.recorder.resolve(pair).await;
                Ok(state)
            }
            Err(failure) => self.admit_failed(&mut target, failure).await,
        }
    }

    /// The pair keeps its state; only `last_error` changes.
    async fn admit_failed(
        &self,
        target: &mut Target,
        failure: CallFailure,
    ) -> Result<MemberState> {
        let message = failure.error.to_string();
        match failure.class {
            FailureClass::Permission => {
                self.recorder
                    .alert(target.pair, AlertKind::InsufficientPrivilege, &message)
                    .await;
            }
            FailureClass::Transient => {
                self.recorder
                    .alert(
                        target.pair,
                        AlertKind::RetriesExhausted,
                        &format!("admission failed after {} attempt(s): {message}", failure.attempts),
                    )
                    .await;
            }
            _ => {}
        }
        if failure.class == FailureClass::Inconsistent {
            let state = self.observe_locked(target).await?;
            if state == MemberState::Member {
                self.recorder.resolve(target.pair).await;
                return Ok(state);
            }
        }

        let state = target.record.state;
        self.write(target, state, Some(&message)).await?;
        Err(sync_error(target.chat, &failure).into())
    }

    // ------------------------------------------------------------------
    // Evict
    // ------------------------------------------------------------------

    pub async fn evict(&self, pair: PairKey) -> Result<MemberState> {
        let _lease = self.leases.acquire(pair).await;
        let _slot = self.gate.operation().await;
        let mut target = self.load(pair).await?;

        if target.record.state.is_clear() && target.record.invitation.is_none() {
            let state = target.record.state;
            self.recorder
                .record(
                    AuditEntry::pair(pair, AuditOperation::Exclude, AuditOutcome::Noop)
                        .detail(format!("already {state}")),
                )
                .await;
            return Ok(state);
        }

        if let Err(failure) = self.preflight(&target).await {
            return self.evict_failed(&mut target, failure).await;
        }
        if let Err(failure) = self.revoke_outstanding(&mut target).await? {
            return self.evict_failed(&mut target, failure).await;
        }
        if target.record.state.is_clear() {
            return Ok(target.record.state);
        }

        let (chat, user) = (target.chat, target.user);

        if target.record.state != MemberState::PartiallyRemoved {
            let settle: Settle<()> = |presence| (presence != Presence::Member).then_some(());
            let entry = AuditEntry::pair(pair, AuditOperation::Exclude, AuditOutcome::Success);
            match self
                .call(entry.clone(), Some((&target, settle)), || {
                    self.api.exclude_member(chat, user)
                })
                .await
            {
                Ok(settled) => {
                    self.write(&mut target, MemberState::PartiallyRemoved, None)
                        .await?;
                    self.recorder
                        .record(settled_entry(entry, AuditOutcome::Success, &settled))
                        .await;
                }
                Err(failure) => return self.evict_failed(&mut target, failure).await,
            }
        }

        let settle: Settle<()> = |presence| (presence != Presence::Excluded).then_some(());
        let entry = AuditEntry::pair(pair, AuditOperation::Release, AuditOutcome::Success);
        match self
            .call(entry.clone(), Some((&target, settle)), || {
                self.api.release_exclusion(chat, user)
            })
            .await
        {
            Ok(settled) => {
                self.recorder
                    .record(settled_entry(entry, AuditOutcome::Success, &settled))
                    .await;
                self.finish_removal(&mut target).await
            }
            Err(failure) => self.evict_failed(&mut target, failure).await,
        }
    }

    async fn evict_failed(&self, target: &mut Target, failure: CallFailure) -> Result<MemberState> {
        let message = failure.error.to_string();
        match failure.class {
            // The chat or the person is gone: nothing left to remove.
            FailureClass::NotFound => return self.finish_removal(target).await,
            FailureClass::Inconsistent => {
                let state = self.observe_locked(target).await?;
                if state.is_clear() {
                    return Ok(state);
                }
            }
            FailureClass::Permission => {
                self.recorder
                    .alert(target.pair, AlertKind::InsufficientPrivilege, &message)
                    .await;
            }
            FailureClass::Transient => {}
        }

        let state = target.record.state;
        self.write(target, state, Some(&message)).await?;

        if state != MemberState::PartiallyRemoved {
            if failure.class == FailureClass::Transient {
                self.recorder
                    .alert(
                        target.pair,
                        AlertKind::RetriesExhausted,
                        &format!("removal failed after {} attempt(s): {message}", failure.attempts),
                    )
                    .await;
            }
        } else {
            tracing::error!(
                person = %target.pair.person,
                chat = %target.pair.chat,
                attempts = failure.attempts,
                error = %message,
                "exclusion in place but release failed, person is barred from the chat"
            );
            self.recorder
                .alert(
                    target.pair,
                    AlertKind::PartialRemoval,
                    &format!("release failed after {} attempt(s): {message}", failure.attempts),
                )
                .await;
        }
        Err(sync_error(target.chat, &failure).into())
    }

    async fn finish_removal(&self, target: &mut Target) -> Result<MemberState> {
        self.write(target, MemberState::Removed, None).await?;
        self.recorder.resolve(target.pair).await;
        Ok(MemberState::Removed)
    }

    // ------------------------------------------------------------------
    // Revoke
    // ------------------------------------------------------------------

    /// Withdraw the pair's outstanding invitation, if any, and forget it.
    /// The outer error is a cache failure, the inner one a failed call.
    async fn revoke_outstanding(
        &self,
        target: &mut Target,
    ) -> Result<std::result::Result<(), CallFailure>> {
        let Some(invitation) = target.record.invitation.clone() else {
            return Ok(Ok(()));
        };

        let chat = target.chat;
        let entry = AuditEntry::pair(target.pair, AuditOperation::Revoke, AuditOutcome::Success);
        let detail = match self
            .call(entry.clone(), None, || {
                self.api.revoke_invitation(chat, &invitation)
            })
            .await
        {
            Ok(settled) => settled_entry(entry, AuditOutcome::Success, &settled),
            // Already gone on the platform side.
            Err(failure) if failure.class == FailureClass::NotFound => AuditEntry {
                outcome: AuditOutcome::Noop,
                ..entry
            }
            .attempt(failure.attempts)
            .detail("invitation no longer exists"),
            Err(failure) => return Ok(Err(failure)),
        };

        let state = target.record.state;
        let last_error = target.record.last_error.clone();
        self.write_invitation(target, state, last_error.as_deref(), None)
            .await?;
        self.recorder.record(detail).await;
        Ok(Ok(()))
    }

    // ------------------------------------------------------------------
    // Observe
    // ------------------------------------------------------------------

    /// Read the pair's presence from the platform and correct the cache.
    pub async fn observe(&self, pair: PairKey) -> Result<MemberState> {
        let _lease = self.leases.acquire(pair).await;
        let mut target = self.load(pair).await?;
        self.observe_locked(&mut target).await
    }

    async fn observe_locked(&self, target: &mut Target) -> Result<MemberState> {
        let (chat, user) = (target.chat, target.user);
        let entry = AuditEntry::pair(target.pair, AuditOperation::Observe, AuditOutcome::Success);
        let (presence, attempt) = match self
            .call(entry.clone(), None, || self.api.observe_member(chat, user))
            .await
        {
            Ok(settled) => (settled.value, settled.attempt),
            Err(failure) if failure.class == FailureClass::NotFound => {
                (Presence::Absent, failure.attempts)
            }
            Err(failure) => return Err(sync_error(target.chat, &failure).into()),
        };

        let current = target.record.state;
        let next = corrected_state(current, presence);
        if next == current {
            self.recorder
                .record(entry.attempt(attempt).detail(format!("cache agrees: {current}")))
                .await;
            return Ok(current);
        }

        let outcome = if current == MemberState::Invited && next == MemberState::Member {
            AuditOutcome::Success
        } else {
            tracing::warn!(
                person = %target.pair.person,
                chat = %target.pair.chat,
                cached = %current,
                observed = ?presence,
                "membership cache disagreed with the platform"
            );
            AuditOutcome::Inconsistent
        };
        self.write(target, next, None).await?;
        self.recorder
            .record(
                AuditEntry::pair(target.pair, AuditOperation::Observe, outcome)
                    .attempt(attempt)
                    .detail(format!("cache {current}, platform {presence:?}, now {next}")),
            )
            .await;
        Ok(next)
    }

    // ------------------------------------------------------------------
    // Preflight
    // ------------------------------------------------------------------

    /// Check the agent's rights in the pair's chat and refresh the cache.
    async fn preflight(&self, target: &Target) -> std::result::Result<(), CallFailure> {
        let chat = target.chat;
        let entry = AuditEntry::pair(target.pair, AuditOperation::Preflight, AuditOutcome::Success);
        match self
            .call(entry.clone(), None, || self.api.check_agent_rights(chat))
            .await
        {
            Ok(settled) => {
                let is_admin = settled.value.is_admin();
                self.cache_rights(target.pair.chat, is_admin).await;
                if is_admin {
                    self.recorder.record(entry.attempt(settled.attempt)).await;
                    Ok(())
                } else {
                    let error = ApiError::Forbidden(format!("agent rights: {:?}", settled.value));
                    self.recorder
                        .record(
                            AuditEntry::pair(
                                target.pair,
                                AuditOperation::Preflight,
                                AuditOutcome::Permission,
                            )
                            .attempt(settled.attempt)
                            .detail(error.to_string()),
                        )
                        .await;
                    Err(CallFailure {
                        error,
                        class: FailureClass::Permission,
                        attempts: settled.attempt,
                    })
                }
            }
            Err(failure) => {
                if failure.class == FailureClass::Permission {
                    self.cache_rights(target.pair.chat, false).await;
                }
                Err(failure)
            }
        }
    }

    /// Check the agent's rights in one chat, outside of any pair operation.
    pub async fn check_rights(&self, chat: ChatId) -> Result<AgentRights> {
        let external = {
            let db = self.db.lock().await;
            db.get_chat(chat)?.external_id
        };
        let entry = AuditEntry::chat(chat, AuditOperation::Preflight, AuditOutcome::Success);
        match self
            .call(entry.clone(), None, || self.api.check_agent_rights(external))
            .await
        {
            Ok(settled) => {
                self.cache_rights(chat, settled.value.is_admin()).await;
                self.recorder
                    .record(
                        entry
                            .attempt(settled.attempt)
                            .detail(format!("agent rights: {:?}", settled.value)),
                    )
                    .await;
                Ok(settled.value)
            }
            Err(failure) => {
                if failure.class == FailureClass::Permission {
                    self.cache_rights(chat, false).await;
                }
                Err(sync_error(external, &failure).into())
            }
        }
    }

    async fn cache_rights(&self, chat: ChatId, is_admin: bool) {
        let db = self.db.lock().await;
        if let Err(e) = db.set_chat_agent_rights(chat, is_admin, Utc::now()) {
            tracing::warn!(chat = %chat, error = %e, "failed to cache agent rights");
        }
    }

    // ------------------------------------------------------------------
    // External call with timeout, retry and per-attempt audit
    // ------------------------------------------------------------------

    async fn call<T, F, Fut>(
        &self,
        entry: AuditEntry,
        settle: Option<(&Target, Settle<T>)>,
        mut f: F,
    ) -> std::result::Result<Settled<T>, CallFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut backoff = self.retry.backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.gate.call().await;

            let result = match tokio::time::timeout(self.call_timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::Timeout),
            };
            let error = match result {
                Ok(value) => {
                    return Ok(Settled {
                        value,
                        attempt,
                        observed: false,
                    })
                }
                Err(error) => error,
            };

            let class = classify(&error);
            self.recorder
                .record(
                    AuditEntry {
                        outcome: failure_outcome(class),
                        ..entry.clone()
                    }
                    .attempt(attempt)
                    .detail(error.to_string()),
                )
                .await;

            if class != FailureClass::Transient {
                return Err(CallFailure {
                    error,
                    class,
                    attempts: attempt,
                });
            }

            // A timed-out mutation may or may not have landed. Look before
            // issuing it again.
            if error == ApiError::Timeout {
                if let Some((target, settle)) = settle {
                    if let Some(value) = self.disambiguate(target, settle).await {
                        return Ok(Settled {
                            value,
                            attempt,
                            observed: true,
                        });
                    }
                }
            }

            if attempt >= max_attempts {
                return Err(CallFailure {
                    error,
                    class,
                    attempts: attempt,
                });
            }

            let mut delay = backoff.next_delay();
            if let ApiError::RateLimited {
                retry_after: Some(after),
            } = &error
            {
                delay = delay.max(*after);
            }
            tracing::debug!(
                person = ?entry.person,
                chat = ?entry.chat,
                operation = entry.operation.as_str(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One observation, no retry. `None` when the observation itself fails
    /// or shows the call did not take effect.
    async fn disambiguate<T>(&self, target: &Target, settle: Settle<T>) -> Option<T> {
        self.gate.call().await;
        let observed = tokio::time::timeout(
            self.call_timeout,
            self.api.observe_member(target.chat, target.user),
        )
        .await;
        match observed {
            Ok(Ok(presence)) => {
                tracing::debug!(pair = %target.pair, ?presence, "observed after timeout");
                settle(presence)
            }
            Ok(Err(e)) => {
                tracing::debug!(pair = %target.pair, error = %e, "observation after timeout failed");
                None
            }
            Err(_) => None,
        }
    }

    // ------------------------------------------------------------------
    // Cache access
    // ------------------------------------------------------------------

    async fn load(&self, pair: PairKey) -> Result<Target> {
        let db = self.db.lock().await;
        let person = db.get_person(pair.person)?;
        let chat = db.get_chat(pair.chat)?;
        let record = db.get_membership(pair)?;
        Ok(Target {
            pair,
            chat: chat.external_id,
            user: person.external_id,
            record,
        })
    }

    /// Compare-and-set write of the pair's state.
    async fn write(
        &self,
        target: &mut Target,
        state: MemberState,
        last_error: Option<&str>,
    ) -> Result<()> {
        let written = {
            let db = self.db.lock().await;
            db.write_membership(target.pair, target.record.version, state, last_error)
        };
        apply_write(target, written)
    }

    /// [`Self::write`] that also replaces the stored invitation.
    async fn write_invitation(
        &self,
        target: &mut Target,
        state: MemberState,
        last_error: Option<&str>,
        invitation: Option<&str>,
    ) -> Result<()> {
        let written = {
            let db = self.db.lock().await;
            db.write_membership_invitation(
                target.pair,
                target.record.version,
                state,
                last_error,
                invitation,
            )
        };
        apply_write(target, written)
    }
}

/// Adopt a successful compare-and-set write. A lost race means someone else
/// changed the pair behind our lease; the pass re-reads and re-diffs.
fn apply_write(
    target: &mut Target,
    written: std::result::Result<MembershipRecord, StoreError>,
) -> Result<()> {
    match written {
        Ok(record) => {
            target.record = record;
            Ok(())
        }
        Err(StoreError::StaleVersion { pair, expected }) => Err(SyncError::Inconsistent(format!(
            "membership {pair} changed concurrently (expected version {expected})"
        ))
        .into()),
        Err(e) => Err(e.into()),
    }
}

fn sync_error(chat: ExternalChatId, failure: &CallFailure) -> SyncError {
    let message = failure.error.to_string();
    match failure.class {
        FailureClass::Transient => SyncError::Transient {
            attempts: failure.attempts,
            message,
        },
        FailureClass::Permission => SyncError::InsufficientPrivilege(chat),
        FailureClass::NotFound => SyncError::NotFound(message),
        FailureClass::Inconsistent => SyncError::Inconsistent(message),
    }
}

/// New cached state after observing `presence` for a pair cached as `current`.
fn corrected_state(current: MemberState, presence: Presence) -> MemberState {
    match (current, presence) {
        (_, Presence::Excluded) => MemberState::PartiallyRemoved,
        (_, Presence::Member) => MemberState::Member,
        // Not joined yet.
        (MemberState::Invited, Presence::Absent) => MemberState::Invited,
        (MemberState::Member, Presence::Absent) => MemberState::Absent,
        // The exclusion was lifted.
        (MemberState::PartiallyRemoved, Presence::Absent) => MemberState::Removed,
        (state, Presence::Absent) => state,
    }
}

fn failure_outcome(class: FailureClass) -> AuditOutcome {
    match class {
        FailureClass::Transient => AuditOutcome::Transient,
        FailureClass::Permission => AuditOutcome::Permission,
        FailureClass::NotFound => AuditOutcome::NotFound,
        FailureClass::Inconsistent => AuditOutcome::Inconsistent,
    }
}

fn settled_entry<T>(entry: AuditEntry, outcome: AuditOutcome, settled: &Settled<T>) -> AuditEntry {
    let entry = AuditEntry { outcome, ..entry }.attempt(settled.attempt);
    if settled.observed {
        entry.detail("confirmed by observation after timeout")
    } else {
        entry
    }
}
