//! A scripted, in-memory [`ChatApi`] for tests.
//!
//! The fake keeps its own view of who is in which chat, so admitting,
//! excluding and releasing behave like the real platform would: an excluded
//! person cannot be admitted until released. In invite-only mode admission
//! hands out single-use invitations that stay usable until accepted or
//! revoked. Failures can be queued per call kind and are returned before the
//! call takes any effect.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use rolesync_shared::{AgentRights, ExternalChatId, ExternalUserId};

use crate::api::{AdmitOutcome, ApiError, ChatApi, Presence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    CheckRights,
    Admit,
    Revoke,
    Exclude,
    Release,
    Observe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    pub kind: CallKind,
    pub chat: ExternalChatId,
    pub user: Option<ExternalUserId>,
}

struct Invitation {
    chat: ExternalChatId,
    user: ExternalUserId,
    usable: bool,
}

struct State {
    rights: HashMap<ExternalChatId, AgentRights>,
    presence: HashMap<(ExternalChatId, ExternalUserId), Presence>,
    invite_only: bool,
    invitations: HashMap<String, Invitation>,
    issued: u64,
    failures: HashMap<CallKind, VecDeque<ApiError>>,
    calls: Vec<Call>,
}

pub struct FakeChatApi {
    state: Mutex<State>,
}

impl Default for FakeChatApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeChatApi {
    /// Agent is administrator everywhere; admission joins directly.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                rights: HashMap::new(),
                presence: HashMap::new(),
                invite_only: false,
                invitations: HashMap::new(),
                issued: 0,
                failures: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_rights(&self, chat: ExternalChatId, rights: AgentRights) {
        self.state().rights.insert(chat, rights);
    }

    /// Admit by invitation instead of adding the person directly.
    pub fn set_invite_only(&self, invite_only: bool) {
        self.state().invite_only = invite_only;
    }

    /// Queue a failure for the next call of `kind`.
    pub fn push_failure(&self, kind: CallKind, error: ApiError) {
        self.state()
            .failures
            .entry(kind)
            .or_default()
            .push_back(error);
    }

    /// Queue `times` network failures for `kind`.
    pub fn fail_next(&self, kind: CallKind, times: usize) {
        for _ in 0..times {
            self.push_failure(kind, ApiError::Network("connection reset".into()));
        }
    }

    pub fn set_presence(&self, chat: ExternalChatId, user: ExternalUserId, presence: Presence) {
        self.state().presence.insert((chat, user), presence);
    }

    /// The person tries to join through an invitation they were sent.
    /// Returns whether a usable invitation let them in; it is spent either
    /// way the join goes.
    pub fn join(&self, chat: ExternalChatId, user: ExternalUserId) -> bool {
        let mut guard = self.state();
        let state = &mut *guard;
        if state.presence.get(&(chat, user)) == Some(&Presence::Excluded) {
            return false;
        }
        let invitation = state
            .invitations
            .values_mut()
            .find(|i| i.usable && i.chat == chat && i.user == user);
        match invitation {
            Some(invitation) => {
                invitation.usable = false;
                state.presence.insert((chat, user), Presence::Member);
                true
            }
            None => false,
        }
    }

    /// Invitations for the pair that could still be used to join.
    pub fn usable_invitations(&self, chat: ExternalChatId, user: ExternalUserId) -> usize {
        self.state()
            .invitations
            .values()
            .filter(|i| i.usable && i.chat == chat && i.user == user)
            .count()
    }

    pub fn presence(&self, chat: ExternalChatId, user: ExternalUserId) -> Presence {
        self.state()
            .presence
            .get(&(chat, user))
            .copied()
            .unwrap_or(Presence::Absent)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.state().calls.iter().filter(|c| c.kind == kind).count()
    }

    pub fn count_for(&self, kind: CallKind, chat: ExternalChatId) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.kind == kind && c.chat == chat)
            .count()
    }

    /// Log the call and pop a queued failure for it, if any.
    fn begin(
        &self,
        kind: CallKind,
        chat: ExternalChatId,
        user: Option<ExternalUserId>,
    ) -> Result<std::sync::MutexGuard<'_, State>, ApiError> {
        let mut state = self.state();
        state.calls.push(Call { kind, chat, user });
        match state.failures.get_mut(&kind).and_then(|q| q.pop_front()) {
            Some(error) => Err(error),
            None => Ok(state),
        }
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn check_agent_rights(&self, chat: ExternalChatId) -> Result<AgentRights, ApiError> {
        let state = self.begin(CallKind::CheckRights, chat, None)?;
        Ok(state
            .rights
            .get(&chat)
            .copied()
            .unwrap_or(AgentRights::Administrator))
    }

    async fn admit(
        &self,
        chat: ExternalChatId,
        user: ExternalUserId,
    ) -> Result<AdmitOutcome, ApiError> {
        let mut state = self.begin(CallKind::Admit, chat, Some(user))?;
        match state.presence.get(&(chat, user)) {
            Some(Presence::Excluded) => Err(ApiError::Rejected("user is banned".into())),
            _ if state.invite_only => {
                state.issued += 1;
                let invitation = format!("invite-{}", state.issued);
                state.invitations.insert(
                    invitation.clone(),
                    Invitation {
                        chat,
                        user,
                        usable: true,
                    },
                );
                Ok(AdmitOutcome::Invited { invitation })
            }
            _ => {
                state.presence.insert((chat, user), Presence::Member);
                Ok(AdmitOutcome::Joined)
            }
        }
    }

    async fn revoke_invitation(
        &self,
        chat: ExternalChatId,
        invitation: &str,
    ) -> Result<(), ApiError> {
        let mut state = self.begin(CallKind::Revoke, chat, None)?;
        if let Some(issued) = state.invitations.get_mut(invitation) {
            issued.usable = false;
        }
        Ok(())
    }

    async fn exclude_member(
        &self,
        chat: ExternalChatId,
        user: ExternalUserId,
    ) -> Result<(), ApiError> {
        let mut state = self.begin(CallKind::Exclude, chat, Some(user))?;
        state.presence.insert((chat, user), Presence::Excluded);
        Ok(())
    }

    async fn release_exclusion(
        &self,
        chat: ExternalChatId,
        user: ExternalUserId,
    ) -> Result<(), ApiError> {
        let mut state = self.begin(CallKind::Release, chat, Some(user))?;
        if state.presence.get(&(chat, user)) == Some(&Presence::Excluded) {
            state.presence.insert((chat, user), Presence::Absent);
        }
        Ok(())
    }

    async fn observe_member(
        &self,
        chat: ExternalChatId,
        user: ExternalUserId,
    ) -> Result<Presence, ApiError> {
        let state = self.begin(CallKind::Observe, chat, Some(user))?;
        Ok(state
            .presence
            .get(&(chat, user))
            .copied()
            .unwrap_or(Presence::Absent))
    }
}
