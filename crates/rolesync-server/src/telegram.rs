//! [`ChatApi`] over the Telegram Bot API.
//!
//! Admission sends the person a single-use, expiring invite link, so a
//! successful admit always yields [`AdmitOutcome::Invited`] carrying the
//! link; the engine promotes the pair once an observation shows the person
//! joined, and revokes the link when the pair is evicted. A link whose
//! delivery fails is revoked on the spot. Exclusion is a ban and release is
//! an unban restricted to banned users, which never kicks a current member.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use rolesync_engine::{AdmitOutcome, ApiError, ChatApi, Presence};
use rolesync_shared::{AgentRights, ExternalChatId, ExternalUserId};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

pub struct TelegramChatApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
    bot_id: ExternalUserId,
    invite_ttl: Duration,
}

/// Every Bot API response is wrapped in this envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
    /// Only present for `restricted` members.
    #[serde(default)]
    is_member: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ChatInviteLink {
    invite_link: String,
}

impl TelegramChatApi {
    pub fn new(
        base_url: &str,
        token: &str,
        timeout: Duration,
        invite_ttl: Duration,
    ) -> anyhow::Result<Self> {
        let bot_id = parse_bot_id(token).context("BOT_TOKEN is not a valid bot token")?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            bot_id,
            invite_ttl,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, ApiError> {
        let url = format!("{}/bot{}/{}", self.base_url, self.token, method);
        let response = self
            .client
            .post(&url)
            .json(&params)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let envelope: Envelope<T> = response.json().await.map_err(|e| {
            if status.is_server_error() {
                ApiError::Network(format!("{method}: HTTP {status}"))
            } else {
                ApiError::Network(format!("{method}: unreadable response: {}", e.without_url()))
            }
        })?;

        if envelope.ok {
            return envelope
                .result
                .ok_or_else(|| ApiError::Network(format!("{method}: response without result")));
        }

        let description = envelope
            .description
            .unwrap_or_else(|| format!("HTTP {status}"));
        let retry_after = envelope.parameters.and_then(|p| p.retry_after);
        tracing::debug!(method, %status, description = %description, "bot api call failed");
        Err(api_error(status, description, retry_after))
    }

    async fn get_member(
        &self,
        chat: ExternalChatId,
        user: ExternalUserId,
    ) -> Result<ChatMember, ApiError> {
        self.call(
            "getChatMember",
            json!({ "chat_id": chat.0, "user_id": user.0 }),
        )
        .await
    }
}

#[async_trait]
impl ChatApi for TelegramChatApi {
    async fn check_agent_rights(&self, chat: ExternalChatId) -> Result<AgentRights, ApiError> {
        let member = self.get_member(chat, self.bot_id).await?;
        Ok(agent_rights(&member.status))
    }

    async fn admit(
        &self,
        chat: ExternalChatId,
        user: ExternalUserId,
    ) -> Result<AdmitOutcome, ApiError> {
        let link: ChatInviteLink = self
            .call(
                "createChatInviteLink",
                invite_params(chat, user, Utc::now().timestamp(), self.invite_ttl),
            )
            .await?;

        let sent: Result<serde_json::Value, ApiError> = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": user.0,
                    "text": format!("You have been granted access. Join here: {}", link.invite_link),
                }),
            )
            .await;
        let error = match sent {
            Ok(_) => {
                return Ok(AdmitOutcome::Invited {
                    invitation: link.invite_link,
                })
            }
            // The bot cannot reach the person. That says nothing about the
            // bot's rights in the target chat.
            Err(ApiError::Forbidden(reason)) => {
                ApiError::Rejected(format!("cannot deliver invite to user {user}: {reason}"))
            }
            Err(e) => e,
        };

        // The message may still have gone out; the link must not outlive
        // the failed admission.
        if let Err(e) = self.revoke_invitation(chat, &link.invite_link).await {
            tracing::warn!(chat = %chat, error = %e, "failed to revoke undelivered invite link");
        }
        Err(error)
    }

    async fn revoke_invitation(
        &self,
        chat: ExternalChatId,
        invitation: &str,
    ) -> Result<(), ApiError> {
        let _: ChatInviteLink = self
            .call(
                "revokeChatInviteLink",
                json!({ "chat_id": chat.0, "invite_link": invitation }),
            )
            .await?;
        Ok(())
    }

    async fn exclude_member(
        &self,
        chat: ExternalChatId,
        user: ExternalUserId,
    ) -> Result<(), ApiError> {
        let _: bool = self
            .call(
                "banChatMember",
                json!({ "chat_id": chat.0, "user_id": user.0, "revoke_messages": false }),
            )
            .await?;
        Ok(())
    }

    async fn release_exclusion(
        &self,
        chat: ExternalChatId,
        user: ExternalUserId,
    ) -> Result<(), ApiError> {
        let _: bool = self
            .call(
                "unbanChatMember",
                json!({ "chat_id": chat.0, "user_id": user.0, "only_if_banned": true }),
            )
            .await?;
        Ok(())
    }

    async fn observe_member(
        &self,
        chat: ExternalChatId,
        user: ExternalUserId,
    ) -> Result<Presence, ApiError> {
        let member = self.get_member(chat, user).await?;
        Ok(presence(&member))
    }
}

fn invite_params(
    chat: ExternalChatId,
    user: ExternalUserId,
    now: i64,
    ttl: Duration,
) -> serde_json::Value {
    json!({
        "chat_id": chat.0,
        "name": format!("rolesync {user}"),
        "member_limit": 1,
        "expire_date": now + ttl.as_secs() as i64,
    })
}

/// Bot tokens look like `<bot id>:<secret>`.
fn parse_bot_id(token: &str) -> Option<ExternalUserId> {
    let (id, secret) = token.split_once(':')?;
    if secret.is_empty() {
        return None;
    }
    id.parse().ok().map(ExternalUserId)
}

fn agent_rights(status: &str) -> AgentRights {
    match status {
        "creator" | "administrator" => AgentRights::Administrator,
        "member" | "restricted" => AgentRights::Member,
        _ => AgentRights::None,
    }
}

fn presence(member: &ChatMember) -> Presence {
    match member.status.as_str() {
        "creator" | "administrator" | "member" => Presence::Member,
        "restricted" if member.is_member.unwrap_or(false) => Presence::Member,
        "kicked" => Presence::Excluded,
        _ => Presence::Absent,
    }
}

fn api_error(status: StatusCode, description: String, retry_after: Option<u64>) -> ApiError {
    let lower = description.to_lowercase();
    match status {
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited {
            retry_after: retry_after.map(Duration::from_secs),
        },
        StatusCode::FORBIDDEN => ApiError::Forbidden(description),
        StatusCode::UNAUTHORIZED => ApiError::Forbidden(description),
        _ if lower.contains("not enough rights") || lower.contains("not an administrator") => {
            ApiError::Forbidden(description)
        }
        _ if lower.contains("not found") || lower.contains("participant_id_invalid") => {
            ApiError::NotFound(description)
        }
        s if s.is_server_error() => ApiError::Network(description),
        _ => ApiError::Rejected(description),
    }
}

fn transport_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else {
        // The URL carries the bot token.
        ApiError::Network(e.without_url().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_id_comes_from_the_token() {
        assert_eq!(
            parse_bot_id("123456:AAE-secret"),
            Some(ExternalUserId(123456))
        );
        assert_eq!(parse_bot_id("123456"), None);
        assert_eq!(parse_bot_id("abc:secret"), None);
        assert_eq!(parse_bot_id("123:"), None);
    }

    #[test]
    fn member_statuses() {
        assert_eq!(agent_rights("creator"), AgentRights::Administrator);
        assert_eq!(agent_rights("administrator"), AgentRights::Administrator);
        assert_eq!(agent_rights("restricted"), AgentRights::Member);
        assert_eq!(agent_rights("left"), AgentRights::None);

        let member = |status: &str, is_member| ChatMember {
            status: status.into(),
            is_member,
        };
        assert_eq!(presence(&member("member", None)), Presence::Member);
        assert_eq!(presence(&member("restricted", Some(true))), Presence::Member);
        assert_eq!(presence(&member("restricted", Some(false))), Presence::Absent);
        assert_eq!(presence(&member("left", None)), Presence::Absent);
        assert_eq!(presence(&member("kicked", None)), Presence::Excluded);
    }

    #[test]
    fn error_mapping() {
        assert_eq!(
            api_error(
                StatusCode::TOO_MANY_REQUESTS,
                "Too Many Requests: retry after 7".into(),
                Some(7)
            ),
            ApiError::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        assert!(matches!(
            api_error(StatusCode::FORBIDDEN, "Forbidden: bot was kicked".into(), None),
            ApiError::Forbidden(_)
        ));
        assert!(matches!(
            api_error(
                StatusCode::BAD_REQUEST,
                "Bad Request: not enough rights to restrict/unrestrict chat member".into(),
                None
            ),
            ApiError::Forbidden(_)
        ));
        assert!(matches!(
            api_error(StatusCode::BAD_REQUEST, "Bad Request: user not found".into(), None),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            api_error(StatusCode::BAD_GATEWAY, "Bad Gateway".into(), None),
            ApiError::Network(_)
        ));
        assert!(matches!(
            api_error(StatusCode::BAD_REQUEST, "Bad Request: USER_ID_INVALID".into(), None),
            ApiError::Rejected(_)
        ));
    }

    #[test]
    fn invite_links_are_single_use_and_expire() {
        let params = invite_params(
            ExternalChatId(-1001),
            ExternalUserId(42),
            1_700_000_000,
            Duration::from_secs(3600),
        );
        assert_eq!(params["chat_id"], -1001);
        assert_eq!(params["member_limit"], 1);
        assert_eq!(params["expire_date"], 1_700_003_600i64);
        assert_eq!(params["name"], "rolesync 42");
    }

    #[test]
    fn envelope_parsing() {
        let ok: Envelope<ChatMember> = serde_json::from_str(
            r#"{"ok":true,"result":{"status":"kicked","user":{"id":1},"until_date":0}}"#,
        )
        .unwrap();
        assert_eq!(presence(&ok.result.unwrap()), Presence::Excluded);

        let limited: Envelope<bool> = serde_json::from_str(
            r#"{"ok":false,"error_code":429,"description":"Too Many Requests","parameters":{"retry_after":3}}"#,
        )
        .unwrap();
        assert!(!limited.ok);
        assert_eq!(limited.parameters.and_then(|p| p.retry_after), Some(3));
    }
}
