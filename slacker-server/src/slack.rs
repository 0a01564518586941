//! Chat client: thread posts, replies, status reactions, direct messages
//! and presence lookups.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use slacker_core::message::status_emojis;
use slacker_core::{ReviewStatus, ThreadRef};
use std::time::Duration;
use tracing::{debug, warn};

use crate::retry::{with_retry, RemoteError, RetryPolicy, OPEN_CONVERSATION_RETRY, POST_RETRY};

pub const SLACK_API_BASE: &str = "https://slack.com/api";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Active,
    Away,
}

/// Write access to the chat surface.
#[async_trait]
pub trait MessagingApi: Send + Sync {
    /// Post a top-level message and return where it landed.
    async fn post_thread(&self, channel: &str, text: &str) -> Result<ThreadRef, RemoteError>;

    async fn post_reply(&self, thread: &ThreadRef, text: &str) -> Result<(), RemoteError>;

    /// Make `status`'s emoji the only status reaction on the thread.
    async fn set_reaction(&self, thread: &ThreadRef, status: ReviewStatus) -> Result<(), RemoteError>;

    async fn send_direct_message(&self, user: &str, text: &str) -> Result<(), RemoteError>;

    async fn presence(&self, user: &str) -> Result<Presence, RemoteError>;
}

/// Map a Slack error code onto the retry classification.
pub fn classify_slack_error(operation: &str, code: &str) -> RemoteError {
    match code {
        "ratelimited" | "rate_limited" | "internal_error" | "fatal_error"
        | "service_unavailable" | "request_timeout" => RemoteError::transient(operation, code),
        "channel_not_found" | "not_in_channel" | "user_not_found" | "users_not_found"
        | "thread_not_found" | "message_not_found" => RemoteError::not_found(operation, code),
        _ => RemoteError::permanent(operation, code),
    }
}

#[derive(Clone)]
pub struct SlackClient {
    client: Client,
    token: String,
    api_base: String,
    post_retry: RetryPolicy,
    open_retry: RetryPolicy,
}

impl SlackClient {
    pub fn new(token: String) -> Result<Self> {
        Self::with_base_url(token, SLACK_API_BASE)
    }

    pub fn with_base_url(token: String, api_base: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build Slack HTTP client")?;

        Ok(Self {
            client,
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
            post_retry: POST_RETRY,
            open_retry: OPEN_CONVERSATION_RETRY,
        })
    }

    /// One Web API call. Slack reports most failures as `ok: false` with a
    /// 200 status, so both layers are checked.
    async fn call(&self, method: &str, params: &[(&str, &str)]) -> Result<Value, RemoteError> {
        let url = format!("{}/{}", self.api_base, method);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .form(params)
            .send()
            .await
            .map_err(|e| RemoteError::from_reqwest(method, e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RemoteError::transient(method, "ratelimited"));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(method, status, &body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RemoteError::from_reqwest(method, e))?;

        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            Ok(body)
        } else {
            let code = body.get("error").and_then(Value::as_str).unwrap_or("unknown_error");
            Err(classify_slack_error(method, code))
        }
    }

    /// A call where one specific error code means the desired state already holds.
    async fn call_idempotent(
        &self,
        method: &str,
        params: &[(&str, &str)],
        already_done: &str,
    ) -> Result<(), RemoteError> {
        match self.call(method, params).await {
            Ok(_) => Ok(()),
            Err(RemoteError::Permanent { message, .. }) if message == already_done => {
                debug!("{} was a no-op ({})", method, already_done);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// [`Self::call_idempotent`] with transient failures retried.
    async fn call_idempotent_with_retry(
        &self,
        method: &str,
        params: &[(&str, &str)],
        already_done: &str,
    ) -> Result<(), RemoteError> {
        with_retry(&self.post_retry, method, || async move {
            self.call_idempotent(method, params, already_done).await
        })
        .await
    }

    async fn post_message(&self, channel: &str, text: &str, thread_ts: Option<&str>) -> Result<Value, RemoteError> {
        let mut params = vec![
            ("channel", channel),
            ("text", text),
            ("unfurl_links", "false"),
            ("unfurl_media", "false"),
        ];
        if let Some(ts) = thread_ts {
            params.push(("thread_ts", ts));
        }
        let params = &params;
        with_retry(&self.post_retry, "chat.postMessage", || async move {
            self.call("chat.postMessage", params).await
        })
        .await
    }

    async fn open_conversation(&self, user: &str) -> Result<String, RemoteError> {
        let body = with_retry(&self.open_retry, "conversations.open", || async move {
            self.call("conversations.open", &[("users", user)]).await
        })
        .await?;

        body.pointer("/channel/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::permanent("conversations.open", "response had no channel id"))
    }
}

#[async_trait]
impl MessagingApi for SlackClient {
    async fn post_thread(&self, channel: &str, text: &str) -> Result<ThreadRef, RemoteError> {
        let body = self.post_message(channel, text, None).await?;
        let ts = body
            .get("ts")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::permanent("chat.postMessage", "response had no ts"))?;
        let channel_id = body.get("channel").and_then(Value::as_str).unwrap_or(channel);

        Ok(ThreadRef {
            channel: channel_id.to_string(),
            ts: ts.to_string(),
        })
    }

    async fn post_reply(&self, thread: &ThreadRef, text: &str) -> Result<(), RemoteError> {
        self.post_message(&thread.channel, text, Some(&thread.ts)).await?;
        Ok(())
    }

    async fn set_reaction(&self, thread: &ThreadRef, status: ReviewStatus) -> Result<(), RemoteError> {
        let target = status.emoji();
        let on_thread = |name: &'static str| {
            [
                ("channel", thread.channel.as_str()),
                ("timestamp", thread.ts.as_str()),
                ("name", name),
            ]
        };

        for emoji in status_emojis().filter(|e| *e != target) {
            let removed = self
                .call_idempotent_with_retry("reactions.remove", &on_thread(emoji), "no_reaction")
                .await;
            if let Err(e) = removed {
                warn!("Failed to remove :{}: from {}/{}: {}", emoji, thread.channel, thread.ts, e);
            }
        }

        self.call_idempotent_with_retry("reactions.add", &on_thread(target), "already_reacted")
            .await
    }

    async fn send_direct_message(&self, user: &str, text: &str) -> Result<(), RemoteError> {
        let channel = self.open_conversation(user).await?;
        self.post_message(&channel, text, None).await?;
        Ok(())
    }

    async fn presence(&self, user: &str) -> Result<Presence, RemoteError> {
        let body = with_retry(&self.post_retry, "users.getPresence", || async move {
            self.call("users.getPresence", &[("user", user)]).await
        })
        .await?;
        match body.get("presence").and_then(Value::as_str) {
            Some("active") => Ok(Presence::Active),
            _ => Ok(Presence::Away),
        }
    }
}
