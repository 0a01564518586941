//! Ties incoming events to state: re-resolve the affected pull request,
//! persist the result, keep its thread up to date and notify whoever is
//! newly blocked.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use slacker_core::message::{review_reply, thread_text};
use slacker_core::{resolve, ItemKey, RepoRef, ThreadRef, TrackedItem};
use tracing::{debug, info, warn};

use crate::config::Routing;
use crate::github::{fetch_signals, TrackingApi};
use crate::ingest::{EventHandler, IncomingEvent};
use crate::notify::NotificationScheduler;
use crate::slack::MessagingApi;
use crate::store::StateStore;

#[derive(Debug, Deserialize)]
struct Login {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestRef {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    action: String,
    number: u64,
}

#[derive(Debug, Deserialize)]
struct ReviewPayload {
    user: Login,
    state: String,
}

#[derive(Debug, Deserialize)]
struct ReviewEvent {
    action: String,
    review: ReviewPayload,
    pull_request: PullRequestRef,
}

#[derive(Debug, Default, Deserialize)]
struct CheckTarget {
    #[serde(default)]
    pull_requests: Vec<PullRequestRef>,
}

#[derive(Debug, Deserialize)]
struct CheckEvent {
    #[serde(default)]
    check_run: Option<CheckTarget>,
    #[serde(default)]
    check_suite: Option<CheckTarget>,
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload).with_context(|| format!("Malformed {} payload", kind))
}

pub struct Coordinator {
    tracking: Arc<dyn TrackingApi>,
    messaging: Arc<dyn MessagingApi>,
    store: Arc<StateStore>,
    notifier: Arc<NotificationScheduler>,
    routing: Routing,
}

impl Coordinator {
    pub fn new(
        tracking: Arc<dyn TrackingApi>,
        messaging: Arc<dyn MessagingApi>,
        store: Arc<StateStore>,
        notifier: Arc<NotificationScheduler>,
        routing: Routing,
    ) -> Self {
        Self {
            tracking,
            messaging,
            store,
            notifier,
            routing,
        }
    }

    async fn handle_pull_request(&self, repo: &RepoRef, payload: Value) -> Result<()> {
        let event: PullRequestEvent = decode("pull_request", payload)?;
        let opened = matches!(event.action.as_str(), "opened" | "reopened");
        debug!("pull_request {} for #{}", event.action, event.number);
        self.refresh(repo, event.number, opened).await
    }

    async fn handle_review(&self, repo: &RepoRef, payload: Value) -> Result<()> {
        let event: ReviewEvent = decode("pull_request_review", payload)?;
        let tenant = self.routing.tenant_for(&repo.owner);
        let key = ItemKey::new(&repo.owner, &repo.name, event.pull_request.number);

        if event.action == "submitted" {
            let thread = self.store.item(&tenant, &key).await.and_then(|item| item.thread);
            if let Some(thread) = thread {
                let text = review_reply(&event.review.user.login, &event.review.state);
                if let Err(e) = self.notifier.send_thread_update(&thread, &text).await {
                    warn!("{:#}", e);
                }
            }
        }

        self.refresh(repo, event.pull_request.number, false).await
    }

    async fn handle_check(&self, kind: &str, repo: &RepoRef, payload: Value) -> Result<()> {
        let event: CheckEvent = decode(kind, payload)?;
        let target = event.check_run.or(event.check_suite).unwrap_or_default();
        if target.pull_requests.is_empty() {
            debug!("{} is not attached to any pull request", kind);
        }
        for pr in target.pull_requests {
            if let Err(e) = self.refresh(repo, pr.number, false).await {
                warn!("Failed to refresh {}#{} after {}: {:#}", repo, pr.number, kind, e);
            }
        }
        Ok(())
    }

    /// Re-resolve one pull request and push the outcome everywhere it shows.
    ///
    /// Untracked pull requests are only picked up when `opened` is set; other
    /// events for them are ignored.
    async fn refresh(&self, repo: &RepoRef, number: u64, opened: bool) -> Result<()> {
        let tenant = self.routing.tenant_for(&repo.owner);
        let key = ItemKey::new(&repo.owner, &repo.name, number);

        let lock = self.store.item_lock(&tenant, &key).await;
        let result = {
            let _guard = lock.lock().await;
            self.refresh_locked(repo, number, &tenant, &key, opened).await
        };
        drop(lock);
        self.store.release_item_lock(&tenant, &key).await;
        result
    }

    async fn refresh_locked(
        &self,
        repo: &RepoRef,
        number: u64,
        tenant: &str,
        key: &ItemKey,
        opened: bool,
    ) -> Result<()> {
        // Fail before any thread is posted for a tenant that cannot be saved.
        self.store.ensure_loaded(tenant).await?;

        let existing = self.store.item(tenant, key).await;
        if existing.is_none() && !opened {
            debug!("Ignoring event for untracked {}", key);
            return Ok(());
        }

        let (pr, signals) = fetch_signals(self.tracking.as_ref(), &repo.owner, &repo.name, number)
            .await
            .with_context(|| format!("Failed to fetch {}", key))?;
        let resolution = resolve(&signals);

        let previous_status = existing.as_ref().map(|item| item.status);
        let previous_blocked = existing
            .as_ref()
            .map(|item| item.blocked_on.clone())
            .unwrap_or_default();

        let mut item = TrackedItem {
            owner: repo.owner.clone(),
            repo: repo.name.clone(),
            number,
            title: pr.title,
            author: pr.author,
            status: resolution.status,
            blocked_on: resolution.blocked_on.clone(),
            thread: existing.as_ref().and_then(|item| item.thread.clone()),
            last_updated: Utc::now(),
            last_notified: existing.as_ref().and_then(|item| item.last_notified),
        };

        let mut announced = false;
        if item.thread.is_none() && opened {
            item.thread = self.announce(repo, &item).await;
            announced = item.thread.is_some();
        }

        self.store
            .set_item(tenant, item.clone())
            .await
            .with_context(|| format!("Failed to store {}", key))?;

        if previous_status != Some(item.status) {
            info!(
                "{} is now {} (blocked on {:?})",
                key,
                item.status,
                item.blocked_on.iter().map(ToString::to_string).collect::<Vec<_>>()
            );
            if let (Some(thread), false) = (&item.thread, announced) {
                if let Err(e) = self.notifier.update_thread_reaction(thread, item.status).await {
                    warn!("{:#}", e);
                }
            }
        }

        for assignee in resolution.newly_blocked(&previous_blocked) {
            match self.notifier.notify_user(tenant, &assignee, &item).await {
                Ok(delivery) => debug!("Notification to {}: {:?}", assignee, delivery),
                Err(e) => warn!("{:#}", e),
            }
        }
        Ok(())
    }

    /// Post the pull request's thread to the first configured channel that
    /// accepts it, and mark it with the current status.
    async fn announce(&self, repo: &RepoRef, item: &TrackedItem) -> Option<ThreadRef> {
        let channels = self.routing.channels_for(repo);
        if channels.is_empty() {
            debug!("No channels configured for {}", repo);
            return None;
        }

        let text = thread_text(&self.routing.prefix, item);
        for channel in channels {
            match self.messaging.post_thread(channel, &text).await {
                Ok(thread) => {
                    info!("Announced {} in {}", item.key(), channel);
                    if let Err(e) = self.notifier.update_thread_reaction(&thread, item.status).await {
                        warn!("{:#}", e);
                    }
                    return Some(thread);
                }
                Err(e) => warn!("Failed to announce {} in {}: {}", item.key(), channel, e),
            }
        }
        None
    }
}

#[async_trait]
impl EventHandler for Coordinator {
    async fn handle(&self, event: IncomingEvent) -> Result<()> {
        match event.kind.as_str() {
            "pull_request" => self.handle_pull_request(&event.repo, event.payload).await,
            "pull_request_review" => self.handle_review(&event.repo, event.payload).await,
            "check_run" | "check_suite" => {
                self.handle_check(&event.kind, &event.repo, event.payload).await
            }
            "push" if event.repo.name == ".github" => {
                info!(
                    "Configuration repository for {} changed; routing is read from the environment",
                    event.repo.owner
                );
                Ok(())
            }
            other => {
                debug!("Ignoring {} event", other);
                Ok(())
            }
        }
    }
}
