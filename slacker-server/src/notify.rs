//! Direct-message delivery: real-time notifications on the event path and a
//! periodic sweep for morning reminders.
//!
//! Whether a message may go out is decided by pure functions over the user's
//! preferences and the current time. Presence is checked last, and a user
//! who is away has the notification deferred to a later tick.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use slacker_core::message::{daily_reminder_text, notification_text};
use slacker_core::{Assignee, ItemKey, ReviewStatus, ThreadRef, TrackedItem, UserPreferences};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::slack::{MessagingApi, Presence};
use crate::store::StateStore;

/// Morning reminders go out during this local hour.
pub const DAILY_WINDOW_START_HOUR: u32 = 8;
pub const DAILY_WINDOW_END_HOUR: u32 = 9;
/// Minimum gap, in hours, between any message and a morning reminder.
pub const DAILY_QUIET_PERIOD_HOURS: i64 = 8;
pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

/// Outcome of the preference checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Deliver,
    Disabled,
    TooSoon,
    OutsideWindow,
    QuietPeriod,
}

fn too_soon(prefs: &UserPreferences, now: DateTime<Utc>) -> bool {
    prefs
        .last_notified
        .is_some_and(|last| now.signed_duration_since(last) < prefs.notify_delay.as_duration())
}

pub fn gate_realtime(prefs: &UserPreferences, now: DateTime<Utc>) -> Gate {
    if !prefs.real_time_notifications {
        Gate::Disabled
    } else if too_soon(prefs, now) {
        Gate::TooSoon
    } else {
        Gate::Deliver
    }
}

pub fn gate_daily(prefs: &UserPreferences, now: DateTime<Utc>) -> Gate {
    if !prefs.daily_reminders {
        return Gate::Disabled;
    }
    if too_soon(prefs, now) {
        return Gate::TooSoon;
    }
    let hour = now.with_timezone(&prefs.tz()).hour();
    if !(DAILY_WINDOW_START_HOUR..DAILY_WINDOW_END_HOUR).contains(&hour) {
        return Gate::OutsideWindow;
    }
    if prefs
        .last_notified
        .is_some_and(|last| now.signed_duration_since(last) < chrono::Duration::hours(DAILY_QUIET_PERIOD_HOURS))
    {
        return Gate::QuietPeriod;
    }
    Gate::Deliver
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Suppressed(Gate),
    /// The user was not active; retried on a later tick.
    Deferred,
    /// Teams and users with no chat account are never messaged.
    Skipped,
}

pub struct NotificationScheduler {
    store: Arc<StateStore>,
    messaging: Arc<dyn MessagingApi>,
    /// Tracking login -> chat user id.
    directory: HashMap<String, String>,
    tick: Duration,
    /// (tenant, login, item) triples waiting for the user to come back.
    deferred: Mutex<HashSet<(String, String, ItemKey)>>,
}

impl NotificationScheduler {
    pub fn new(
        store: Arc<StateStore>,
        messaging: Arc<dyn MessagingApi>,
        directory: HashMap<String, String>,
    ) -> Self {
        Self {
            store,
            messaging,
            directory,
            tick: DEFAULT_TICK,
            deferred: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    async fn is_active(&self, chat_user: &str) -> bool {
        match self.messaging.presence(chat_user).await {
            Ok(presence) => presence == Presence::Active,
            Err(e) => {
                warn!("Presence lookup for {} failed, treating as away: {}", chat_user, e);
                false
            }
        }
    }

    /// Tell `assignee` that `item` is now waiting on them, if their
    /// preferences and presence allow it right now.
    pub async fn notify_user(
        &self,
        tenant: &str,
        assignee: &Assignee,
        item: &TrackedItem,
    ) -> Result<Delivery> {
        let Some(login) = assignee.login() else {
            debug!("Not messaging team {}", assignee);
            return Ok(Delivery::Skipped);
        };
        let Some(chat_user) = self.directory.get(login) else {
            debug!("No chat account known for {}", login);
            return Ok(Delivery::Skipped);
        };

        let prefs = self.store.user_preferences(tenant, login).await;
        let gate = gate_realtime(&prefs, Utc::now());
        if gate != Gate::Deliver {
            debug!("Not notifying {} about {}: {:?}", login, item.key(), gate);
            return Ok(Delivery::Suppressed(gate));
        }

        if !self.is_active(chat_user).await {
            debug!("{} is away, deferring notification about {}", login, item.key());
            self.deferred
                .lock()
                .await
                .insert((tenant.to_string(), login.to_string(), item.key()));
            return Ok(Delivery::Deferred);
        }

        self.messaging
            .send_direct_message(chat_user, &notification_text(item))
            .await
            .with_context(|| format!("Failed to notify {} about {}", login, item.key()))?;

        // Already sent: failures to record it are logged, never retried.
        if let Err(e) = self.store.touch_last_notified(tenant, login).await {
            warn!("Failed to record notification to {}: {:#}", login, e);
        }
        if let Err(e) = self.store.touch_item_notified(tenant, &item.key()).await {
            warn!("Failed to record notification about {}: {:#}", item.key(), e);
        }
        info!("Notified {} about {}", login, item.key());
        Ok(Delivery::Sent)
    }

    pub async fn send_thread_update(&self, thread: &ThreadRef, text: &str) -> Result<()> {
        self.messaging
            .post_reply(thread, text)
            .await
            .with_context(|| format!("Failed to reply in thread {}/{}", thread.channel, thread.ts))
    }

    pub async fn update_thread_reaction(&self, thread: &ThreadRef, status: ReviewStatus) -> Result<()> {
        self.messaging
            .set_reaction(thread, status)
            .await
            .with_context(|| format!("Failed to update reaction on {}/{}", thread.channel, thread.ts))
    }

    /// Re-evaluate notifications deferred because the user was away. Entries
    /// are dropped once sent, once no longer relevant, or when notifications
    /// were turned off.
    pub async fn retry_deferred(&self) -> usize {
        let pending: Vec<_> = self.deferred.lock().await.drain().collect();
        let mut sent = 0;

        for (tenant, login, key) in pending {
            let still_waiting = self
                .store
                .item(&tenant, &key)
                .await
                .filter(|item| item.status.is_open() && item.is_blocked_on(&login));
            let Some(item) = still_waiting else {
                debug!("Dropping deferred notification for {} about {}", login, key);
                continue;
            };

            let outcome = self.notify_user(&tenant, &Assignee::user(login.clone()), &item).await;
            match outcome {
                Ok(Delivery::Sent) => sent += 1,
                // Away again: notify_user put it back.
                Ok(Delivery::Deferred) => {}
                Ok(Delivery::Suppressed(Gate::TooSoon)) => {
                    self.deferred.lock().await.insert((tenant, login, key));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("{:#}", e);
                    self.deferred.lock().await.insert((tenant, login, key));
                }
            }
        }
        sent
    }

    /// Send morning reminders to everyone in `tenant` who is due one.
    pub async fn send_daily_reminders(&self, tenant: &str, now: DateTime<Utc>) -> usize {
        let mut sent = 0;
        for login in self.store.blocked_users(tenant).await {
            let Some(chat_user) = self.directory.get(&login) else {
                continue;
            };
            let prefs = self.store.user_preferences(tenant, &login).await;
            if gate_daily(&prefs, now) != Gate::Deliver {
                continue;
            }

            let items: Vec<TrackedItem> = self
                .store
                .items_for_user(tenant, &login)
                .await
                .into_iter()
                .filter(|item| item.status.is_open())
                .collect();
            if items.is_empty() {
                continue;
            }
            if !self.is_active(chat_user).await {
                debug!("{} is away, skipping morning reminder for now", login);
                continue;
            }

            let refs: Vec<&TrackedItem> = items.iter().collect();
            match self
                .messaging
                .send_direct_message(chat_user, &daily_reminder_text(&refs))
                .await
            {
                Ok(()) => {
                    if let Err(e) = self.store.touch_last_notified(tenant, &login).await {
                        warn!("Failed to record morning reminder to {}: {:#}", login, e);
                    }
                    info!("Sent morning reminder to {} ({} items)", login, items.len());
                    sent += 1;
                }
                Err(e) => warn!("Failed to send morning reminder to {}: {}", login, e),
            }
        }
        sent
    }

    pub async fn check_notifications(&self) {
        let retried = self.retry_deferred().await;
        if retried > 0 {
            info!("Delivered {} deferred notification(s)", retried);
        }

        let now = Utc::now();
        for tenant in self.store.tenants().await {
            self.send_daily_reminders(&tenant, now).await;
        }
    }

    /// Tick until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Notification scheduler started (every {:?})", self.tick);
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Notification scheduler stopping");
                    return;
                }
                _ = ticker.tick() => self.check_notifications().await,
            }
        }
    }
}
