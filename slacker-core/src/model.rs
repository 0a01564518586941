//! Domain model shared by the store, the resolver and the notifier.
//!
//! Everything here is plain data: the per-tenant record that gets persisted,
//! the tracked pull requests inside it, user preferences, and the small
//! identifier types used as map keys.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Textual form prefix distinguishing teams from individual users.
pub const TEAM_PREFIX: &str = "team:";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid repository identifier {0:?}, expected <owner>/<name>")]
    InvalidRepo(String),
    #[error("invalid assignee {0:?}")]
    InvalidAssignee(String),
    #[error("unsupported notification delay of {0} minutes")]
    InvalidDelay(u64),
}

/// Repository coordinates as carried in event envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `<owner>/<name>`. Exactly two non-empty segments are accepted.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {
                Ok(Self::new(owner, name))
            }
            _ => Err(ParseError::InvalidRepo(s.to_string())),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Composite key `owner/repo#number` for one pull request within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(pub String);

impl ItemKey {
    pub fn new(owner: &str, repo: &str, number: u64) -> Self {
        Self(format!("{}/{}#{}", owner, repo, number))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Someone a pull request is currently waiting on.
///
/// Serialized as the login for users and `team:<slug>` for teams, which is
/// also the key used by the reverse index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Assignee {
    User(String),
    Team(String),
}

impl Assignee {
    pub fn user(login: impl Into<String>) -> Self {
        Self::User(login.into())
    }

    pub fn team(slug: impl Into<String>) -> Self {
        Self::Team(slug.into())
    }

    /// The login of an individual user; `None` for teams.
    pub fn login(&self) -> Option<&str> {
        match self {
            Self::User(login) => Some(login),
            Self::Team(_) => None,
        }
    }
}

impl fmt::Display for Assignee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(login) => write!(f, "{}", login),
            Self::Team(slug) => write!(f, "{}{}", TEAM_PREFIX, slug),
        }
    }
}

impl FromStr for Assignee {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(TEAM_PREFIX) {
            Some(slug) if !slug.is_empty() => Ok(Self::Team(slug.to_string())),
            None if !s.is_empty() => Ok(Self::User(s.to_string())),
            _ => Err(ParseError::InvalidAssignee(s.to_string())),
        }
    }
}

impl From<Assignee> for String {
    fn from(assignee: Assignee) -> Self {
        assignee.to_string()
    }
}

impl TryFrom<String> for Assignee {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Derived review status of a pull request. Each status has exactly one label
/// and one reaction emoji.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReviewStatus {
    Merged,
    ClosedUnmerged,
    ChecksRunning,
    ChecksFailed,
    ChangesRequested,
    Approved,
    AwaitingReview,
}

impl ReviewStatus {
    pub const ALL: [ReviewStatus; 7] = [
        Self::Merged,
        Self::ClosedUnmerged,
        Self::ChecksRunning,
        Self::ChecksFailed,
        Self::ChangesRequested,
        Self::Approved,
        Self::AwaitingReview,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Merged => "merged",
            Self::ClosedUnmerged => "closed-unmerged",
            Self::ChecksRunning => "checks-running",
            Self::ChecksFailed => "checks-failed",
            Self::ChangesRequested => "changes-requested",
            Self::Approved => "approved",
            Self::AwaitingReview => "awaiting-review",
        }
    }

    /// Reaction placed on the pull request's thread.
    pub fn emoji(self) -> &'static str {
        match self {
            Self::Merged => "pray",
            Self::ClosedUnmerged => "face_palm",
            Self::ChecksRunning => "test_tube",
            Self::ChecksFailed => "broken_heart",
            Self::ChangesRequested => "carpentry_saw",
            Self::Approved => "white_check_mark",
            Self::AwaitingReview => "hourglass",
        }
    }

    /// What the blocked user is expected to do, phrased for a notification.
    pub fn action(self) -> &'static str {
        match self {
            Self::ChecksFailed => "waiting for you to fix tests",
            Self::AwaitingReview => "waiting for your review",
            Self::ChangesRequested => "waiting for you to address review feedback",
            Self::Approved => "approved and ready to merge",
            _ => "needs your attention",
        }
    }

    pub fn is_open(self) -> bool {
        !matches!(self, Self::Merged | Self::ClosedUnmerged)
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Quiet interval after a notification, restricted to the values the
/// settings surface offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u64", try_from = "u64")]
pub enum NotifyDelay {
    Minutes15,
    #[default]
    Minutes30,
    Minutes60,
    Minutes120,
}

impl NotifyDelay {
    pub fn minutes(self) -> u64 {
        match self {
            Self::Minutes15 => 15,
            Self::Minutes30 => 30,
            Self::Minutes60 => 60,
            Self::Minutes120 => 120,
        }
    }

    pub fn as_duration(self) -> chrono::Duration {
        chrono::Duration::minutes(self.minutes() as i64)
    }
}

impl From<NotifyDelay> for u64 {
    fn from(delay: NotifyDelay) -> Self {
        delay.minutes()
    }
}

impl TryFrom<u64> for NotifyDelay {
    type Error = ParseError;

    fn try_from(minutes: u64) -> Result<Self, Self::Error> {
        match minutes {
            15 => Ok(Self::Minutes15),
            30 => Ok(Self::Minutes30),
            60 => Ok(Self::Minutes60),
            120 => Ok(Self::Minutes120),
            other => Err(ParseError::InvalidDelay(other)),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Per-user notification settings within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    #[serde(default)]
    pub last_notified: Option<DateTime<Utc>>,
    /// IANA zone name; empty or unknown names behave as UTC.
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub notify_delay: NotifyDelay,
    #[serde(default = "default_true")]
    pub real_time_notifications: bool,
    #[serde(default = "default_true")]
    pub daily_reminders: bool,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            last_notified: None,
            timezone: String::new(),
            notify_delay: NotifyDelay::default(),
            real_time_notifications: true,
            daily_reminders: true,
        }
    }
}

impl UserPreferences {
    pub fn tz(&self) -> Tz {
        self.timezone.parse::<Tz>().unwrap_or(Tz::UTC)
    }
}

/// Where a pull request's announcement lives on the messaging surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRef {
    pub channel: String,
    pub ts: String,
}

/// One pull request as tracked by the bot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedItem {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub title: String,
    pub author: String,
    pub status: ReviewStatus,
    #[serde(default)]
    pub blocked_on: Vec<Assignee>,
    /// Set once when the announcement thread is created, then never replaced.
    #[serde(default)]
    pub thread: Option<ThreadRef>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub last_notified: Option<DateTime<Utc>>,
}

impl TrackedItem {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(&self.owner, &self.repo, self.number)
    }

    pub fn url(&self) -> String {
        format!(
            "https://github.com/{}/{}/pull/{}",
            self.owner, self.repo, self.number
        )
    }

    pub fn is_blocked_on(&self, identity: &str) -> bool {
        self.blocked_on.iter().any(|a| a.to_string() == identity)
    }
}

/// Everything persisted for one tenant: one snapshot file per record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantData {
    pub tenant_id: String,
    #[serde(default, deserialize_with = "lenient_users")]
    pub users: BTreeMap<String, UserPreferences>,
    #[serde(default)]
    pub items: BTreeMap<ItemKey, TrackedItem>,
    /// Reverse index: identity -> keys of items currently blocked on it.
    #[serde(default)]
    pub user_items: BTreeMap<String, Vec<ItemKey>>,
    pub last_updated: DateTime<Utc>,
}

/// Decodes preference records one at a time, dropping any that fail so a
/// single bad record does not take the rest of the tenant down with it.
fn lenient_users<'de, D>(deserializer: D) -> Result<BTreeMap<String, UserPreferences>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Record {
        Valid(UserPreferences),
        Invalid(serde::de::IgnoredAny),
    }

    let raw = BTreeMap::<String, Record>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(user, record)| match record {
            Record::Valid(prefs) => Some((user, prefs)),
            Record::Invalid(_) => {
                tracing::warn!("Dropping undecodable preferences for {}", user);
                None
            }
        })
        .collect())
}

impl TenantData {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            users: BTreeMap::new(),
            items: BTreeMap::new(),
            user_items: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }

    /// Insert or replace an item and bring the reverse index in line with its
    /// attribution. Identities no longer blocking the item lose the key, and
    /// identities whose list becomes empty are dropped. Returns the previous
    /// version of the item.
    pub fn upsert_item(&mut self, item: TrackedItem) -> Option<TrackedItem> {
        let key = item.key();
        let blocked_on = item.blocked_on.clone();
        let previous = self.items.insert(key.clone(), item);

        if let Some(prev) = &previous {
            for lifted in prev.blocked_on.iter().filter(|a| !blocked_on.contains(a)) {
                let identity = lifted.to_string();
                if let Some(keys) = self.user_items.get_mut(&identity) {
                    keys.retain(|k| k != &key);
                    if keys.is_empty() {
                        self.user_items.remove(&identity);
                    }
                }
            }
        }

        for assignee in &blocked_on {
            let keys = self.user_items.entry(assignee.to_string()).or_default();
            if !keys.contains(&key) {
                keys.push(key.clone());
            }
        }

        self.last_updated = Utc::now();
        previous
    }

    /// Items currently attributed to `identity`, in the order they were first
    /// attributed.
    pub fn items_for(&self, identity: &str) -> Vec<&TrackedItem> {
        self.user_items
            .get(identity)
            .map(|keys| keys.iter().filter_map(|k| self.items.get(k)).collect())
            .unwrap_or_default()
    }

    pub fn preferences(&self, identity: &str) -> UserPreferences {
        self.users.get(identity).cloned().unwrap_or_default()
    }
}
