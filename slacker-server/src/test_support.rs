//! In-memory stand-ins for the remote services.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use slacker_core::{CheckRun, Review, ReviewStatus, ThreadRef};

use crate::github::{PullRequestSnapshot, TrackingApi};
use crate::retry::RemoteError;
use crate::slack::{MessagingApi, Presence};

#[derive(Default)]
pub struct FakeTracking {
    prs: Mutex<HashMap<u64, PullRequestSnapshot>>,
    checks: Mutex<HashMap<u64, Vec<CheckRun>>>,
    reviews: Mutex<HashMap<u64, Vec<Review>>>,
    fail_reviews: AtomicBool,
}

impl FakeTracking {
    pub fn open_pr(number: u64, author: &str, reviewers: &[&str]) -> PullRequestSnapshot {
        PullRequestSnapshot {
            number,
            title: format!("PR {}", number),
            author: author.to_string(),
            merged: false,
            closed: false,
            head_sha: format!("sha-{}", number),
            requested_reviewers: reviewers.iter().map(|r| r.to_string()).collect(),
            requested_teams: Vec::new(),
        }
    }

    pub fn check(name: &str, status: &str, conclusion: Option<&str>) -> CheckRun {
        CheckRun {
            name: name.to_string(),
            status: status.to_string(),
            conclusion: conclusion.map(str::to_string),
        }
    }

    pub fn review(reviewer: &str, state: &str) -> Review {
        Review {
            reviewer: reviewer.to_string(),
            state: state.to_string(),
        }
    }

    pub fn put_pull_request(&self, pr: PullRequestSnapshot) {
        self.prs.lock().unwrap().insert(pr.number, pr);
    }

    pub fn update_pull_request(&self, number: u64, f: impl FnOnce(&mut PullRequestSnapshot)) {
        if let Some(pr) = self.prs.lock().unwrap().get_mut(&number) {
            f(pr);
        }
    }

    pub fn put_checks(&self, number: u64, checks: Vec<CheckRun>) {
        self.checks.lock().unwrap().insert(number, checks);
    }

    pub fn put_reviews(&self, number: u64, reviews: Vec<Review>) {
        self.reviews.lock().unwrap().insert(number, reviews);
    }

    pub fn fail_reviews(&self, fail: bool) {
        self.fail_reviews.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TrackingApi for FakeTracking {
    async fn fetch_item(&self, _owner: &str, _repo: &str, number: u64) -> Result<PullRequestSnapshot, RemoteError> {
        self.prs
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or_else(|| RemoteError::not_found("fetch pull request", "404"))
    }

    async fn fetch_checks(&self, _owner: &str, _repo: &str, git_ref: &str) -> Result<Vec<CheckRun>, RemoteError> {
        let number = self
            .prs
            .lock()
            .unwrap()
            .values()
            .find(|pr| pr.head_sha == git_ref)
            .map(|pr| pr.number);
        Ok(number
            .and_then(|n| self.checks.lock().unwrap().get(&n).cloned())
            .unwrap_or_default())
    }

    async fn fetch_reviews(&self, _owner: &str, _repo: &str, number: u64) -> Result<Vec<Review>, RemoteError> {
        if self.fail_reviews.load(Ordering::SeqCst) {
            return Err(RemoteError::transient("fetch reviews", "502"));
        }
        Ok(self.reviews.lock().unwrap().get(&number).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Thread { channel: String, text: String },
    Reply { thread: ThreadRef, text: String },
    Reaction { thread: ThreadRef, status: ReviewStatus },
    DirectMessage { user: String, text: String },
}

#[derive(Default)]
pub struct FakeMessaging {
    sent: Mutex<Vec<Sent>>,
    presence: Mutex<HashMap<String, Presence>>,
    missing_channels: Mutex<HashSet<String>>,
    next_ts: AtomicU64,
}

impl FakeMessaging {
    pub fn set_presence(&self, user: &str, presence: Presence) {
        self.presence.lock().unwrap().insert(user.to_string(), presence);
    }

    /// Posting to `channel` fails as if the bot was never invited.
    pub fn remove_channel(&self, channel: &str) {
        self.missing_channels.lock().unwrap().insert(channel.to_string());
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn direct_messages_to(&self, user: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::DirectMessage { user: to, text } if to == user => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn threads(&self) -> Vec<(String, String)> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Thread { channel, text } => Some((channel, text)),
                _ => None,
            })
            .collect()
    }

    pub fn replies(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Reply { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn reactions(&self) -> Vec<ReviewStatus> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Reaction { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }

    fn record(&self, sent: Sent) {
        self.sent.lock().unwrap().push(sent);
    }
}

#[async_trait]
impl MessagingApi for FakeMessaging {
    async fn post_thread(&self, channel: &str, text: &str) -> Result<ThreadRef, RemoteError> {
        if self.missing_channels.lock().unwrap().contains(channel) {
            return Err(RemoteError::not_found("chat.postMessage", "channel_not_found"));
        }
        let ts = format!("{}.000100", 1_700_000_000 + self.next_ts.fetch_add(1, Ordering::SeqCst));
        self.record(Sent::Thread {
            channel: channel.to_string(),
            text: text.to_string(),
        });
        Ok(ThreadRef {
            channel: channel.to_string(),
            ts,
        })
    }

    async fn post_reply(&self, thread: &ThreadRef, text: &str) -> Result<(), RemoteError> {
        self.record(Sent::Reply {
            thread: thread.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn set_reaction(&self, thread: &ThreadRef, status: ReviewStatus) -> Result<(), RemoteError> {
        self.record(Sent::Reaction {
            thread: thread.clone(),
            status,
        });
        Ok(())
    }

    async fn send_direct_message(&self, user: &str, text: &str) -> Result<(), RemoteError> {
        self.record(Sent::DirectMessage {
            user: user.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn presence(&self, user: &str) -> Result<Presence, RemoteError> {
        Ok(self
            .presence
            .lock()
            .unwrap()
            .get(user)
            .copied()
            .unwrap_or(Presence::Active))
    }
}
