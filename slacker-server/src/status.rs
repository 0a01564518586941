//! Status types for the status endpoint.

use chrono::{DateTime, Utc};
use serde::Serialize;
use slacker_core::{ReviewStatus, TrackedItem};

/// Counts of tracked pull requests per status.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub total_prs: usize,
    pub merged: usize,
    pub closed_unmerged: usize,
    pub checks_running: usize,
    pub checks_failed: usize,
    pub changes_requested: usize,
    pub approved: usize,
    pub awaiting_review: usize,
}

/// A PR entry for display on the status page.
#[derive(Debug, Serialize)]
pub struct PrStatusEntry {
    pub key: String,
    pub title: String,
    pub author: String,
    pub status: ReviewStatus,
    pub emoji: &'static str,
    pub blocked_on: Vec<String>,
    pub has_thread: bool,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatusData {
    pub version: String,
    pub tenant: String,
    pub summary: StatusSummary,
    pub prs: Vec<PrStatusEntry>,
}

impl StatusData {
    pub fn from_items(tenant: &str, items: Vec<TrackedItem>, version: String) -> Self {
        let mut summary = StatusSummary {
            total_prs: items.len(),
            ..Default::default()
        };

        let mut prs = Vec::with_capacity(items.len());
        for item in items {
            match item.status {
                ReviewStatus::Merged => summary.merged += 1,
                ReviewStatus::ClosedUnmerged => summary.closed_unmerged += 1,
                ReviewStatus::ChecksRunning => summary.checks_running += 1,
                ReviewStatus::ChecksFailed => summary.checks_failed += 1,
                ReviewStatus::ChangesRequested => summary.changes_requested += 1,
                ReviewStatus::Approved => summary.approved += 1,
                ReviewStatus::AwaitingReview => summary.awaiting_review += 1,
            }

            prs.push(PrStatusEntry {
                key: item.key().to_string(),
                emoji: item.status.emoji(),
                blocked_on: item.blocked_on.iter().map(ToString::to_string).collect(),
                has_thread: item.thread.is_some(),
                title: item.title,
                author: item.author,
                status: item.status,
                last_updated: item.last_updated,
            });
        }
        prs.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));

        Self {
            version,
            tenant: tenant.to_string(),
            summary,
            prs,
        }
    }
}
