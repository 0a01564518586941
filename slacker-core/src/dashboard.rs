//! Per-user view of a tenant's pull requests.

use serde::Serialize;

use crate::model::TrackedItem;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Dashboard {
    pub user: String,
    /// Open items the user must act on.
    pub blocked_on_you: Vec<TrackedItem>,
    /// Open items the user authored that are waiting on someone else.
    pub waiting_on_others: Vec<TrackedItem>,
    /// The user's merged or closed items.
    pub other: Vec<TrackedItem>,
}

impl Dashboard {
    /// Group the items that involve `user`, most recently updated first.
    pub fn build(user: &str, items: impl IntoIterator<Item = TrackedItem>) -> Self {
        let mut dashboard = Dashboard {
            user: user.to_string(),
            ..Dashboard::default()
        };

        for item in items {
            let blocked = item.is_blocked_on(user);
            if item.status.is_open() && blocked {
                dashboard.blocked_on_you.push(item);
            } else if item.author == user {
                if item.status.is_open() {
                    dashboard.waiting_on_others.push(item);
                } else {
                    dashboard.other.push(item);
                }
            }
        }

        for group in [
            &mut dashboard.blocked_on_you,
            &mut dashboard.waiting_on_others,
            &mut dashboard.other,
        ] {
            group.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        }
        dashboard
    }

    pub fn is_empty(&self) -> bool {
        self.blocked_on_you.is_empty() && self.waiting_on_others.is_empty() && self.other.is_empty()
    }
}
