//! Text posted to the messaging surface.

use crate::model::{ReviewStatus, TrackedItem};

/// Prefix used when an organisation does not configure its own.
pub const DEFAULT_PREFIX: &str = ":postal_horn:";

/// Opening message of a pull request's thread.
pub fn thread_text(prefix: &str, item: &TrackedItem) -> String {
    format!(
        "{} {} • <{}|{}/{}#{}> by @{}",
        prefix,
        item.title,
        item.url(),
        item.owner,
        item.repo,
        item.number,
        item.author
    )
}

/// Direct message telling a user a pull request is waiting on them.
pub fn notification_text(item: &TrackedItem) -> String {
    format!(
        "{} {} • {}/{}#{} by @{} - {}",
        DEFAULT_PREFIX,
        item.title,
        item.owner,
        item.repo,
        item.number,
        item.author,
        item.status.action()
    )
}

/// Thread reply announcing a submitted review.
pub fn review_reply(reviewer: &str, state: &str) -> String {
    let mut message = format!("@{} reviewed the PR", reviewer);
    match state.to_ascii_lowercase().as_str() {
        "approved" => message.push_str(" ✅"),
        "changes_requested" => message.push_str(" 🔧"),
        _ => {}
    }
    message
}

/// Morning summary of everything waiting on a user.
pub fn daily_reminder_text(items: &[&TrackedItem]) -> String {
    let noun = if items.len() == 1 {
        "pull request is"
    } else {
        "pull requests are"
    };
    let mut text = format!(":sunrise: Good morning! {} {} waiting on you:", items.len(), noun);
    for item in items {
        text.push_str(&format!(
            "\n• {} • {}/{}#{} - {}",
            item.title,
            item.owner,
            item.repo,
            item.number,
            item.status.action()
        ));
    }
    text
}

/// Every reaction the bot may have placed, for clearing stale ones.
pub fn status_emojis() -> impl Iterator<Item = &'static str> {
    ReviewStatus::ALL.into_iter().map(ReviewStatus::emoji)
}
