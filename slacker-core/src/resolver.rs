//! Derivation of a pull request's review status from raw upstream signals.
//!
//! Rules are evaluated in a fixed order and the first one that matches wins:
//!
//! 1. merged
//! 2. closed without merge
//! 3. any check still running
//! 4. any completed check that neither succeeded nor was skipped (blocks the author)
//! 5. any review requesting changes (blocks the author)
//! 6. any approval (blocks the author, who can now merge)
//! 7. otherwise awaiting review, blocked on requested reviewers then teams
//!
//! Resolution is pure. Callers re-run it on every signal with freshly fetched
//! inputs rather than caching anything beyond the stored status.

use crate::model::{Assignee, ReviewStatus};

const RUNNING_CHECK_STATUSES: [&str; 3] = ["in_progress", "queued", "pending"];
const PASSING_CONCLUSIONS: [&str; 2] = ["success", "skipped"];

/// One check run attached to the head commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRun {
    pub name: String,
    pub status: String,
    pub conclusion: Option<String>,
}

impl CheckRun {
    fn is_running(&self) -> bool {
        let status = self.status.to_ascii_lowercase();
        RUNNING_CHECK_STATUSES.contains(&status.as_str())
    }

    fn is_failed(&self) -> bool {
        if !self.status.eq_ignore_ascii_case("completed") {
            return false;
        }
        match &self.conclusion {
            Some(conclusion) => !PASSING_CONCLUSIONS
                .iter()
                .any(|ok| conclusion.eq_ignore_ascii_case(ok)),
            None => true,
        }
    }
}

/// One submitted review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub reviewer: String,
    pub state: String,
}

impl Review {
    fn normalized_state(&self) -> String {
        self.state.trim().to_ascii_lowercase().replace(' ', "_")
    }

    fn requests_changes(&self) -> bool {
        self.normalized_state() == "changes_requested"
    }

    fn approves(&self) -> bool {
        self.normalized_state() == "approved"
    }
}

/// Everything the resolver looks at for one pull request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    pub merged: bool,
    pub closed: bool,
    pub author: String,
    pub checks: Vec<CheckRun>,
    pub reviews: Vec<Review>,
    pub requested_reviewers: Vec<String>,
    pub requested_teams: Vec<String>,
}

/// Outcome of resolution: one status and who must act next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub status: ReviewStatus,
    pub blocked_on: Vec<Assignee>,
}

impl Resolution {
    fn unblocked(status: ReviewStatus) -> Self {
        Self {
            status,
            blocked_on: Vec::new(),
        }
    }

    fn on_author(status: ReviewStatus, author: &str) -> Self {
        Self {
            status,
            blocked_on: vec![Assignee::user(author)],
        }
    }

    /// Identities blocked now that were not blocked in `previous`.
    pub fn newly_blocked(&self, previous: &[Assignee]) -> Vec<Assignee> {
        self.blocked_on
            .iter()
            .filter(|a| !previous.contains(a))
            .cloned()
            .collect()
    }
}

pub fn resolve(signals: &Signals) -> Resolution {
    if signals.merged {
        return Resolution::unblocked(ReviewStatus::Merged);
    }
    if signals.closed {
        return Resolution::unblocked(ReviewStatus::ClosedUnmerged);
    }
    if signals.checks.iter().any(CheckRun::is_running) {
        return Resolution::unblocked(ReviewStatus::ChecksRunning);
    }
    if signals.checks.iter().any(CheckRun::is_failed) {
        return Resolution::on_author(ReviewStatus::ChecksFailed, &signals.author);
    }
    if signals.reviews.iter().any(Review::requests_changes) {
        return Resolution::on_author(ReviewStatus::ChangesRequested, &signals.author);
    }
    if signals.reviews.iter().any(Review::approves) {
        return Resolution::on_author(ReviewStatus::Approved, &signals.author);
    }

    let mut blocked_on: Vec<Assignee> = Vec::new();
    let requested = signals
        .requested_reviewers
        .iter()
        .map(Assignee::user)
        .chain(signals.requested_teams.iter().map(Assignee::team));
    for assignee in requested {
        if !blocked_on.contains(&assignee) {
            blocked_on.push(assignee);
        }
    }

    Resolution {
        status: ReviewStatus::AwaitingReview,
        blocked_on,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn check(status: &str, conclusion: Option<&str>) -> CheckRun {
        CheckRun {
            name: "ci".to_string(),
            status: status.to_string(),
            conclusion: conclusion.map(str::to_string),
        }
    }

    fn review(reviewer: &str, state: &str) -> Review {
        Review {
            reviewer: reviewer.to_string(),
            state: state.to_string(),
        }
    }

    fn base() -> Signals {
        Signals {
            author: "alice".to_string(),
            requested_reviewers: vec!["bob".to_string(), "carol".to_string()],
            requested_teams: vec!["core".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_merged_wins_over_everything() {
        let signals = Signals {
            merged: true,
            closed: true,
            checks: vec![check("completed", Some("failure"))],
            reviews: vec![review("bob", "CHANGES_REQUESTED")],
            ..base()
        };
        let resolution = resolve(&signals);
        assert_eq!(resolution.status, ReviewStatus::Merged);
        assert!(resolution.blocked_on.is_empty());
    }

    #[test]
    fn test_closed_unmerged() {
        let signals = Signals {
            closed: true,
            ..base()
        };
        assert_eq!(
            resolve(&signals),
            Resolution::unblocked(ReviewStatus::ClosedUnmerged)
        );
    }

    #[test]
    fn test_running_checks_dominate_failures() {
        let signals = Signals {
            checks: vec![
                check("completed", Some("failure")),
                check("queued", None),
            ],
            ..base()
        };
        assert_eq!(
            resolve(&signals),
            Resolution::unblocked(ReviewStatus::ChecksRunning)
        );
    }

    #[test]
    fn test_failed_checks_block_author() {
        let signals = Signals {
            checks: vec![
                check("completed", Some("success")),
                check("completed", Some("timed_out")),
            ],
            reviews: vec![review("bob", "APPROVED")],
            ..base()
        };
        let resolution = resolve(&signals);
        assert_eq!(resolution.status, ReviewStatus::ChecksFailed);
        assert_eq!(resolution.blocked_on, vec![Assignee::user("alice")]);
    }

    #[test]
    fn test_skipped_and_successful_checks_pass() {
        let signals = Signals {
            checks: vec![
                check("completed", Some("success")),
                check("COMPLETED", Some("SKIPPED")),
            ],
            ..base()
        };
        assert_eq!(resolve(&signals).status, ReviewStatus::AwaitingReview);
    }

    #[test]
    fn test_completed_check_without_conclusion_counts_as_failed() {
        let signals = Signals {
            checks: vec![check("completed", None)],
            ..base()
        };
        assert_eq!(resolve(&signals).status, ReviewStatus::ChecksFailed);
    }

    #[test]
    fn test_changes_requested_dominates_approval() {
        let signals = Signals {
            reviews: vec![review("bob", "APPROVED"), review("carol", "CHANGES_REQUESTED")],
            ..base()
        };
        let resolution = resolve(&signals);
        assert_eq!(resolution.status, ReviewStatus::ChangesRequested);
        assert_eq!(resolution.blocked_on, vec![Assignee::user("alice")]);
    }

    #[test]
    fn test_approved_blocks_author() {
        let signals = Signals {
            reviews: vec![review("bob", "COMMENTED"), review("carol", "approved")],
            ..base()
        };
        let resolution = resolve(&signals);
        assert_eq!(resolution.status, ReviewStatus::Approved);
        assert_eq!(resolution.blocked_on, vec![Assignee::user("alice")]);
    }

    #[test]
    fn test_awaiting_review_blocks_requested_reviewers_then_teams() {
        let resolution = resolve(&base());
        assert_eq!(resolution.status, ReviewStatus::AwaitingReview);
        assert_eq!(
            resolution.blocked_on,
            vec![
                Assignee::user("bob"),
                Assignee::user("carol"),
                Assignee::team("core"),
            ]
        );
    }

    #[test]
    fn test_awaiting_review_deduplicates() {
        let signals = Signals {
            requested_reviewers: vec!["bob".to_string(), "bob".to_string()],
            requested_teams: vec!["core".to_string(), "core".to_string()],
            ..base()
        };
        assert_eq!(
            resolve(&signals).blocked_on,
            vec![Assignee::user("bob"), Assignee::team("core")]
        );
    }

    #[test]
    fn test_newly_blocked() {
        let resolution = resolve(&base());
        let newly = resolution.newly_blocked(&[Assignee::user("bob")]);
        assert_eq!(newly, vec![Assignee::user("carol"), Assignee::team("core")]);
    }

    fn arb_check() -> impl Strategy<Value = CheckRun> {
        (
            prop_oneof![
                Just("queued"),
                Just("in_progress"),
                Just("pending"),
                Just("completed"),
                Just("waiting"),
            ],
            proptest::option::of(prop_oneof![
                Just("success"),
                Just("skipped"),
                Just("failure"),
                Just("neutral"),
                Just("cancelled"),
            ]),
        )
            .prop_map(|(status, conclusion)| check(status, conclusion))
    }

    fn arb_review() -> impl Strategy<Value = Review> {
        (
            "[a-z]{1,6}",
            prop_oneof![
                Just("APPROVED"),
                Just("CHANGES_REQUESTED"),
                Just("COMMENTED"),
                Just("DISMISSED"),
            ],
        )
            .prop_map(|(reviewer, state)| review(&reviewer, state))
    }

    fn arb_signals() -> impl Strategy<Value = Signals> {
        (
            any::<bool>(),
            any::<bool>(),
            "[a-z]{1,8}",
            proptest::collection::vec(arb_check(), 0..4),
            proptest::collection::vec(arb_review(), 0..4),
            proptest::collection::vec("[a-z]{1,4}", 0..4),
            proptest::collection::vec("[a-z]{1,4}", 0..3),
        )
            .prop_map(
                |(merged, closed, author, checks, reviews, requested_reviewers, requested_teams)| {
                    Signals {
                        merged,
                        closed,
                        author,
                        checks,
                        reviews,
                        requested_reviewers,
                        requested_teams,
                    }
                },
            )
    }

    /// Index of the first rule in the precedence list that applies.
    fn first_matching_rule(s: &Signals) -> usize {
        let rules = [
            s.merged,
            s.closed,
            s.checks.iter().any(|c| c.is_running()),
            s.checks.iter().any(|c| c.is_failed()),
            s.reviews.iter().any(|r| r.requests_changes()),
            s.reviews.iter().any(|r| r.approves()),
            true,
        ];
        rules.iter().position(|applies| *applies).unwrap()
    }

    proptest! {
        #[test]
        fn resolution_is_deterministic(signals in arb_signals()) {
            prop_assert_eq!(resolve(&signals), resolve(&signals.clone()));
        }

        #[test]
        fn status_follows_first_matching_rule(signals in arb_signals()) {
            let resolution = resolve(&signals);
            prop_assert_eq!(resolution.status, ReviewStatus::ALL[first_matching_rule(&signals)]);
        }

        #[test]
        fn attribution_matches_status(signals in arb_signals()) {
            let resolution = resolve(&signals);
            match resolution.status {
                ReviewStatus::Merged | ReviewStatus::ClosedUnmerged | ReviewStatus::ChecksRunning => {
                    prop_assert!(resolution.blocked_on.is_empty());
                }
                ReviewStatus::AwaitingReview => {
                    let mut expected: Vec<Assignee> = Vec::new();
                    for a in signals.requested_reviewers.iter().map(Assignee::user)
                        .chain(signals.requested_teams.iter().map(Assignee::team))
                    {
                        if !expected.contains(&a) {
                            expected.push(a);
                        }
                    }
                    prop_assert_eq!(resolution.blocked_on, expected);
                }
                _ => {
                    prop_assert_eq!(resolution.blocked_on, vec![Assignee::user(signals.author.clone())]);
                }
            }
        }
    }
}
