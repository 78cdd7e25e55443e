//! # Storage Contract
//!
//! Abstract persistence for packages, users, subscriptions, teams, bounce
//! statistics, confirmation tokens and running jobs. The relational layer
//! behind this trait is an external collaborator; [`MemoryStorage`] is the
//! reference implementation backing tests and the demo mode.
//!
//! Multi-row updates (`unsubscribe_all`, keyword replacement) are atomic
//! with respect to concurrent readers. `subscribe` is idempotent: a
//! conflicting insert degrades to a no-op reported through
//! [`SubscribeOutcome::AlreadySubscribed`].

mod memory;

pub use memory::MemoryStorage;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::error::PtsResult;
use crate::models::{
    BounceRecord, CommandConfirmation, Keyword, Package, RunningJob, Subscription, Team,
};

/// Result of an idempotent subscribe operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Subscribed,
    AlreadySubscribed,
}

#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    // Packages

    async fn create_package(&self, package: Package) -> PtsResult<()>;
    async fn get_package(&self, name: &str) -> PtsResult<Option<Package>>;
    async fn all_packages(&self) -> PtsResult<Vec<Package>>;

    // Subscriptions

    /// Create an active subscription with the default keyword set, or
    /// reactivate an inactive one. Inserting over an existing active
    /// subscription is a no-op.
    async fn subscribe(&self, package: &str, email: &str) -> PtsResult<SubscribeOutcome>;

    /// Deactivate or remove the subscription. Returns whether one existed.
    async fn unsubscribe(&self, package: &str, email: &str) -> PtsResult<bool>;

    /// Remove every subscription of the user atomically. Returns the names
    /// of the affected packages (empty when the user had none).
    async fn unsubscribe_all(&self, email: &str) -> PtsResult<Vec<String>>;

    async fn get_subscription(&self, package: &str, email: &str)
        -> PtsResult<Option<Subscription>>;

    async fn subscriptions_for_user(&self, email: &str) -> PtsResult<Vec<Subscription>>;

    /// All subscriptions of the package, active and inactive.
    async fn subscriptions_for_package(&self, package: &str) -> PtsResult<Vec<Subscription>>;

    /// Active subscriptions of the package whose allowed-keyword set
    /// contains `keyword`, ordered by subscriber address.
    async fn active_subscribers(
        &self,
        package: &str,
        keyword: &Keyword,
    ) -> PtsResult<Vec<Subscription>>;

    /// Replace the allowed-keyword set of one subscription. Returns whether
    /// the subscription existed.
    async fn set_keywords(
        &self,
        package: &str,
        email: &str,
        keywords: BTreeSet<Keyword>,
    ) -> PtsResult<bool>;

    // Teams

    async fn create_team(&self, team: Team) -> PtsResult<()>;
    async fn get_team(&self, slug: &str) -> PtsResult<Option<Team>>;
    /// Returns false when the user was already a member.
    async fn add_team_member(&self, slug: &str, email: &str) -> PtsResult<bool>;
    /// Returns false when the user was not a member.
    async fn remove_team_member(&self, slug: &str, email: &str) -> PtsResult<bool>;

    // Bounce statistics

    /// Increment `sent_count` for the user's record on `date`, creating the
    /// record if needed.
    async fn add_sent(&self, email: &str, date: NaiveDate) -> PtsResult<()>;

    /// Increment `bounced_count` for the user's record on `date`, creating
    /// the record if needed.
    async fn add_bounce(&self, email: &str, date: NaiveDate) -> PtsResult<()>;

    /// The most recent `limit` records for the user, newest first.
    async fn bounce_records(&self, email: &str, limit: usize) -> PtsResult<Vec<BounceRecord>>;

    // Confirmation tokens

    async fn store_confirmation(&self, confirmation: CommandConfirmation) -> PtsResult<()>;

    /// Claim a token, removing it. Returns `None` for unknown tokens;
    /// tokens are single-use.
    async fn claim_confirmation(&self, token: &str) -> PtsResult<Option<CommandConfirmation>>;

    // Running jobs

    /// Insert or update the job record by id.
    async fn save_running_job(&self, job: RunningJob) -> PtsResult<()>;
    async fn load_running_job(&self, id: Uuid) -> PtsResult<Option<RunningJob>>;
    async fn incomplete_jobs(&self) -> PtsResult<Vec<RunningJob>>;
}
