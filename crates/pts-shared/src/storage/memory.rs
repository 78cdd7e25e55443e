//! In-memory reference implementation of the storage contract.
//!
//! BTreeMap-backed so every enumeration is deterministic. A single RwLock
//! over the whole store gives the multi-row operations the same atomicity
//! the contract demands from a relational backend.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::PtsResult;
use crate::models::{
    normalize_email, BounceRecord, CommandConfirmation, Keyword, Package, RunningJob,
    Subscription, Team,
};

use super::{Storage, SubscribeOutcome};

#[derive(Debug, Default)]
struct Inner {
    packages: BTreeMap<String, Package>,
    /// Keyed by (package, email).
    subscriptions: BTreeMap<(String, String), Subscription>,
    teams: BTreeMap<String, Team>,
    /// Keyed by (email, date).
    bounce_records: BTreeMap<(String, NaiveDate), BounceRecord>,
    confirmations: BTreeMap<String, CommandConfirmation>,
    running_jobs: BTreeMap<Uuid, RunningJob>,
}

/// Deterministic in-memory store for tests and the demo mode.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_package(&self, package: Package) -> PtsResult<()> {
        let mut inner = self.inner.write().await;
        inner.packages.insert(package.name.clone(), package);
        Ok(())
    }

    async fn get_package(&self, name: &str) -> PtsResult<Option<Package>> {
        let inner = self.inner.read().await;
        Ok(inner.packages.get(name).cloned())
    }

    async fn all_packages(&self) -> PtsResult<Vec<Package>> {
        let inner = self.inner.read().await;
        Ok(inner.packages.values().cloned().collect())
    }

    async fn subscribe(&self, package: &str, email: &str) -> PtsResult<SubscribeOutcome> {
        let email = normalize_email(email);
        let mut inner = self.inner.write().await;
        let key = (package.to_string(), email.clone());
        match inner.subscriptions.get_mut(&key) {
            Some(existing) if existing.active => Ok(SubscribeOutcome::AlreadySubscribed),
            Some(existing) => {
                existing.active = true;
                Ok(SubscribeOutcome::Subscribed)
            }
            None => {
                inner
                    .subscriptions
                    .insert(key, Subscription::new(package, &email));
                Ok(SubscribeOutcome::Subscribed)
            }
        }
    }

    async fn unsubscribe(&self, package: &str, email: &str) -> PtsResult<bool> {
        let email = normalize_email(email);
        let mut inner = self.inner.write().await;
        Ok(inner
            .subscriptions
            .remove(&(package.to_string(), email))
            .is_some())
    }

    async fn unsubscribe_all(&self, email: &str) -> PtsResult<Vec<String>> {
        let email = normalize_email(email);
        let mut inner = self.inner.write().await;
        let affected: Vec<String> = inner
            .subscriptions
            .keys()
            .filter(|(_, sub_email)| *sub_email == email)
            .map(|(package, _)| package.clone())
            .collect();
        for package in &affected {
            inner.subscriptions.remove(&(package.clone(), email.clone()));
        }
        Ok(affected)
    }

    async fn get_subscription(
        &self,
        package: &str,
        email: &str,
    ) -> PtsResult<Option<Subscription>> {
        let email = normalize_email(email);
        let inner = self.inner.read().await;
        Ok(inner
            .subscriptions
            .get(&(package.to_string(), email))
            .cloned())
    }

    async fn subscriptions_for_user(&self, email: &str) -> PtsResult<Vec<Subscription>> {
        let email = normalize_email(email);
        let inner = self.inner.read().await;
        Ok(inner
            .subscriptions
            .values()
            .filter(|sub| sub.email == email)
            .cloned()
            .collect())
    }

    async fn subscriptions_for_package(&self, package: &str) -> PtsResult<Vec<Subscription>> {
        let inner = self.inner.read().await;
        Ok(inner
            .subscriptions
            .values()
            .filter(|sub| sub.package == package)
            .cloned()
            .collect())
    }

    async fn active_subscribers(
        &self,
        package: &str,
        keyword: &Keyword,
    ) -> PtsResult<Vec<Subscription>> {
        let inner = self.inner.read().await;
        // BTreeMap iteration order already sorts by (package, email).
        Ok(inner
            .subscriptions
            .values()
            .filter(|sub| sub.package == package && sub.accepts(keyword))
            .cloned()
            .collect())
    }

    async fn set_keywords(
        &self,
        package: &str,
        email: &str,
        keywords: BTreeSet<Keyword>,
    ) -> PtsResult<bool> {
        let email = normalize_email(email);
        let mut inner = self.inner.write().await;
        match inner.subscriptions.get_mut(&(package.to_string(), email)) {
            Some(sub) => {
                sub.keywords = keywords;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_team(&self, team: Team) -> PtsResult<()> {
        let mut inner = self.inner.write().await;
        inner.teams.insert(team.slug.clone(), team);
        Ok(())
    }

    async fn get_team(&self, slug: &str) -> PtsResult<Option<Team>> {
        let inner = self.inner.read().await;
        Ok(inner.teams.get(slug).cloned())
    }

    async fn add_team_member(&self, slug: &str, email: &str) -> PtsResult<bool> {
        let email = normalize_email(email);
        let mut inner = self.inner.write().await;
        match inner.teams.get_mut(slug) {
            Some(team) => Ok(team.members.insert(email)),
            None => Ok(false),
        }
    }

    async fn remove_team_member(&self, slug: &str, email: &str) -> PtsResult<bool> {
        let email = normalize_email(email);
        let mut inner = self.inner.write().await;
        match inner.teams.get_mut(slug) {
            Some(team) => Ok(team.members.remove(&email)),
            None => Ok(false),
        }
    }

    async fn add_sent(&self, email: &str, date: NaiveDate) -> PtsResult<()> {
        let email = normalize_email(email);
        let mut inner = self.inner.write().await;
        let record = inner
            .bounce_records
            .entry((email.clone(), date))
            .or_insert_with(|| BounceRecord::new(&email, date));
        record.sent_count += 1;
        Ok(())
    }

    async fn add_bounce(&self, email: &str, date: NaiveDate) -> PtsResult<()> {
        let email = normalize_email(email);
        let mut inner = self.inner.write().await;
        let record = inner
            .bounce_records
            .entry((email.clone(), date))
            .or_insert_with(|| BounceRecord::new(&email, date));
        record.bounced_count += 1;
        Ok(())
    }

    async fn bounce_records(&self, email: &str, limit: usize) -> PtsResult<Vec<BounceRecord>> {
        let email = normalize_email(email);
        let inner = self.inner.read().await;
        let mut records: Vec<BounceRecord> = inner
            .bounce_records
            .values()
            .filter(|record| record.email == email)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.date.cmp(&a.date));
        records.truncate(limit);
        Ok(records)
    }

    async fn store_confirmation(&self, confirmation: CommandConfirmation) -> PtsResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .confirmations
            .insert(confirmation.token.clone(), confirmation);
        Ok(())
    }

    async fn claim_confirmation(&self, token: &str) -> PtsResult<Option<CommandConfirmation>> {
        let mut inner = self.inner.write().await;
        Ok(inner.confirmations.remove(token))
    }

    async fn save_running_job(&self, job: RunningJob) -> PtsResult<()> {
        let mut inner = self.inner.write().await;
        inner.running_jobs.insert(job.id, job);
        Ok(())
    }

    async fn load_running_job(&self, id: Uuid) -> PtsResult<Option<RunningJob>> {
        let inner = self.inner.read().await;
        Ok(inner.running_jobs.get(&id).cloned())
    }

    async fn incomplete_jobs(&self) -> PtsResult<Vec<RunningJob>> {
        let inner = self.inner.read().await;
        Ok(inner
            .running_jobs
            .values()
            .filter(|job| !job.is_complete)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let storage = MemoryStorage::new();
        storage
            .create_package(Package::source("nginx"))
            .await
            .unwrap();

        assert_eq!(
            storage.subscribe("nginx", "a@x.org").await.unwrap(),
            SubscribeOutcome::Subscribed
        );
        assert_eq!(
            storage.subscribe("nginx", "A@X.org").await.unwrap(),
            SubscribeOutcome::AlreadySubscribed
        );

        let subs = storage.subscriptions_for_user("a@x.org").await.unwrap();
        assert_eq!(subs.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_all_reports_affected_packages() {
        let storage = MemoryStorage::new();
        for name in ["alpha", "beta"] {
            storage.create_package(Package::source(name)).await.unwrap();
            storage.subscribe(name, "u@x.org").await.unwrap();
        }

        let affected = storage.unsubscribe_all("u@x.org").await.unwrap();
        assert_eq!(affected, vec!["alpha".to_string(), "beta".to_string()]);

        // A second pass finds nothing to remove.
        assert!(storage.unsubscribe_all("u@x.org").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn active_subscribers_sorted_and_filtered() {
        let storage = MemoryStorage::new();
        storage
            .create_package(Package::source("nginx"))
            .await
            .unwrap();
        storage.subscribe("nginx", "zed@x.org").await.unwrap();
        storage.subscribe("nginx", "amy@x.org").await.unwrap();
        storage.subscribe("nginx", "mia@x.org").await.unwrap();
        // mia only accepts bts.
        storage
            .set_keywords("nginx", "mia@x.org", [Keyword::Bts].into_iter().collect())
            .await
            .unwrap();

        let bts: Vec<String> = storage
            .active_subscribers("nginx", &Keyword::Bts)
            .await
            .unwrap()
            .into_iter()
            .map(|sub| sub.email)
            .collect();
        assert_eq!(bts, ["amy@x.org", "mia@x.org", "zed@x.org"]);

        let archive: Vec<String> = storage
            .active_subscribers("nginx", &Keyword::Archive)
            .await
            .unwrap()
            .into_iter()
            .map(|sub| sub.email)
            .collect();
        assert_eq!(archive, ["amy@x.org", "zed@x.org"]);
    }

    #[tokio::test]
    async fn bounce_counters_aggregate_by_day() {
        let storage = MemoryStorage::new();
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        storage.add_sent("u@x.org", date).await.unwrap();
        storage.add_sent("u@x.org", date).await.unwrap();
        storage.add_bounce("u@x.org", date).await.unwrap();

        let records = storage.bounce_records("u@x.org", 7).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sent_count, 2);
        assert_eq!(records[0].bounced_count, 1);
    }

    #[tokio::test]
    async fn bounce_records_newest_first_with_limit() {
        let storage = MemoryStorage::new();
        for day in 1..=10 {
            let date = NaiveDate::from_ymd_opt(2024, 5, day).unwrap();
            storage.add_sent("u@x.org", date).await.unwrap();
        }

        let records = storage.bounce_records("u@x.org", 7).await.unwrap();
        assert_eq!(records.len(), 7);
        assert_eq!(records[0].date, NaiveDate::from_ymd_opt(2024, 5, 10).unwrap());
        assert_eq!(records[6].date, NaiveDate::from_ymd_opt(2024, 5, 4).unwrap());
    }

    #[tokio::test]
    async fn confirmation_tokens_are_single_use() {
        let storage = MemoryStorage::new();
        let confirmation = CommandConfirmation::new("subscribe nginx u@x.org", "u@x.org");
        let token = confirmation.token.clone();
        storage.store_confirmation(confirmation).await.unwrap();

        assert!(storage.claim_confirmation(&token).await.unwrap().is_some());
        assert!(storage.claim_confirmation(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn running_jobs_filter_incomplete() {
        let storage = MemoryStorage::new();
        let done = RunningJob {
            id: Uuid::new_v4(),
            initial_task_name: "a".into(),
            additional_parameters: None,
            state: serde_json::json!({}),
            is_complete: true,
        };
        let pending = RunningJob {
            id: Uuid::new_v4(),
            initial_task_name: "b".into(),
            additional_parameters: None,
            state: serde_json::json!({}),
            is_complete: false,
        };
        storage.save_running_job(done).await.unwrap();
        storage.save_running_job(pending.clone()).await.unwrap();

        let incomplete = storage.incomplete_jobs().await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, pending.id);
    }
}
