//! Wiring and implementations of the `ptsctl` subcommands.

use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use pts_mail::{select_vendor, ControlProcessor, DispatchEngine};
use pts_shared::models::PackageKind;
use pts_shared::storage::{MemoryStorage, Storage};
use pts_shared::transport::SmtpMailTransport;
use pts_shared::{PtsConfig, PtsError};
use pts_tasks::TaskRegistry;

use crate::tasks;

/// Shared wiring for every subcommand.
///
/// The relational persistence layer is an external collaborator behind the
/// `Storage` contract; this binary runs against the in-memory reference
/// store.
#[derive(Debug)]
pub struct App {
    config: PtsConfig,
    storage: Arc<dyn Storage>,
    dispatch: DispatchEngine,
    control: ControlProcessor,
    registry: &'static TaskRegistry,
}

impl App {
    pub fn new(config: PtsConfig) -> Result<Self> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let transport = Arc::new(SmtpMailTransport::new(&config.smtp));
        let vendor = select_vendor(&config)?;

        let dispatch = DispatchEngine::new(
            config.clone(),
            storage.clone(),
            transport.clone(),
            vendor.clone(),
        );
        let control = ControlProcessor::new(config.clone(), storage.clone(), transport);
        let registry =
            pts_tasks::init_global_registry(tasks::build_registry(storage.clone(), vendor)?)?;

        Ok(Self {
            config,
            storage,
            dispatch,
            control,
            registry,
        })
    }

    /// `ptsctl dispatch`: feed the stdin message through the dispatch
    /// engine. Per-message faults are swallowed after logging.
    pub async fn dispatch(&self) -> Result<()> {
        info!("Processing a received package message");
        let raw = read_stdin().await?;
        let sent_to = envelope_recipient();

        match self.dispatch.dispatch(&raw, sent_to.as_deref()).await {
            Ok(outcome) => info!(outcome = ?outcome, "Completed processing a received package message"),
            Err(error) if error.is_per_message() => {
                error!(error = %error, "Dropped undeliverable package message")
            }
            Err(error) => return Err(error.into()),
        }
        Ok(())
    }

    /// `ptsctl control`: feed the stdin message through the control
    /// processor.
    pub async fn control(&self) -> Result<()> {
        info!("Processing a received control message");
        let raw = read_stdin().await?;

        match self.control.process(&raw).await {
            Ok(outcome) => info!(outcome = ?outcome, "Completed processing a received control message"),
            Err(error) if error.is_per_message() => {
                error!(error = %error, "Dropped unprocessable control message")
            }
            Err(error) => return Err(error.into()),
        }
        Ok(())
    }

    pub async fn run_task(&self, name: &str, parameters: Option<String>) -> Result<()> {
        let parameters = parameters
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| PtsError::Configuration(format!("invalid --parameters JSON: {e}")))?;

        let state = pts_tasks::run_task(
            self.registry,
            self.storage.clone(),
            name,
            parameters,
            self.task_deadline(),
        )
        .await?;
        info!(
            job_id = %state.job_id,
            processed = state.processed_tasks.len(),
            "Job finished"
        );
        Ok(())
    }

    pub async fn resume_jobs(&self) -> Result<()> {
        let continued = pts_tasks::continue_incomplete_jobs(
            self.registry,
            self.storage.clone(),
            self.task_deadline(),
        )
        .await?;
        info!(continued = continued, "Continued incomplete jobs");
        Ok(())
    }

    pub async fn unsubscribe_all(&self, emails: &[String]) -> Result<()> {
        for email in emails {
            let packages = self.storage.unsubscribe_all(email).await?;
            if packages.is_empty() {
                println!("Email {email} is not subscribed to any packages.");
                continue;
            }
            for package in packages {
                println!("Unsubscribing {email} from {package}");
            }
        }
        Ok(())
    }

    pub async fn dump_subscribers(&self, inactive: bool, json: bool) -> Result<()> {
        let mut dump: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for package in self.storage.all_packages().await? {
            let subscribers: Vec<String> = self
                .storage
                .subscriptions_for_package(&package.name)
                .await?
                .into_iter()
                .filter(|subscription| subscription.active != inactive)
                .map(|subscription| subscription.email)
                .collect();
            if !subscribers.is_empty() {
                dump.insert(package.name, subscribers);
            }
        }

        if json {
            println!("{}", serde_json::to_string_pretty(&dump)?);
        } else {
            for (package, subscribers) in dump {
                println!("{package} => [ {} ]", subscribers.join(" "));
            }
        }
        Ok(())
    }

    pub async fn stats(&self, json: bool) -> Result<()> {
        let packages = self.storage.all_packages().await?;
        let source_packages = packages
            .iter()
            .filter(|package| package.kind == PackageKind::Source)
            .count();

        let mut subscriptions = 0usize;
        let mut emails = std::collections::BTreeSet::new();
        for package in &packages {
            for subscription in self.storage.subscriptions_for_package(&package.name).await? {
                subscriptions += 1;
                emails.insert(subscription.email);
            }
        }
        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();

        if json {
            let stats = serde_json::json!({
                "package_number": source_packages,
                "subscription_number": subscriptions,
                "date": date,
                "unique_emails_number": emails.len(),
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            println!("Src pkg\tSubscr.\tDate\t\tNb email");
            println!(
                "{source_packages}\t{subscriptions}\t{date}\t{}",
                emails.len()
            );
        }
        Ok(())
    }

    fn task_deadline(&self) -> Duration {
        Duration::from_secs(self.config.task_deadline_seconds)
    }
}

async fn read_stdin() -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    tokio::io::stdin().read_to_end(&mut raw).await?;
    Ok(raw)
}

/// The envelope recipient as handed over by the MTA: `LOCAL_PART` plus
/// `DOMAIN` for Exim, `ORIGINAL_RECIPIENT` for Postfix. `None` falls back
/// to the message's `To:` header downstream.
fn envelope_recipient() -> Option<String> {
    if let Ok(local_part) = env::var("LOCAL_PART") {
        let domain = env::var("DOMAIN").unwrap_or_default();
        return Some(format!("{local_part}@{domain}"));
    }
    env::var("ORIGINAL_RECIPIENT").ok()
}
