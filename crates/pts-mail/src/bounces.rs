//! # Bounce Engine
//!
//! Decodes VERP-wrapped bounce recipients, accumulates per-day statistics
//! keyed by the date embedded in the bounce address (late-arriving bounces
//! land on the day they were sent, not the day they came back), and
//! auto-unsubscribes users that cross the configured threshold.

use std::sync::Arc;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, info, instrument};

use pts_shared::config::BouncePolicyConfig;
use pts_shared::models::BounceRecord;
use pts_shared::storage::Storage;
use pts_shared::transport::{MailTransport, OutboundMessage};
use pts_shared::{PtsConfig, PtsResult};

use crate::codec::{message, verp};

static RE_BOUNCE_LOCAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^bounces\+(\d{8})@(.+)$").expect("static regex"));

/// What a received bounce amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BounceOutcome {
    /// Malformed bounce address: logged and discarded.
    Invalid,
    Recorded {
        email: String,
        date: NaiveDate,
    },
    /// The user crossed the threshold: all subscriptions removed, one
    /// notification mail sent.
    Unsubscribed {
        email: String,
        packages: Vec<String>,
    },
}

#[derive(Debug)]
pub struct BounceEngine {
    config: PtsConfig,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn MailTransport>,
}

impl BounceEngine {
    pub fn new(
        config: PtsConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            config,
            storage,
            transport,
        }
    }

    /// Process a bounce delivered to the given envelope recipient.
    #[instrument(skip(self))]
    pub async fn handle(&self, sent_to: &str) -> PtsResult<BounceOutcome> {
        let (bounce_address, user_email) = match verp::decode(sent_to) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(address = %sent_to, error = %e, "Invalid bounce address");
                return Ok(BounceOutcome::Invalid);
            }
        };

        let date = match self.parse_bounce_date(&bounce_address) {
            Some(date) => date,
            None => {
                error!(address = %bounce_address, "Invalid bounce address");
                return Ok(BounceOutcome::Invalid);
            }
        };

        self.storage.add_bounce(&user_email, date).await?;
        info!(email = %user_email, date = %date, "Logged bounce");

        let records = self
            .storage
            .bounce_records(&user_email, self.config.bounce_policy.window_days)
            .await?;
        if !has_too_many_bounces(&self.config.bounce_policy, &records) {
            return Ok(BounceOutcome::Recorded {
                email: user_email,
                date,
            });
        }

        info!(email = %user_email, "User has too many bounces");
        let packages = self.storage.unsubscribe_all(&user_email).await?;
        if packages.is_empty() {
            // Already unsubscribed by an earlier crossing; do not notify
            // again.
            return Ok(BounceOutcome::Recorded {
                email: user_email,
                date,
            });
        }

        self.send_unsubscribed_notification(&user_email, &packages)
            .await?;
        Ok(BounceOutcome::Unsubscribed {
            email: user_email,
            packages,
        })
    }

    /// The date baked into `bounces+YYYYMMDD@<fqdn>`. The domain must be
    /// our own.
    fn parse_bounce_date(&self, bounce_address: &str) -> Option<NaiveDate> {
        let captures = RE_BOUNCE_LOCAL.captures(bounce_address)?;
        if &captures[2] != self.config.fqdn {
            return None;
        }
        NaiveDate::parse_from_str(&captures[1], "%Y%m%d").ok()
    }

    async fn send_unsubscribed_notification(
        &self,
        email: &str,
        packages: &[String],
    ) -> PtsResult<()> {
        let mut body = String::from(
            "Your subscriptions have been cancelled because too many mails\n\
             sent to your address have bounced back.\n\n\
             You were subscribed to the following packages:\n\n",
        );
        for package in packages {
            body.push_str("  * ");
            body.push_str(package);
            body.push('\n');
        }
        body.push_str("\nPlease contact us if this address is working again.\n");

        let data = message::compose(
            &[
                ("From", &self.config.contact_email),
                ("To", email),
                ("Cc", &self.config.contact_email),
                (
                    "Subject",
                    "All your subscriptions from the PTS have been cancelled",
                ),
            ],
            &body,
        )?;
        self.transport
            .send(OutboundMessage::new(&self.config.bounces_email, email, data))
            .await
    }
}

/// The injected threshold predicate: at least `required_days` of the most
/// recent `window_days` records have a bounce ratio above `ratio`.
pub fn has_too_many_bounces(policy: &BouncePolicyConfig, records: &[BounceRecord]) -> bool {
    let exceeded_days = records
        .iter()
        .take(policy.window_days)
        .filter(|record| {
            let sent = record.sent_count.max(1) as f64;
            f64::from(record.bounced_count) / sent > policy.ratio
        })
        .count();
    exceeded_days >= policy.required_days
}
