//! # Dispatch Engine
//!
//! Routes an inbound package message to its subscribers: bounce shortcut,
//! package/keyword extraction from the envelope recipient, loop guard,
//! default-keyword approval gate, header decoration, VERP-enveloped SMTP
//! fan-out and sent accounting.
//!
//! Every per-message fault is swallowed after logging; the MTA only sees a
//! failure when the process could not start at all.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument};

use pts_shared::models::Keyword;
use pts_shared::storage::Storage;
use pts_shared::transport::{MailTransport, OutboundMessage};
use pts_shared::{PtsConfig, PtsError, PtsResult};

use crate::bounces::{BounceEngine, BounceOutcome};
use crate::codec::{verp, MailMessage};
use crate::vendor::Vendor;

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The envelope recipient was a bounce address; C7 handled it.
    Bounce(BounceOutcome),
    /// The per-package loop address was present in `X-Loop`.
    LoopDropped,
    /// Default keyword without approval.
    UnapprovedDefault,
    /// The named package is not tracked. A drop, not an error.
    UnknownPackage,
    Delivered {
        package: String,
        keyword: Keyword,
        recipients: usize,
    },
}

#[derive(Debug)]
pub struct DispatchEngine {
    config: PtsConfig,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn MailTransport>,
    vendor: Arc<dyn Vendor>,
    bounces: BounceEngine,
}

impl DispatchEngine {
    pub fn new(
        config: PtsConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn MailTransport>,
        vendor: Arc<dyn Vendor>,
    ) -> Self {
        let bounces = BounceEngine::new(config.clone(), storage.clone(), transport.clone());
        Self {
            config,
            storage,
            transport,
            vendor,
            bounces,
        }
    }

    /// Process one received package message. `sent_to` is the envelope
    /// recipient from the MTA environment; when absent the `To:` header is
    /// the last resort.
    #[instrument(skip(self, raw, sent_to))]
    pub async fn dispatch(
        &self,
        raw: &[u8],
        sent_to: Option<&str>,
    ) -> PtsResult<DispatchOutcome> {
        let msg = MailMessage::parse(raw.to_vec())?;

        let sent_to = match sent_to {
            Some(address) => address.to_string(),
            None => msg.to_address().ok_or_else(|| {
                PtsError::Parse("no envelope recipient and no To header".into())
            })?,
        };

        let local_part = sent_to
            .split('@')
            .next()
            .unwrap_or_default()
            .to_string();

        if local_part.starts_with("bounces+") {
            let outcome = self.bounces.handle(&sent_to).await?;
            return Ok(DispatchOutcome::Bounce(outcome));
        }

        let (package_name, keyword_from_address) = split_local_part(&local_part);

        // Loop guard before anything else touches the message.
        let package_address = self.config.package_address(package_name);
        if msg
            .header_all("X-Loop")
            .iter()
            .any(|value| *value == package_address)
        {
            info!(package = %package_name, "Bad X-Loop, message discarded");
            return Ok(DispatchOutcome::LoopDropped);
        }

        let keyword = self.classify(&local_part, keyword_from_address, &msg);

        if keyword == Keyword::Default && !self.approved_default(&msg) {
            info!(package = %package_name, "Discarding default keyword message");
            return Ok(DispatchOutcome::UnapprovedDefault);
        }

        if self.storage.get_package(package_name).await?.is_none() {
            debug!(package = %package_name, "Message for unknown package dropped");
            return Ok(DispatchOutcome::UnknownPackage);
        }

        let data = self.decorate(&msg, package_name, &keyword)?;
        let recipients = self
            .send_to_subscribers(package_name, &keyword, data)
            .await?;

        info!(
            package = %package_name,
            keyword = %keyword,
            recipients = recipients,
            "Dispatched package message"
        );
        Ok(DispatchOutcome::Delivered {
            package: package_name.to_string(),
            keyword,
            recipients,
        })
    }

    /// Keyword from the address if present, else the vendor classifier,
    /// else `default`.
    fn classify(
        &self,
        local_part: &str,
        keyword_from_address: Option<&str>,
        msg: &MailMessage,
    ) -> Keyword {
        if let Some(name) = keyword_from_address {
            return Keyword::from(name);
        }
        if let Some(keyword) = self.vendor.get_keyword(local_part, msg) {
            return keyword;
        }
        Keyword::Default
    }

    fn approved_default(&self, msg: &MailMessage) -> bool {
        if msg.has_header("X-PTS-Approved") {
            return true;
        }
        self.vendor.approve_default_message(msg).unwrap_or(false)
    }

    /// Append the forwarding headers, standard ones first, vendor extras
    /// after. Existing headers are never removed.
    fn decorate(
        &self,
        msg: &MailMessage,
        package_name: &str,
        keyword: &Keyword,
    ) -> PtsResult<Vec<u8>> {
        let mut headers = vec![
            ("X-Loop".to_string(), self.config.package_address(package_name)),
            ("X-PTS-Package".to_string(), package_name.to_string()),
            ("X-PTS-Keyword".to_string(), keyword.to_string()),
            ("Precedence".to_string(), "list".to_string()),
            (
                "List-Unsubscribe".to_string(),
                format!(
                    "<mailto:{}?body=unsubscribe%20{}>",
                    self.config.control_email, package_name
                ),
            ),
        ];
        if let Some(extra) = self.vendor.add_new_headers(msg, package_name, keyword) {
            headers.extend(extra);
        }
        msg.prepend_headers(&headers)
    }

    /// VERP-envelope the decorated message for every matching subscriber,
    /// hand the batch to the transport, and account each accepted copy.
    async fn send_to_subscribers(
        &self,
        package_name: &str,
        keyword: &Keyword,
        data: Vec<u8>,
    ) -> PtsResult<usize> {
        let subscribers = self
            .storage
            .active_subscribers(package_name, keyword)
            .await?;
        if subscribers.is_empty() {
            return Ok(0);
        }

        let date = Utc::now().date_naive();
        let bounce_address = self.config.bounce_address(date);

        let mut envelopes = Vec::with_capacity(subscribers.len());
        for subscription in &subscribers {
            let mail_from = verp::encode(&bounce_address, &subscription.email)?;
            envelopes.push(OutboundMessage::new(
                &mail_from,
                &subscription.email,
                data.clone(),
            ));
        }

        let accepted = self.transport.send_batch(envelopes).await?;
        for recipient in &accepted {
            self.storage.add_sent(recipient, date).await?;
        }
        Ok(accepted.len())
    }
}

/// Split the local part into package name and optional keyword on the
/// first underscore: `nginx_bts` -> (`nginx`, Some(`bts`)).
fn split_local_part(local_part: &str) -> (&str, Option<&str>) {
    match local_part.split_once('_') {
        Some((package, keyword)) if !keyword.is_empty() => (package, Some(keyword)),
        _ => (local_part, None),
    }
}
