//! # Mail Transport Contract
//!
//! Outbound mail leaves the system as fully formed envelopes: an SMTP
//! MAIL-FROM (the VERP-encoded bounce path for dispatched copies), a single
//! RCPT-TO, and the raw DATA bytes. The engines never talk SMTP directly;
//! they hand batches to a [`MailTransport`].
//!
//! [`SmtpMailTransport`] is the production implementation over one reusable
//! relay connection. [`RecordingTransport`] captures envelopes for tests.

mod recording;
mod smtp;

pub use recording::RecordingTransport;
pub use smtp::SmtpMailTransport;

use async_trait::async_trait;

use crate::error::PtsResult;

/// One outbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// SMTP MAIL-FROM (return path).
    pub envelope_from: String,
    /// SMTP RCPT-TO.
    pub envelope_to: String,
    /// Raw RFC 5322 DATA.
    pub data: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(envelope_from: &str, envelope_to: &str, data: Vec<u8>) -> Self {
        Self {
            envelope_from: envelope_from.to_string(),
            envelope_to: envelope_to.to_string(),
            data,
        }
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync + std::fmt::Debug {
    /// Send one envelope.
    async fn send(&self, message: OutboundMessage) -> PtsResult<()>;

    /// Send a batch over one connection. Failure of one recipient does not
    /// abort the batch; the implementation logs it and continues. Returns
    /// the recipients actually handed to the relay, in input order.
    async fn send_batch(&self, messages: Vec<OutboundMessage>) -> PtsResult<Vec<String>> {
        let mut accepted = Vec::with_capacity(messages.len());
        for message in messages {
            let recipient = message.envelope_to.clone();
            match self.send(message).await {
                Ok(()) => accepted.push(recipient),
                Err(error) => {
                    tracing::warn!(
                        recipient = %recipient,
                        error = %error,
                        "Failed to hand message to transport"
                    );
                }
            }
        }
        Ok(accepted)
    }
}
