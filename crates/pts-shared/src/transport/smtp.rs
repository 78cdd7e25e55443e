//! SMTP transport over lettre, one pooled relay connection per process.

use std::time::Duration;

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};

use crate::config::SmtpConfig;
use crate::error::{PtsError, PtsResult};

use super::{MailTransport, OutboundMessage};

/// Production transport handing envelopes to the configured SMTP relay.
pub struct SmtpMailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl std::fmt::Debug for SmtpMailTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailTransport").finish_non_exhaustive()
    }
}

impl SmtpMailTransport {
    pub fn new(config: &SmtpConfig) -> Self {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_seconds)))
            .build();
        Self { transport }
    }

    fn parse_address(raw: &str) -> PtsResult<Address> {
        raw.parse::<Address>()
            .map_err(|e| PtsError::Transport(format!("invalid envelope address {raw}: {e}")))
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, message: OutboundMessage) -> PtsResult<()> {
        let from = Self::parse_address(&message.envelope_from)?;
        let to = Self::parse_address(&message.envelope_to)?;
        let envelope = Envelope::new(Some(from), vec![to])
            .map_err(|e| PtsError::Transport(format!("invalid envelope: {e}")))?;

        self.transport
            .send_raw(&envelope, &message.data)
            .await
            .map_err(|e| PtsError::Transport(format!("smtp send failed: {e}")))?;
        Ok(())
    }
}
