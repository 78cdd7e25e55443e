//! Recording transport used by tests and local dry runs.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Mutex;

use crate::error::{PtsError, PtsResult};

use super::{MailTransport, OutboundMessage};

/// Captures every envelope instead of sending it. Recipients listed in
/// `failing` are rejected, which lets tests exercise the
/// failure-does-not-abort-the-batch behavior.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundMessage>>,
    failing: Mutex<BTreeSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sends to this recipient fail.
    pub fn fail_recipient(&self, recipient: &str) {
        self.failing
            .lock()
            .expect("recording transport lock poisoned")
            .insert(recipient.to_string());
    }

    /// Snapshot of everything sent so far.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .expect("recording transport lock poisoned")
            .clone()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send(&self, message: OutboundMessage) -> PtsResult<()> {
        let failing = self
            .failing
            .lock()
            .expect("recording transport lock poisoned");
        if failing.contains(&message.envelope_to) {
            return Err(PtsError::Transport(format!(
                "injected failure for {}",
                message.envelope_to
            )));
        }
        drop(failing);

        self.sent
            .lock()
            .expect("recording transport lock poisoned")
            .push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_continues_past_failing_recipient() {
        let transport = RecordingTransport::new();
        transport.fail_recipient("bad@x.org");

        let accepted = transport
            .send_batch(vec![
                OutboundMessage::new("rp@x.org", "amy@x.org", b"data".to_vec()),
                OutboundMessage::new("rp@x.org", "bad@x.org", b"data".to_vec()),
                OutboundMessage::new("rp@x.org", "zed@x.org", b"data".to_vec()),
            ])
            .await
            .unwrap();

        assert_eq!(accepted, ["amy@x.org", "zed@x.org"]);
        assert_eq!(transport.sent().len(), 2);
    }
}
