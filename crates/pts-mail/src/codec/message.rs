//! # Message Codec
//!
//! Thin wrapper over `mail-parser` keeping the original bytes alongside the
//! parsed view. Forwarded copies are produced by prepending new headers to
//! the untouched raw message, so the DATA handed to the transport is
//! byte-identical across recipients and original encodings survive.

use mail_parser::MessageParser;

use pts_shared::{PtsError, PtsResult};

/// An inbound RFC 5322 message.
///
/// Accessors parse on demand and return owned values; a message that parsed
/// at construction keeps parsing. Header lookups are case-insensitive and
/// preserve order; multi-valued headers yield every value.
#[derive(Debug, Clone)]
pub struct MailMessage {
    raw: Vec<u8>,
}

impl MailMessage {
    /// Parse a raw message. Messages without a single parseable header are
    /// rejected; everything else is best-effort (a missing `Content-Type`
    /// reads as `text/plain; charset=ascii`).
    pub fn parse(raw: Vec<u8>) -> PtsResult<Self> {
        if MessageParser::default().parse(&raw).is_none() {
            return Err(PtsError::Parse("message has no parseable headers".into()));
        }
        Ok(Self { raw })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// All values of the named header, in order of appearance.
    pub fn header_all(&self, name: &str) -> Vec<String> {
        match MessageParser::default().parse(&self.raw) {
            Some(message) => message
                .header_values(name)
                .filter_map(|value| value.as_text())
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        }
    }

    /// First value of the named header.
    pub fn header(&self, name: &str) -> Option<String> {
        self.header_all(name).into_iter().next()
    }

    pub fn has_header(&self, name: &str) -> bool {
        match MessageParser::default().parse(&self.raw) {
            Some(message) => message.header_values(name).next().is_some(),
            None => false,
        }
    }

    pub fn subject(&self) -> Option<String> {
        MessageParser::default()
            .parse(&self.raw)
            .and_then(|message| message.subject().map(str::to_string))
    }

    /// The addr-spec of the first `From:` mailbox.
    pub fn from_address(&self) -> Option<String> {
        MessageParser::default().parse(&self.raw).and_then(|message| {
            message
                .from()
                .and_then(|address| address.first())
                .and_then(|mailbox| mailbox.address())
                .map(str::to_string)
        })
    }

    /// The addr-spec of the first `To:` mailbox.
    pub fn to_address(&self) -> Option<String> {
        MessageParser::default().parse(&self.raw).and_then(|message| {
            message
                .to()
                .and_then(|address| address.first())
                .and_then(|mailbox| mailbox.address())
                .map(str::to_string)
        })
    }

    /// The decoded text of the first `text/plain` part, if one exists.
    /// Undecodable payloads and HTML-only messages yield `None`.
    pub fn first_plain_text(&self) -> Option<String> {
        MessageParser::default().parse(&self.raw).and_then(|message| {
            message
                .text_bodies()
                .find(|part| part.is_text() && !part.is_text_html())
                .and_then(|part| part.text_contents().map(str::to_string))
        })
    }

    /// Every decoded text part joined together. Used by vendor keyword
    /// classification, which scans the whole body.
    pub fn all_text(&self) -> String {
        match MessageParser::default().parse(&self.raw) {
            Some(message) => {
                let parts: Vec<String> = message
                    .text_bodies()
                    .filter_map(|part| part.text_contents().map(str::to_string))
                    .collect();
                parts.join("\n")
            }
            None => String::new(),
        }
    }

    /// Render a copy of the message with the given headers inserted above
    /// the existing header block, in the given order. Values containing CR
    /// or LF are rejected to prevent header injection.
    pub fn prepend_headers(&self, headers: &[(String, String)]) -> PtsResult<Vec<u8>> {
        let line_ending: &[u8] = if self.raw.windows(2).any(|w| w == b"\r\n") {
            b"\r\n"
        } else {
            b"\n"
        };

        let mut out = Vec::with_capacity(self.raw.len() + headers.len() * 64);
        for (name, value) in headers {
            check_header_value(name)?;
            check_header_value(value)?;
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(line_ending);
        }
        out.extend_from_slice(&self.raw);
        Ok(out)
    }
}

/// Render a fresh outbound message from headers and a text body.
pub fn compose(headers: &[(&str, &str)], body: &str) -> PtsResult<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len() + headers.len() * 64 + 64);
    for (name, value) in headers {
        check_header_value(name)?;
        check_header_value(value)?;
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    for line in body.split('\n') {
        out.extend_from_slice(line.trim_end_matches('\r').as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    Ok(out)
}

fn check_header_value(value: &str) -> PtsResult<()> {
    if value.contains('\r') || value.contains('\n') {
        return Err(PtsError::Parse(format!(
            "header field contains a line break: {value:?}"
        )));
    }
    Ok(())
}
