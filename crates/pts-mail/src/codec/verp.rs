//! # VERP Codec
//!
//! Variable Envelope Return Path encoding: the recipient of a dispatched
//! copy is folded into the envelope sender so a later bounce identifies the
//! original addressee.
//!
//! `encode("bounces+20240307@pts.example.org", "user@example.com")` yields
//! `bounces+20240307+user=example.com@pts.example.org`. The recipient's
//! local part is percent-escaped so `+`, `=` and any other octet unsafe in
//! a local part never collide with the separators, which keeps
//! `decode(encode(rp, r)) == (rp, r)` for every RFC 5321 addr-spec pair.

use pts_shared::{PtsError, PtsResult};

/// Encode a recipient into the return path.
pub fn encode(return_path: &str, recipient: &str) -> PtsResult<String> {
    let (rp_local, rp_domain) = split_address(return_path)?;
    let (rc_local, rc_domain) = split_address(recipient)?;
    Ok(format!(
        "{rp_local}+{}={rc_domain}@{rp_domain}",
        escape(rc_local)
    ))
}

/// Recover `(return_path, recipient)` from a bounced envelope recipient.
pub fn decode(address: &str) -> PtsResult<(String, String)> {
    let (local, domain) = split_address(address)?;
    let (rp_local, encoded) = local
        .rsplit_once('+')
        .ok_or_else(|| PtsError::Parse(format!("not a VERP address: {address}")))?;
    let (rc_local, rc_domain) = encoded
        .rsplit_once('=')
        .ok_or_else(|| PtsError::Parse(format!("not a VERP address: {address}")))?;
    if rp_local.is_empty() || rc_domain.is_empty() {
        return Err(PtsError::Parse(format!("not a VERP address: {address}")));
    }
    Ok((
        format!("{rp_local}@{domain}"),
        format!("{}@{rc_domain}", unescape(rc_local)?),
    ))
}

fn split_address(address: &str) -> PtsResult<(&str, &str)> {
    match address.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok((local, domain)),
        _ => Err(PtsError::Parse(format!("not an addr-spec: {address}"))),
    }
}

/// Octets safe to carry unescaped inside the encoded local part. The
/// separators `+` and `=`, and the escape character `%` itself, are never
/// in this set.
fn is_safe(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-')
}

fn escape(local: &str) -> String {
    let mut out = String::with_capacity(local.len());
    for byte in local.bytes() {
        if is_safe(byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn unescape(encoded: &str) -> PtsResult<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut pos = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            b'%' => {
                let hex = bytes
                    .get(pos + 1..pos + 3)
                    .and_then(|pair| std::str::from_utf8(pair).ok())
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| {
                        PtsError::Parse(format!("truncated escape in VERP local part: {encoded}"))
                    })?;
                out.push(hex);
                pos += 3;
            }
            byte => {
                out.push(byte);
                pos += 1;
            }
        }
    }
    String::from_utf8(out)
        .map_err(|_| PtsError::Parse(format!("undecodable VERP local part: {encoded}")))
}
