//! Modified UTF-7 mailbox-name codec (RFC 3501 §5.1.3).
//!
//! An idiosyncratic base64 variant: `&` shifts into base64, `-` shifts
//! out, `,` stands in for `/`, and `&` itself is spelled `&-`. This is
//! deliberately a byte-wise stateful implementation of exactly the
//! IMAP dialect, not a general UTF-7 codec.

use base64::alphabet::Alphabet;
use base64::engine::general_purpose::GeneralPurposeConfig;
use base64::engine::{DecodePaddingMode, GeneralPurpose};
use base64::Engine;
use once_cell::sync::Lazy;

use crate::errors::{SyncError, SyncResult};

static MUTF7_B64: Lazy<GeneralPurpose> = Lazy::new(|| {
    let alphabet =
        Alphabet::new("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+,")
            .expect("fixed alphabet");
    GeneralPurpose::new(
        &alphabet,
        GeneralPurposeConfig::new()
            .with_encode_padding(false)
            .with_decode_padding_mode(DecodePaddingMode::Indifferent),
    )
});

fn flush_shift(pending: &mut Vec<u16>, out: &mut String) {
    if pending.is_empty() {
        return;
    }
    let mut bytes = Vec::with_capacity(pending.len() * 2);
    for unit in pending.drain(..) {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    out.push('&');
    out.push_str(&MUTF7_B64.encode(&bytes));
    out.push('-');
}

/// Encode a UTF-8 mailbox name for the wire.
pub fn encode(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending: Vec<u16> = Vec::new();

    for c in name.chars() {
        if (' '..='~').contains(&c) {
            flush_shift(&mut pending, &mut out);
            if c == '&' {
                out.push_str("&-");
            } else {
                out.push(c);
            }
        } else {
            let mut units = [0u16; 2];
            pending.extend_from_slice(c.encode_utf16(&mut units));
        }
    }
    flush_shift(&mut pending, &mut out);
    out
}

fn decode_shift(chunk: &str) -> SyncResult<String> {
    let bytes = MUTF7_B64
        .decode(chunk)
        .map_err(|e| SyncError::Message(format!("bad modified-utf7 base64 {chunk:?}: {e}")))?;
    if bytes.len() % 2 != 0 {
        return Err(SyncError::Message(format!(
            "odd utf-16 payload in modified-utf7 chunk {chunk:?}"
        )));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|_| SyncError::Message(format!("invalid utf-16 in modified-utf7 chunk {chunk:?}")))
}

/// Decode a wire mailbox name back to UTF-8. Callers that can tolerate
/// undecodable names should fall back to the raw input on error.
pub fn decode(name: &str) -> SyncResult<String> {
    let mut out = String::with_capacity(name.len());
    let mut shift: Option<String> = None;

    for c in name.chars() {
        match shift {
            None => {
                if c == '&' {
                    shift = Some(String::new());
                } else {
                    out.push(c);
                }
            }
            Some(ref mut chunk) => {
                if c == '-' {
                    if chunk.is_empty() {
                        out.push('&');
                    } else {
                        out.push_str(&decode_shift(chunk)?);
                    }
                    shift = None;
                } else {
                    chunk.push(c);
                }
            }
        }
    }

    if shift.is_some() {
        return Err(SyncError::Message(format!(
            "unterminated modified-utf7 shift in {name:?}"
        )));
    }
    Ok(out)
}
