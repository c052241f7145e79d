//! Header-block surgery used before APPEND.

use tern::folder::imap::{strip_headers, MARKER_HEADER};

const MESSAGE: &[u8] = b"From: a@example.com\r\n\
X-Private: secret\r\n\
X-Folded: first\r\n\
\tsecond line\r\n\
Subject: hello\r\n\
\r\n\
X-Private: body text, not a header\r\n";

#[test]
fn strips_named_headers_only() {
    let out = strip_headers(MESSAGE, &["X-Private".to_string()]);
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("From: a@example.com"));
    assert!(text.contains("Subject: hello"));
    assert!(!text.starts_with("X-Private"));
    assert!(!text.contains("X-Private: secret"));
    // The body is untouched even when it looks like the header.
    assert!(text.contains("X-Private: body text, not a header"));
}

#[test]
fn strips_folded_continuations() {
    let out = strip_headers(MESSAGE, &["X-Folded".to_string()]);
    let text = String::from_utf8(out).unwrap();
    assert!(!text.contains("X-Folded"));
    assert!(!text.contains("second line"));
}

#[test]
fn no_names_is_identity() {
    assert_eq!(strip_headers(MESSAGE, &[]), MESSAGE);
}

#[test]
fn header_name_matching_is_case_insensitive() {
    let out = strip_headers(MESSAGE, &["x-private".to_string()]);
    assert!(!String::from_utf8(out).unwrap().contains("X-Private: secret"));
}

#[test]
fn marker_header_is_the_compatible_name() {
    // Uploaded messages carry this marker so the assigned UID can be
    // found again; it is never re-stripped on the destination.
    assert_eq!(MARKER_HEADER, "X-OfflineIMAP");
}
