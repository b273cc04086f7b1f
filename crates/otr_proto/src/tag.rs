//! Query strings, whitespace tags, error text, and raw classification.
//!
//! A query message (`?OTRv34?`) is an explicit request to negotiate. A
//! whitespace tag is the covert form: a fixed 16-character base sequence of
//! spaces and tabs appended to plaintext, followed by one 8-character block
//! per advertised version. `?OTR Error:` carries a human-readable failure.

use crate::fragment;
use crate::message::ENCODED_PREFIX;
use crate::version::Version;

pub const ERROR_PREFIX: &str = "?OTR Error: ";

const WHITESPACE_BASE: &str = " \t  \t\t\t\t \t \t \t  ";
const WHITESPACE_V2: &str = "  \t\t  \t ";
const WHITESPACE_V3: &str = "  \t\t  \t\t";
const WHITESPACE_V4: &str = "  \t\t \t  ";

// ── Query messages ───────────────────────────────────────────────────────────

/// `?OTRv34?`, optionally followed by the host's human-readable fallback.
pub fn build_query(versions: &[Version], fallback: &str) -> String {
    let digits: String = versions.iter().filter_map(|v| v.digit()).collect();
    if fallback.is_empty() {
        format!("?OTRv{digits}?")
    } else {
        format!("?OTRv{digits}? {fallback}")
    }
}

/// Versions offered by a query message, or `None` if this is not a query.
/// Handles `?OTR?` (v1-only, offers nothing we speak), `?OTRv24?`, and the
/// combined `?OTR?v34?` form.
pub fn parse_query(raw: &str) -> Option<Vec<Version>> {
    let rest = raw.strip_prefix("?OTR")?;
    let mut chars = rest.chars().peekable();
    let mut versions = Vec::new();
    let mut is_query = false;
    if chars.peek() == Some(&'?') {
        // bare v1 offer
        chars.next();
        is_query = true;
    }
    if chars.peek() == Some(&'v') {
        chars.next();
        is_query = true;
        for c in chars.by_ref() {
            if c == '?' {
                break;
            }
            if let Some(v) = Version::from_digit(c) {
                if !versions.contains(&v) {
                    versions.push(v);
                }
            }
        }
    }
    is_query.then_some(versions)
}

// ── Whitespace tags ──────────────────────────────────────────────────────────

pub fn build_whitespace_tag(versions: &[Version]) -> String {
    let mut tag = String::from(WHITESPACE_BASE);
    for v in versions {
        match v {
            Version::Two => tag.push_str(WHITESPACE_V2),
            Version::Three => tag.push_str(WHITESPACE_V3),
            Version::Four => tag.push_str(WHITESPACE_V4),
            Version::None => {}
        }
    }
    tag
}

/// Find and strip a whitespace tag. Returns the cleaned text and the
/// advertised versions (empty if no tag present).
pub fn extract_whitespace_tag(raw: &str) -> (String, Vec<Version>) {
    let Some(start) = raw.find(WHITESPACE_BASE) else {
        return (raw.to_string(), Vec::new());
    };
    let mut versions = Vec::new();
    let mut rest = &raw[start + WHITESPACE_BASE.len()..];
    loop {
        if let Some(r) = rest.strip_prefix(WHITESPACE_V2) {
            versions.push(Version::Two);
            rest = r;
        } else if let Some(r) = rest.strip_prefix(WHITESPACE_V3) {
            versions.push(Version::Three);
            rest = r;
        } else if let Some(r) = rest.strip_prefix(WHITESPACE_V4) {
            versions.push(Version::Four);
            rest = r;
        } else {
            break;
        }
    }
    let mut cleaned = String::with_capacity(raw.len());
    cleaned.push_str(&raw[..start]);
    cleaned.push_str(rest);
    (cleaned, versions)
}

// ── Error messages ───────────────────────────────────────────────────────────

pub fn build_error(text: &str) -> String {
    format!("{ERROR_PREFIX}{text}")
}

pub fn parse_error(raw: &str) -> Option<&str> {
    raw.strip_prefix(ERROR_PREFIX)
}

// ── Classification ───────────────────────────────────────────────────────────

/// What a raw transport string is, before any per-type parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    /// Plaintext; whitespace tag already stripped, advertised versions attached.
    Plaintext { content: String, tag_versions: Vec<Version> },
    Query(Vec<Version>),
    Error(String),
    Encoded,
    Fragment,
}

pub fn classify(raw: &str) -> RawMessage {
    if fragment::is_fragment(raw) {
        return RawMessage::Fragment;
    }
    if raw.starts_with(ENCODED_PREFIX) {
        return RawMessage::Encoded;
    }
    if let Some(text) = parse_error(raw) {
        return RawMessage::Error(text.to_string());
    }
    if let Some(versions) = parse_query(raw) {
        return RawMessage::Query(versions);
    }
    let (content, tag_versions) = extract_whitespace_tag(raw);
    RawMessage::Plaintext { content, tag_versions }
}

/// Highest mutually viable version, preferring newer.
pub fn select_version(offered: &[Version], allowed: &[Version]) -> Option<Version> {
    offered.iter().filter(|v| allowed.contains(v)).max().copied()
}
