//! Deterministic identity for discovered programs.
//!
//! A stable key is the SHA-256 of four normalized fields joined with `|`:
//! jurisdiction, type, title, canonical source URL. Re-running research over
//! the same jurisdiction must land on the same key even when the upstream page
//! changes casing, spacing, or tracking parameters.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;

use crate::types::Candidate;

const FIELD_DELIMITER: char = '|';

/// Query parameters that identify a click, not a resource.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "gclsrc", "dclid", "msclkid", "mc_cid", "mc_eid", "_ga", "_gl", "ref",
    "ref_src", "igshid", "_dt",
];

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));
static NON_TITLE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s-]").expect("title pattern is valid"));

/// The normalized fields a stable key is computed from. Exposed so callers
/// can log exactly what was hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFields {
    pub jurisdiction: String,
    pub program_type: String,
    pub title: String,
    pub source_url: String,
}

impl KeyFields {
    pub fn from_parts(
        jurisdiction: &str,
        program_type: &str,
        title: &str,
        source_url: Option<&str>,
    ) -> Self {
        Self {
            jurisdiction: normalize_jurisdiction(jurisdiction),
            program_type: normalize_type(program_type),
            title: normalize_title(title),
            source_url: source_url.map(canonical_url).unwrap_or_default(),
        }
    }

    pub fn from_candidate(candidate: &Candidate) -> Self {
        Self::from_parts(
            &candidate.jurisdiction,
            &candidate.program_type,
            &candidate.title,
            candidate.source_url.as_deref(),
        )
    }

    pub fn key(&self) -> String {
        let joined = [
            self.jurisdiction.as_str(),
            self.program_type.as_str(),
            self.title.as_str(),
            self.source_url.as_str(),
        ]
        .join(&FIELD_DELIMITER.to_string());
        hex::encode(Sha256::digest(joined.as_bytes()))
    }
}

/// Stable key for a research candidate.
pub fn stable_key(candidate: &Candidate) -> String {
    KeyFields::from_candidate(candidate).key()
}

pub fn normalize_jurisdiction(raw: &str) -> String {
    raw.trim().to_uppercase()
}

pub fn normalize_type(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Lowercase, trim, collapse whitespace runs, then drop anything that is not
/// a word character, whitespace, or hyphen.
pub fn normalize_title(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let collapsed = WHITESPACE_RUN.replace_all(lowered.trim(), " ");
    NON_TITLE_CHARS.replace_all(&collapsed, "").into_owned()
}

/// Canonical form of a source URL. Never fails: input that does not parse as
/// an absolute URL comes back lowercased and trimmed.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let Ok(mut parsed) = Url::parse(trimmed) else {
        return trimmed.to_lowercase();
    };

    parsed.set_fragment(None);

    if parsed.scheme() == "http" {
        // Only fails for non-special schemes, which never reach this branch.
        let _ = parsed.set_scheme("https");
    }
    if parsed.scheme() == "https" && parsed.port() == Some(443) {
        let _ = parsed.set_port(None);
    }

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let stripped = path.trim_end_matches('/');
        parsed.set_path(if stripped.is_empty() { "/" } else { stripped });
    }

    parsed.to_string()
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}
