//! Deterministic server names

use chrono::{DateTime, Utc};

const MAX_NAME_LEN: usize = 63;
const PREFIX: &str = "opt";
const FALLBACK_SLUG: &str = "job";

/// `opt-<template>-<yyyymmddhhmmss>`, reduced to lowercase letters, digits
/// and single dashes, at most 63 characters. A template id with nothing
/// usable in it becomes `job`.
pub fn server_name(template_id: &str, created_at: DateTime<Utc>) -> String {
    let mut slug = sanitize(template_id);
    if slug.is_empty() {
        slug = FALLBACK_SLUG.to_string();
    }
    // keep the timestamp when the slug is long
    let stamp = created_at.format("%Y%m%d%H%M%S").to_string();
    let room = MAX_NAME_LEN - PREFIX.len() - stamp.len() - 2;
    slug.truncate(room);
    let slug = slug.trim_end_matches('-');

    sanitize(&format!("{}-{}-{}", PREFIX, slug, stamp))
}

/// Lowercase, map anything outside `[a-z0-9-]` to `-`, collapse runs of
/// dashes, trim them from both ends and cap the length.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars().flat_map(char::to_lowercase) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(c);
    }
    out.truncate(MAX_NAME_LEN);
    out.trim_end_matches('-').to_string()
}
