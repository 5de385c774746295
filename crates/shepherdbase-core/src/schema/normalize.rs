//! Key normalization into canonical snake_case form.
//!
//! Client input arrives with mixed camelCase and snake_case keys depending
//! on which form produced it. Normalization rewrites every top-level key to
//! the canonical name for its entity: the per-entity override table is
//! consulted first (exact match on the source key), then a generic
//! camelCase to snake_case rewrite applies.
//!
//! Values pass through unchanged; no type coercion happens here. Nested
//! objects (per-ministry custom answers, consent payloads) are opaque
//! values whose keys are caller-defined, so they are not renamed.

use serde_json::Value;

use super::{EntityKind, Record};

/// Rewrite a camelCase key as snake_case.
///
/// Already-snake keys have no uppercase letters and come back unchanged,
/// which is what makes normalization idempotent.
fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Canonical name for a single key of the given entity.
pub fn normalize_key(kind: EntityKind, key: &str) -> String {
    for (source, target) in kind.overrides() {
        if *source == key {
            return (*target).to_string();
        }
    }
    snake_case(key)
}

/// Rewrite all top-level keys of `raw` into canonical form.
///
/// When two input keys collapse to the same canonical key (e.g. both
/// `mobilePhone` and `mobile_phone` present), the later one wins; the
/// output never carries two differently-cased keys for one field.
pub fn normalize(kind: EntityKind, raw: &Record) -> Record {
    let mut out = Record::new();
    for (key, value) in raw {
        out.insert(normalize_key(kind, key), value.clone());
    }
    out
}

/// Normalize a filter map's keys so callers may filter with either casing.
pub(crate) fn normalize_filter_keys(
    kind: EntityKind,
    filters: &std::collections::BTreeMap<String, Value>,
) -> std::collections::BTreeMap<String, Value> {
    filters
        .iter()
        .map(|(k, v)| (normalize_key(kind, k), v.clone()))
        .collect()
}
