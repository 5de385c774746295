//! Canonical record validation.
//!
//! Malformed input is an expected, reportable condition: validation returns
//! a structured violation list instead of erroring, so the caller can put
//! the messages on a form. Only programmer errors (not representable here,
//! since `EntityKind` is a closed enum) would ever panic.
//!
//! Records are expected to be in canonical form already; run
//! [`normalize`](super::normalize) first.

use chrono::{NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::{normalize, EntityKind, Record};

/// Minimum digits a phone number must contain, separators aside.
const PHONE_MIN_DIGITS: usize = 7;

/// Date fields must parse as real calendar dates in this format.
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Fields validated as calendar dates when present.
const DATE_FIELDS: &[&str] = &[
    "date_of_birth",
    "start_date",
    "end_date",
    "open_date",
    "close_date",
];

/// Enrollment modes a ministry (and an enrollment status) may carry.
const ENROLLMENT_TYPES: &[&str] = &["enrolled", "expressed_interest"];

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$")
        .expect("email regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationCode {
    MissingField,
    InvalidPhone,
    InvalidEmail,
    InvalidDate,
    FutureDate,
    InvalidChoice,
    InvalidType,
    ForeignKeyMismatch,
}

/// One validation failure, tied to the canonical field that caused it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub field: String,
    pub code: ViolationCode,
    pub message: String,
}

impl Violation {
    fn new(field: impl Into<String>, code: ViolationCode, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code,
            message: message.into(),
        }
    }

    fn prefixed(mut self, prefix: &str) -> Self {
        self.field = format!("{}.{}", prefix, self.field);
        self
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

fn check_phone(field: &str, raw: &str, out: &mut Vec<Violation>) {
    let digits = raw.chars().filter(char::is_ascii_digit).count();
    let allowed = raw
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '(' | ')' | '-' | '.' | ' '));
    if digits < PHONE_MIN_DIGITS || !allowed {
        out.push(Violation::new(
            field,
            ViolationCode::InvalidPhone,
            format!("'{}' is not a valid phone number", raw),
        ));
    }
}

fn check_email(field: &str, raw: &str, out: &mut Vec<Violation>) {
    if !EMAIL_RE.is_match(raw) {
        out.push(Violation::new(
            field,
            ViolationCode::InvalidEmail,
            format!("'{}' is not a valid email address", raw),
        ));
    }
}

fn check_date(field: &str, raw: &str, out: &mut Vec<Violation>) {
    match NaiveDate::parse_from_str(raw, DATE_FORMAT) {
        Ok(date) => {
            if field == "date_of_birth" && date > Utc::now().date_naive() {
                out.push(Violation::new(
                    field,
                    ViolationCode::FutureDate,
                    "date of birth cannot be in the future",
                ));
            }
        }
        Err(_) => out.push(Violation::new(
            field,
            ViolationCode::InvalidDate,
            format!("'{}' is not a valid {} date", raw, DATE_FORMAT),
        )),
    }
}

/// Apply the format rule (if any) for one present field.
///
/// Null and blank values are skipped; the required-field check already
/// reports those where presence matters.
fn check_field_format(kind: EntityKind, field: &str, value: &Value, out: &mut Vec<Violation>) {
    match value {
        Value::Null => return,
        Value::String(s) if s.trim().is_empty() => return,
        _ => {}
    }

    let expect_string = |value: &Value, out: &mut Vec<Violation>| -> Option<String> {
        match value {
            Value::String(s) => Some(s.clone()),
            _ => {
                out.push(Violation::new(
                    field,
                    ViolationCode::InvalidType,
                    "expected a string value",
                ));
                None
            }
        }
    };

    if field.contains("phone") {
        if let Some(s) = expect_string(value, out) {
            check_phone(field, &s, out);
        }
    } else if field.contains("email") {
        if let Some(s) = expect_string(value, out) {
            check_email(field, &s, out);
        }
    } else if DATE_FIELDS.contains(&field) {
        if let Some(s) = expect_string(value, out) {
            check_date(field, &s, out);
        }
    } else if field == "enrollment_type"
        || (field == "status" && kind == EntityKind::MinistryEnrollment)
    {
        if let Some(s) = expect_string(value, out) {
            if !ENROLLMENT_TYPES.contains(&s.as_str()) {
                out.push(Violation::new(
                    field,
                    ViolationCode::InvalidChoice,
                    format!("'{}' must be one of: {}", s, ENROLLMENT_TYPES.join(", ")),
                ));
            }
        }
    } else if field == "is_primary_guardian" || field == "is_active" {
        if !value.is_boolean() {
            out.push(Violation::new(
                field,
                ViolationCode::InvalidType,
                "expected a boolean value",
            ));
        }
    }
}

fn collect_violations(kind: EntityKind, record: &Record, require_presence: bool) -> Vec<Violation> {
    let mut out = Vec::new();

    if require_presence {
        for field in kind.required_fields() {
            if is_blank(record.get(*field)) {
                out.push(Violation::new(
                    *field,
                    ViolationCode::MissingField,
                    format!("{} requires {}", kind, field),
                ));
            }
        }
    }

    for (field, value) in record {
        check_field_format(kind, field, value, &mut out);
    }

    out
}

/// Validate a full canonical record against its entity schema.
pub fn validate(kind: EntityKind, record: &Record) -> Result<(), Vec<Violation>> {
    let violations = collect_violations(kind, record, true);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Validate a partial update: format rules only.
///
/// Required-field presence is not checked because a patch merges into an
/// existing record that already satisfied it.
pub fn validate_patch(kind: EntityKind, patch: &Record) -> Result<(), Vec<Violation>> {
    let violations = collect_violations(kind, patch, false);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

// ===== Registration bundle =====

/// A per-child ministry choice submitted with a registration.
///
/// `custom_fields` is an opaque caller-defined map; its keys are never
/// renamed or validated.
#[derive(Debug, Clone)]
pub struct MinistrySelection {
    pub child_index: usize,
    pub ministry_id: String,
    pub status: String,
    pub custom_fields: Value,
}

/// Raw registration submission, exactly as the form layer produced it.
/// Keys may be in any casing; normalization happens during validation.
#[derive(Debug, Clone, Default)]
pub struct RegistrationBundle {
    pub cycle_id: String,
    pub submitted_via: String,
    pub household: Record,
    pub guardians: Vec<Record>,
    pub emergency_contact: Option<Record>,
    pub children: Vec<Record>,
    pub consents: Vec<Value>,
    pub ministry_selections: Vec<MinistrySelection>,
}

/// A bundle that passed validation: canonical keys, ids filled in, every
/// child/guardian/contact pointing at the same household.
#[derive(Debug, Clone)]
pub struct ValidatedBundle {
    pub household_id: String,
    pub cycle_id: String,
    pub submitted_via: String,
    pub household: Record,
    pub guardians: Vec<Record>,
    pub emergency_contact: Option<Record>,
    pub children: Vec<Record>,
    pub consents: Vec<Value>,
    pub ministry_selections: Vec<MinistrySelection>,
}

fn string_field(record: &Record, field: &str) -> Option<String> {
    match record.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    }
}

/// Fill a missing `household_id` from the owning household, flag a
/// present-but-different one as a cross-entity mismatch, and reject a
/// non-string one instead of silently replacing it.
fn reconcile_household_id(
    record: &mut Record,
    household_id: &str,
    prefix: &str,
    out: &mut Vec<Violation>,
) {
    match record.get("household_id").cloned() {
        Some(Value::String(actual)) if !actual.trim().is_empty() => {
            if actual != household_id {
                out.push(Violation::new(
                    format!("{}.household_id", prefix),
                    ViolationCode::ForeignKeyMismatch,
                    format!(
                        "household_id '{}' does not match the bundle household '{}'",
                        actual, household_id
                    ),
                ));
            }
        }
        None | Some(Value::Null) | Some(Value::String(_)) => {
            record.insert(
                "household_id".to_string(),
                Value::String(household_id.to_string()),
            );
        }
        Some(_) => {
            out.push(Violation::new(
                format!("{}.household_id", prefix),
                ViolationCode::InvalidType,
                "expected a string value",
            ));
        }
    }
}

/// Normalize and validate a whole registration submission.
///
/// On success every record is canonical, carries an id, and agrees on the
/// household id; on failure nothing has touched a store adapter.
pub fn validate_registration_bundle(
    bundle: &RegistrationBundle,
) -> Result<ValidatedBundle, Vec<Violation>> {
    let mut out = Vec::new();

    if bundle.cycle_id.trim().is_empty() {
        out.push(Violation::new(
            "cycle_id",
            ViolationCode::MissingField,
            "a registration must reference a cycle",
        ));
    }
    if bundle.submitted_via.trim().is_empty() {
        out.push(Violation::new(
            "submitted_via",
            ViolationCode::MissingField,
            "a registration must carry a submission channel",
        ));
    }

    let mut household = normalize(EntityKind::Household, &bundle.household);
    let household_id = match string_field(&household, "household_id") {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4().to_string();
            household.insert("household_id".to_string(), Value::String(id.clone()));
            id
        }
    };
    if let Err(violations) = validate(EntityKind::Household, &household) {
        out.extend(violations.into_iter().map(|v| v.prefixed("household")));
    }

    let mut guardians = Vec::with_capacity(bundle.guardians.len());
    for (i, raw) in bundle.guardians.iter().enumerate() {
        let prefix = format!("guardians[{}]", i);
        let mut guardian = normalize(EntityKind::Guardian, raw);
        reconcile_household_id(&mut guardian, &household_id, &prefix, &mut out);
        if let Err(violations) = validate(EntityKind::Guardian, &guardian) {
            out.extend(violations.into_iter().map(|v| v.prefixed(&prefix)));
        }
        guardians.push(guardian);
    }

    let emergency_contact = bundle.emergency_contact.as_ref().map(|raw| {
        let mut contact = normalize(EntityKind::EmergencyContact, raw);
        reconcile_household_id(&mut contact, &household_id, "emergency_contact", &mut out);
        if let Err(violations) = validate(EntityKind::EmergencyContact, &contact) {
            out.extend(violations.into_iter().map(|v| v.prefixed("emergency_contact")));
        }
        contact
    });

    let mut children = Vec::with_capacity(bundle.children.len());
    for (i, raw) in bundle.children.iter().enumerate() {
        let prefix = format!("children[{}]", i);
        let mut child = normalize(EntityKind::Child, raw);
        if string_field(&child, "child_id").is_none() {
            child.insert(
                "child_id".to_string(),
                Value::String(Uuid::new_v4().to_string()),
            );
        }
        reconcile_household_id(&mut child, &household_id, &prefix, &mut out);
        if let Err(violations) = validate(EntityKind::Child, &child) {
            out.extend(violations.into_iter().map(|v| v.prefixed(&prefix)));
        }
        children.push(child);
    }

    for (i, consent) in bundle.consents.iter().enumerate() {
        if !consent.is_object() {
            out.push(Violation::new(
                format!("consents[{}]", i),
                ViolationCode::InvalidType,
                "a consent record must be a JSON object",
            ));
        }
    }

    for (i, selection) in bundle.ministry_selections.iter().enumerate() {
        let prefix = format!("ministry_selections[{}]", i);
        if selection.child_index >= bundle.children.len() {
            out.push(Violation::new(
                format!("{}.child_index", prefix),
                ViolationCode::ForeignKeyMismatch,
                format!(
                    "child index {} is out of range for {} children",
                    selection.child_index,
                    bundle.children.len()
                ),
            ));
        }
        if selection.ministry_id.trim().is_empty() {
            out.push(Violation::new(
                format!("{}.ministry_id", prefix),
                ViolationCode::MissingField,
                "a ministry selection must reference a ministry",
            ));
        }
        if !ENROLLMENT_TYPES.contains(&selection.status.as_str()) {
            out.push(Violation::new(
                format!("{}.status", prefix),
                ViolationCode::InvalidChoice,
                format!(
                    "'{}' must be one of: {}",
                    selection.status,
                    ENROLLMENT_TYPES.join(", ")
                ),
            ));
        }
    }

    if !out.is_empty() {
        return Err(out);
    }

    Ok(ValidatedBundle {
        household_id,
        cycle_id: bundle.cycle_id.clone(),
        submitted_via: bundle.submitted_via.clone(),
        household,
        guardians,
        emergency_contact,
        children,
        consents: bundle.consents.clone(),
        ministry_selections: bundle.ministry_selections.clone(),
    })
}
