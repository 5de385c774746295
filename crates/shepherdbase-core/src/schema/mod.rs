//! Canonical entity schemas.
//!
//! Every record the data layer accepts is keyed by canonical snake_case
//! field names. This module is the single source of truth for per-entity
//! metadata: logical table name, primary-key field, required fields,
//! indexed fields, rename overrides, and whether the backing table carries
//! an `updated_at` column.
//!
//! - `EntityKind`: one variant per logical table
//! - `normalize`: key normalization into canonical form
//! - `validate`: field-format and required-field validation

pub mod normalize;
pub mod validate;

pub use normalize::{normalize, normalize_key};
pub use validate::{
    validate, validate_patch, validate_registration_bundle, MinistrySelection,
    RegistrationBundle, ValidatedBundle, Violation, ViolationCode,
};

use serde_json::Value;

/// A canonical record: a JSON object with snake_case keys.
///
/// Unknown keys pass through unvalidated; the remote store only persists
/// columns the destination table actually has.
pub type Record = serde_json::Map<String, Value>;

/// One variant per logical table in the data layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Household,
    Guardian,
    EmergencyContact,
    Child,
    RegistrationCycle,
    Registration,
    Ministry,
    MinistryEnrollment,
    LeaderProfile,
    MinistryLeaderMembership,
    Attendance,
    Incident,
}

impl EntityKind {
    /// All entity kinds, in dependency order (parents before children).
    pub const ALL: [EntityKind; 12] = [
        EntityKind::Household,
        EntityKind::Guardian,
        EntityKind::EmergencyContact,
        EntityKind::Child,
        EntityKind::RegistrationCycle,
        EntityKind::Registration,
        EntityKind::Ministry,
        EntityKind::MinistryEnrollment,
        EntityKind::LeaderProfile,
        EntityKind::MinistryLeaderMembership,
        EntityKind::Attendance,
        EntityKind::Incident,
    ];

    /// Logical table name used by both store adapters.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Household => "households",
            EntityKind::Guardian => "guardians",
            EntityKind::EmergencyContact => "emergency_contacts",
            EntityKind::Child => "children",
            EntityKind::RegistrationCycle => "registration_cycles",
            EntityKind::Registration => "registrations",
            EntityKind::Ministry => "ministries",
            EntityKind::MinistryEnrollment => "ministry_enrollments",
            EntityKind::LeaderProfile => "leader_profiles",
            EntityKind::MinistryLeaderMembership => "ministry_leader_memberships",
            EntityKind::Attendance => "attendance",
            EntityKind::Incident => "incidents",
        }
    }

    /// Primary-key field name (`<entity>_id`).
    pub fn id_field(&self) -> &'static str {
        match self {
            EntityKind::Household => "household_id",
            EntityKind::Guardian => "guardian_id",
            EntityKind::EmergencyContact => "emergency_contact_id",
            EntityKind::Child => "child_id",
            EntityKind::RegistrationCycle => "cycle_id",
            EntityKind::Registration => "registration_id",
            EntityKind::Ministry => "ministry_id",
            EntityKind::MinistryEnrollment => "enrollment_id",
            EntityKind::LeaderProfile => "leader_id",
            EntityKind::MinistryLeaderMembership => "membership_id",
            EntityKind::Attendance => "attendance_id",
            EntityKind::Incident => "incident_id",
        }
    }

    /// Minimal identifying fields a record must carry before it may be
    /// persisted. The primary key is not listed; adapters generate it.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Household => &["address_line1"],
            EntityKind::Guardian => &["first_name", "last_name", "mobile_phone", "household_id"],
            EntityKind::EmergencyContact => {
                &["first_name", "last_name", "mobile_phone", "household_id"]
            }
            EntityKind::Child => &["first_name", "last_name", "household_id"],
            EntityKind::RegistrationCycle => &["start_date", "end_date"],
            EntityKind::Registration => &["child_id", "cycle_id"],
            EntityKind::Ministry => &["name", "enrollment_type"],
            EntityKind::MinistryEnrollment => &["child_id", "ministry_id", "cycle_id"],
            EntityKind::LeaderProfile => &["first_name", "last_name"],
            EntityKind::MinistryLeaderMembership => &["leader_id", "ministry_id"],
            EntityKind::Attendance => &["child_id", "event_id"],
            EntityKind::Incident => &["child_id", "description"],
        }
    }

    /// Fields the local store maintains secondary indexes for.
    /// `list` filters on these become prefix scans instead of table scans.
    pub fn indexed_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Household => &[],
            EntityKind::Guardian => &["household_id"],
            EntityKind::EmergencyContact => &["household_id"],
            EntityKind::Child => &["household_id"],
            EntityKind::RegistrationCycle => &[],
            EntityKind::Registration => &["child_id", "cycle_id"],
            EntityKind::Ministry => &[],
            EntityKind::MinistryEnrollment => &["child_id", "cycle_id"],
            EntityKind::LeaderProfile => &[],
            EntityKind::MinistryLeaderMembership => &["ministry_id"],
            EntityKind::Attendance => &["child_id", "event_id"],
            EntityKind::Incident => &["child_id"],
        }
    }

    /// Whether the backing table carries an `updated_at` column.
    ///
    /// The remote store must omit the field entirely for tables without the
    /// column; sending it produces a destination-schema error.
    pub fn has_updated_at(&self) -> bool {
        !matches!(
            self,
            EntityKind::MinistryLeaderMembership | EntityKind::Attendance
        )
    }

    /// Rename overrides: exact source key -> canonical key.
    ///
    /// Only fields whose canonical name differs from a naive camelCase to
    /// snake_case rewrite belong here. Consumed solely by the normalizer.
    pub fn overrides(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            EntityKind::Household => &[
                ("zip", "postal_code"),
                ("preferredTranslation", "preferred_scripture_translation"),
            ],
            EntityKind::Guardian => &[
                ("cellPhone", "mobile_phone"),
                ("cell_phone", "mobile_phone"),
                ("primary", "is_primary_guardian"),
            ],
            EntityKind::EmergencyContact => {
                &[("phone", "mobile_phone"), ("cellPhone", "mobile_phone")]
            }
            EntityKind::Child => &[("dob", "date_of_birth")],
            EntityKind::RegistrationCycle => &[],
            EntityKind::Registration => &[("channel", "submitted_via")],
            EntityKind::Ministry => &[("mode", "enrollment_type")],
            EntityKind::MinistryEnrollment => &[("answers", "custom_fields")],
            EntityKind::LeaderProfile => &[],
            EntityKind::MinistryLeaderMembership => &[],
            EntityKind::Attendance => &[("checkIn", "check_in_at"), ("checkOut", "check_out_at")],
            EntityKind::Incident => &[],
        }
    }

    /// Look up an entity kind by its logical table name.
    pub fn from_table(table: &str) -> Option<EntityKind> {
        EntityKind::ALL.iter().copied().find(|k| k.table() == table)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table())
    }
}
