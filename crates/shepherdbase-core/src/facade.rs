//! Canonical data-access facade: the only path callers use.
//!
//! Every write runs normalize → validate → adapter; a validation failure
//! comes back as a violation list and never touches the store. The active
//! adapter is injected once at construction (see [`crate::open_store`]) and
//! does not change within a session.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::schema::{
    normalize, normalize::normalize_filter_keys, validate, validate_patch,
    validate_registration_bundle, EntityKind, Record, RegistrationBundle, Violation,
};
use crate::store::{DataStore, ListFilter, StoreError, TableSubscription, WriteOp};

#[derive(Debug, Error)]
pub enum DataError {
    /// Expected user-input problems, reported as a structured list.
    #[error("validation failed with {} violation(s)", .0.len())]
    Invalid(Vec<Violation>),

    /// Store and transport failures, propagated unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a successful registration submission wrote.
#[derive(Debug, Clone)]
pub struct RegistrationReceipt {
    pub household_id: String,
    pub child_ids: Vec<String>,
    pub registration_ids: Vec<String>,
    pub enrollment_ids: Vec<String>,
}

pub struct DataAccess {
    store: Arc<dyn DataStore>,
}

impl DataAccess {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Record>, DataError> {
        Ok(self.store.get(kind, id).await?)
    }

    pub async fn create(&self, kind: EntityKind, raw: Record) -> Result<Record, DataError> {
        let row = normalize(kind, &raw);
        validate(kind, &row).map_err(DataError::Invalid)?;
        Ok(self.store.create(kind, row).await?)
    }

    pub async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        raw_patch: Record,
    ) -> Result<Record, DataError> {
        let patch = normalize(kind, &raw_patch);
        validate_patch(kind, &patch).map_err(DataError::Invalid)?;
        Ok(self.store.update(kind, id, patch).await?)
    }

    /// Equality-filtered listing. Filter keys are normalized too, so callers
    /// may filter with either casing.
    pub async fn list(&self, kind: EntityKind, filters: &ListFilter) -> Result<Vec<Record>, DataError> {
        let filters = normalize_filter_keys(kind, filters);
        Ok(self.store.list(kind, &filters).await?)
    }

    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), DataError> {
        Ok(self.store.delete(kind, id).await?)
    }

    pub fn subscribe(&self, table: &str) -> Result<TableSubscription, DataError> {
        Ok(self.store.subscribe(table)?)
    }

    /// Submit a whole registration as one logical unit.
    ///
    /// The bundle is normalized and validated first (including the
    /// cross-entity household-id check); only a clean bundle reaches the
    /// adapter, as one write batch in dependency order.
    pub async fn submit_registration(
        &self,
        bundle: RegistrationBundle,
    ) -> Result<RegistrationReceipt, DataError> {
        let validated = validate_registration_bundle(&bundle).map_err(DataError::Invalid)?;

        let mut ops = Vec::new();
        ops.push(WriteOp::Upsert {
            kind: EntityKind::Household,
            row: validated.household.clone(),
        });
        for guardian in &validated.guardians {
            ops.push(WriteOp::Upsert {
                kind: EntityKind::Guardian,
                row: guardian.clone(),
            });
        }
        if let Some(contact) = &validated.emergency_contact {
            ops.push(WriteOp::Upsert {
                kind: EntityKind::EmergencyContact,
                row: contact.clone(),
            });
        }

        let mut child_ids = Vec::with_capacity(validated.children.len());
        for child in &validated.children {
            // Bundle validation filled the child ids in.
            let id = child
                .get("child_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            child_ids.push(id);
            ops.push(WriteOp::Upsert {
                kind: EntityKind::Child,
                row: child.clone(),
            });
        }

        let mut registration_ids = Vec::with_capacity(child_ids.len());
        for child_id in &child_ids {
            let registration_id = Uuid::new_v4().to_string();
            let mut row = Record::new();
            row.insert(
                "registration_id".to_string(),
                Value::String(registration_id.clone()),
            );
            row.insert("child_id".to_string(), Value::String(child_id.clone()));
            row.insert(
                "cycle_id".to_string(),
                Value::String(validated.cycle_id.clone()),
            );
            row.insert(
                "submitted_via".to_string(),
                Value::String(validated.submitted_via.clone()),
            );
            row.insert(
                "consents".to_string(),
                Value::Array(validated.consents.clone()),
            );
            registration_ids.push(registration_id);
            ops.push(WriteOp::Create {
                kind: EntityKind::Registration,
                row,
            });
        }

        let mut enrollment_ids = Vec::with_capacity(validated.ministry_selections.len());
        for selection in &validated.ministry_selections {
            let enrollment_id = Uuid::new_v4().to_string();
            let mut row = Record::new();
            row.insert(
                "enrollment_id".to_string(),
                Value::String(enrollment_id.clone()),
            );
            row.insert(
                "child_id".to_string(),
                Value::String(child_ids[selection.child_index].clone()),
            );
            row.insert(
                "ministry_id".to_string(),
                Value::String(selection.ministry_id.clone()),
            );
            row.insert(
                "cycle_id".to_string(),
                Value::String(validated.cycle_id.clone()),
            );
            row.insert("status".to_string(), Value::String(selection.status.clone()));
            row.insert("custom_fields".to_string(), selection.custom_fields.clone());
            enrollment_ids.push(enrollment_id);
            ops.push(WriteOp::Create {
                kind: EntityKind::MinistryEnrollment,
                row,
            });
        }

        debug!(
            household_id = %validated.household_id,
            children = child_ids.len(),
            ops = ops.len(),
            "submitting registration batch"
        );
        self.store.apply_batch(ops).await?;
        info!(
            household_id = %validated.household_id,
            registrations = registration_ids.len(),
            "registration submitted"
        );

        Ok(RegistrationReceipt {
            household_id: validated.household_id,
            child_ids,
            registration_ids,
            enrollment_ids,
        })
    }
}
