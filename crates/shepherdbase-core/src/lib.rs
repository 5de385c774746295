//! shepherdbase-core - the canonical data layer for a ministry/household
//! management application.
//!
//! One logical persistence contract, two physically different backends:
//! an embedded [`LocalStore`](store::LocalStore) for offline and demo use,
//! and a hosted [`RemoteStore`](store::RemoteStore) for production. In
//! front of both sits a conversion pipeline that rewrites heterogeneous,
//! partially camel-cased client input into one validated, snake_case
//! record shape before it may touch either store.
//!
//! Callers construct a [`DataAccess`] facade around the store
//! [`open_store`] selects from configuration:
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use shepherdbase_core::{open_store, Config, DataAccess};
//!
//! let config = Config::load()?;
//! let data = DataAccess::new(open_store(&config)?);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod facade;
pub mod schema;
pub mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

pub use config::{BackendKind, Config};
pub use facade::{DataAccess, DataError, RegistrationReceipt};
pub use schema::{
    normalize, validate, validate_registration_bundle, EntityKind, MinistrySelection, Record,
    RegistrationBundle, ValidatedBundle, Violation, ViolationCode,
};
pub use store::{
    ChangeOp, DataStore, ListFilter, LocalStore, RemoteStore, StoreError, TableChange,
    TableSubscription, WriteOp,
};

/// Build the configured store adapter, once per process.
///
/// The choice is made at startup and injected into [`DataAccess`];
/// a session never switches backends.
pub fn open_store(config: &Config) -> Result<Arc<dyn DataStore>> {
    match config.backend {
        BackendKind::Local => {
            let path = config.data_dir()?;
            info!(path = %path.display(), "opening local store");
            let store = LocalStore::open(&path)
                .with_context(|| format!("Failed to open local store at {}", path.display()))?;
            Ok(Arc::new(store))
        }
        BackendKind::Remote => {
            let url = config
                .remote_url
                .as_deref()
                .context("remote backend selected but remote_url is not configured")?;
            let key = config
                .remote_service_key
                .as_deref()
                .context("remote backend selected but remote_service_key is not configured")?;
            info!(url, "connecting remote store");
            let store = RemoteStore::new(url, key).context("Failed to build remote store client")?;
            Ok(Arc::new(store))
        }
    }
}
