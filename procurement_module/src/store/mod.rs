//! Persistence for users, vendors, RFPs, dispatches and proposals.
//!
//! `PROCUREMENT_STORE_BACKEND` selects `postgres` (default) or `memory`.

mod memory_store;
mod postgres_store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    AttachmentMeta, DispatchStatus, NewDispatch, NewProposal, NewRfp, NewUser, NewVendor,
    Proposal, ProposalFields, Rfp, SentDispatch, User, Vendor, VendorProposal,
};

pub use self::memory_store::InMemoryProcurementStore;
pub use self::postgres_store::PostgresProcurementStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("postgres error: {0}")]
    Postgres(#[from] postgres::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("missing DATABASE_URL")]
    MissingDbUrl,
    #[error("store config error: {0}")]
    Config(String),
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error("blocking store task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub trait ProcurementStore: Send + Sync {
    fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    /// Returns the user with `new.email`, creating it first if absent.
    fn get_or_create_user(&self, new: &NewUser) -> Result<User, StoreError>;

    fn create_rfp(&self, new: &NewRfp) -> Result<Rfp, StoreError>;
    /// Returns the RFP with `new.reference_token`, creating it first if absent.
    fn get_or_create_rfp_by_token(&self, new: &NewRfp) -> Result<Rfp, StoreError>;
    fn get_rfp(&self, id: Uuid) -> Result<Option<Rfp>, StoreError>;

    fn get_vendor(&self, id: Uuid) -> Result<Option<Vendor>, StoreError>;
    /// `email` is compared after lower-casing and trimming.
    fn find_vendor_by_email(&self, email: &str) -> Result<Option<Vendor>, StoreError>;
    /// Returns the vendor with `new.contact_email`, creating it first if absent.
    fn get_or_create_vendor(&self, new: &NewVendor) -> Result<Vendor, StoreError>;

    fn create_dispatch(&self, new: &NewDispatch) -> Result<SentDispatch, StoreError>;
    fn find_dispatch_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<SentDispatch>, StoreError>;
    fn find_dispatch_by_reference_id(
        &self,
        reference_id: &str,
    ) -> Result<Option<SentDispatch>, StoreError>;
    /// Most recently created dispatch addressed to `vendor_id`.
    fn latest_dispatch_for_vendor(
        &self,
        vendor_id: Uuid,
    ) -> Result<Option<SentDispatch>, StoreError>;
    /// Moves a dispatch to SENT. A DELIVERED dispatch is returned unchanged.
    fn mark_dispatch_sent(
        &self,
        id: Uuid,
        sent_at: DateTime<Utc>,
        reply_to: &str,
    ) -> Result<SentDispatch, StoreError>;
    /// A DELIVERED dispatch is returned unchanged.
    fn set_dispatch_status(
        &self,
        id: Uuid,
        status: DispatchStatus,
    ) -> Result<SentDispatch, StoreError>;

    fn create_proposal(&self, new: &NewProposal) -> Result<Proposal, StoreError>;
    fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>, StoreError>;
    fn append_proposal_attachments(
        &self,
        id: Uuid,
        attachments: &[AttachmentMeta],
    ) -> Result<Proposal, StoreError>;
    /// Overwrites the structured fields and stamps `parsed_at`.
    fn apply_proposal_fields(
        &self,
        id: Uuid,
        fields: &ProposalFields,
        parsed_at: DateTime<Utc>,
    ) -> Result<Proposal, StoreError>;
    /// Proposals for one RFP with their vendors, in creation order.
    fn list_proposals_for_rfp(&self, rfp_id: Uuid) -> Result<Vec<VendorProposal>, StoreError>;
}

/// Runs a store call on the blocking pool. The postgres client drives its own
/// runtime and panics when called from an async worker thread.
pub async fn run_blocking<T, F>(store: &Arc<dyn ProcurementStore>, call: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn ProcurementStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || call(store.as_ref()))
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl StoreBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Some(StoreBackend::Postgres),
            "memory" | "in-memory" | "in_memory" => Some(StoreBackend::Memory),
            _ => None,
        }
    }
}

pub fn build_store(
    backend: StoreBackend,
    db_url: Option<&str>,
    tls_allow_invalid_certs: bool,
) -> Result<Arc<dyn ProcurementStore>, StoreError> {
    match backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryProcurementStore::new())),
        StoreBackend::Postgres => {
            let db_url = db_url
                .filter(|value| !value.trim().is_empty())
                .ok_or(StoreError::MissingDbUrl)?;
            Ok(Arc::new(PostgresProcurementStore::new(
                db_url,
                tls_allow_invalid_certs,
            )?))
        }
    }
}
