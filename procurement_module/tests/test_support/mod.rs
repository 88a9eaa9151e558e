#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use procurement_module::attachments::{ObjectStorage, StorageError};
use procurement_module::llm::{LlmClient, LlmError};
use procurement_module::models::{
    AttachmentMeta, DispatchStatus, NewDispatch, NewProposal, NewRfp, NewUser, NewVendor,
    Proposal, ProposalFields, Requirements, Rfp, SentDispatch, User, Vendor, VendorProposal,
};
use procurement_module::pipeline::EnrichmentMode;
use procurement_module::service::{AppState, Collaborators, ServiceConfig};
use procurement_module::store::{InMemoryProcurementStore, ProcurementStore, StoreError};
use uuid::Uuid;

pub const INBOUND_TOKEN: &str = "test-inbound-token";

/// Returns the same completion for every call and counts calls.
pub struct ScriptedLlm {
    reply: String,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(reply: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.into(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _system_prompt: &str, _user_text: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.reply.clone())
    }
}

pub struct FailingLlm;

#[async_trait]
impl LlmClient for FailingLlm {
    async fn complete(&self, _system_prompt: &str, _user_text: &str) -> Result<String, LlmError> {
        Err(LlmError::Api {
            provider: "openai",
            status: 500,
            body: "upstream down".to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPut {
    pub key: String,
    pub size: usize,
    pub content_type: Option<String>,
}

/// Object storage that keeps uploads in memory. Keys containing
/// `fail_marker` are rejected.
#[derive(Default)]
pub struct MemoryObjectStorage {
    pub puts: Mutex<Vec<StoredPut>>,
    pub fail_marker: Option<String>,
}

impl MemoryObjectStorage {
    pub fn failing_on(marker: &str) -> Self {
        Self {
            fail_marker: Some(marker.to_string()),
            ..Default::default()
        }
    }

    pub fn puts(&self) -> Vec<StoredPut> {
        self.puts.lock().expect("puts lock").clone()
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), StorageError> {
        if let Some(marker) = &self.fail_marker {
            if key.contains(marker.as_str()) {
                return Err(StorageError::Storage(format!("rejected {}", key)));
            }
        }
        self.puts.lock().expect("puts lock").push(StoredPut {
            key: key.to_string(),
            size: bytes.len(),
            content_type: content_type.map(str::to_string),
        });
        Ok(())
    }

    fn object_url(&self, key: &str) -> String {
        format!("https://storage.test/public/{}", key)
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        Ok(format!(
            "https://storage.test/signed/{}?expires={}",
            key,
            expires_in.as_secs()
        ))
    }
}

/// In-memory store that drives a throwaway current-thread runtime on every
/// call, like the blocking postgres client. Any call made on an async worker
/// thread panics with "Cannot start a runtime from within a runtime".
pub struct BlockingClientStore {
    inner: InMemoryProcurementStore,
    calls: AtomicUsize,
}

impl BlockingClientStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryProcurementStore::new(),
            calls: AtomicUsize::new(0),
        })
    }

    /// Unchecked access for seeding from test bodies.
    pub fn inner(&self) -> &InMemoryProcurementStore {
        &self.inner
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn client(&self) -> &InMemoryProcurementStore {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("client runtime")
            .block_on(async {});
        self.calls.fetch_add(1, Ordering::SeqCst);
        &self.inner
    }
}

impl ProcurementStore for BlockingClientStore {
    fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        self.client().get_user(id)
    }

    fn get_or_create_user(&self, new: &NewUser) -> Result<User, StoreError> {
        self.client().get_or_create_user(new)
    }

    fn create_rfp(&self, new: &NewRfp) -> Result<Rfp, StoreError> {
        self.client().create_rfp(new)
    }

    fn get_or_create_rfp_by_token(&self, new: &NewRfp) -> Result<Rfp, StoreError> {
        self.client().get_or_create_rfp_by_token(new)
    }

    fn get_rfp(&self, id: Uuid) -> Result<Option<Rfp>, StoreError> {
        self.client().get_rfp(id)
    }

    fn get_vendor(&self, id: Uuid) -> Result<Option<Vendor>, StoreError> {
        self.client().get_vendor(id)
    }

    fn find_vendor_by_email(&self, email: &str) -> Result<Option<Vendor>, StoreError> {
        self.client().find_vendor_by_email(email)
    }

    fn get_or_create_vendor(&self, new: &NewVendor) -> Result<Vendor, StoreError> {
        self.client().get_or_create_vendor(new)
    }

    fn create_dispatch(&self, new: &NewDispatch) -> Result<SentDispatch, StoreError> {
        self.client().create_dispatch(new)
    }

    fn find_dispatch_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<SentDispatch>, StoreError> {
        self.client().find_dispatch_by_message_id(message_id)
    }

    fn find_dispatch_by_reference_id(
        &self,
        reference_id: &str,
    ) -> Result<Option<SentDispatch>, StoreError> {
        self.client().find_dispatch_by_reference_id(reference_id)
    }

    fn latest_dispatch_for_vendor(
        &self,
        vendor_id: Uuid,
    ) -> Result<Option<SentDispatch>, StoreError> {
        self.client().latest_dispatch_for_vendor(vendor_id)
    }

    fn mark_dispatch_sent(
        &self,
        id: Uuid,
        sent_at: DateTime<Utc>,
        reply_to: &str,
    ) -> Result<SentDispatch, StoreError> {
        self.client().mark_dispatch_sent(id, sent_at, reply_to)
    }

    fn set_dispatch_status(
        &self,
        id: Uuid,
        status: DispatchStatus,
    ) -> Result<SentDispatch, StoreError> {
        self.client().set_dispatch_status(id, status)
    }

    fn create_proposal(&self, new: &NewProposal) -> Result<Proposal, StoreError> {
        self.client().create_proposal(new)
    }

    fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>, StoreError> {
        self.client().get_proposal(id)
    }

    fn append_proposal_attachments(
        &self,
        id: Uuid,
        attachments: &[AttachmentMeta],
    ) -> Result<Proposal, StoreError> {
        self.client().append_proposal_attachments(id, attachments)
    }

    fn apply_proposal_fields(
        &self,
        id: Uuid,
        fields: &ProposalFields,
        parsed_at: DateTime<Utc>,
    ) -> Result<Proposal, StoreError> {
        self.client().apply_proposal_fields(id, fields, parsed_at)
    }

    fn list_proposals_for_rfp(&self, rfp_id: Uuid) -> Result<Vec<VendorProposal>, StoreError> {
        self.client().list_proposals_for_rfp(rfp_id)
    }
}

pub fn memory_store() -> Arc<InMemoryProcurementStore> {
    Arc::new(InMemoryProcurementStore::new())
}

pub fn seed_buyer(store: &dyn ProcurementStore) -> User {
    store
        .get_or_create_user(&NewUser {
            email: "buyer@buyer.test".to_string(),
            username: "buyer".to_string(),
            name: Some("Buyer".to_string()),
            credential: "hashed".to_string(),
        })
        .expect("seed buyer")
}

pub fn seed_rfp(
    store: &dyn ProcurementStore,
    owner: &User,
    token: &str,
    budget_usd: Option<f64>,
    delivery_days: Option<i32>,
) -> Rfp {
    store
        .create_rfp(&NewRfp {
            title: format!("RFP {}", token),
            description_raw: "Need laptops".to_string(),
            requirements: Requirements::default(),
            budget_usd,
            delivery_days,
            payment_terms: None,
            warranty_months: None,
            reference_token: token.to_string(),
            created_by_id: owner.id,
        })
        .expect("seed rfp")
}

pub fn seed_vendor(store: &dyn ProcurementStore, name: &str, email: &str) -> Vendor {
    store
        .get_or_create_vendor(&NewVendor {
            name: name.to_string(),
            contact_email: email.to_string(),
            notes: None,
            credential: "hashed".to_string(),
        })
        .expect("seed vendor")
}

pub fn seed_dispatch(
    store: &dyn ProcurementStore,
    rfp: &Rfp,
    vendor: &Vendor,
    reference_id: &str,
    message_id: &str,
) -> SentDispatch {
    store
        .create_dispatch(&NewDispatch {
            rfp_id: rfp.id,
            vendor_id: vendor.id,
            reference_id: reference_id.to_string(),
            message_id: message_id.to_string(),
        })
        .expect("seed dispatch")
}

pub fn test_config(mode: EnrichmentMode) -> ServiceConfig {
    ServiceConfig {
        inbound_token: Some(INBOUND_TOKEN.to_string()),
        enrichment_mode: mode,
        ..Default::default()
    }
}

pub fn app_state(
    config: &ServiceConfig,
    store: Arc<InMemoryProcurementStore>,
    llm: Option<Arc<dyn LlmClient>>,
    storage: Option<Arc<dyn ObjectStorage>>,
) -> AppState {
    AppState::new(
        config,
        Collaborators {
            store,
            llm,
            storage,
            email_sender: None,
        },
    )
}

pub const PROPOSAL_JSON: &str = r#"```json
{
  "priceUsd": 45000,
  "lineItems": [
    {"name": "Laptop", "qty": 20, "unit_price_usd": 2250, "total_usd": 45000, "specs": {"ram": "16GB"}}
  ],
  "deliveryDays": 14,
  "warrantyMonths": 24,
  "paymentTerms": "Net 30",
  "completenessScore": 95
}
```"#;
