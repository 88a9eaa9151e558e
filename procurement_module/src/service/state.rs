use std::sync::Arc;

use crate::attachments::{AttachmentRelocator, ObjectStorage, SupabaseObjectStorage};
use crate::correlator::MailCorrelator;
use crate::dispatch::{EmailSender, RfpDispatcher};
use crate::enrichment::ProposalEnricher;
use crate::llm::{HttpLlmClient, LlmClient};
use crate::pipeline::InboundPipeline;
use crate::ranking::ProposalRanker;
use crate::rfp_structurer::RfpStructurer;
use crate::store::{build_store, ProcurementStore};
use send_emails_module::{SendGridClient, DEFAULT_API_BASE_URL};
use tracing::{info, warn};

use super::config::ServiceConfig;
use super::BoxError;

/// External systems the service talks to. Optional ones degrade per request
/// when absent.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ProcurementStore>,
    pub llm: Option<Arc<dyn LlmClient>>,
    pub storage: Option<Arc<dyn ObjectStorage>>,
    pub email_sender: Option<Arc<dyn EmailSender>>,
}

impl Collaborators {
    /// Opens the store and builds whichever HTTP clients are configured.
    /// Blocking: the postgres pool connects eagerly.
    pub fn from_config(config: &ServiceConfig) -> Result<Self, BoxError> {
        let store = build_store(
            config.store_backend,
            config.database_url.as_deref(),
            config.db_tls_allow_invalid_certs,
        )?;

        let llm = match HttpLlmClient::new(config.llm.clone()) {
            Ok(client) => Some(Arc::new(client) as Arc<dyn LlmClient>),
            Err(err) => {
                warn!("llm disabled: {}", err);
                None
            }
        };

        let storage = match config.storage.clone() {
            Some(storage_config) => {
                info!(
                    "attachment storage: supabase bucket={}",
                    storage_config.bucket
                );
                Some(Arc::new(SupabaseObjectStorage::new(storage_config)?) as Arc<dyn ObjectStorage>)
            }
            None => {
                warn!("attachment storage disabled: SUPABASE_PROJECT_URL/SUPABASE_SECRET_KEY not set");
                None
            }
        };

        let email_sender = match config.sendgrid_api_key.as_deref() {
            Some(api_key) => {
                let base_url = config
                    .sendgrid_api_base_url
                    .as_deref()
                    .unwrap_or(DEFAULT_API_BASE_URL);
                Some(Arc::new(SendGridClient::new(api_key, base_url)?) as Arc<dyn EmailSender>)
            }
            None => {
                warn!("rfp dispatch disabled: SENDGRID_API_KEY not set");
                None
            }
        };

        Ok(Self {
            store,
            llm,
            storage,
            email_sender,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub(super) inbound_token: Option<Arc<str>>,
    pub(super) inbound_body_max_bytes: usize,
    pub(super) store: Arc<dyn ProcurementStore>,
    pub(super) pipeline: InboundPipeline,
    pub(super) relocator: AttachmentRelocator,
    pub(super) ranker: ProposalRanker,
    pub(super) structurer: RfpStructurer,
    pub(super) dispatcher: RfpDispatcher,
}

impl AppState {
    pub fn new(config: &ServiceConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            store,
            llm,
            storage,
            email_sender,
        } = collaborators;

        let relocator = AttachmentRelocator::new(
            storage,
            config.attachments_acl,
            config.attachments_cdn_url.clone(),
            config.storage_timeout,
        );
        let pipeline = InboundPipeline::new(
            store.clone(),
            MailCorrelator::new(store.clone(), config.system_user_email.clone()),
            relocator.clone(),
            ProposalEnricher::new(store.clone(), llm.clone(), config.llm.timeout),
            config.enrichment_mode,
        );

        Self {
            inbound_token: config.inbound_token.as_deref().map(Arc::from),
            inbound_body_max_bytes: config.inbound_body_max_bytes,
            pipeline,
            relocator,
            ranker: ProposalRanker::new(store.clone()),
            structurer: RfpStructurer::new(store.clone(), llm, config.llm.timeout),
            dispatcher: RfpDispatcher::new(store.clone(), email_sender, config.dispatch.clone()),
            store,
        }
    }
}
