//! Inbound proposal ingestion: correlate, persist, relocate attachments,
//! acknowledge the dispatch, then enrich.
//!
//! The proposal row is written before any attachment or model work so a
//! later failure never loses the submission.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::attachments::AttachmentRelocator;
use crate::correlator::{Correlation, MailCorrelator};
use crate::enrichment::{EnrichmentOutcome, ProposalEnricher};
use crate::inbound_email::InboundEmail;
use crate::models::{DispatchStatus, NewProposal, Proposal};
use crate::store::{run_blocking, ProcurementStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentMode {
    /// Spawned after the proposal is stored; the caller does not wait.
    Background,
    /// Awaited before [`InboundPipeline::ingest`] returns.
    Inline,
}

impl EnrichmentMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "background" | "async" => Some(EnrichmentMode::Background),
            "inline" | "sync" => Some(EnrichmentMode::Inline),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("correlation failed: {0}")]
    Correlation(#[source] StoreError),
    #[error("proposal creation failed: {0}")]
    ProposalCreate(#[source] StoreError),
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub proposal: Proposal,
    pub correlation: Correlation,
    /// Present only for inline enrichment.
    pub enrichment: Option<EnrichmentOutcome>,
}

#[derive(Clone)]
pub struct InboundPipeline {
    store: Arc<dyn ProcurementStore>,
    correlator: MailCorrelator,
    relocator: AttachmentRelocator,
    enricher: ProposalEnricher,
    mode: EnrichmentMode,
}

impl InboundPipeline {
    pub fn new(
        store: Arc<dyn ProcurementStore>,
        correlator: MailCorrelator,
        relocator: AttachmentRelocator,
        enricher: ProposalEnricher,
        mode: EnrichmentMode,
    ) -> Self {
        Self {
            store,
            correlator,
            relocator,
            enricher,
            mode,
        }
    }

    pub async fn ingest(&self, email: InboundEmail) -> Result<IngestOutcome, IngestError> {
        let correlator = self.correlator.clone();
        let (email, correlation) = tokio::task::spawn_blocking(move || {
            let correlation = correlator.correlate(&email);
            (email, correlation)
        })
        .await
        .map_err(|err| IngestError::Correlation(StoreError::Task(err.to_string())))?;
        let correlation = correlation.map_err(IngestError::Correlation)?;
        info!(
            "inbound correlated tier={} rfp={} vendor={} dispatch={:?}",
            correlation.tier.as_str(),
            correlation.rfp_id,
            correlation.vendor_id,
            correlation.dispatch.as_ref().map(|dispatch| dispatch.id)
        );

        let new_proposal = NewProposal {
            rfp_id: correlation.rfp_id,
            vendor_id: correlation.vendor_id,
            sent_rfp_reference: correlation.sent_rfp_reference().map(str::to_string),
            raw_email_body: email.stored_body(),
        };
        let mut proposal = run_blocking(&self.store, move |store| {
            store.create_proposal(&new_proposal)
        })
        .await
        .map_err(IngestError::ProposalCreate)?;
        info!("proposal created id={} rfp={}", proposal.id, proposal.rfp_id);

        let stored = self.relocator.relocate_all(&email.attachments).await;
        if !stored.is_empty() {
            let proposal_id = proposal.id;
            let count = stored.len();
            match run_blocking(&self.store, move |store| {
                store.append_proposal_attachments(proposal_id, &stored)
            })
            .await
            {
                Ok(updated) => proposal = updated,
                Err(err) => warn!(
                    "failed to record {} attachment(s) on proposal={}: {}",
                    count, proposal_id, err
                ),
            }
        }

        if let Some(dispatch) = &correlation.dispatch {
            self.mark_delivered(dispatch.id).await;
        }

        let body = email.readable_body();
        let enrichment = match self.mode {
            EnrichmentMode::Inline => Some(self.enricher.enrich_from_body(proposal.id, &body).await),
            EnrichmentMode::Background => {
                let enricher = self.enricher.clone();
                let proposal_id = proposal.id;
                tokio::spawn(async move {
                    enricher.enrich_from_body(proposal_id, &body).await;
                });
                None
            }
        };

        Ok(IngestOutcome {
            proposal,
            correlation,
            enrichment,
        })
    }

    async fn mark_delivered(&self, dispatch_id: Uuid) {
        match run_blocking(&self.store, move |store| {
            store.set_dispatch_status(dispatch_id, DispatchStatus::Delivered)
        })
        .await
        {
            Ok(dispatch) => info!("dispatch={} status={}", dispatch.id, dispatch.status),
            Err(err) => warn!("failed to mark dispatch={} DELIVERED: {}", dispatch_id, err),
        }
    }
}
