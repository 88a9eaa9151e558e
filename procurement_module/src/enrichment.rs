//! Fills a stored proposal's structured fields from its reply text.
//!
//! Enrichment is best-effort: any failure leaves the proposal as it was, and a
//! proposal that already carries `parsed_at` is never enriched again.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::llm::{complete_with_timeout, LlmClient};
use crate::llm_json::{self, LlmDecodeError};
use crate::models::{LineItem, ProposalFields};
use crate::prompts::PROPOSAL_EXTRACTION_PROMPT;
use crate::reply_extractor::extract_latest;
use crate::store::{run_blocking, ProcurementStore};

/// Bodies at or under this many characters are not worth a model call.
pub const MIN_BODY_CHARS: usize = 10;
/// Extracted replies at or under this many characters are skipped.
pub const MIN_REPLY_CHARS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BodyTooShort,
    ReplyTooShort,
    AlreadyEnriched,
    ProposalMissing,
    NoLlmConfigured,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentOutcome {
    Enriched(ProposalFields),
    Skipped(SkipReason),
    Failed(String),
}

#[derive(Clone)]
pub struct ProposalEnricher {
    store: Arc<dyn ProcurementStore>,
    llm: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
}

impl ProposalEnricher {
    pub fn new(
        store: Arc<dyn ProcurementStore>,
        llm: Option<Arc<dyn LlmClient>>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            llm,
            timeout,
        }
    }

    /// Runs reply extraction on a raw body, then [`Self::enrich`].
    pub async fn enrich_from_body(&self, proposal_id: Uuid, body: &str) -> EnrichmentOutcome {
        if body.trim().chars().count() <= MIN_BODY_CHARS {
            info!("enrichment skipped proposal={} reason=body_too_short", proposal_id);
            return EnrichmentOutcome::Skipped(SkipReason::BodyTooShort);
        }
        let reply = extract_latest(body);
        self.enrich(proposal_id, &reply).await
    }

    pub async fn enrich(&self, proposal_id: Uuid, extracted_text: &str) -> EnrichmentOutcome {
        let outcome = self.try_enrich(proposal_id, extracted_text).await;
        match &outcome {
            EnrichmentOutcome::Enriched(fields) => info!(
                "enrichment stored proposal={} price_usd={:?} delivery_days={:?} completeness={:?}",
                proposal_id, fields.price_usd, fields.delivery_days, fields.completeness_score
            ),
            EnrichmentOutcome::Skipped(reason) => {
                info!("enrichment skipped proposal={} reason={:?}", proposal_id, reason)
            }
            EnrichmentOutcome::Failed(reason) => {
                warn!("enrichment failed proposal={}: {}", proposal_id, reason)
            }
        }
        outcome
    }

    async fn try_enrich(&self, proposal_id: Uuid, extracted_text: &str) -> EnrichmentOutcome {
        if extracted_text.trim().chars().count() <= MIN_REPLY_CHARS {
            return EnrichmentOutcome::Skipped(SkipReason::ReplyTooShort);
        }
        let proposal = match run_blocking(&self.store, move |store| store.get_proposal(proposal_id))
            .await
        {
            Ok(Some(proposal)) => proposal,
            Ok(None) => return EnrichmentOutcome::Skipped(SkipReason::ProposalMissing),
            Err(err) => return EnrichmentOutcome::Failed(format!("load proposal: {}", err)),
        };
        if proposal.parsed_at.is_some() {
            return EnrichmentOutcome::Skipped(SkipReason::AlreadyEnriched);
        }
        let Some(llm) = self.llm.as_deref() else {
            return EnrichmentOutcome::Skipped(SkipReason::NoLlmConfigured);
        };

        let raw = match complete_with_timeout(
            llm,
            PROPOSAL_EXTRACTION_PROMPT,
            extracted_text,
            self.timeout,
        )
        .await
        {
            Ok(raw) => raw,
            Err(err) => return EnrichmentOutcome::Failed(format!("llm: {}", err)),
        };
        let extracted = match decode_proposal_fields(&raw) {
            Ok(fields) => fields,
            Err(err) => return EnrichmentOutcome::Failed(format!("decode: {}", err)),
        };

        let merged = extracted.merge_over(&proposal.fields);
        let parsed_at = Utc::now();
        match run_blocking(&self.store, move |store| {
            store.apply_proposal_fields(proposal_id, &merged, parsed_at)
        })
        .await
        {
            Ok(updated) => EnrichmentOutcome::Enriched(updated.fields),
            Err(err) => EnrichmentOutcome::Failed(format!("store: {}", err)),
        }
    }
}

/// Decodes the extraction model's reply. Unknown keys are ignored and
/// malformed values become absent.
pub fn decode_proposal_fields(raw: &str) -> Result<ProposalFields, LlmDecodeError> {
    let map = llm_json::decode_object(raw)?;
    let field = |camel: &str, snake: &str| map.get(camel).or_else(|| map.get(snake));

    let line_items = field("lineItems", "line_items")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(decode_line_item).collect::<Vec<_>>())
        .filter(|items| !items.is_empty());

    Ok(ProposalFields {
        price_usd: llm_json::number(field("priceUsd", "price_usd")),
        line_items,
        delivery_days: llm_json::integer(field("deliveryDays", "delivery_days")),
        warranty_months: llm_json::integer(field("warrantyMonths", "warranty_months")),
        payment_terms: llm_json::text(field("paymentTerms", "payment_terms")),
        completeness_score: llm_json::number(field("completenessScore", "completeness_score"))
            .map(|score| score.clamp(0.0, 100.0)),
    })
}

fn decode_line_item(value: &Value) -> Option<LineItem> {
    let item: &Map<String, Value> = value.as_object()?;
    Some(LineItem {
        name: llm_json::text(item.get("name"))?,
        qty: llm_json::number(item.get("qty")),
        unit_price_usd: llm_json::number(item.get("unit_price_usd")),
        total_usd: llm_json::number(item.get("total_usd")),
        specs: llm_json::object(item.get("specs")),
    })
}
