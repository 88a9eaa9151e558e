//! Turns a buyer's free-text request into a persisted, itemized RFP.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::llm::{complete_with_timeout, LlmClient, LlmError};
use crate::llm_json::{self, LlmDecodeError};
use crate::models::{NewRfp, RequirementItem, Requirements, RequirementsMetadata, Rfp};
use crate::prompts::rfp_structuring_prompt;
use crate::store::{run_blocking, ProcurementStore, StoreError};

/// Requests shorter than this are rejected before any model call.
pub const MIN_RFP_TEXT_CHARS: usize = 10;
pub const UNTITLED_RFP: &str = "Untitled RFP";

#[derive(Debug, thiserror::Error)]
pub enum StructureError {
    #[error("RFP text must be at least 10 characters long")]
    TextTooShort,
    #[error("user not found: {0}")]
    UserNotFound(Uuid),
    #[error("no llm configured")]
    NoLlmConfigured,
    #[error("llm call failed: {0}")]
    Llm(#[from] LlmError),
    #[error("failed to parse RFP structure: {0}")]
    Decode(#[from] LlmDecodeError),
    #[error("invalid RFP structure: at least one item is required")]
    NoItems,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct StructuredRfp {
    pub rfp: Rfp,
    /// The model's decoded object, as returned.
    pub parsed_structure: Map<String, Value>,
}

#[derive(Clone)]
pub struct RfpStructurer {
    store: Arc<dyn ProcurementStore>,
    llm: Option<Arc<dyn LlmClient>>,
    timeout: Duration,
}

impl RfpStructurer {
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

    pub async fn structure(
        &self,
        text: &str,
        created_by: Uuid,
    ) -> Result<StructuredRfp, StructureError> {
        let text = text.trim();
        if text.chars().count() < MIN_RFP_TEXT_CHARS {
            return Err(StructureError::TextTooShort);
        }
        if run_blocking(&self.store, move |store| store.get_user(created_by))
            .await?
            .is_none()
        {
            return Err(StructureError::UserNotFound(created_by));
        }
        let llm = self.llm.as_deref().ok_or(StructureError::NoLlmConfigured)?;

        let prompt = rfp_structuring_prompt(text);
        let raw = complete_with_timeout(llm, &prompt, text, self.timeout).await?;
        let parsed = llm_json::decode_object(&raw).map_err(|err| {
            warn!("rfp structuring returned undecodable output: {}", err);
            err
        })?;

        let items = decode_items(parsed.get("items"));
        if items.is_empty() {
            return Err(StructureError::NoItems);
        }
        let item_count = items.len();

        let new = NewRfp {
            title: llm_json::text(parsed.get("title")).unwrap_or_else(|| UNTITLED_RFP.to_string()),
            description_raw: text.to_string(),
            requirements: Requirements {
                items,
                metadata: Some(RequirementsMetadata {
                    parsed_at: Utc::now(),
                    item_count,
                }),
            },
            budget_usd: llm_json::number(parsed.get("total_budget_usd")),
            delivery_days: llm_json::integer(parsed.get("delivery_days")),
            payment_terms: llm_json::text(parsed.get("payment_terms")),
            warranty_months: llm_json::integer(parsed.get("warranty_months")),
            reference_token: new_reference_token(),
            created_by_id: created_by,
        };
        let rfp = run_blocking(&self.store, move |store| store.create_rfp(&new)).await?;
        info!(
            "rfp structured id={} items={} budget_usd={:?}",
            rfp.id, item_count, rfp.budget_usd
        );
        Ok(StructuredRfp {
            rfp,
            parsed_structure: parsed,
        })
    }
}

fn decode_items(value: Option<&Value>) -> Vec<RequirementItem> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let item = item.as_object()?;
            Some(RequirementItem {
                name: llm_json::text(item.get("name"))?,
                qty: llm_json::number(item.get("qty")),
                specs: llm_json::object(item.get("specs")),
                unit_budget_usd: llm_json::number(item.get("unit_budget_usd")),
            })
        })
        .collect()
}

/// 16 random bytes, hex encoded.
pub fn new_reference_token() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}
