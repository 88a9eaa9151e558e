use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub name: Option<String>,
    /// Opaque credential; never used for login by this service.
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Vendor {
    pub id: Uuid,
    pub name: String,
    pub contact_email: String,
    pub phone: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewVendor {
    pub name: String,
    pub contact_email: String,
    pub notes: Option<String>,
    pub credential: String,
}

/// Lower-cased, trimmed form used for every vendor email comparison.
pub fn normalize_vendor_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequirementItem {
    pub name: String,
    #[serde(default)]
    pub qty: Option<f64>,
    #[serde(default)]
    pub specs: Map<String, Value>,
    #[serde(default)]
    pub unit_budget_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequirementsMetadata {
    pub parsed_at: DateTime<Utc>,
    pub item_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Requirements {
    #[serde(default)]
    pub items: Vec<RequirementItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RequirementsMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rfp {
    pub id: Uuid,
    pub title: String,
    pub description_raw: String,
    pub requirements: Requirements,
    pub budget_usd: Option<f64>,
    pub delivery_days: Option<i32>,
    pub payment_terms: Option<String>,
    pub warranty_months: Option<i32>,
    pub reference_token: String,
    pub created_by_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRfp {
    pub title: String,
    pub description_raw: String,
    pub requirements: Requirements,
    pub budget_usd: Option<f64>,
    pub delivery_days: Option<i32>,
    pub payment_terms: Option<String>,
    pub warranty_months: Option<i32>,
    pub reference_token: String,
    pub created_by_id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchStatus {
    Draft,
    Sent,
    Failed,
    Delivered,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Draft => "DRAFT",
            DispatchStatus::Sent => "SENT",
            DispatchStatus::Failed => "FAILED",
            DispatchStatus::Delivered => "DELIVERED",
        }
    }

    /// DELIVERED is terminal; every other status may move anywhere.
    pub fn can_transition_to(&self, next: DispatchStatus) -> bool {
        *self != DispatchStatus::Delivered || next == DispatchStatus::Delivered
    }
}

impl fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(DispatchStatus::Draft),
            "SENT" => Ok(DispatchStatus::Sent),
            "FAILED" => Ok(DispatchStatus::Failed),
            "DELIVERED" => Ok(DispatchStatus::Delivered),
            other => Err(format!("unknown dispatch status: {}", other)),
        }
    }
}

/// Record of one RFP sent to one vendor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SentDispatch {
    pub id: Uuid,
    pub rfp_id: Uuid,
    pub vendor_id: Uuid,
    pub reference_id: String,
    pub message_id: String,
    pub status: DispatchStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDispatch {
    pub rfp_id: Uuid,
    pub vendor_id: Uuid,
    pub reference_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub filename: String,
    pub storage_key: String,
    pub url: String,
    pub size: u64,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub name: String,
    #[serde(default)]
    pub qty: Option<f64>,
    #[serde(default)]
    pub unit_price_usd: Option<f64>,
    #[serde(default)]
    pub total_usd: Option<f64>,
    #[serde(default)]
    pub specs: Map<String, Value>,
}

/// The structured portion of a proposal that enrichment fills in.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProposalFields {
    pub price_usd: Option<f64>,
    pub line_items: Option<Vec<LineItem>>,
    pub delivery_days: Option<i32>,
    pub warranty_months: Option<i32>,
    pub payment_terms: Option<String>,
    pub completeness_score: Option<f64>,
}

impl ProposalFields {
    /// Fields present in `self` win; absent ones keep the existing value.
    pub fn merge_over(self, existing: &ProposalFields) -> ProposalFields {
        ProposalFields {
            price_usd: self.price_usd.or(existing.price_usd),
            line_items: self
                .line_items
                .filter(|items| !items.is_empty())
                .or_else(|| existing.line_items.clone()),
            delivery_days: self.delivery_days.or(existing.delivery_days),
            warranty_months: self.warranty_months.or(existing.warranty_months),
            payment_terms: self
                .payment_terms
                .filter(|terms| !terms.trim().is_empty())
                .or_else(|| existing.payment_terms.clone()),
            completeness_score: self.completeness_score.or(existing.completeness_score),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &ProposalFields::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: Uuid,
    pub rfp_id: Uuid,
    pub vendor_id: Uuid,
    pub sent_rfp_reference: Option<String>,
    pub raw_email_body: String,
    pub attachments: Vec<AttachmentMeta>,
    pub parsed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub fields: ProposalFields,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProposal {
    pub rfp_id: Uuid,
    pub vendor_id: Uuid,
    pub sent_rfp_reference: Option<String>,
    pub raw_email_body: String,
}

/// A proposal joined with the vendor that submitted it.
#[derive(Debug, Clone, PartialEq)]
pub struct VendorProposal {
    pub proposal: Proposal,
    pub vendor: Vendor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivered_is_terminal() {
        assert!(DispatchStatus::Draft.can_transition_to(DispatchStatus::Sent));
        assert!(DispatchStatus::Sent.can_transition_to(DispatchStatus::Delivered));
        assert!(DispatchStatus::Failed.can_transition_to(DispatchStatus::Delivered));
        assert!(!DispatchStatus::Delivered.can_transition_to(DispatchStatus::Sent));
        assert!(!DispatchStatus::Delivered.can_transition_to(DispatchStatus::Failed));
        assert!(DispatchStatus::Delivered.can_transition_to(DispatchStatus::Delivered));
    }

    #[test]
    fn dispatch_status_parses_case_insensitively() {
        assert_eq!("sent".parse::<DispatchStatus>(), Ok(DispatchStatus::Sent));
        assert_eq!(" DELIVERED ".parse::<DispatchStatus>(), Ok(DispatchStatus::Delivered));
        assert!("bounced".parse::<DispatchStatus>().is_err());
    }

    #[test]
    fn merge_keeps_existing_values_for_absent_fields() {
        let existing = ProposalFields {
            price_usd: Some(1000.0),
            delivery_days: Some(10),
            payment_terms: Some("Net 30".to_string()),
            ..Default::default()
        };
        let incoming = ProposalFields {
            delivery_days: Some(7),
            warranty_months: Some(12),
            line_items: Some(Vec::new()),
            payment_terms: Some("  ".to_string()),
            ..Default::default()
        };

        let merged = incoming.merge_over(&existing);
        assert_eq!(merged.price_usd, Some(1000.0));
        assert_eq!(merged.delivery_days, Some(7));
        assert_eq!(merged.warranty_months, Some(12));
        assert_eq!(merged.payment_terms.as_deref(), Some("Net 30"));
        assert_eq!(merged.line_items, None);
    }

    #[test]
    fn proposal_serializes_with_flattened_fields() {
        let proposal = Proposal {
            id: Uuid::nil(),
            rfp_id: Uuid::nil(),
            vendor_id: Uuid::nil(),
            sent_rfp_reference: None,
            raw_email_body: "body".to_string(),
            attachments: Vec::new(),
            parsed_at: None,
            fields: ProposalFields {
                price_usd: Some(42.0),
                ..Default::default()
            },
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&proposal).expect("serialize");
        assert_eq!(value["priceUsd"], serde_json::json!(42.0));
        assert!(value["deliveryDays"].is_null());
        assert!(value.get("fields").is_none());
    }
}
