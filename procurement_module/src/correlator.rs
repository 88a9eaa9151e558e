//! Resolves which RFP and vendor an inbound email belongs to.
//!
//! Tiers are tried in order and the first hit wins:
//! 1. `In-Reply-To` / `References` against dispatch message ids
//! 2. the email's own `Message-ID` against dispatch message ids
//! 3. a reference token from a plus-addressed recipient or a `[REF:...]` subject tag
//! 4. the sender's most recent dispatch
//!
//! When nothing matches, the email is filed under a sentinel RFP so that no
//! inbound reply is ever dropped.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::inbound_email::InboundEmail;
use crate::models::{NewRfp, NewUser, NewVendor, Requirements, SentDispatch, Vendor};
use crate::store::{ProcurementStore, StoreError};

pub const UNMATCHED_RFP_TOKEN: &str = "unmatched-inbound-proposals";
pub const UNMATCHED_RFP_TITLE: &str = "Unmatched Inbound Proposals";
pub const UNKNOWN_VENDOR_EMAIL: &str = "unknown@unknown.com";
pub const UNKNOWN_VENDOR_NAME: &str = "Unknown Vendor";
const PLACEHOLDER_CREDENTIAL: &str = "unknown-vendor-placeholder";

static RECIPIENT_TOKEN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)rfp\+([^@>\s]+)@").ok());
static SUBJECT_REFERENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\[REF:([^\]]+)\]").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    ThreadReply,
    OwnMessageId,
    ReferenceToken,
    SenderHistory,
    Fallback,
}

impl MatchTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchTier::ThreadReply => "thread_reply",
            MatchTier::OwnMessageId => "own_message_id",
            MatchTier::ReferenceToken => "reference_token",
            MatchTier::SenderHistory => "sender_history",
            MatchTier::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Correlation {
    pub rfp_id: Uuid,
    pub vendor_id: Uuid,
    pub dispatch: Option<SentDispatch>,
    pub tier: MatchTier,
}

impl Correlation {
    fn from_dispatch(dispatch: SentDispatch, tier: MatchTier) -> Self {
        Self {
            rfp_id: dispatch.rfp_id,
            vendor_id: dispatch.vendor_id,
            dispatch: Some(dispatch),
            tier,
        }
    }

    pub fn sent_rfp_reference(&self) -> Option<&str> {
        self.dispatch
            .as_ref()
            .map(|dispatch| dispatch.reference_id.as_str())
    }
}

#[derive(Clone)]
pub struct MailCorrelator {
    store: Arc<dyn ProcurementStore>,
    system_user_email: String,
}

impl MailCorrelator {
    pub fn new(store: Arc<dyn ProcurementStore>, system_user_email: impl Into<String>) -> Self {
        Self {
            store,
            system_user_email: system_user_email.into(),
        }
    }

    /// Always yields an RFP and vendor; only fails when the store cannot
    /// materialize the fallback records.
    ///
    /// Runs store queries synchronously; async callers go through
    /// `spawn_blocking`.
    pub fn correlate(&self, email: &InboundEmail) -> Result<Correlation, StoreError> {
        if let Some(dispatch) = self.match_message_ids(
            email.in_reply_to.iter().chain(email.references.iter()),
        ) {
            return Ok(Correlation::from_dispatch(dispatch, MatchTier::ThreadReply));
        }

        if let Some(dispatch) = self.match_message_ids(email.message_id.iter()) {
            return Ok(Correlation::from_dispatch(dispatch, MatchTier::OwnMessageId));
        }

        if let Some(dispatch) = self.match_reference_token(email) {
            return Ok(Correlation::from_dispatch(dispatch, MatchTier::ReferenceToken));
        }

        let sender_vendor = email
            .sender_address()
            .and_then(|address| self.lookup("vendor by email", || self.store.find_vendor_by_email(address)));
        if let Some(vendor) = sender_vendor.as_ref() {
            if let Some(dispatch) = self.lookup("latest dispatch", || {
                self.store.latest_dispatch_for_vendor(vendor.id)
            }) {
                return Ok(Correlation {
                    rfp_id: dispatch.rfp_id,
                    vendor_id: vendor.id,
                    dispatch: Some(dispatch),
                    tier: MatchTier::SenderHistory,
                });
            }
        }

        self.fallback(email, sender_vendor)
    }

    fn match_message_ids<'a>(
        &self,
        candidates: impl Iterator<Item = &'a String>,
    ) -> Option<SentDispatch> {
        candidates
            .filter_map(|candidate| normalize_message_id(candidate))
            .find_map(|bare| {
                let message_id = format!("<{}>", bare);
                debug!("correlator trying message id {}", message_id);
                self.lookup("dispatch by message id", || {
                    self.store.find_dispatch_by_message_id(&message_id)
                })
            })
    }

    fn match_reference_token(&self, email: &InboundEmail) -> Option<SentDispatch> {
        email
            .to
            .iter()
            .filter_map(|recipient| extract_recipient_token(recipient))
            .chain(extract_subject_reference(&email.subject))
            .find_map(|token| {
                self.lookup("dispatch by reference id", || {
                    self.store.find_dispatch_by_reference_id(&token)
                })
            })
    }

    fn lookup<T>(
        &self,
        what: &str,
        query: impl FnOnce() -> Result<Option<T>, StoreError>,
    ) -> Option<T> {
        match query() {
            Ok(found) => found,
            Err(err) => {
                warn!("correlator lookup failed ({}): {}", what, err);
                None
            }
        }
    }

    fn fallback(
        &self,
        email: &InboundEmail,
        sender_vendor: Option<Vendor>,
    ) -> Result<Correlation, StoreError> {
        let rfp_id = self.unmatched_rfp_id()?;
        let vendor = match (sender_vendor, email.from.as_ref()) {
            (Some(vendor), _) => vendor,
            (None, Some(mailbox)) => {
                let vendor = self.store.get_or_create_vendor(&NewVendor {
                    name: mailbox.display_name(),
                    contact_email: mailbox.address.clone(),
                    notes: Some("Auto-created from inbound email".to_string()),
                    credential: PLACEHOLDER_CREDENTIAL.to_string(),
                })?;
                info!(
                    "correlator auto-created vendor id={} for unknown sender",
                    vendor.id
                );
                vendor
            }
            (None, None) => self.store.get_or_create_vendor(&NewVendor {
                name: UNKNOWN_VENDOR_NAME.to_string(),
                contact_email: UNKNOWN_VENDOR_EMAIL.to_string(),
                notes: Some("Placeholder for unmatched inbound emails".to_string()),
                credential: PLACEHOLDER_CREDENTIAL.to_string(),
            })?,
        };

        Ok(Correlation {
            rfp_id,
            vendor_id: vendor.id,
            dispatch: None,
            tier: MatchTier::Fallback,
        })
    }

    fn unmatched_rfp_id(&self) -> Result<Uuid, StoreError> {
        let user = self.store.get_or_create_user(&NewUser {
            email: self.system_user_email.clone(),
            username: "system".to_string(),
            name: Some("System User".to_string()),
            credential: PLACEHOLDER_CREDENTIAL.to_string(),
        })?;
        let rfp = self.store.get_or_create_rfp_by_token(&NewRfp {
            title: UNMATCHED_RFP_TITLE.to_string(),
            description_raw:
                "Container for proposals that could not be matched to an existing RFP"
                    .to_string(),
            requirements: Requirements::default(),
            budget_usd: None,
            delivery_days: None,
            payment_terms: None,
            warranty_months: None,
            reference_token: UNMATCHED_RFP_TOKEN.to_string(),
            created_by_id: user.id,
        })?;
        Ok(rfp.id)
    }
}

/// Trims, strips angle brackets and lower-cases a message id.
pub fn normalize_message_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches(|ch| matches!(ch, '<' | '>')).trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_ascii_lowercase())
}

/// Token from a plus-addressed recipient such as `rfp+<token>@reply.example.com`.
pub fn extract_recipient_token(recipient: &str) -> Option<String> {
    RECIPIENT_TOKEN
        .as_ref()?
        .captures(recipient)
        .and_then(|captures| captures.get(1))
        .map(|token| token.as_str().trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Token from a `[REF:<token>]` subject tag.
pub fn extract_subject_reference(subject: &str) -> Option<String> {
    SUBJECT_REFERENCE
        .as_ref()?
        .captures(subject)
        .and_then(|captures| captures.get(1))
        .map(|token| token.as_str().trim().to_string())
        .filter(|token| !token.is_empty())
}
