use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Map;
use uuid::Uuid;

use super::{ProcurementStore, StoreError};
use crate::models::{
    normalize_vendor_email, AttachmentMeta, DispatchStatus, NewDispatch, NewProposal, NewRfp,
    NewUser, NewVendor, Proposal, ProposalFields, Rfp, SentDispatch, User, Vendor,
    VendorProposal,
};

/// Process-local store used by tests and `PROCUREMENT_STORE_BACKEND=memory`.
#[derive(Debug, Default)]
pub struct InMemoryProcurementStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    users: Vec<User>,
    vendors: Vec<Vendor>,
    rfps: Vec<Rfp>,
    dispatches: Vec<SentDispatch>,
    proposals: Vec<Proposal>,
}

impl InMemoryProcurementStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl MemoryState {
    fn insert_user(&mut self, new: &NewUser) -> Result<User, StoreError> {
        if self.users.iter().any(|user| user.email == new.email) {
            return Err(StoreError::Conflict(format!("users.email={}", new.email)));
        }
        let user = User {
            id: Uuid::new_v4(),
            email: new.email.clone(),
            username: new.username.clone(),
            name: new.name.clone(),
            created_at: Utc::now(),
        };
        self.users.push(user.clone());
        Ok(user)
    }

    fn insert_rfp(&mut self, new: &NewRfp) -> Result<Rfp, StoreError> {
        if !self.users.iter().any(|user| user.id == new.created_by_id) {
            return Err(StoreError::not_found("user", new.created_by_id));
        }
        if self
            .rfps
            .iter()
            .any(|rfp| rfp.reference_token == new.reference_token)
        {
            return Err(StoreError::Conflict(format!(
                "rfps.reference_token={}",
                new.reference_token
            )));
        }
        let rfp = Rfp {
            id: Uuid::new_v4(),
            title: new.title.clone(),
            description_raw: new.description_raw.clone(),
            requirements: new.requirements.clone(),
            budget_usd: new.budget_usd,
            delivery_days: new.delivery_days,
            payment_terms: new.payment_terms.clone(),
            warranty_months: new.warranty_months,
            reference_token: new.reference_token.clone(),
            created_by_id: new.created_by_id,
            created_at: Utc::now(),
        };
        self.rfps.push(rfp.clone());
        Ok(rfp)
    }

    fn dispatch_mut(&mut self, id: Uuid) -> Result<&mut SentDispatch, StoreError> {
        self.dispatches
            .iter_mut()
            .find(|dispatch| dispatch.id == id)
            .ok_or_else(|| StoreError::not_found("sent_rfp", id))
    }

    fn proposal_mut(&mut self, id: Uuid) -> Result<&mut Proposal, StoreError> {
        self.proposals
            .iter_mut()
            .find(|proposal| proposal.id == id)
            .ok_or_else(|| StoreError::not_found("proposal", id))
    }
}

impl ProcurementStore for InMemoryProcurementStore {
    fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let state = self.lock()?;
        Ok(state.users.iter().find(|user| user.id == id).cloned())
    }

    fn get_or_create_user(&self, new: &NewUser) -> Result<User, StoreError> {
        let mut state = self.lock()?;
        if let Some(user) = state.users.iter().find(|user| user.email == new.email) {
            return Ok(user.clone());
        }
        state.insert_user(new)
    }

    fn create_rfp(&self, new: &NewRfp) -> Result<Rfp, StoreError> {
        self.lock()?.insert_rfp(new)
    }

    fn get_or_create_rfp_by_token(&self, new: &NewRfp) -> Result<Rfp, StoreError> {
        let mut state = self.lock()?;
        if let Some(rfp) = state
            .rfps
            .iter()
            .find(|rfp| rfp.reference_token == new.reference_token)
        {
            return Ok(rfp.clone());
        }
        state.insert_rfp(new)
    }

    fn get_rfp(&self, id: Uuid) -> Result<Option<Rfp>, StoreError> {
        let state = self.lock()?;
        Ok(state.rfps.iter().find(|rfp| rfp.id == id).cloned())
    }

    fn get_vendor(&self, id: Uuid) -> Result<Option<Vendor>, StoreError> {
        let state = self.lock()?;
        Ok(state.vendors.iter().find(|vendor| vendor.id == id).cloned())
    }

    fn find_vendor_by_email(&self, email: &str) -> Result<Option<Vendor>, StoreError> {
        let email = normalize_vendor_email(email);
        let state = self.lock()?;
        Ok(state
            .vendors
            .iter()
            .find(|vendor| vendor.contact_email == email)
            .cloned())
    }

    fn get_or_create_vendor(&self, new: &NewVendor) -> Result<Vendor, StoreError> {
        let email = normalize_vendor_email(&new.contact_email);
        let mut state = self.lock()?;
        if let Some(vendor) = state
            .vendors
            .iter()
            .find(|vendor| vendor.contact_email == email)
        {
            return Ok(vendor.clone());
        }
        let vendor = Vendor {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            contact_email: email,
            phone: None,
            notes: new.notes.clone(),
            metadata: Map::new(),
            created_at: Utc::now(),
        };
        state.vendors.push(vendor.clone());
        Ok(vendor)
    }

    fn create_dispatch(&self, new: &NewDispatch) -> Result<SentDispatch, StoreError> {
        let mut state = self.lock()?;
        if !state.rfps.iter().any(|rfp| rfp.id == new.rfp_id) {
            return Err(StoreError::not_found("rfp", new.rfp_id));
        }
        if !state.vendors.iter().any(|vendor| vendor.id == new.vendor_id) {
            return Err(StoreError::not_found("vendor", new.vendor_id));
        }
        if state.dispatches.iter().any(|dispatch| {
            dispatch.reference_id == new.reference_id || dispatch.message_id == new.message_id
        }) {
            return Err(StoreError::Conflict(format!(
                "sent_rfps.reference_id={}",
                new.reference_id
            )));
        }
        let dispatch = SentDispatch {
            id: Uuid::new_v4(),
            rfp_id: new.rfp_id,
            vendor_id: new.vendor_id,
            reference_id: new.reference_id.clone(),
            message_id: new.message_id.clone(),
            status: DispatchStatus::Draft,
            sent_at: None,
            reply_to: None,
            created_at: Utc::now(),
        };
        state.dispatches.push(dispatch.clone());
        Ok(dispatch)
    }

    fn find_dispatch_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<SentDispatch>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .dispatches
            .iter()
            .find(|dispatch| dispatch.message_id == message_id)
            .cloned())
    }

    fn find_dispatch_by_reference_id(
        &self,
        reference_id: &str,
    ) -> Result<Option<SentDispatch>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .dispatches
            .iter()
            .find(|dispatch| dispatch.reference_id == reference_id)
            .cloned())
    }

    fn latest_dispatch_for_vendor(
        &self,
        vendor_id: Uuid,
    ) -> Result<Option<SentDispatch>, StoreError> {
        let state = self.lock()?;
        // Later entries win ties on created_at.
        Ok(state
            .dispatches
            .iter()
            .filter(|dispatch| dispatch.vendor_id == vendor_id)
            .fold(None::<&SentDispatch>, |latest, dispatch| match latest {
                Some(current) if current.created_at > dispatch.created_at => Some(current),
                _ => Some(dispatch),
            })
            .cloned())
    }

    fn mark_dispatch_sent(
        &self,
        id: Uuid,
        sent_at: DateTime<Utc>,
        reply_to: &str,
    ) -> Result<SentDispatch, StoreError> {
        let mut state = self.lock()?;
        let dispatch = state.dispatch_mut(id)?;
        if dispatch.status.can_transition_to(DispatchStatus::Sent) {
            dispatch.status = DispatchStatus::Sent;
            dispatch.sent_at = Some(sent_at);
            dispatch.reply_to = Some(reply_to.to_string());
        }
        Ok(dispatch.clone())
    }

    fn set_dispatch_status(
        &self,
        id: Uuid,
        status: DispatchStatus,
    ) -> Result<SentDispatch, StoreError> {
        let mut state = self.lock()?;
        let dispatch = state.dispatch_mut(id)?;
        if dispatch.status.can_transition_to(status) {
            dispatch.status = status;
        }
        Ok(dispatch.clone())
    }

    fn create_proposal(&self, new: &NewProposal) -> Result<Proposal, StoreError> {
        let mut state = self.lock()?;
        if !state.rfps.iter().any(|rfp| rfp.id == new.rfp_id) {
            return Err(StoreError::not_found("rfp", new.rfp_id));
        }
        if !state.vendors.iter().any(|vendor| vendor.id == new.vendor_id) {
            return Err(StoreError::not_found("vendor", new.vendor_id));
        }
        let proposal = Proposal {
            id: Uuid::new_v4(),
            rfp_id: new.rfp_id,
            vendor_id: new.vendor_id,
            sent_rfp_reference: new.sent_rfp_reference.clone(),
            raw_email_body: new.raw_email_body.clone(),
            attachments: Vec::new(),
            parsed_at: None,
            fields: ProposalFields::default(),
            created_at: Utc::now(),
        };
        state.proposals.push(proposal.clone());
        Ok(proposal)
    }

    fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .proposals
            .iter()
            .find(|proposal| proposal.id == id)
            .cloned())
    }

    fn append_proposal_attachments(
        &self,
        id: Uuid,
        attachments: &[AttachmentMeta],
    ) -> Result<Proposal, StoreError> {
        let mut state = self.lock()?;
        let proposal = state.proposal_mut(id)?;
        proposal.attachments.extend_from_slice(attachments);
        Ok(proposal.clone())
    }

    fn apply_proposal_fields(
        &self,
        id: Uuid,
        fields: &ProposalFields,
        parsed_at: DateTime<Utc>,
    ) -> Result<Proposal, StoreError> {
        let mut state = self.lock()?;
        let proposal = state.proposal_mut(id)?;
        proposal.fields = fields.clone();
        proposal.parsed_at = Some(parsed_at);
        Ok(proposal.clone())
    }

    fn list_proposals_for_rfp(&self, rfp_id: Uuid) -> Result<Vec<VendorProposal>, StoreError> {
        let state = self.lock()?;
        state
            .proposals
            .iter()
            .filter(|proposal| proposal.rfp_id == rfp_id)
            .map(|proposal| {
                let vendor = state
                    .vendors
                    .iter()
                    .find(|vendor| vendor.id == proposal.vendor_id)
                    .cloned()
                    .ok_or_else(|| StoreError::not_found("vendor", proposal.vendor_id))?;
                Ok::<_, StoreError>(VendorProposal {
                    proposal: proposal.clone(),
                    vendor,
                })
            })
            .collect()
    }
}
