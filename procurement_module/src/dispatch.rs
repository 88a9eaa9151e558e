//! Outbound RFP emails to vendors.
//!
//! Every send gets a dispatch record in DRAFT carrying the `referenceId` and
//! `messageId` that inbound replies are later matched on. Both are fixed
//! before the provider is called.

use std::sync::Arc;

use chrono::{Datelike, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use send_emails_module::{OutboundEmail, SendEmailError, SendGridClient, SendResult};

use crate::models::{DispatchStatus, NewDispatch, SentDispatch, Vendor};
use crate::store::{run_blocking, ProcurementStore, StoreError};

pub trait EmailSender: Send + Sync {
    fn send(&self, email: &OutboundEmail) -> Result<SendResult, SendEmailError>;
}

impl EmailSender for SendGridClient {
    fn send(&self, email: &OutboundEmail) -> Result<SendResult, SendEmailError> {
        SendGridClient::send(self, email)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("vendorIds is required and must be a non-empty array")]
    NoVendorIds,
    #[error("missing required fields: subject, text/html")]
    MissingContent,
    #[error("rfp not found: {0}")]
    RfpNotFound(Uuid),
    #[error("no vendors found with the provided ids")]
    NoVendorsFound,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub from_email: String,
    pub from_name: String,
    pub reply_domain: String,
}

#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub rfp_id: Uuid,
    pub vendor_ids: Vec<Uuid>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub sender_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentEntry {
    pub vendor_id: Uuid,
    pub vendor_name: String,
    pub email: String,
    pub sent_rfp: SentDispatch,
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEntry {
    pub vendor_id: Uuid,
    pub vendor_name: Option<String>,
    pub email: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub sent: Vec<SentEntry>,
    pub failed: Vec<FailedEntry>,
    pub summary: DispatchSummary,
}

#[derive(Clone)]
pub struct RfpDispatcher {
    store: Arc<dyn ProcurementStore>,
    sender: Option<Arc<dyn EmailSender>>,
    config: DispatchConfig,
}

impl RfpDispatcher {
    pub fn new(
        store: Arc<dyn ProcurementStore>,
        sender: Option<Arc<dyn EmailSender>>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            sender,
            config,
        }
    }

    pub async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReport, DispatchError> {
        if request.vendor_ids.is_empty() {
            return Err(DispatchError::NoVendorIds);
        }
        let has_body = [&request.text, &request.html]
            .iter()
            .any(|body| body.as_deref().is_some_and(|body| !body.trim().is_empty()));
        if request.subject.trim().is_empty() || !has_body {
            return Err(DispatchError::MissingContent);
        }
        let rfp_id = request.rfp_id;
        let vendor_ids = request.vendor_ids.clone();
        let lookup = run_blocking(&self.store, move |store| {
            if store.get_rfp(rfp_id)?.is_none() {
                return Ok(None);
            }
            let mut vendors = Vec::with_capacity(vendor_ids.len());
            for vendor_id in vendor_ids {
                vendors.push((vendor_id, store.get_vendor(vendor_id)?));
            }
            Ok(Some(vendors))
        })
        .await?;
        let Some(lookup) = lookup else {
            return Err(DispatchError::RfpNotFound(rfp_id));
        };

        let mut vendors = Vec::new();
        let mut failed = Vec::new();
        for (vendor_id, vendor) in lookup {
            match vendor {
                Some(vendor) => vendors.push(vendor),
                None => failed.push(FailedEntry {
                    vendor_id,
                    vendor_name: None,
                    email: None,
                    error: "vendor not found".to_string(),
                }),
            }
        }
        if vendors.is_empty() {
            return Err(DispatchError::NoVendorsFound);
        }

        let mut sent = Vec::new();
        for vendor in vendors {
            match self.send_to_vendor(request, &vendor).await {
                Ok(entry) => sent.push(entry),
                Err(error) => {
                    warn!("rfp dispatch failed vendor={}: {}", vendor.id, error);
                    failed.push(FailedEntry {
                        vendor_id: vendor.id,
                        vendor_name: Some(vendor.name),
                        email: Some(vendor.contact_email),
                        error,
                    });
                }
            }
        }

        let summary = DispatchSummary {
            total: sent.len() + failed.len(),
            successful: sent.len(),
            failed: failed.len(),
        };
        info!(
            "rfp dispatch finished rfp={} sent={} failed={}",
            request.rfp_id, summary.successful, summary.failed
        );
        Ok(DispatchReport {
            sent,
            failed,
            summary,
        })
    }

    async fn send_to_vendor(
        &self,
        request: &DispatchRequest,
        vendor: &Vendor,
    ) -> Result<SentEntry, String> {
        let new_dispatch = NewDispatch {
            rfp_id: request.rfp_id,
            vendor_id: vendor.id,
            reference_id: new_reference_id(request.rfp_id),
            message_id: new_message_id(&self.config.reply_domain),
        };
        let draft = run_blocking(&self.store, move |store| store.create_dispatch(&new_dispatch))
            .await
            .map_err(|err| format!("create dispatch: {}", err))?;

        let reply_to = reply_to_address(&draft.reference_id, &self.config.reply_domain);
        let email = self.build_email(request, vendor, &draft, &reply_to);

        let result = match self.sender.clone() {
            Some(sender) => tokio::task::spawn_blocking(move || sender.send(&email))
                .await
                .map_err(|err| format!("send task: {}", err))
                .and_then(|result| result.map_err(|err| err.to_string())),
            None => Err("email sender not configured".to_string()),
        };

        match result {
            Ok(send_result) => {
                let (dispatch_id, sent_at) = (draft.id, Utc::now());
                let updated = run_blocking(&self.store, move |store| {
                    store.mark_dispatch_sent(dispatch_id, sent_at, &reply_to)
                })
                .await
                .map_err(|err| format!("mark sent: {}", err))?;
                info!(
                    "rfp dispatch sent dispatch={} vendor={} reference_id={}",
                    updated.id, vendor.id, updated.reference_id
                );
                Ok(SentEntry {
                    vendor_id: vendor.id,
                    vendor_name: vendor.name.clone(),
                    email: vendor.contact_email.clone(),
                    sent_rfp: updated,
                    provider_message_id: send_result.provider_message_id,
                })
            }
            Err(error) => {
                let dispatch_id = draft.id;
                if let Err(err) = run_blocking(&self.store, move |store| {
                    store.set_dispatch_status(dispatch_id, DispatchStatus::Failed)
                })
                .await
                {
                    warn!("failed to mark dispatch={} FAILED: {}", draft.id, err);
                }
                Err(error)
            }
        }
    }

    fn build_email(
        &self,
        request: &DispatchRequest,
        vendor: &Vendor,
        draft: &SentDispatch,
        reply_to: &str,
    ) -> OutboundEmail {
        let text = request
            .text
            .clone()
            .filter(|text| !text.trim().is_empty());
        let html = request
            .html
            .clone()
            .filter(|html| !html.trim().is_empty())
            .unwrap_or_else(|| {
                render_html(
                    text.as_deref().unwrap_or_default(),
                    &draft.reference_id,
                    &self.config.from_name,
                )
            });

        OutboundEmail {
            to: vendor.contact_email.clone(),
            from_email: self.config.from_email.clone(),
            from_name: Some(
                request
                    .sender_name
                    .clone()
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| self.config.from_name.clone()),
            ),
            reply_to: Some(reply_to.to_string()),
            subject: tag_subject(&request.subject, &draft.reference_id),
            text_body: text,
            html_body: Some(html),
            headers: vec![
                ("Message-ID".to_string(), draft.message_id.clone()),
                ("X-Reference-ID".to_string(), draft.reference_id.clone()),
                ("X-Mailer".to_string(), self.config.from_name.clone()),
            ],
        }
    }
}

/// `rfp.<rfpId>.<16 hex chars>`
pub fn new_reference_id(rfp_id: Uuid) -> String {
    format!("rfp.{}.{}", rfp_id, hex::encode(rand::random::<[u8; 8]>()))
}

/// `<rfp-<uuid>@<domain>>`, lower-cased to match how inbound ids are compared.
pub fn new_message_id(reply_domain: &str) -> String {
    format!("<rfp-{}@{}>", Uuid::new_v4(), reply_domain.trim()).to_ascii_lowercase()
}

pub fn reply_to_address(reference_id: &str, reply_domain: &str) -> String {
    format!("rfp+{}@{}", reference_id, reply_domain.trim())
}

fn tag_subject(subject: &str, reference_id: &str) -> String {
    format!("{} [REF:{}]", subject.trim(), reference_id)
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn render_html(text: &str, reference_id: &str, from_name: &str) -> String {
    let body = escape_html(text).replace('\n', "<br/>");
    let from_name = escape_html(from_name);
    format!(
        r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"/><meta name="viewport" content="width=device-width,initial-scale=1"/></head>
<body style="margin:0;padding:0;font-family:Arial,sans-serif;background:#f4f4f4;">
  <table width="100%" cellpadding="0" cellspacing="0" style="padding:20px;background:#f4f4f4;">
    <tr><td align="center">
      <table width="600" cellpadding="0" cellspacing="0" style="background:#fff;border-radius:8px;overflow:hidden;">
        <tr><td style="background:#4f46e5;padding:30px;text-align:center;color:#fff;">
          <h1 style="margin:0;font-size:22px;">{from_name}</h1>
        </td></tr>
        <tr><td style="padding:30px;color:#333;font-size:15px;line-height:1.5;">
          {body}
          <p style="margin-top:20px;color:#555;font-size:13px;">Reference ID: <code>{reference_id}</code></p>
        </td></tr>
        <tr><td style="background:#fafafa;padding:18px;text-align:center;color:#6b7280;font-size:12px;border-top:1px solid #eee">
          Sent via {from_name}
          <div style="margin-top:6px;">&copy; {year} {from_name}</div>
        </td></tr>
      </table>
    </td></tr>
  </table>
</body>
</html>
"#,
        year = Utc::now().year(),
    )
}
