use std::collections::HashMap;
use std::time::Duration;

use axum::body::{to_bytes, Bytes};
use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dispatch::{DispatchError, DispatchRequest};
use crate::inbound_email::{FormFile, InboundEmail, InboundForm};
use crate::models::AttachmentMeta;
use crate::ranking::RankingError;
use crate::rfp_structurer::StructureError;
use crate::store::run_blocking;

use super::state::AppState;
use super::verify::verify_inbound_token;

const DOWNLOAD_LINK_TTL: Duration = Duration::from_secs(60 * 60);

pub(super) async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub(super) async fn inbound_email(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
) -> Response {
    if let Err(reason) = verify_inbound_token(
        state.inbound_token.as_deref(),
        query.get("token").map(String::as_str),
    ) {
        warn!("inbound webhook rejected: {}", reason);
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"ok": false, "error": "unauthorized"})),
        )
            .into_response();
    }
    if request.method() != Method::POST {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            Json(json!({"ok": false, "error": "method not allowed"})),
        )
            .into_response();
    }

    let form = match read_inbound_form(&state, request).await {
        Ok(form) => form,
        Err(err) => {
            error!("inbound webhook form unreadable: {}", err);
            return inbound_failure(err);
        }
    };
    let email = match InboundEmail::from_form(form) {
        Ok(email) => email,
        Err(err) => {
            error!("inbound webhook email unparsable: {}", err);
            return inbound_failure(err.to_string());
        }
    };
    info!(
        "inbound email from={:?} subject={:?} attachments={}",
        email.sender_address(),
        email.subject,
        email.attachments.len()
    );

    match state.pipeline.ingest(email).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({"ok": true, "createdProposalId": outcome.proposal.id})),
        )
            .into_response(),
        Err(err) => {
            error!("inbound ingestion failed: {}", err);
            inbound_failure(err.to_string())
        }
    }
}

fn inbound_failure(error: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"ok": false, "error": error})),
    )
        .into_response()
}

async fn read_inbound_form(state: &AppState, request: Request) -> Result<InboundForm, String> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|err| err.body_text())?;
        let mut form = InboundForm::default();
        while let Some(field) = multipart.next_field().await.map_err(|err| err.body_text())? {
            let name = field.name().unwrap_or_default().to_string();
            let filename = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            let bytes = field.bytes().await.map_err(|err| err.body_text())?;
            match filename {
                Some(filename) => form.files.push(FormFile {
                    field_name: name,
                    filename: Some(filename),
                    content_type,
                    bytes: bytes.to_vec(),
                }),
                None => form
                    .fields
                    .push((name, String::from_utf8_lossy(&bytes).into_owned())),
            }
        }
        return Ok(form);
    }

    let body = to_bytes(request.into_body(), state.inbound_body_max_bytes)
        .await
        .map_err(|err| format!("failed to read body: {}", err))?;
    InboundForm::from_urlencoded(&body).map_err(|err| err.to_string())
}

pub(super) async fn compare_proposals(
    State(state): State<AppState>,
    Path(rfp_id): Path<String>,
) -> Response {
    let Ok(rfp_id) = Uuid::parse_str(rfp_id.trim()) else {
        return failure(StatusCode::NOT_FOUND, "RFP not found");
    };
    match state.ranker.rank(rfp_id).await {
        Ok(report) => (StatusCode::OK, Json(json!({"success": true, "data": report}))).into_response(),
        Err(RankingError::RfpNotFound(_)) => failure(StatusCode::NOT_FOUND, "RFP not found"),
        Err(RankingError::NoProposals(_)) => {
            failure(StatusCode::NOT_FOUND, "No proposals found for this RFP")
        }
        Err(err) => {
            error!("ranking failed rfp={}: {}", rfp_id, err);
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to compare proposals")
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentLink {
    #[serde(flatten)]
    meta: AttachmentMeta,
    download_url: String,
}

pub(super) async fn proposal_attachments(
    State(state): State<AppState>,
    Path(proposal_id): Path<String>,
) -> Response {
    let Ok(proposal_id) = Uuid::parse_str(proposal_id.trim()) else {
        return failure(StatusCode::NOT_FOUND, "Proposal not found");
    };
    let proposal = match run_blocking(&state.store, move |store| store.get_proposal(proposal_id))
        .await
    {
        Ok(Some(proposal)) => proposal,
        Ok(None) => return failure(StatusCode::NOT_FOUND, "Proposal not found"),
        Err(err) => {
            error!("proposal lookup failed id={}: {}", proposal_id, err);
            return failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load proposal");
        }
    };

    let mut links = Vec::with_capacity(proposal.attachments.len());
    for meta in proposal.attachments {
        let download_url = match state.relocator.download_url(&meta, DOWNLOAD_LINK_TTL).await {
            Ok(url) => url,
            Err(err) => {
                warn!("signing failed key={}: {}", meta.storage_key, err);
                meta.url.clone()
            }
        };
        links.push(AttachmentLink { meta, download_url });
    }
    (StatusCode::OK, Json(json!({"success": true, "data": links}))).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParseRfpRequest {
    text: String,
    user_id: Uuid,
}

pub(super) async fn parse_rfp(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ParseRfpRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return failure(StatusCode::BAD_REQUEST, &format!("Validation failed: {}", err));
        }
    };

    match state.structurer.structure(&request.text, request.user_id).await {
        Ok(structured) => (
            StatusCode::CREATED,
            Json(json!({
                "success": true,
                "message": "RFP parsed and saved successfully",
                "data": {
                    "rfp": structured.rfp,
                    "parsedStructure": structured.parsed_structure,
                }
            })),
        )
            .into_response(),
        Err(err) => {
            let status = match &err {
                StructureError::TextTooShort | StructureError::NoItems => StatusCode::BAD_REQUEST,
                StructureError::UserNotFound(_) => StatusCode::NOT_FOUND,
                StructureError::NoLlmConfigured
                | StructureError::Llm(_)
                | StructureError::Decode(_) => StatusCode::BAD_GATEWAY,
                StructureError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            if status.is_server_error() {
                error!("rfp parse failed: {}", err);
            }
            failure(status, &err.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMultipleRequest {
    rfp_id: Uuid,
    #[serde(default)]
    vendor_ids: Vec<Uuid>,
    #[serde(default)]
    subject: String,
    text: Option<String>,
    html: Option<String>,
    sender_name: Option<String>,
}

pub(super) async fn send_to_vendors(State(state): State<AppState>, body: Bytes) -> Response {
    let request: SendMultipleRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return failure(StatusCode::BAD_REQUEST, &format!("Validation failed: {}", err));
        }
    };
    let request = DispatchRequest {
        rfp_id: request.rfp_id,
        vendor_ids: request.vendor_ids,
        subject: request.subject,
        text: request.text,
        html: request.html,
        sender_name: request.sender_name,
    };

    match state.dispatcher.dispatch(&request).await {
        Ok(report) => {
            let message = format!(
                "Emails sent to {} out of {} vendors",
                report.summary.successful, report.summary.total
            );
            (
                StatusCode::OK,
                Json(json!({"success": true, "message": message, "data": report})),
            )
                .into_response()
        }
        Err(err) => {
            let status = match &err {
                DispatchError::NoVendorIds | DispatchError::MissingContent => StatusCode::BAD_REQUEST,
                DispatchError::RfpNotFound(_) | DispatchError::NoVendorsFound => StatusCode::NOT_FOUND,
                DispatchError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            if status.is_server_error() {
                error!("rfp dispatch failed: {}", err);
            }
            failure(status, &err.to_string())
        }
    }
}

fn failure(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"success": false, "message": message}))).into_response()
}
