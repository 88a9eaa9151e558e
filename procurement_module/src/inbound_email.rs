//! Normalizes inbound-parse webhook forms into a single email shape.
//!
//! Providers post either discrete fields (`from`, `to`, `subject`, `text`,
//! `html`, a raw `headers` block) or the full RFC 822 message in an `email`
//! field. Both variants, plus any uploaded file parts, land in [`InboundEmail`].

use std::sync::LazyLock;

use mail_parser::{HeaderValue, MessageParser, MimeHeaders};
use regex::Regex;

use crate::html::html_to_text;

static ADDRESS_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"[^\s<>,;:"'()\[\]]+@[^\s<>,;:"'()\[\]]+"#).ok());

#[derive(Debug, thiserror::Error)]
pub enum InboundFormError {
    #[error("invalid form encoding: {0}")]
    Encoding(String),
    #[error("raw email could not be parsed")]
    UnparsableRawEmail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub address: String,
    pub name: Option<String>,
}

impl Mailbox {
    /// Display name, falling back to the address local part.
    pub fn display_name(&self) -> String {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.address
                    .split('@')
                    .next()
                    .unwrap_or(&self.address)
                    .to_string()
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAttachment {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundEmail {
    pub from: Option<Mailbox>,
    pub to: Vec<String>,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,
    pub message_id: Option<String>,
    pub attachments: Vec<InboundAttachment>,
}

/// One uploaded file part of a multipart form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormFile {
    pub field_name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct InboundForm {
    pub fields: Vec<(String, String)>,
    pub files: Vec<FormFile>,
}

impl InboundForm {
    pub fn from_urlencoded(body: &[u8]) -> Result<Self, InboundFormError> {
        let fields: Vec<(String, String)> = serde_urlencoded::from_bytes(body)
            .map_err(|err| InboundFormError::Encoding(err.to_string()))?;
        Ok(Self {
            fields,
            files: Vec::new(),
        })
    }

    /// First non-blank value among `names`, matched case-insensitively.
    pub fn field(&self, names: &[&str]) -> Option<&str> {
        names.iter().find_map(|name| {
            self.fields
                .iter()
                .find(|(key, value)| key.eq_ignore_ascii_case(name) && !value.trim().is_empty())
                .map(|(_, value)| value.as_str())
        })
    }
}

impl InboundEmail {
    pub fn from_form(form: InboundForm) -> Result<Self, InboundFormError> {
        let mut email = match form.field(&["email"]) {
            Some(raw) => parse_raw_email(raw.as_bytes())?,
            None => InboundEmail::default(),
        };
        let headers = form
            .field(&["headers"])
            .map(parse_header_block)
            .unwrap_or_default();
        let header = |name: &str| {
            headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        };

        if email.from.is_none() {
            email.from = form
                .field(&["from", "sender"])
                .or_else(|| header("From"))
                .and_then(parse_mailbox);
        }
        if email.to.is_empty() {
            email.to = form
                .field(&["to", "recipient"])
                .or_else(|| header("To"))
                .map(parse_address_list)
                .unwrap_or_default();
        }
        if email.subject.is_empty() {
            email.subject = form
                .field(&["subject"])
                .or_else(|| header("Subject"))
                .map(|value| value.trim().to_string())
                .unwrap_or_default();
        }
        if email.text_body.is_none() {
            email.text_body = form
                .field(&["text", "body-plain", "plain"])
                .map(str::to_string);
        }
        if email.html_body.is_none() {
            email.html_body = form.field(&["html", "body-html"]).map(str::to_string);
        }
        if email.in_reply_to.is_empty() {
            email.in_reply_to = form
                .field(&["In-Reply-To", "in_reply_to", "inReplyTo"])
                .or_else(|| header("In-Reply-To"))
                .map(split_message_ids)
                .unwrap_or_default();
        }
        if email.references.is_empty() {
            email.references = form
                .field(&["References"])
                .or_else(|| header("References"))
                .map(split_message_ids)
                .unwrap_or_default();
        }
        if email.message_id.is_none() {
            email.message_id = form
                .field(&["Message-ID", "Message-Id", "message_id", "messageId"])
                .or_else(|| header("Message-ID"))
                .map(|value| value.trim().to_string());
        }

        email.attachments.extend(form.files.into_iter().map(|file| InboundAttachment {
            filename: file.filename,
            content_type: file.content_type,
            bytes: file.bytes,
        }));
        Ok(email)
    }

    /// Body persisted on the proposal: plain text when present, otherwise the HTML.
    pub fn stored_body(&self) -> String {
        non_blank(self.text_body.as_deref())
            .or_else(|| non_blank(self.html_body.as_deref()))
            .unwrap_or_default()
            .to_string()
    }

    /// Body handed to reply extraction, with HTML reduced to text.
    pub fn readable_body(&self) -> String {
        if let Some(text) = non_blank(self.text_body.as_deref()) {
            return text.to_string();
        }
        non_blank(self.html_body.as_deref())
            .map(html_to_text)
            .unwrap_or_default()
    }

    pub fn sender_address(&self) -> Option<&str> {
        self.from.as_ref().map(|mailbox| mailbox.address.as_str())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

pub fn parse_raw_email(raw: &[u8]) -> Result<InboundEmail, InboundFormError> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or(InboundFormError::UnparsableRawEmail)?;

    let from = message.from().and_then(|address| address.first()).and_then(|addr| {
        addr.address().map(|address| Mailbox {
            address: address.trim().to_string(),
            name: addr.name().map(|name| name.trim().to_string()),
        })
    });
    let to = message
        .to()
        .map(|address| {
            address
                .iter()
                .filter_map(|addr| addr.address())
                .map(|address| address.trim().to_string())
                .collect()
        })
        .unwrap_or_default();

    let attachments = message
        .attachments()
        .map(|part| InboundAttachment {
            filename: part.attachment_name().map(str::to_string),
            content_type: part.content_type().map(|content_type| {
                match content_type.subtype() {
                    Some(subtype) => format!("{}/{}", content_type.ctype(), subtype),
                    None => content_type.ctype().to_string(),
                }
            }),
            bytes: part.contents().to_vec(),
        })
        .collect();

    Ok(InboundEmail {
        from,
        to,
        subject: message.subject().unwrap_or_default().trim().to_string(),
        text_body: message.body_text(0).map(|body| body.into_owned()),
        html_body: message.body_html(0).map(|body| body.into_owned()),
        in_reply_to: header_ids(message.in_reply_to()),
        references: header_ids(message.references()),
        message_id: message.message_id().map(|id| format!("<{}>", id.trim())),
        attachments,
    })
}

fn header_ids(value: &HeaderValue) -> Vec<String> {
    match value {
        HeaderValue::Text(id) => split_message_ids(id),
        HeaderValue::TextList(ids) => ids.iter().flat_map(|id| split_message_ids(id)).collect(),
        _ => Vec::new(),
    }
}

/// Splits a header value holding one or more message ids.
pub fn split_message_ids(value: &str) -> Vec<String> {
    value
        .split(|ch: char| ch.is_whitespace() || matches!(ch, ',' | ';'))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses `Name <addr@host>` or a bare address.
pub fn parse_mailbox(value: &str) -> Option<Mailbox> {
    let value = value.trim();
    if let (Some(open), Some(close)) = (value.rfind('<'), value.rfind('>')) {
        if open < close {
            let address = value[open + 1..close].trim();
            if address.contains('@') {
                let name = value[..open]
                    .trim()
                    .trim_matches('"')
                    .trim()
                    .to_string();
                return Some(Mailbox {
                    address: address.to_string(),
                    name: Some(name).filter(|name| !name.is_empty()),
                });
            }
        }
    }
    let pattern = ADDRESS_PATTERN.as_ref()?;
    pattern.find(value).map(|found| Mailbox {
        address: found.as_str().to_string(),
        name: None,
    })
}

/// Every address in a recipient header, in order.
pub fn parse_address_list(value: &str) -> Vec<String> {
    match ADDRESS_PATTERN.as_ref() {
        Some(pattern) => pattern
            .find_iter(value)
            .map(|found| found.as_str().to_string())
            .collect(),
        None => Vec::new(),
    }
}

/// Parses a raw header block, unfolding continuation lines.
pub fn parse_header_block(block: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in block.lines() {
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    headers
}
