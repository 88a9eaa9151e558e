//! Outbound email delivery through the SendGrid v3 mail API.
//!
//! The API key and base URL are supplied by the caller.

use std::time::Duration;

use serde::Serialize;

pub const DEFAULT_API_BASE_URL: &str = "https://api.sendgrid.com";
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum SendEmailError {
    #[error("missing SENDGRID_API_KEY")]
    MissingApiKey,
    #[error("invalid email: {0}")]
    InvalidEmail(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sendgrid returned {status}: {body}")]
    Api { status: u16, body: String },
}

/// A single outbound message. Extra headers are passed through verbatim.
#[derive(Debug, Clone, Default)]
pub struct OutboundEmail {
    pub to: String,
    pub from_email: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub status: u16,
    /// Value of SendGrid's `X-Message-Id` response header, when present.
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendGridClient {
    api_key: String,
    api_base_url: String,
    client: reqwest::blocking::Client,
}

impl SendGridClient {
    pub fn new(
        api_key: impl Into<String>,
        api_base_url: impl Into<String>,
    ) -> Result<Self, SendEmailError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(SendEmailError::MissingApiKey);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()?;
        Ok(Self {
            api_key,
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Sends one message. Blocking; call from a blocking context.
    pub fn send(&self, email: &OutboundEmail) -> Result<SendResult, SendEmailError> {
        validate(email)?;
        let payload = build_payload(email);
        let url = format!("{}/v3/mail/send", self.api_base_url);

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SendEmailError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let provider_message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        Ok(SendResult {
            status: status.as_u16(),
            provider_message_id,
        })
    }
}

fn validate(email: &OutboundEmail) -> Result<(), SendEmailError> {
    if !looks_like_address(&email.to) {
        return Err(SendEmailError::InvalidEmail(format!(
            "invalid recipient: {}",
            email.to
        )));
    }
    if !looks_like_address(&email.from_email) {
        return Err(SendEmailError::InvalidEmail(format!(
            "invalid sender: {}",
            email.from_email
        )));
    }
    if email.subject.trim().is_empty() {
        return Err(SendEmailError::InvalidEmail("subject is empty".to_string()));
    }
    let has_text = email
        .text_body
        .as_deref()
        .is_some_and(|body| !body.trim().is_empty());
    let has_html = email
        .html_body
        .as_deref()
        .is_some_and(|body| !body.trim().is_empty());
    if !has_text && !has_html {
        return Err(SendEmailError::InvalidEmail("body is empty".to_string()));
    }
    Ok(())
}

fn looks_like_address(value: &str) -> bool {
    let value = value.trim();
    match value.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !value.contains(' '),
        None => false,
    }
}

#[derive(Debug, Serialize)]
struct MailSendRequest<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: Address<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<Address<'a>>,
    subject: &'a str,
    content: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    headers: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct Personalization<'a> {
    to: Vec<Address<'a>>,
}

#[derive(Debug, Serialize)]
struct Address<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    value: &'a str,
}

fn build_payload(email: &OutboundEmail) -> MailSendRequest<'_> {
    // SendGrid requires text/plain to precede text/html.
    let mut content = Vec::new();
    if let Some(text) = email.text_body.as_deref().filter(|body| !body.trim().is_empty()) {
        content.push(Content {
            kind: "text/plain",
            value: text,
        });
    }
    if let Some(html) = email.html_body.as_deref().filter(|body| !body.trim().is_empty()) {
        content.push(Content {
            kind: "text/html",
            value: html,
        });
    }

    let headers = email
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), serde_json::Value::String(value.clone())))
        .collect();

    MailSendRequest {
        personalizations: vec![Personalization {
            to: vec![Address {
                email: email.to.trim(),
                name: None,
            }],
        }],
        from: Address {
            email: email.from_email.trim(),
            name: email.from_name.as_deref(),
        },
        reply_to: email.reply_to.as_deref().map(|reply_to| Address {
            email: reply_to,
            name: None,
        }),
        subject: &email.subject,
        content,
        headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn sample_email() -> OutboundEmail {
        OutboundEmail {
            to: "sales@vendor.test".to_string(),
            from_email: "buyer@acme.test".to_string(),
            from_name: Some("AerChain".to_string()),
            reply_to: Some("rfp+rfp.abc.1234@reply.acme.test".to_string()),
            subject: "RFP: Laptops [REF:rfp.abc.1234]".to_string(),
            text_body: Some("Please quote.".to_string()),
            html_body: Some("<p>Please quote.</p>".to_string()),
            headers: vec![
                ("Message-ID".to_string(), "<rfp-1@reply.acme.test>".to_string()),
                ("X-Reference-ID".to_string(), "rfp.abc.1234".to_string()),
            ],
        }
    }

    #[test]
    fn send_posts_mail_payload_and_returns_message_id() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/v3/mail/send")
            .match_header("authorization", "Bearer SG.test")
            .match_body(Matcher::PartialJson(json!({
                "personalizations": [{"to": [{"email": "sales@vendor.test"}]}],
                "from": {"email": "buyer@acme.test", "name": "AerChain"},
                "reply_to": {"email": "rfp+rfp.abc.1234@reply.acme.test"},
                "subject": "RFP: Laptops [REF:rfp.abc.1234]",
                "content": [
                    {"type": "text/plain", "value": "Please quote."},
                    {"type": "text/html", "value": "<p>Please quote.</p>"}
                ],
                "headers": {
                    "Message-ID": "<rfp-1@reply.acme.test>",
                    "X-Reference-ID": "rfp.abc.1234"
                }
            })))
            .with_status(202)
            .with_header("x-message-id", "sg-abc123")
            .create();

        let client = SendGridClient::new("SG.test", server.url()).expect("client");
        let result = client.send(&sample_email()).expect("send");

        mock.assert();
        assert_eq!(result.status, 202);
        assert_eq!(result.provider_message_id.as_deref(), Some("sg-abc123"));
    }

    #[test]
    fn send_surfaces_api_errors() {
        let mut server = mockito::Server::new();
        let _mock = server
            .mock("POST", "/v3/mail/send")
            .with_status(401)
            .with_body(r#"{"errors":[{"message":"bad key"}]}"#)
            .create();

        let client = SendGridClient::new("SG.bad", server.url()).expect("client");
        let err = client.send(&sample_email()).expect_err("should fail");
        match err {
            SendEmailError::Api { status, body } => {
                assert_eq!(status, 401);
                assert!(body.contains("bad key"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn send_rejects_invalid_messages_without_calling_api() {
        let client = SendGridClient::new("SG.test", "http://127.0.0.1:9").expect("client");

        let mut email = sample_email();
        email.to = "not-an-address".to_string();
        assert!(matches!(
            client.send(&email),
            Err(SendEmailError::InvalidEmail(_))
        ));

        let mut email = sample_email();
        email.text_body = None;
        email.html_body = Some("   ".to_string());
        assert!(matches!(
            client.send(&email),
            Err(SendEmailError::InvalidEmail(_))
        ));
    }

    #[test]
    fn new_rejects_blank_api_key() {
        assert!(matches!(
            SendGridClient::new("  ", DEFAULT_API_BASE_URL),
            Err(SendEmailError::MissingApiKey)
        ));
    }
}
