use async_trait::async_trait;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{extract_address, MailboxService};
use crate::config::Config;
use crate::error::AdapterError;
use crate::model::{InboundMessage, IntentLabel};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/";

#[derive(Clone)]
pub struct GmailClient {
    http: Client,
    base_url: Url,
    token: String,
    user_id: String,
    query: String,
    processed_label_id: Option<String>,
    intent_label_ids: BTreeMap<IntentLabel, String>,
}

impl fmt::Debug for GmailClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GmailClient")
            .field("base_url", &self.base_url)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl GmailClient {
    pub fn from_config(cfg: &Config) -> Result<Self, AdapterError> {
        let base_url = Url::parse(GMAIL_API_BASE)
            .map_err(|e| AdapterError::Invalid(format!("Gmail base URL: {e}")))?;
        Self::with_base_url(cfg, base_url)
    }

    pub fn with_base_url(cfg: &Config, base_url: Url) -> Result<Self, AdapterError> {
        let http = Client::builder()
            .user_agent("candidate-mailbot/0.1")
            .timeout(cfg.app.adapter_timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url,
            token: cfg.gmail.access_token.clone(),
            user_id: cfg.gmail.user_id.clone(),
            query: cfg.gmail.query.clone(),
            processed_label_id: cfg.gmail.processed_label_id.clone(),
            intent_label_ids: cfg.gmail.intent_label_ids.clone(),
        })
    }

    fn endpoint(&self, tail: &str) -> Result<Url, AdapterError> {
        self.base_url
            .join(&format!("gmail/v1/users/{}/{}", self.user_id, tail))
            .map_err(|e| AdapterError::Invalid(format!("bad Gmail URL: {e}")))
    }

    pub fn build_list_request(&self, max_count: usize) -> Result<reqwest::Request, AdapterError> {
        let url = self.endpoint("messages")?;
        Ok(self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .query(&[
                ("q", self.query.as_str()),
                ("maxResults", max_count.to_string().as_str()),
            ])
            .build()?)
    }

    pub fn build_send_request(
        &self,
        original: &InboundMessage,
        body: &str,
    ) -> Result<reqwest::Request, AdapterError> {
        let url = self.endpoint("messages/send")?;
        let raw = URL_SAFE.encode(build_reply_mime(original, body));
        Ok(self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&json!({ "raw": raw, "threadId": original.thread_id }))
            .build()?)
    }

    /// Mark read, add the processed label and the label mapped to `intent`.
    pub fn build_modify_request(
        &self,
        message_id: &str,
        intent: Option<IntentLabel>,
    ) -> Result<reqwest::Request, AdapterError> {
        let url = self.endpoint(&format!("messages/{message_id}/modify"))?;
        let mut add: Vec<&str> = self.processed_label_id.iter().map(String::as_str).collect();
        if let Some(label_id) = intent.and_then(|i| self.intent_label_ids.get(&i)) {
            add.push(label_id.as_str());
        }
        Ok(self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&json!({ "addLabelIds": add, "removeLabelIds": ["UNREAD"] }))
            .build()?)
    }

    async fn execute_json<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::Request,
    ) -> Result<T, AdapterError> {
        debug!(method = %request.method(), url = %request.url(), "gmail request");
        let res = self.http.execute(request).await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(AdapterError::from_status("gmail", status, &body));
        }
        let text = res.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| AdapterError::Malformed(format!("gmail response: {e}")))
    }

    async fn get_message(&self, id: &str) -> Result<InboundMessage, AdapterError> {
        let url = self.endpoint(&format!("messages/{id}"))?;
        let request = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .query(&[("format", "full")])
            .build()?;
        let message: GmailMessage = self.execute_json(request).await?;
        parse_message(message)
    }
}

#[async_trait]
impl MailboxService for GmailClient {
    async fn fetch_candidate_messages(
        &self,
        max_count: usize,
    ) -> Result<Vec<InboundMessage>, AdapterError> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let list: ListMessagesResponse = self
            .execute_json(self.build_list_request(max_count)?)
            .await?;

        let mut messages = Vec::with_capacity(list.messages.len());
        for stub in list.messages.iter().take(max_count) {
            match self.get_message(&stub.id).await {
                Ok(msg) => messages.push(msg),
                // Left unread, so it shows up again on the next poll.
                Err(err) => warn!(?err, id = %stub.id, "failed to fetch gmail message"),
            }
        }
        messages.sort_by_key(|m| m.received_at);
        info!(count = messages.len(), "fetched gmail messages");
        Ok(messages)
    }

    async fn send_reply(&self, original: &InboundMessage, body: &str) -> Result<(), AdapterError> {
        let request = self.build_send_request(original, body)?;
        let sent: SentMessage = self.execute_json(request).await?;
        info!(message_id = %original.message_id, sent_id = %sent.id, "reply sent");
        Ok(())
    }

    async fn mark_handled(
        &self,
        message_id: &str,
        intent: Option<IntentLabel>,
    ) -> Result<(), AdapterError> {
        let request = self.build_modify_request(message_id, intent)?;
        let _: Value = self.execute_json(request).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ListMessagesResponse {
    #[serde(default)]
    messages: Vec<MessageStub>,
}

#[derive(Debug, Deserialize)]
struct MessageStub {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub internal_date: Option<String>,
    #[serde(default)]
    pub payload: Option<MessagePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePart {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body: Option<PartBody>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Debug, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct PartBody {
    #[serde(default)]
    pub data: Option<String>,
}

/// Convert a `format=full` Gmail message into an [`InboundMessage`].
pub fn parse_message(message: GmailMessage) -> Result<InboundMessage, AdapterError> {
    let payload = message.payload.unwrap_or_default();
    let from = header_value(&payload, "From").unwrap_or_default();
    // Keep an unparseable sender verbatim; the pipeline rejects it explicitly.
    let sender_address = extract_address(&from).unwrap_or_else(|| from.trim().to_string());
    let subject = header_value(&payload, "Subject").unwrap_or_else(|| "(No Subject)".to_string());
    let received_at = extract_received_at(&payload, message.internal_date.as_deref());
    let body = extract_body(&payload)?.unwrap_or_default();

    Ok(InboundMessage {
        thread_id: message.thread_id.unwrap_or_else(|| message.id.clone()),
        message_id: message.id,
        sender_address,
        subject,
        body: body.trim().to_string(),
        received_at,
    })
}

fn header_value(payload: &MessagePart, name: &str) -> Option<String> {
    payload
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.trim().to_string())
}

fn extract_received_at(payload: &MessagePart, internal_date: Option<&str>) -> DateTime<Utc> {
    if let Some(ms) = internal_date.and_then(|s| s.parse::<i64>().ok()) {
        if let Some(ts) = DateTime::from_timestamp_millis(ms) {
            return ts;
        }
    }
    if let Some(date_header) = header_value(payload, "Date") {
        match DateTime::parse_from_rfc2822(&date_header) {
            Ok(parsed) => return parsed.with_timezone(&Utc),
            Err(_) => warn!(header = %date_header, "failed to parse Date header"),
        }
    }
    Utc::now()
}

fn extract_body(payload: &MessagePart) -> Result<Option<String>, AdapterError> {
    if let Some(part) = find_part_with_mime(payload, "text/plain") {
        if let Some(body) = decode_part_body(part)? {
            return Ok(Some(body));
        }
    }
    if let Some(part) = find_part_with_mime(payload, "text/html") {
        if let Some(body) = decode_part_body(part)? {
            return Ok(Some(strip_html(&body)));
        }
    }
    decode_part_body(payload)
}

fn find_part_with_mime<'a>(part: &'a MessagePart, target: &str) -> Option<&'a MessagePart> {
    if part
        .mime_type
        .as_deref()
        .is_some_and(|m| m.eq_ignore_ascii_case(target))
    {
        return Some(part);
    }
    part.parts
        .iter()
        .find_map(|child| find_part_with_mime(child, target))
}

fn decode_part_body(part: &MessagePart) -> Result<Option<String>, AdapterError> {
    let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) else {
        return Ok(None);
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .map_err(|e| AdapterError::Malformed(format!("message body base64: {e}")))?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));
static BLANKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n+").expect("valid regex"));

fn strip_html(html: &str) -> String {
    let text = html
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("</p>", "\n");
    let text = TAGS.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">");
    BLANKS.replace_all(text.trim(), "\n\n").into_owned()
}

/// RFC 2822 reply to `original`; Gmail threads it by `threadId` and subject.
pub fn build_reply_mime(original: &InboundMessage, body: &str) -> String {
    let subject = if original.subject.to_ascii_lowercase().starts_with("re:") {
        original.subject.clone()
    } else {
        format!("Re: {}", original.subject)
    };
    format!(
        "To: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\nMIME-Version: 1.0\r\n\r\n{}",
        original.sender_address,
        subject.replace(['\r', '\n'], " "),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_config() -> Config {
        serde_yaml::from_str(crate::config::example()).unwrap()
    }

    fn sample_inbound() -> InboundMessage {
        InboundMessage {
            message_id: "m-1".into(),
            thread_id: "t-1".into(),
            sender_address: "jane@example.com".into(),
            subject: "Interview slots".into(),
            body: "Could we meet Tuesday?".into(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn parse_message_prefers_plain_text_part() {
        let plain = URL_SAFE.encode("Hello team,\nI can do Tuesday.");
        let html = URL_SAFE.encode("<p>ignored</p>");
        let raw = json!({
            "id": "18c",
            "threadId": "18a",
            "internalDate": "1700000000000",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    { "name": "From", "value": "\"Jane\" <Jane@Example.com>" },
                    { "name": "Subject", "value": "Re: Interview" }
                ],
                "parts": [
                    { "mimeType": "text/html", "body": { "data": html } },
                    { "mimeType": "text/plain", "body": { "data": plain } }
                ]
            }
        });
        let msg = parse_message(serde_json::from_value(raw).unwrap()).unwrap();
        assert_eq!(msg.message_id, "18c");
        assert_eq!(msg.thread_id, "18a");
        assert_eq!(msg.sender_address, "jane@example.com");
        assert_eq!(msg.subject, "Re: Interview");
        assert_eq!(msg.body, "Hello team,\nI can do Tuesday.");
        assert_eq!(msg.received_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn parse_message_falls_back_to_html_and_keeps_bad_sender() {
        let html = URL_SAFE_NO_PAD.encode("<div>Thanks &amp; regards<br>Bob</div>");
        let raw = json!({
            "id": "x1",
            "payload": {
                "mimeType": "text/html",
                "headers": [{ "name": "From", "value": "Mailer Daemon" }],
                "body": { "data": html }
            }
        });
        let msg = parse_message(serde_json::from_value(raw).unwrap()).unwrap();
        assert_eq!(msg.thread_id, "x1");
        assert_eq!(msg.sender_address, "Mailer Daemon");
        assert_eq!(msg.subject, "(No Subject)");
        assert_eq!(msg.body, "Thanks & regards\nBob");
    }

    #[test]
    fn reply_mime_adds_single_re_prefix() {
        let mut original = sample_inbound();
        let mime = build_reply_mime(&original, "See you then.");
        assert!(mime.starts_with("To: jane@example.com\r\nSubject: Re: Interview slots\r\n"));
        assert!(mime.ends_with("\r\n\r\nSee you then."));

        original.subject = "RE: Offer".into();
        let mime = build_reply_mime(&original, "Thanks");
        assert!(mime.contains("Subject: RE: Offer\r\n"));
    }

    #[test]
    fn send_request_targets_thread() {
        let client = GmailClient::from_config(&sample_config()).unwrap();
        let request = client.build_send_request(&sample_inbound(), "Hi").unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/gmail/v1/users/me/messages/send");
        assert_eq!(
            request
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer YOUR_GMAIL_OAUTH_ACCESS_TOKEN"
        );
        let body: Value =
            serde_json::from_slice(request.body().and_then(|b| b.as_bytes()).unwrap()).unwrap();
        assert_eq!(body["threadId"], "t-1");
        let raw = URL_SAFE.decode(body["raw"].as_str().unwrap()).unwrap();
        assert!(String::from_utf8(raw).unwrap().contains("Subject: Re: Interview slots"));
    }

    #[test]
    fn modify_request_labels_by_intent() {
        let client = GmailClient::from_config(&sample_config()).unwrap();
        let request = client
            .build_modify_request("m-1", Some(IntentLabel::Scheduling))
            .unwrap();
        assert_eq!(request.url().path(), "/gmail/v1/users/me/messages/m-1/modify");
        let body: Value =
            serde_json::from_slice(request.body().and_then(|b| b.as_bytes()).unwrap()).unwrap();
        assert_eq!(
            body["addLabelIds"],
            json!(["Label_candidate_processed", "Label_scheduling"])
        );
        assert_eq!(body["removeLabelIds"], json!(["UNREAD"]));

        // Unmapped intents and unclassified messages only get the processed label.
        for intent in [Some(IntentLabel::Unknown), None] {
            let request = client.build_modify_request("m-1", intent).unwrap();
            let body: Value =
                serde_json::from_slice(request.body().and_then(|b| b.as_bytes()).unwrap()).unwrap();
            assert_eq!(body["addLabelIds"], json!(["Label_candidate_processed"]));
        }
    }

    #[test]
    fn list_request_carries_query() {
        let client = GmailClient::from_config(&sample_config()).unwrap();
        let request = client.build_list_request(20).unwrap();
        let pairs: Vec<(String, String)> = request.url().query_pairs().into_owned().collect();
        assert!(pairs.contains(&("q".into(), "is:unread in:inbox".into())));
        assert!(pairs.contains(&("maxResults".into(), "20".into())));
    }
}
