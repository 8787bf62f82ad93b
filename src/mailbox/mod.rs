//! Mailbox capability: where candidate mail comes from and replies go to.
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::AdapterError;
use crate::model::{InboundMessage, IntentLabel};

pub mod gmail;

pub use gmail::GmailClient;

#[async_trait]
pub trait MailboxService: Send + Sync {
    /// Up to `max_count` messages that still need handling, oldest first.
    async fn fetch_candidate_messages(
        &self,
        max_count: usize,
    ) -> Result<Vec<InboundMessage>, AdapterError>;

    /// Reply in the thread of `original`. `Ok` means the provider confirmed
    /// the send; any error leaves the outcome unknown.
    async fn send_reply(&self, original: &InboundMessage, body: &str) -> Result<(), AdapterError>;

    /// Stop `fetch_candidate_messages` from returning this message again and
    /// file it under `intent` when the mailbox has a label for it.
    async fn mark_handled(
        &self,
        message_id: &str,
        intent: Option<IntentLabel>,
    ) -> Result<(), AdapterError>;
}

static ANGLE_ADDR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\s*([^<>\s]+@[^<>\s]+)\s*>").expect("valid regex"));
static PLAIN_ADDR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+'\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)+$").expect("valid regex")
});

/// Pull the bare address out of a `From` header such as
/// `"Jane Doe" <Jane@Example.com>`. Lower-cased; `None` if nothing usable.
pub fn extract_address(from_header: &str) -> Option<String> {
    let candidate = match ANGLE_ADDR.captures(from_header) {
        Some(caps) => caps.get(1).map(|m| m.as_str()).unwrap_or_default(),
        None => from_header.trim(),
    };
    let candidate = candidate.trim().to_ascii_lowercase();
    is_valid_address(&candidate).then_some(candidate)
}

pub fn is_valid_address(address: &str) -> bool {
    PLAIN_ADDR.is_match(address.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_display_name_form() {
        assert_eq!(
            extract_address("\"Jane Doe\" <Jane.Doe@Example.com>").as_deref(),
            Some("jane.doe@example.com")
        );
        assert_eq!(
            extract_address("recruiting@acme.io").as_deref(),
            Some("recruiting@acme.io")
        );
    }

    #[test]
    fn rejects_garbage_senders() {
        assert_eq!(extract_address("Mailer Daemon"), None);
        assert_eq!(extract_address("<not-an-address>"), None);
        assert!(!is_valid_address("a@b"));
        assert!(is_valid_address("a@b.co"));
    }
}
