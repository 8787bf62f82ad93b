use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An email as fetched from the mailbox. Never mutated after fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: String,
    pub thread_id: String,
    pub sender_address: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// CRM snapshot of a candidate, fetched once per message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateContext {
    pub candidate_id: String,
    pub name: String,
    #[serde(default)]
    pub stage: String,
    #[serde(default)]
    pub recruiter_id: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntentLabel {
    Inquiry,
    Scheduling,
    Offer,
    Rejection,
    Unknown,
}

impl IntentLabel {
    pub const ALL: [IntentLabel; 5] = [
        IntentLabel::Inquiry,
        IntentLabel::Scheduling,
        IntentLabel::Offer,
        IntentLabel::Rejection,
        IntentLabel::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentLabel::Inquiry => "Inquiry",
            IntentLabel::Scheduling => "Scheduling",
            IntentLabel::Offer => "Offer",
            IntentLabel::Rejection => "Rejection",
            IntentLabel::Unknown => "Unknown",
        }
    }

    /// Lenient parse: case-insensitive, surrounding whitespace and
    /// punctuation ignored. Anything unrecognised is `Unknown`.
    pub fn parse_label(value: &str) -> Self {
        let cleaned = value
            .trim()
            .trim_matches(|c: char| !c.is_ascii_alphanumeric());
        IntentLabel::ALL
            .into_iter()
            .find(|label| label.as_str().eq_ignore_ascii_case(cleaned))
            .unwrap_or(IntentLabel::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub intent: IntentLabel,
    pub confidence: f32,
    pub draft_response: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProcessingStatus {
    Pending,
    Classified,
    Responded,
    Failed,
    Skipped,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Classified => "classified",
            ProcessingStatus::Responded => "responded",
            ProcessingStatus::Failed => "failed",
            ProcessingStatus::Skipped => "skipped",
        }
    }

    pub fn parse_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ProcessingStatus::Pending),
            "classified" => Some(ProcessingStatus::Classified),
            "responded" => Some(ProcessingStatus::Responded),
            "failed" => Some(ProcessingStatus::Failed),
            "skipped" => Some(ProcessingStatus::Skipped),
            _ => None,
        }
    }

    /// Responded and Skipped never change again.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Responded | ProcessingStatus::Skipped
        )
    }
}

/// One row of the transaction log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub message_id: String,
    pub status: ProcessingStatus,
    pub intent_label: Option<IntentLabel>,
    pub confidence: Option<f32>,
    pub draft_response: Option<String>,
    pub error_detail: Option<String>,
    pub attempt_count: i64,
    pub terminal: bool,
    pub message: InboundMessage,
    pub claimed_by: Option<String>,
    /// The mailbox confirmed the message was marked handled.
    pub mailbox_handled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingRecord {
    /// True once the record can never be picked up again.
    pub fn is_terminal(&self, max_attempts: i64) -> bool {
        self.status.is_final()
            || self.terminal
            || (self.status == ProcessingStatus::Failed && self.attempt_count >= max_attempts)
    }

    pub fn classification(&self) -> Option<ClassificationResult> {
        Some(ClassificationResult {
            intent: self.intent_label?,
            confidence: self.confidence.unwrap_or_default(),
            draft_response: self.draft_response.clone()?,
        })
    }
}
