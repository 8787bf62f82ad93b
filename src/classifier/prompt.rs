//! Prompt construction and response parsing for the chat model.
use serde::Deserialize;

use crate::error::AdapterError;
use crate::model::{CandidateContext, ClassificationResult, IntentLabel};

/// Longest email body sent to the model, in characters.
pub const MAX_BODY_CHARS: usize = 12_000;

pub fn system_prompt() -> String {
    let labels: Vec<&str> = IntentLabel::ALL.iter().map(|l| l.as_str()).collect();
    format!(
        "You triage email from job candidates on behalf of a recruiting team.\n\
         Classify the email into exactly one intent: {labels}.\n\
         - Inquiry: questions about the role, the process or application status.\n\
         - Scheduling: arranging, confirming or moving an interview or call.\n\
         - Offer: offer details, compensation, start dates, contract questions.\n\
         - Rejection: the candidate withdraws or responds to a rejection.\n\
         - Unknown: anything else, or when you are unsure.\n\
         Then draft a short, professional reply (under 150 words) signed as the recruiting team. \
         Never invent dates, salaries or commitments that are not in the email or candidate record. \
         For Unknown, leave the reply empty.\n\
         Respond with a JSON object only: \
         {{\"intent\": \"<label>\", \"confidence\": <0.0-1.0>, \"reply\": \"<text>\"}}",
        labels = labels.join(", ")
    )
}

pub fn user_prompt(body: &str, context: &CandidateContext) -> String {
    let mut out = String::new();
    out.push_str("Candidate record:\n");
    out.push_str(&format!("- name: {}\n", context.name));
    out.push_str(&format!("- candidate id: {}\n", context.candidate_id));
    if !context.stage.is_empty() {
        out.push_str(&format!("- stage: {}\n", context.stage));
    }
    for (key, value) in &context.fields {
        out.push_str(&format!("- {}: {}\n", key, value));
    }
    out.push_str("\nEmail:\n");
    let trimmed: String = body.chars().take(MAX_BODY_CHARS).collect();
    out.push_str(&trimmed);
    if body.chars().count() > MAX_BODY_CHARS {
        out.push_str("\n[truncated]");
    }
    out
}

#[derive(Debug, Deserialize)]
struct ModelAnswer {
    intent: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    reply: Option<String>,
}

/// Parse the model's JSON answer. Code fences around the object are tolerated;
/// anything else that is not the expected object is `Malformed`.
pub fn parse_classification(content: &str) -> Result<ClassificationResult, AdapterError> {
    let trimmed = content.trim();
    let json = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    let answer: ModelAnswer = serde_json::from_str(json)
        .map_err(|e| AdapterError::Malformed(format!("classifier answer: {e}")))?;

    let confidence = answer.confidence.unwrap_or(0.0);
    if !confidence.is_finite() {
        return Err(AdapterError::Malformed("confidence is not a number".into()));
    }
    Ok(ClassificationResult {
        intent: IntentLabel::parse_label(&answer.intent),
        confidence: confidence.clamp(0.0, 1.0),
        draft_response: answer.reply.unwrap_or_default().trim().to_string(),
    })
}
