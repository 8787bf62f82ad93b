use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use super::prompt::{parse_classification, system_prompt, user_prompt};
use super::Classifier;
use crate::config::Config;
use crate::error::AdapterError;
use crate::model::{CandidateContext, ClassificationResult, IntentLabel};

/// Chat-completions classifier speaking the OpenAI wire format.
#[derive(Clone)]
pub struct OpenAiClassifier {
    http: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    temperature: f32,
}

impl fmt::Debug for OpenAiClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiClassifier")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClassifier {
    pub fn from_config(cfg: &Config) -> Result<Self, AdapterError> {
        let raw = &cfg.classifier.base_url;
        let normalized = if raw.ends_with('/') {
            raw.clone()
        } else {
            format!("{raw}/")
        };
        let endpoint = Url::parse(&normalized)
            .and_then(|base| base.join("v1/chat/completions"))
            .map_err(|e| AdapterError::Invalid(format!("classifier.base_url: {e}")))?;
        let http = Client::builder()
            .user_agent("candidate-mailbot/0.1")
            .timeout(cfg.app.adapter_timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            endpoint,
            api_key: cfg.classifier.api_key.clone(),
            model: cfg.classifier.model.clone(),
            temperature: cfg.classifier.temperature,
        })
    }

    pub fn build_request(
        &self,
        body: &str,
        context: &CandidateContext,
    ) -> Result<reqwest::Request, AdapterError> {
        let payload = json!({
            "model": self.model,
            "temperature": self.temperature,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": system_prompt() },
                { "role": "user", "content": user_prompt(body, context) },
            ],
        });
        Ok(self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .build()?)
    }
}

fn answer_content(response: ChatResponse) -> Result<String, AdapterError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| AdapterError::Malformed("no choices in completion".into()))?;
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(AdapterError::Rejected("completion blocked by content filter".into()));
    }
    choice
        .message
        .content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| AdapterError::Malformed("empty completion".into()))
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(
        &self,
        body: &str,
        context: &CandidateContext,
    ) -> Result<ClassificationResult, AdapterError> {
        if body.trim().is_empty() {
            return Ok(ClassificationResult {
                intent: IntentLabel::Unknown,
                confidence: 1.0,
                draft_response: String::new(),
            });
        }
        let request = self.build_request(body, context)?;
        debug!(model = %self.model, candidate = %context.candidate_id, "classify");
        let res = self.http.execute(request).await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(AdapterError::from_status("openai", status, &text));
        }
        let response: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| AdapterError::Malformed(format!("completion: {e}")))?;
        parse_classification(&answer_content(response)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_config() -> Config {
        serde_yaml::from_str(crate::config::example()).unwrap()
    }

    fn context() -> CandidateContext {
        CandidateContext {
            candidate_id: "C1".into(),
            name: "Jane Doe".into(),
            stage: String::new(),
            recruiter_id: None,
            fields: BTreeMap::new(),
        }
    }

    #[test]
    fn request_targets_chat_completions() {
        let mut cfg = sample_config();
        cfg.classifier.base_url = "http://localhost:8080/proxy".into();
        let client = OpenAiClassifier::from_config(&cfg).unwrap();
        let request = client.build_request("Hello", &context()).unwrap();
        assert_eq!(request.url().as_str(), "http://localhost:8080/proxy/v1/chat/completions");
        assert_eq!(
            request
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer YOUR_OPENAI_API_KEY"
        );
        let body: serde_json::Value =
            serde_json::from_slice(request.body().and_then(|b| b.as_bytes()).unwrap()).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body["messages"][1]["content"].as_str().unwrap().contains("Hello"));
    }

    #[test]
    fn content_filter_is_permanent() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{ "message": { "content": null }, "finish_reason": "content_filter" }]
        }))
        .unwrap();
        let err = answer_content(response).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn missing_choices_is_malformed() {
        let response: ChatResponse = serde_json::from_value(json!({ "choices": [] })).unwrap();
        assert!(matches!(answer_content(response), Err(AdapterError::Malformed(_))));
    }

    #[tokio::test]
    async fn empty_body_skips_the_model() {
        let client = OpenAiClassifier::from_config(&sample_config()).unwrap();
        let result = client.classify("  \n", &context()).await.unwrap();
        assert_eq!(result.intent, IntentLabel::Unknown);
        assert!(result.draft_response.is_empty());
    }
}
