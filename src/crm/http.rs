use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use super::CandidateDirectory;
use crate::config::Config;
use crate::error::AdapterError;
use crate::model::CandidateContext;

/// JSON CRM endpoint: `GET {base_url}candidates?email=<addr>` answers 200 with
/// the candidate or 404 when the address is unknown.
#[derive(Clone)]
pub struct HttpCrmClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl fmt::Debug for HttpCrmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCrmClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct CrmCandidate {
    id: String,
    name: String,
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    recruiter_id: Option<String>,
    #[serde(default)]
    fields: BTreeMap<String, serde_json::Value>,
}

impl From<CrmCandidate> for CandidateContext {
    fn from(c: CrmCandidate) -> Self {
        let fields = c
            .fields
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();
        CandidateContext {
            candidate_id: c.id,
            name: c.name,
            stage: c.stage.unwrap_or_default(),
            recruiter_id: c.recruiter_id,
            fields,
        }
    }
}

impl HttpCrmClient {
    pub fn from_config(cfg: &Config) -> Result<Self, AdapterError> {
        let raw = cfg
            .crm
            .base_url
            .as_deref()
            .ok_or_else(|| AdapterError::Invalid("crm.base_url not set".into()))?;
        // A trailing slash keeps `join` from dropping the last path segment.
        let normalized = if raw.ends_with('/') {
            raw.to_string()
        } else {
            format!("{raw}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| AdapterError::Invalid(format!("crm.base_url: {e}")))?;
        let http = Client::builder()
            .user_agent("candidate-mailbot/0.1")
            .timeout(cfg.app.adapter_timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url,
            token: cfg.crm.api_token.clone().filter(|t| !t.trim().is_empty()),
        })
    }

    pub fn build_lookup_request(&self, email_address: &str) -> Result<reqwest::Request, AdapterError> {
        let url = self
            .base_url
            .join("candidates")
            .map_err(|e| AdapterError::Invalid(format!("bad CRM URL: {e}")))?;
        let mut builder = self.http.get(url).query(&[("email", email_address)]);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder.build()?)
    }
}

#[async_trait]
impl CandidateDirectory for HttpCrmClient {
    async fn resolve_candidate(
        &self,
        email_address: &str,
    ) -> Result<Option<CandidateContext>, AdapterError> {
        let request = self.build_lookup_request(email_address)?;
        debug!(url = %request.url(), "crm lookup");
        let res = self.http.execute(request).await?;
        let status = res.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = res.text().await?;
        if !status.is_success() {
            return Err(AdapterError::from_status("crm", status, &body));
        }
        let candidate: CrmCandidate = serde_json::from_str(&body)
            .map_err(|e| AdapterError::Malformed(format!("crm candidate: {e}")))?;
        Ok(Some(candidate.into()))
    }
}
