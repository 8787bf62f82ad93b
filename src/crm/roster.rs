use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::CandidateDirectory;
use crate::error::AdapterError;
use crate::model::CandidateContext;

/// Candidate directory backed by a local YAML roster, for teams whose
/// candidate list lives in a spreadsheet export rather than a CRM.
#[derive(Debug, Clone, Default)]
pub struct RosterDirectory {
    by_email: HashMap<String, CandidateContext>,
}

#[derive(Debug, Deserialize)]
struct RosterFile {
    candidates: Vec<RosterEntry>,
}

#[derive(Debug, Deserialize)]
struct RosterEntry {
    email: String,
    #[serde(flatten)]
    context: CandidateContext,
}

impl RosterDirectory {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: RosterFile = serde_yaml::from_str(content).context("invalid roster YAML")?;
        let mut by_email = HashMap::with_capacity(file.candidates.len());
        for entry in file.candidates {
            let key = entry.email.trim().to_ascii_lowercase();
            if key.is_empty() {
                bail!("roster entry {} has an empty email", entry.context.candidate_id);
            }
            if by_email.insert(key.clone(), entry.context).is_some() {
                bail!("roster lists {} more than once", key);
            }
        }
        Ok(Self { by_email })
    }

    pub fn len(&self) -> usize {
        self.by_email.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_email.is_empty()
    }
}

#[async_trait]
impl CandidateDirectory for RosterDirectory {
    async fn resolve_candidate(
        &self,
        email_address: &str,
    ) -> Result<Option<CandidateContext>, AdapterError> {
        let key = email_address.trim().to_ascii_lowercase();
        Ok(self.by_email.get(&key).cloned())
    }
}
