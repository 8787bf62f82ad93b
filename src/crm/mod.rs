//! Candidate lookup capability.
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::error::AdapterError;
use crate::model::CandidateContext;

pub mod http;
pub mod roster;

pub use http::HttpCrmClient;
pub use roster::RosterDirectory;

#[async_trait]
pub trait CandidateDirectory: Send + Sync {
    /// `Ok(None)` means the sender is not a known candidate.
    async fn resolve_candidate(
        &self,
        email_address: &str,
    ) -> Result<Option<CandidateContext>, AdapterError>;
}

/// Build the directory selected by `crm` in the config.
pub fn from_config(cfg: &Config) -> Result<Arc<dyn CandidateDirectory>> {
    if let Some(path) = cfg.crm.roster_path.as_deref().filter(|p| !p.trim().is_empty()) {
        let roster = RosterDirectory::load(Path::new(path))
            .with_context(|| format!("failed to load candidate roster {}", path))?;
        return Ok(Arc::new(roster));
    }
    let client = HttpCrmClient::from_config(cfg).context("failed to build CRM client")?;
    Ok(Arc::new(client))
}
