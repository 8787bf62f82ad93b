//! Intent classification and reply drafting.
use async_trait::async_trait;

use crate::error::AdapterError;
use crate::model::{CandidateContext, ClassificationResult};

pub mod openai;
pub mod prompt;

pub use openai::OpenAiClassifier;

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        body: &str,
        context: &CandidateContext,
    ) -> Result<ClassificationResult, AdapterError>;
}
