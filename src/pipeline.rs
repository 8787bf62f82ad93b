//! Batch orchestrator: claim, resolve, classify, respond, record.
//!
//! The store is the only synchronisation point. Every transition is a
//! conditional update on the claim held by this run, so overlapping batches
//! (in this process or another) cannot both send a reply for one message.
use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::classifier::Classifier;
use crate::config::Config;
use crate::crm::CandidateDirectory;
use crate::db::{self, ClaimOutcome, ClaimRequest, Pool};
use crate::error::AdapterError;
use crate::mailbox::{is_valid_address, MailboxService};
use crate::model::{
    CandidateContext, ClassificationResult, InboundMessage, IntentLabel, ProcessingRecord,
    ProcessingStatus,
};

pub const UNMATCHED_SENDER: &str = "unmatched_sender";
pub const MALFORMED_SENDER: &str = "malformed_sender";
pub const LOW_CONFIDENCE: &str = "low_confidence";
pub const NO_REPLY: &str = "no_reply";

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub max_attempts: i64,
    pub workers: usize,
    pub adapter_timeout: Duration,
    pub lease: Duration,
    pub min_confidence: Option<f32>,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            batch_size: cfg.app.batch_size as usize,
            max_attempts: i64::from(cfg.app.max_attempts),
            workers: cfg.app.workers.max(1) as usize,
            adapter_timeout: cfg.app.adapter_timeout(),
            lease: Duration::from_secs(cfg.app.lease_seconds),
            min_confidence: cfg.classifier.min_confidence,
        }
    }
}

/// Counters for one `process_batch` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    /// Records added from the store's retry scan.
    pub retried: usize,
    pub claimed: usize,
    pub responded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub exhausted: usize,
    pub duplicates: usize,
    pub in_flight: usize,
    pub invariant_violations: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Responded => self.responded += 1,
            MessageOutcome::Skipped => self.skipped += 1,
            MessageOutcome::Failed => self.failed += 1,
            MessageOutcome::Exhausted => self.exhausted += 1,
            MessageOutcome::Duplicate => self.duplicates += 1,
            MessageOutcome::InFlight | MessageOutcome::ClaimLost => self.in_flight += 1,
            MessageOutcome::InvariantViolation => self.invariant_violations += 1,
            MessageOutcome::NotStarted => {}
        }
    }
}

/// Where one message ended up in this batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    Responded,
    Skipped,
    /// Failed this time; retryable or terminal.
    Failed,
    /// Already terminal Failed when we tried to claim it.
    Exhausted,
    /// Already Responded or Skipped.
    Duplicate,
    InFlight,
    /// Our claim was taken over mid-flight; a conditional update matched nothing.
    ClaimLost,
    InvariantViolation,
    /// Shutdown requested before the claim.
    NotStarted,
}

/// Result of one adapter stage, tagged by retryability.
#[derive(Debug)]
pub enum StageResult<T> {
    Done(T),
    Transient(String),
    Permanent(String),
}

impl<T> From<Result<T, AdapterError>> for StageResult<T> {
    fn from(res: Result<T, AdapterError>) -> Self {
        match res {
            Ok(value) => StageResult::Done(value),
            Err(err) if err.is_transient() => StageResult::Transient(err.to_string()),
            Err(err) => StageResult::Permanent(err.to_string()),
        }
    }
}

async fn run_stage<T, F>(limit: Duration, fut: F) -> StageResult<T>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res.into(),
        Err(_) => Err(AdapterError::Timeout(limit)).into(),
    }
}

pub struct Pipeline {
    pool: Pool,
    mailbox: Arc<dyn MailboxService>,
    directory: Arc<dyn CandidateDirectory>,
    classifier: Arc<dyn Classifier>,
    settings: PipelineSettings,
    shutdown: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        pool: Pool,
        mailbox: Arc<dyn MailboxService>,
        directory: Arc<dyn CandidateDirectory>,
        classifier: Arc<dyn Classifier>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            pool,
            mailbox,
            directory,
            classifier,
            settings,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag stops new claims; messages already claimed finish.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Fetch, top up from the retry scan, and drive every message to a final
    /// or retryable record. Adapter failures are recorded per message; a store
    /// failure aborts the batch.
    #[instrument(skip_all)]
    pub async fn process_batch(&self) -> Result<BatchReport> {
        let run_id = Uuid::new_v4().to_string();
        let mut report = BatchReport::default();

        let mut fetched = match run_stage(
            self.settings.adapter_timeout,
            self.mailbox.fetch_candidate_messages(self.settings.batch_size),
        )
        .await
        {
            StageResult::Done(messages) => messages,
            StageResult::Transient(detail) | StageResult::Permanent(detail) => {
                warn!(%detail, "mailbox fetch failed; continuing with retry scan");
                Vec::new()
            }
        };
        let mut seen: HashSet<String> = HashSet::new();
        fetched.retain(|m| seen.insert(m.message_id.clone()));
        fetched.truncate(self.settings.batch_size);
        fetched.sort_by_key(|m| m.received_at);
        report.fetched = fetched.len();

        let room = self.settings.batch_size.saturating_sub(fetched.len());
        if room > 0 {
            let retryable =
                db::retryable_records(&self.pool, self.settings.max_attempts, room as i64).await?;
            for record in retryable {
                if seen.insert(record.message_id.clone()) {
                    fetched.push(record.message);
                    report.retried += 1;
                }
            }
        }

        let claimed = AtomicUsize::new(0);
        let mut results = stream::iter(fetched.iter())
            .map(|msg| self.process_message(msg, &run_id, &claimed))
            .buffer_unordered(self.settings.workers);
        while let Some(outcome) = results.next().await {
            report.record(outcome?);
        }
        drop(results);
        report.claimed = claimed.into_inner();

        info!(
            run_id = %run_id,
            fetched = report.fetched,
            retried = report.retried,
            claimed = report.claimed,
            responded = report.responded,
            skipped = report.skipped,
            failed = report.failed,
            exhausted = report.exhausted,
            duplicates = report.duplicates,
            in_flight = report.in_flight,
            invariant_violations = report.invariant_violations,
            "batch finished"
        );
        Ok(report)
    }

    #[instrument(skip_all, fields(message_id = %msg.message_id))]
    async fn process_message(
        &self,
        msg: &InboundMessage,
        run_id: &str,
        claimed: &AtomicUsize,
    ) -> Result<MessageOutcome> {
        if self.stopping() {
            return Ok(MessageOutcome::NotStarted);
        }
        let req = ClaimRequest {
            run_id,
            max_attempts: self.settings.max_attempts,
            lease: self.settings.lease,
        };
        let record = match db::claim(&self.pool, msg, &req).await? {
            ClaimOutcome::Claimed(record) | ClaimOutcome::Reclaimed(record) => record,
            ClaimOutcome::AlreadyFinal(record) => {
                debug!(status = record.status.as_str(), "already handled");
                self.hand_back(&record).await?;
                return Ok(MessageOutcome::Duplicate);
            }
            ClaimOutcome::Exhausted(record) => {
                warn!(
                    attempt = record.attempt_count,
                    error_detail = record.error_detail.as_deref().unwrap_or(""),
                    "retries exhausted; skipping"
                );
                self.hand_back(&record).await?;
                return Ok(MessageOutcome::Exhausted);
            }
            ClaimOutcome::InFlight => {
                debug!("claimed by another run");
                return Ok(MessageOutcome::InFlight);
            }
        };
        claimed.fetch_add(1, Ordering::SeqCst);
        debug!(status = record.status.as_str(), attempt = record.attempt_count, "claimed");

        match record.status {
            ProcessingStatus::Classified => match record.classification() {
                Some(result) => self.respond(&record, &result, run_id).await,
                None => {
                    let detail = "classified record has no draft";
                    self.fail(&record, run_id, detail, false, record.intent_label)
                        .await
                }
            },
            _ => self.resolve_and_classify(&record, run_id).await,
        }
    }

    async fn resolve_and_classify(
        &self,
        record: &ProcessingRecord,
        run_id: &str,
    ) -> Result<MessageOutcome> {
        let msg = &record.message;
        let timeout = self.settings.adapter_timeout;

        if !is_valid_address(&msg.sender_address) {
            return self.skip(record, run_id, MALFORMED_SENDER, None).await;
        }

        let context: CandidateContext = match run_stage(
            timeout,
            self.directory.resolve_candidate(&msg.sender_address),
        )
        .await
        {
            StageResult::Done(Some(context)) => context,
            StageResult::Done(None) => {
                return self.skip(record, run_id, UNMATCHED_SENDER, None).await;
            }
            StageResult::Transient(detail) => {
                return self.fail(record, run_id, &detail, true, None).await;
            }
            StageResult::Permanent(detail) => {
                return self.skip(record, run_id, &detail, None).await;
            }
        };

        let result = match run_stage(timeout, self.classifier.classify(&msg.body, &context)).await
        {
            StageResult::Done(result) => result,
            StageResult::Transient(detail) => {
                return self.fail(record, run_id, &detail, true, None).await;
            }
            StageResult::Permanent(detail) => {
                return self.fail(record, run_id, &detail, false, None).await;
            }
        };
        info!(
            candidate = %context.candidate_id,
            intent = result.intent.as_str(),
            confidence = result.confidence,
            "classified"
        );

        if let Some(min) = self.settings.min_confidence {
            if result.confidence < min {
                return self
                    .skip(record, run_id, LOW_CONFIDENCE, Some(IntentLabel::Unknown))
                    .await;
            }
        }
        if result.intent == IntentLabel::Unknown || result.draft_response.trim().is_empty() {
            return self
                .skip(record, run_id, NO_REPLY, Some(result.intent))
                .await;
        }

        if !db::mark_classified(&self.pool, &record.message_id, run_id, &result, self.settings.lease)
            .await?
        {
            warn!("claim lost before classification was stored");
            return Ok(MessageOutcome::ClaimLost);
        }
        self.respond(record, &result, run_id).await
    }

    /// The only place a reply is sent. The send gate renews this run's live
    /// lease atomically, so no other run can reclaim the record mid-send.
    async fn respond(
        &self,
        record: &ProcessingRecord,
        result: &ClassificationResult,
        run_id: &str,
    ) -> Result<MessageOutcome> {
        let id = &record.message_id;
        if !db::begin_send(&self.pool, id, run_id, self.settings.lease).await? {
            warn!("send gate closed; lease lapsed or claim taken over");
            return Ok(MessageOutcome::ClaimLost);
        }

        let send = run_stage(
            self.settings.adapter_timeout,
            self.mailbox.send_reply(&record.message, &result.draft_response),
        )
        .await;

        match send {
            StageResult::Done(()) => {
                if db::mark_responded(&self.pool, id, run_id).await? {
                    info!(intent = result.intent.as_str(), "responded");
                    self.mark_handled(id, Some(result.intent)).await?;
                    return Ok(MessageOutcome::Responded);
                }
                let current = db::get_record(&self.pool, id).await?;
                if current.as_ref().map(|r| r.status) == Some(ProcessingStatus::Responded) {
                    error!("invariant violation: reply sent for an already responded message");
                } else {
                    error!(
                        status = current.as_ref().map(|r| r.status.as_str()).unwrap_or("missing"),
                        "invariant violation: reply sent but claim was lost"
                    );
                }
                Ok(MessageOutcome::InvariantViolation)
            }
            StageResult::Transient(detail) => {
                let status = db::mark_send_failed(
                    &self.pool,
                    id,
                    run_id,
                    &detail,
                    self.settings.max_attempts,
                )
                .await?;
                match status {
                    Some(ProcessingStatus::Failed) => {
                        warn!(%detail, "send retries exhausted");
                        self.mark_handled(id, Some(result.intent)).await?;
                        Ok(MessageOutcome::Failed)
                    }
                    Some(_) => {
                        warn!(%detail, attempt = record.attempt_count + 1, "send outcome unknown; will retry send");
                        Ok(MessageOutcome::Failed)
                    }
                    None => Ok(MessageOutcome::ClaimLost),
                }
            }
            StageResult::Permanent(detail) => {
                self.fail(record, run_id, &detail, false, Some(result.intent))
                    .await
            }
        }
    }

    async fn skip(
        &self,
        record: &ProcessingRecord,
        run_id: &str,
        detail: &str,
        intent: Option<IntentLabel>,
    ) -> Result<MessageOutcome> {
        if !db::mark_skipped(&self.pool, &record.message_id, run_id, detail, intent).await? {
            return Ok(MessageOutcome::ClaimLost);
        }
        info!(reason = detail, "skipped");
        self.mark_handled(&record.message_id, intent).await?;
        Ok(MessageOutcome::Skipped)
    }

    async fn fail(
        &self,
        record: &ProcessingRecord,
        run_id: &str,
        detail: &str,
        transient: bool,
        intent: Option<IntentLabel>,
    ) -> Result<MessageOutcome> {
        if !db::mark_failed(&self.pool, &record.message_id, run_id, detail, transient).await? {
            return Ok(MessageOutcome::ClaimLost);
        }
        let attempts = record.attempt_count + i64::from(transient);
        let terminal = !transient || attempts >= self.settings.max_attempts;
        warn!(%detail, attempt = attempts, terminal, "stage failed");
        if terminal {
            self.mark_handled(&record.message_id, intent).await?;
        }
        Ok(MessageOutcome::Failed)
    }

    /// Retry the mailbox hand-back for a final record whose earlier attempt
    /// never went through.
    async fn hand_back(&self, record: &ProcessingRecord) -> Result<()> {
        if record.mailbox_handled {
            return Ok(());
        }
        self.mark_handled(&record.message_id, record.intent_label).await
    }

    /// Best effort; the record is already final and a mailbox error never
    /// changes it. Only a store error is returned.
    async fn mark_handled(&self, message_id: &str, intent: Option<IntentLabel>) -> Result<()> {
        let marked = run_stage(
            self.settings.adapter_timeout,
            self.mailbox.mark_handled(message_id, intent),
        )
        .await;
        match marked {
            StageResult::Done(()) => db::mark_mailbox_handled(&self.pool, message_id).await,
            StageResult::Transient(detail) | StageResult::Permanent(detail) => {
                warn!(%detail, "could not mark message handled in mailbox");
                Ok(())
            }
        }
    }
}
