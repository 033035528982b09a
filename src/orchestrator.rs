//! Run state machine.
//!
//! One run walks the feed post by post:
//!
//! ```text
//! INIT -> FETCHING -> PROCESSING(post) -> {DEDUP, FILTER, GENERATING, APPROVAL, RATE_GATE, ACTING}
//!      -> RECORDING -> (FETCHING | DONE)
//! ```
//!
//! Every processed post ends in exactly one history record. Only history failures abort
//! a run; everything else is recorded against the post and the run moves on.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::ActionExecutor;
use crate::approval::ApprovalGate;
use crate::clock::{Clock, SystemClock};
use crate::config::BotConfig;
use crate::filter::{ContentFilter, Verdict};
use crate::generator::{GenerationError, ReplyGenerator};
use crate::history::{HistoryError, HistoryStore, Outcome, ReplyRecord};
use crate::metrics::Metrics;
use crate::post::Post;
use crate::rate::{GateOutcome, RateGate};
use crate::session::SessionHandle;
use crate::source::PostSource;

/// Resolved settings for the engine.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_replies_per_run: usize,
    /// Upper bound on posts processed in one run, whatever their outcome.
    pub max_posts_per_run: usize,
    pub min_delay_between_replies: Duration,
    pub manual_approval: bool,
    pub continuous: bool,
    pub interval: Duration,
    pub generation_retry_backoff: Duration,
    pub reply_jitter_secs: f64,
}

impl From<&BotConfig> for RunSettings {
    fn from(bot: &BotConfig) -> Self {
        Self {
            max_replies_per_run: bot.max_replies_per_run,
            max_posts_per_run: bot.max_posts_per_run,
            min_delay_between_replies: bot.min_delay(),
            manual_approval: bot.manual_approval,
            continuous: bot.continuous,
            interval: bot.interval(),
            generation_retry_backoff: bot.retry_backoff(),
            reply_jitter_secs: bot.reply_jitter_secs,
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from(&BotConfig::default())
    }
}

/// Where a post is in its processing, for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetching,
    Dedup,
    Filter,
    Generating,
    Approval,
    RateGate,
    Acting,
    Recording,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fetching => "fetching",
            Self::Dedup => "dedup",
            Self::Filter => "filter",
            Self::Generating => "generating",
            Self::Approval => "approval",
            Self::RateGate => "rate-gate",
            Self::Acting => "acting",
            Self::Recording => "recording",
        };
        f.write_str(name)
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    /// The source had no more posts.
    Exhausted,
    /// `max_replies_per_run` replies were posted.
    CapReached,
    /// `max_posts_per_run` posts were processed without reaching the reply cap.
    PostLimitReached,
    /// Discovery failed; the next run starts fresh.
    SourceUnavailable(String),
    /// Shutdown was requested.
    Interrupted,
}

impl fmt::Display for RunEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "exhausted"),
            Self::CapReached => write!(f, "cap-reached"),
            Self::PostLimitReached => write!(f, "post-limit-reached"),
            Self::SourceUnavailable(reason) => write!(f, "source-unavailable: {}", reason),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// In-memory state of one run. Never persisted.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: Uuid,
    pub posts_processed: usize,
    pub replies_posted: usize,
    pub last_reply_time: Option<DateTime<Utc>>,
    pub metrics: Metrics,
}

impl RunState {
    pub fn new(last_reply_time: Option<DateTime<Utc>>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            posts_processed: 0,
            replies_posted: 0,
            last_reply_time,
            metrics: Metrics::new(),
        }
    }

    fn record(&mut self, record: &ReplyRecord) {
        self.posts_processed += 1;
        self.metrics.record(record.outcome);
        if record.outcome == Outcome::Posted {
            self.replies_posted += 1;
            self.last_reply_time = Some(record.timestamp);
        }
    }
}

/// Summary returned by [`Orchestrator::run_once`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub posts_processed: usize,
    pub replies_posted: usize,
    pub metrics: Metrics,
    pub end: RunEnd,
}

impl RunReport {
    fn new(state: RunState, end: RunEnd) -> Self {
        Self {
            run_id: state.run_id,
            posts_processed: state.posts_processed,
            replies_posted: state.replies_posted,
            metrics: state.metrics,
            end,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// History is the source of truth for dedup; without it nothing is safe to post.
    #[error("history store failure: {0}")]
    History(#[from] HistoryError),
}

/// What happened to one post.
enum PostFlow {
    Done(ReplyRecord),
    Interrupted,
}

/// Drives runs over the injected components.
pub struct Orchestrator {
    settings: RunSettings,
    source: Box<dyn PostSource>,
    filter: ContentFilter,
    generator: Box<dyn ReplyGenerator>,
    executor: Box<dyn ActionExecutor>,
    history: Box<dyn HistoryStore>,
    approval: Option<Box<dyn ApprovalGate>>,
    clock: Arc<dyn Clock>,
    rate: RateGate,
    cancel: CancellationToken,
    totals: Metrics,
}

impl Orchestrator {
    pub fn new(
        settings: RunSettings,
        source: Box<dyn PostSource>,
        filter: ContentFilter,
        generator: Box<dyn ReplyGenerator>,
        executor: Box<dyn ActionExecutor>,
        history: Box<dyn HistoryStore>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let rate = RateGate::new(
            settings.min_delay_between_replies,
            settings.reply_jitter_secs,
            clock.clone(),
        );
        Self {
            settings,
            source,
            filter,
            generator,
            executor,
            history,
            approval: None,
            clock,
            rate,
            cancel: CancellationToken::new(),
            totals: Metrics::new(),
        }
    }

    pub fn with_approval(mut self, gate: Box<dyn ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.rate = RateGate::new(
            self.settings.min_delay_between_replies,
            self.settings.reply_jitter_secs,
            clock.clone(),
        );
        self.clock = clock;
        self
    }

    /// Token that interrupts the run between posts or during waits.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn history(&self) -> &dyn HistoryStore {
        self.history.as_ref()
    }

    /// Cumulative tallies over every run of this orchestrator.
    pub fn totals(&self) -> &Metrics {
        &self.totals
    }

    /// Execute one run from INIT to DONE.
    ///
    /// Per-post failures are recorded and skipped. Only a history failure is an error.
    pub async fn run_once(
        &mut self,
        session: Option<&SessionHandle>,
    ) -> Result<RunReport, OrchestratorError> {
        let mut state = RunState::new(self.history.last_posted_at()?);
        let run_id = state.run_id;
        info!(
            run_id = %run_id,
            authenticated = session.is_some(),
            max_replies = self.settings.max_replies_per_run,
            "run started"
        );

        let end = match self.drive(&mut state).await {
            Ok(end) => end,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "run aborted");
                self.totals.absorb(&state.metrics);
                return Err(e);
            }
        };

        let report = RunReport::new(state, end);
        self.totals.absorb(&report.metrics);
        info!(
            run_id = %run_id,
            posts_processed = report.posts_processed,
            replies_posted = report.replies_posted,
            skipped_duplicate = report.metrics.skipped_duplicate,
            skipped_filtered = report.metrics.skipped_filtered,
            failed = report.metrics.failed,
            end = %report.end,
            "run finished"
        );
        info!(
            runs = self.totals.runs,
            posted = self.totals.posted,
            failed = self.totals.failed,
            success_rate = self.totals.success_rate(),
            "cumulative totals"
        );
        Ok(report)
    }

    /// One run, or repeated runs when `continuous` is set. Returns the cumulative totals.
    pub async fn run(
        &mut self,
        session: Option<&SessionHandle>,
    ) -> Result<Metrics, OrchestratorError> {
        if self.settings.continuous {
            return self.run_continuous(session).await;
        }
        self.run_once(session).await?;
        Ok(self.totals)
    }

    /// Repeat runs every `interval` until cancelled or a run fails.
    pub async fn run_continuous(
        &mut self,
        session: Option<&SessionHandle>,
    ) -> Result<Metrics, OrchestratorError> {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            "starting continuous mode"
        );
        loop {
            let report = self.run_once(session).await?;
            if report.end == RunEnd::Interrupted {
                break;
            }

            info!(
                interval_secs = self.settings.interval.as_secs(),
                "waiting until next run"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }
        info!(runs = self.totals.runs, "continuous mode stopped");
        Ok(self.totals)
    }

    async fn drive(&mut self, state: &mut RunState) -> Result<RunEnd, OrchestratorError> {
        let run_id = state.run_id;

        if let Err(e) = self.source.restart().await {
            warn!(run_id = %run_id, stage = %Stage::Fetching, error = %e, "source unavailable");
            return Ok(RunEnd::SourceUnavailable(e.to_string()));
        }

        loop {
            if state.replies_posted >= self.settings.max_replies_per_run {
                info!(run_id = %run_id, replies = state.replies_posted, "reply cap reached");
                return Ok(RunEnd::CapReached);
            }
            if state.posts_processed >= self.settings.max_posts_per_run {
                info!(run_id = %run_id, processed = state.posts_processed, "post limit reached");
                return Ok(RunEnd::PostLimitReached);
            }
            if self.cancel.is_cancelled() {
                return Ok(RunEnd::Interrupted);
            }

            debug!(run_id = %run_id, stage = %Stage::Fetching, "fetching next post");
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(RunEnd::Interrupted),
                next = self.source.next_post() => next,
            };
            let post = match next {
                Ok(Some(post)) => post,
                Ok(None) => return Ok(RunEnd::Exhausted),
                Err(e) => {
                    warn!(run_id = %run_id, stage = %Stage::Fetching, error = %e, "source unavailable");
                    return Ok(RunEnd::SourceUnavailable(e.to_string()));
                }
            };

            match self.process(state, &post).await? {
                PostFlow::Done(record) => {
                    let record = self.record(run_id, record)?;
                    state.record(&record);
                }
                PostFlow::Interrupted => {
                    info!(run_id = %run_id, post_id = %post.id, "interrupted before posting");
                    return Ok(RunEnd::Interrupted);
                }
            }
        }
    }

    async fn process(
        &mut self,
        state: &RunState,
        post: &Post,
    ) -> Result<PostFlow, OrchestratorError> {
        let run_id = state.run_id;
        let record = |outcome: Outcome, clock: &dyn Clock| {
            ReplyRecord::new(post, outcome, clock.now(), run_id)
        };

        debug!(run_id = %run_id, post_id = %post.id, stage = %Stage::Dedup, "processing post");
        if self.history.exists(&post.id)? {
            info!(run_id = %run_id, post_id = %post.id, "already replied, skipping");
            return Ok(PostFlow::Done(
                record(Outcome::SkippedDuplicate, self.clock.as_ref()).with_detail("already-replied"),
            ));
        }

        debug!(run_id = %run_id, post_id = %post.id, stage = %Stage::Filter, "checking content");
        if let Verdict::Reject(reason) = self.filter.check(&post.text) {
            info!(run_id = %run_id, post_id = %post.id, reason = %reason, "post filtered");
            return Ok(PostFlow::Done(
                record(Outcome::SkippedFiltered, self.clock.as_ref()).with_detail(reason.to_string()),
            ));
        }

        debug!(run_id = %run_id, post_id = %post.id, stage = %Stage::Generating, "generating reply");
        let reply = match self.generate_with_retry(run_id, post).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    run_id = %run_id,
                    post_id = %post.id,
                    stage = %Stage::Generating,
                    kind = %e.kind(),
                    error = %e,
                    "generation failed twice, skipping post"
                );
                return Ok(PostFlow::Done(
                    record(Outcome::Failed, self.clock.as_ref()).with_detail(e.kind().to_string()),
                ));
            }
        };

        if self.settings.manual_approval {
            debug!(run_id = %run_id, post_id = %post.id, stage = %Stage::Approval, "awaiting approval");
            let approved = match self.approval.as_mut() {
                Some(gate) => gate.confirm(post, &reply).await,
                None => {
                    warn!(run_id = %run_id, post_id = %post.id, "manual approval enabled without a gate");
                    false
                }
            };
            if !approved {
                info!(run_id = %run_id, post_id = %post.id, "reply declined");
                return Ok(PostFlow::Done(
                    record(Outcome::SkippedFiltered, self.clock.as_ref())
                        .with_reply(reply)
                        .with_detail("declined"),
                ));
            }
        }

        debug!(run_id = %run_id, post_id = %post.id, stage = %Stage::RateGate, "checking rate gate");
        if let GateOutcome::Cancelled = self.rate.wait(state.last_reply_time, &self.cancel).await {
            return Ok(PostFlow::Interrupted);
        }

        debug!(run_id = %run_id, post_id = %post.id, stage = %Stage::Acting, "posting reply");
        match self.executor.reply(post, &reply).await {
            Ok(()) => {
                info!(
                    run_id = %run_id,
                    post_id = %post.id,
                    author = %post.author,
                    replies = state.replies_posted + 1,
                    max = self.settings.max_replies_per_run,
                    "reply posted"
                );
                Ok(PostFlow::Done(
                    record(Outcome::Posted, self.clock.as_ref()).with_reply(reply),
                ))
            }
            Err(e) => {
                warn!(
                    run_id = %run_id,
                    post_id = %post.id,
                    stage = %Stage::Acting,
                    kind = e.kind(),
                    error = %e,
                    "posting failed"
                );
                Ok(PostFlow::Done(
                    record(Outcome::Failed, self.clock.as_ref())
                        .with_reply(reply)
                        .with_detail(e.kind()),
                ))
            }
        }
    }

    /// One attempt, then one retry after the backoff.
    async fn generate_with_retry(&self, run_id: Uuid, post: &Post) -> Result<String, GenerationError> {
        match self.generator.generate(post).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!(
                    run_id = %run_id,
                    post_id = %post.id,
                    stage = %Stage::Generating,
                    kind = %e.kind(),
                    error = %e,
                    "generation failed, retrying once"
                );
                tokio::time::sleep(self.settings.generation_retry_backoff).await;
                self.generator.generate(post).await
            }
        }
    }

    /// Durably append the record. A rejected duplicate `posted` append is stored as
    /// `skipped-duplicate` instead.
    fn record(&mut self, run_id: Uuid, record: ReplyRecord) -> Result<ReplyRecord, OrchestratorError> {
        debug!(run_id = %run_id, post_id = %record.post_id, stage = %Stage::Recording, outcome = %record.outcome, "recording");
        match self.history.append(&record) {
            Ok(()) => Ok(record),
            Err(HistoryError::ConstraintViolation { post_id }) => {
                warn!(run_id = %run_id, post_id = %post_id, "post already has a posted record");
                let mut duplicate = record;
                duplicate.outcome = Outcome::SkippedDuplicate;
                duplicate.detail = Some("constraint-violation".to_string());
                self.history.append(&duplicate)?;
                Ok(duplicate)
            }
            Err(e) => {
                error!(
                    run_id = %run_id,
                    post_id = %record.post_id,
                    stage = %Stage::Recording,
                    error = %e,
                    "history append failed"
                );
                Err(e.into())
            }
        }
    }
}
