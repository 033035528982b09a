use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use mockall::mock;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

use replyguy::action::{ActionError, ActionExecutor, DryRunSurface, HumanPacedExecutor};
use replyguy::clock::TokioClock;
use replyguy::config::{FilterConfig, PacingConfig};
use replyguy::filter::ContentFilter;
use replyguy::generator::{GenerationError, ReplyGenerator};
use replyguy::history::{HistoryError, HistoryStore, JsonlHistoryStore, Outcome, ReplyRecord};
use replyguy::orchestrator::{Orchestrator, OrchestratorError, RunEnd, RunSettings};
use replyguy::post::Post;
use replyguy::source::{FeedFileSource, MemorySource};

mock! {
    pub Generator {}

    #[async_trait]
    impl ReplyGenerator for Generator {
        async fn generate(&self, post: &Post) -> Result<String, GenerationError>;
    }
}

mock! {
    pub Executor {}

    #[async_trait]
    impl ActionExecutor for Executor {
        async fn reply(&mut self, post: &Post, reply: &str) -> Result<(), ActionError>;
    }
}

fn settings() -> RunSettings {
    RunSettings {
        max_replies_per_run: 20,
        max_posts_per_run: 100,
        min_delay_between_replies: Duration::from_secs(30),
        manual_approval: false,
        continuous: false,
        interval: Duration::from_secs(30 * 60),
        generation_retry_backoff: Duration::from_secs(2),
        reply_jitter_secs: 0.0,
    }
}

fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 6, 1, 9, 0, 0).unwrap()
}

fn post(id: &str) -> Post {
    Post::new(id, "dev", format!("Post {} on why build caches keep breaking", id))
}

fn replying_generator() -> MockGenerator {
    let mut generator = MockGenerator::new();
    generator
        .expect_generate()
        .returning(|p| Ok(format!("Pinning the toolchain fixed this for us ({})", p.id)));
    generator
}

fn posting_executor() -> MockExecutor {
    let mut executor = MockExecutor::new();
    executor.expect_reply().returning(|_, _| Ok(()));
    executor
}

fn orchestrator(
    history_path: &Path,
    settings: RunSettings,
    posts: Vec<Post>,
    generator: MockGenerator,
    executor: MockExecutor,
) -> Orchestrator {
    let history = JsonlHistoryStore::open(history_path).unwrap();
    Orchestrator::new(
        settings,
        Box::new(MemorySource::new(posts)),
        ContentFilter::new(&FilterConfig::default()),
        Box::new(generator),
        Box::new(executor),
        Box::new(history),
    )
    .with_clock(Arc::new(TokioClock::new(anchor())))
}

fn seed_posted(path: &Path, p: &Post) {
    let mut store = JsonlHistoryStore::open(path).unwrap();
    let record = ReplyRecord::new(p, Outcome::Posted, anchor() - chrono::Duration::days(1), uuid::Uuid::nil())
        .with_reply("an earlier reply");
    store.append(&record).unwrap();
}

/// A already replied, B filtered, C posted.
#[tokio::test(start_paused = true)]
async fn test_duplicate_filtered_and_posted_in_one_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");

    let a = post("A");
    let b = Post::new("B", "dev", "This release is going to kill our on-call rotation");
    let c = post("C");
    seed_posted(&path, &a);

    let mut generator = MockGenerator::new();
    generator
        .expect_generate()
        .withf(|p| p.id == "C")
        .times(1)
        .returning(|_| Ok("Cache keys with the compiler version saved us".to_string()));
    let mut executor = MockExecutor::new();
    executor
        .expect_reply()
        .withf(|p, _| p.id == "C")
        .times(1)
        .returning(|_, _| Ok(()));

    let mut orch = orchestrator(&path, settings(), vec![a, b, c], generator, executor);
    let report = assert_ok!(orch.run_once(None).await);

    assert_eq!(report.end, RunEnd::Exhausted);
    assert_eq!(report.replies_posted, 1);
    assert_eq!(report.posts_processed, 3);
    assert_eq!(report.metrics.skipped_duplicate, 1);
    assert_eq!(report.metrics.skipped_filtered, 1);

    let history = orch.history();
    assert_eq!(history.posted_count().unwrap(), 2);
    let records = history.recent(3).unwrap();
    assert_eq!(records[0].post_id, "C");
    assert_eq!(records[0].outcome, Outcome::Posted);
    assert_eq!(records[1].post_id, "B");
    assert_eq!(records[1].outcome, Outcome::SkippedFiltered);
    assert_eq!(records[1].detail.as_deref(), Some("blocklist:kill"));
    assert_eq!(records[2].post_id, "A");
    assert_eq!(records[2].outcome, Outcome::SkippedDuplicate);
    assert!(records.iter().all(|r| r.run_id == report.run_id));
}

#[tokio::test(start_paused = true)]
async fn test_cap_stops_before_next_post() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");

    let mut executor = MockExecutor::new();
    executor
        .expect_reply()
        .withf(|p, _| p.id == "1")
        .times(1)
        .returning(|_, _| Ok(()));

    let mut orch = orchestrator(
        &path,
        RunSettings {
            max_replies_per_run: 1,
            ..settings()
        },
        vec![post("1"), post("2")],
        replying_generator(),
        executor,
    );
    let report = orch.run_once(None).await.unwrap();

    assert_eq!(report.end, RunEnd::CapReached);
    assert_eq!(report.replies_posted, 1);
    assert_eq!(report.posts_processed, 1);
    // The second post was never touched, so it left no record.
    assert_eq!(orch.history().recent(10).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_generator_failing_twice_skips_post() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");

    let mut generator = MockGenerator::new();
    generator
        .expect_generate()
        .withf(|p| p.id == "1")
        .times(2)
        .returning(|_| Err(GenerationError::QuotaExceeded("HTTP 429".into())));
    generator
        .expect_generate()
        .withf(|p| p.id == "2")
        .times(1)
        .returning(|_| Ok("Second post gets its reply".to_string()));

    let mut executor = MockExecutor::new();
    executor
        .expect_reply()
        .withf(|p, _| p.id == "2")
        .times(1)
        .returning(|_, _| Ok(()));

    let mut orch = orchestrator(&path, settings(), vec![post("1"), post("2")], generator, executor);
    let started = tokio::time::Instant::now();
    let report = orch.run_once(None).await.unwrap();

    assert_eq!(report.metrics.failed, 1);
    assert_eq!(report.replies_posted, 1);
    assert!(started.elapsed() >= Duration::from_secs(2), "retry backoff skipped");

    let records = orch.history().recent(2).unwrap();
    assert_eq!(records[1].post_id, "1");
    assert_eq!(records[1].outcome, Outcome::Failed);
    assert_eq!(records[1].detail.as_deref(), Some("quota-exceeded"));
    assert!(records[1].reply_text.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_no_duplicate_replies_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");
    let posts = vec![post("1"), post("2"), post("3")];

    {
        let mut orch =
            orchestrator(&path, settings(), posts.clone(), replying_generator(), posting_executor());
        assert_eq!(orch.run_once(None).await.unwrap().replies_posted, 3);
    }

    // A fresh process over the same history and the same feed.
    let mut generator = MockGenerator::new();
    generator.expect_generate().never();
    let mut executor = MockExecutor::new();
    executor.expect_reply().never();

    let mut orch = orchestrator(&path, settings(), posts, generator, executor);
    let report = orch.run_once(None).await.unwrap();
    assert_eq!(report.replies_posted, 0);
    assert_eq!(report.metrics.skipped_duplicate, 3);
    assert_eq!(orch.history().posted_count().unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_posted_replies_respect_min_delay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");

    let mut orch = orchestrator(
        &path,
        RunSettings {
            reply_jitter_secs: 5.0,
            ..settings()
        },
        (1..=4).map(|i| post(&i.to_string())).collect(),
        replying_generator(),
        posting_executor(),
    );
    orch.run_once(None).await.unwrap();

    let mut posted: Vec<DateTime<Utc>> = orch
        .history()
        .recent(10)
        .unwrap()
        .into_iter()
        .filter(|r| r.outcome == Outcome::Posted)
        .map(|r| r.timestamp)
        .collect();
    posted.reverse();
    assert_eq!(posted.len(), 4);
    for pair in posted.windows(2) {
        assert!(
            pair[1] - pair[0] >= chrono::Duration::seconds(30),
            "replies {} and {} too close",
            pair[0],
            pair[1]
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_crash_never_reposts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");
    let feed = vec![post("1"), post("2")];

    // First process posts "1", records it, then dies while writing the next line.
    seed_posted(&path, &feed[0]);
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"post_id":"2","author":"dev","orig"#).unwrap();
    }

    let mut executor = MockExecutor::new();
    executor
        .expect_reply()
        .withf(|p, _| p.id == "2")
        .times(1)
        .returning(|_, _| Ok(()));

    let mut orch = orchestrator(&path, settings(), feed, replying_generator(), executor);
    let report = orch.run_once(None).await.unwrap();
    assert_eq!(report.replies_posted, 1);
    assert_eq!(report.metrics.skipped_duplicate, 1);

    let reopened = JsonlHistoryStore::open(&path).unwrap();
    assert_eq!(reopened.posted_count().unwrap(), 2);
}

/// Store whose disk went away.
struct BrokenHistory {
    fail_exists: bool,
}

impl HistoryStore for BrokenHistory {
    fn exists(&self, _post_id: &str) -> Result<bool, HistoryError> {
        if self.fail_exists {
            return Err(HistoryError::Io(std::io::Error::other("disk gone")));
        }
        Ok(false)
    }

    fn append(&mut self, _record: &ReplyRecord) -> Result<(), HistoryError> {
        Err(HistoryError::Io(std::io::Error::other("read-only filesystem")))
    }

    fn count_today(&self) -> Result<usize, HistoryError> {
        Ok(0)
    }

    fn posted_count(&self) -> Result<usize, HistoryError> {
        Ok(0)
    }

    fn last_posted_at(&self) -> Result<Option<DateTime<Utc>>, HistoryError> {
        Ok(None)
    }

    fn recent(&self, _limit: usize) -> Result<Vec<ReplyRecord>, HistoryError> {
        Ok(Vec::new())
    }

    fn records_on(&self, _date: NaiveDate) -> Result<Vec<ReplyRecord>, HistoryError> {
        Ok(Vec::new())
    }
}

fn broken_orchestrator(fail_exists: bool, executor: MockExecutor) -> Orchestrator {
    Orchestrator::new(
        settings(),
        Box::new(MemorySource::new(vec![post("1"), post("2")])),
        ContentFilter::new(&FilterConfig::default()),
        Box::new(replying_generator()),
        Box::new(executor),
        Box::new(BrokenHistory { fail_exists }),
    )
    .with_clock(Arc::new(TokioClock::new(anchor())))
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_history_aborts_before_posting() {
    let mut executor = MockExecutor::new();
    executor.expect_reply().never();

    let mut orch = broken_orchestrator(true, executor);
    let err = orch.run_once(None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::History(HistoryError::Io(_))));
}

#[tokio::test(start_paused = true)]
async fn test_unwritable_history_aborts_run() {
    let mut executor = MockExecutor::new();
    executor
        .expect_reply()
        .withf(|p, _| p.id == "1")
        .times(1)
        .returning(|_, _| Ok(()));

    let mut orch = broken_orchestrator(false, executor);
    assert!(orch.run_once(None).await.is_err());
}

/// Store whose lookup misses posted records, so only `append` catches a repeat.
struct StaleLookup(JsonlHistoryStore);

impl HistoryStore for StaleLookup {
    fn exists(&self, _post_id: &str) -> Result<bool, HistoryError> {
        Ok(false)
    }

    fn append(&mut self, record: &ReplyRecord) -> Result<(), HistoryError> {
        self.0.append(record)
    }

    fn count_today(&self) -> Result<usize, HistoryError> {
        self.0.count_today()
    }

    fn posted_count(&self) -> Result<usize, HistoryError> {
        self.0.posted_count()
    }

    fn last_posted_at(&self) -> Result<Option<DateTime<Utc>>, HistoryError> {
        self.0.last_posted_at()
    }

    fn recent(&self, limit: usize) -> Result<Vec<ReplyRecord>, HistoryError> {
        self.0.recent(limit)
    }

    fn records_on(&self, date: NaiveDate) -> Result<Vec<ReplyRecord>, HistoryError> {
        self.0.records_on(date)
    }
}

#[tokio::test(start_paused = true)]
async fn test_rejected_repeat_append_is_recorded_as_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");
    let store = StaleLookup(JsonlHistoryStore::open(&path).unwrap());

    let mut orch = Orchestrator::new(
        settings(),
        Box::new(MemorySource::new(vec![post("1"), post("1"), post("2")])),
        ContentFilter::new(&FilterConfig::default()),
        Box::new(replying_generator()),
        Box::new(posting_executor()),
        Box::new(store),
    )
    .with_clock(Arc::new(TokioClock::new(anchor())));

    let report = assert_ok!(orch.run_once(None).await);
    assert_eq!(report.end, RunEnd::Exhausted);
    assert_eq!(report.posts_processed, 3);
    assert_eq!(report.replies_posted, 2);
    assert_eq!(report.metrics.skipped_duplicate, 1);

    let reopened = JsonlHistoryStore::open(&path).unwrap();
    let summary: Vec<_> = reopened
        .recent(10)
        .unwrap()
        .into_iter()
        .map(|r| (r.post_id, r.outcome, r.detail))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("2".to_string(), Outcome::Posted, None),
            (
                "1".to_string(),
                Outcome::SkippedDuplicate,
                Some("constraint-violation".to_string())
            ),
            ("1".to_string(), Outcome::Posted, None),
        ]
    );
    assert_eq!(reopened.posted_count().unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_feed_file_dry_run_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let feed_path = dir.path().join("feed.jsonl");
    let history_path = dir.path().join("history.jsonl");
    std::fs::write(
        &feed_path,
        [
            r#"{"id":"100","author":"rustacean","text":"Finally switched our CI to nextest, flaky test retries are a game changer"}"#,
            r#"{"id":"101","author":"bot","text":"RT @rustacean: Finally switched our CI to nextest"}"#,
            r#"{"id":"100","author":"rustacean","text":"Finally switched our CI to nextest, flaky test retries are a game changer"}"#,
        ]
        .join("\n"),
    )
    .unwrap();

    let pacing = PacingConfig {
        step_delay_secs: [0.1, 0.2],
        pre_type_delay_secs: [0.1, 0.2],
        typing_speed_secs: 0.01,
        post_submit_pause_secs: [0.1, 0.2],
        action_timeout_secs: 60,
    };
    let mut orch = Orchestrator::new(
        settings(),
        Box::new(FeedFileSource::new(&feed_path)),
        ContentFilter::new(&FilterConfig::default()),
        Box::new(replying_generator()),
        Box::new(HumanPacedExecutor::new(DryRunSurface::new(), pacing)),
        Box::new(JsonlHistoryStore::open(&history_path).unwrap()),
    )
    .with_clock(Arc::new(TokioClock::new(anchor())));

    let report = orch.run_once(None).await.unwrap();
    assert_eq!(report.posts_processed, 2);
    assert_eq!(report.replies_posted, 1);
    assert_eq!(report.metrics.skipped_filtered, 1);

    let day = anchor().date_naive();
    assert_eq!(orch.history().records_on(day).unwrap().len(), 2);

    // Second run over the same snapshot only finds duplicates.
    let report = orch.run_once(None).await.unwrap();
    assert_eq!(report.replies_posted, 0);
    assert_eq!(report.metrics.skipped_duplicate, 1);
    assert_eq!(orch.totals().runs, 2);
}

#[tokio::test(start_paused = true)]
async fn test_missing_feed_ends_run_early() {
    let dir = tempfile::tempdir().unwrap();
    let mut generator = MockGenerator::new();
    generator.expect_generate().never();

    let mut orch = Orchestrator::new(
        settings(),
        Box::new(FeedFileSource::new(dir.path().join("missing.jsonl"))),
        ContentFilter::new(&FilterConfig::default()),
        Box::new(generator),
        Box::new(posting_executor()),
        Box::new(JsonlHistoryStore::open(dir.path().join("history.jsonl")).unwrap()),
    );
    let report = orch.run_once(None).await.unwrap();
    assert!(matches!(report.end, RunEnd::SourceUnavailable(_)));
    assert_eq!(report.posts_processed, 0);
}
