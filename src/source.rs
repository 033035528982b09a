//! Candidate post discovery.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::post::Post;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// Discovery failed; the run ends early and the next run starts fresh.
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Lazy, finite sequence of candidate posts for one run.
///
/// `next_post` returning `Ok(None)` means the source is exhausted for this run.
/// Each run calls `restart` first; a source is not rewound within a run.
#[async_trait]
pub trait PostSource: Send {
    async fn restart(&mut self) -> Result<(), SourceError>;
    async fn next_post(&mut self) -> Result<Option<Post>, SourceError>;
}

/// Dedup within one run: a feed often shows the same post twice while scrolling.
#[derive(Debug, Default)]
struct SeenInRun {
    ids: HashSet<String>,
}

impl SeenInRun {
    fn first_sighting(&mut self, id: &str) -> bool {
        self.ids.insert(id.to_string())
    }

    fn clear(&mut self) {
        self.ids.clear();
    }
}

/// Posts from a JSONL feed snapshot, one `{"id","author","text"}` object per line.
///
/// The file is re-read on every `restart`, so an external scraper can refresh it
/// between runs.
pub struct FeedFileSource {
    path: PathBuf,
    queue: VecDeque<Post>,
    seen: SeenInRun,
}

impl FeedFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            queue: VecDeque::new(),
            seen: SeenInRun::default(),
        }
    }
}

#[async_trait]
impl PostSource for FeedFileSource {
    async fn restart(&mut self) -> Result<(), SourceError> {
        self.queue.clear();
        self.seen.clear();

        let data = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SourceError::Unavailable(format!("cannot read {}: {}", self.path.display(), e))
        })?;

        for (idx, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Post>(line) {
                Ok(post) => self.queue.push_back(post),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = idx + 1,
                    error = %e,
                    "skipping unreadable feed entry"
                ),
            }
        }

        info!(path = %self.path.display(), posts = self.queue.len(), "feed loaded");
        Ok(())
    }

    async fn next_post(&mut self) -> Result<Option<Post>, SourceError> {
        while let Some(post) = self.queue.pop_front() {
            if self.seen.first_sighting(&post.id) {
                return Ok(Some(post));
            }
            debug!(post_id = %post.id, "post repeated in feed, skipping");
        }
        Ok(None)
    }
}

/// Fixed list of posts, replayed from the start on every run.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    posts: Vec<Post>,
    cursor: usize,
}

impl MemorySource {
    pub fn new(posts: Vec<Post>) -> Self {
        Self { posts, cursor: 0 }
    }
}

#[async_trait]
impl PostSource for MemorySource {
    async fn restart(&mut self) -> Result<(), SourceError> {
        self.cursor = 0;
        Ok(())
    }

    async fn next_post(&mut self) -> Result<Option<Post>, SourceError> {
        let post = self.posts.get(self.cursor).cloned();
        if post.is_some() {
            self.cursor += 1;
        }
        Ok(post)
    }
}
