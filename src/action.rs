//! Human-paced posting.
//!
//! The executor only ever asks the platform to scroll, click and type. All timing
//! lives here so the platform adapter stays a thin shim over the browser driver.

use async_trait::async_trait;
use rand::Rng;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::PacingConfig;
use crate::post::Post;

/// Element the executor interacts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiTarget {
    /// Reply button of a specific post.
    ReplyButton { post_id: String },
    /// Composer text box.
    ReplyBox,
    /// Submit button of the composer.
    SubmitButton,
}

impl fmt::Display for UiTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReplyButton { post_id } => write!(f, "reply-button[{}]", post_id),
            Self::ReplyBox => write!(f, "reply-box"),
            Self::SubmitButton => write!(f, "submit-button"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrollTarget {
    /// Bring an element into the middle of the viewport.
    IntoView(UiTarget),
    /// Scroll the page by a pixel offset; negative scrolls up.
    By(i32),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    #[error("element not found: {0}")]
    ElementNotFound(String),
    #[error("action timed out: {0}")]
    Timeout(String),
    #[error("rejected by platform: {0}")]
    RejectedByPlatform(String),
}

impl ActionError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ElementNotFound(_) => "element-not-found",
            Self::Timeout(_) => "action-timeout",
            Self::RejectedByPlatform(_) => "rejected-by-platform",
        }
    }
}

/// Minimal UI automation the executor needs from a platform.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AutomationSurface: Send {
    async fn scroll(&mut self, target: &ScrollTarget) -> Result<(), ActionError>;
    async fn click(&mut self, target: &UiTarget) -> Result<(), ActionError>;
    /// Type `text` into `target`. The executor sends one character at a time.
    async fn type_text(&mut self, target: &UiTarget, text: &str) -> Result<(), ActionError>;
}

/// Posts one reply to one post. Never retried by the caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionExecutor: Send {
    async fn reply(&mut self, post: &Post, reply: &str) -> Result<(), ActionError>;
}

/// Uniform random duration within `[lo, hi]` seconds.
fn uniform_secs([lo, hi]: [f64; 2]) -> Duration {
    let secs = if hi > lo {
        rand::thread_rng().gen_range(lo..=hi)
    } else {
        lo
    };
    Duration::from_secs_f64(secs.max(0.0))
}

/// Per-keystroke delay: typing speed scaled by a random factor in `[0.7, 1.5]`.
fn keystroke_delay(typing_speed: f64) -> Duration {
    uniform_secs([typing_speed * 0.7, typing_speed * 1.5])
}

/// Distance for one idle scroll through the feed: mostly down, sometimes back up.
pub fn browse_scroll_distance<R: Rng + ?Sized>(rng: &mut R) -> i32 {
    if rng.gen_bool(0.2) {
        -rng.gen_range(200..=400)
    } else {
        rng.gen_range(300..=900)
    }
}

/// Executor that imitates a person: scroll, click, pause, type slowly, submit.
pub struct HumanPacedExecutor<S> {
    surface: S,
    pacing: PacingConfig,
}

impl<S: AutomationSurface> HumanPacedExecutor<S> {
    pub fn new(surface: S, pacing: PacingConfig) -> Self {
        Self { surface, pacing }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    async fn perform(&mut self, post: &Post, reply: &str) -> Result<(), ActionError> {
        let button = UiTarget::ReplyButton {
            post_id: post.id.clone(),
        };

        self.surface
            .scroll(&ScrollTarget::IntoView(button.clone()))
            .await?;
        tokio::time::sleep(uniform_secs(self.pacing.step_delay_secs)).await;

        self.surface.click(&button).await?;
        debug!(post_id = %post.id, "reply composer opened");
        tokio::time::sleep(uniform_secs(self.pacing.step_delay_secs)).await;

        self.surface.click(&UiTarget::ReplyBox).await?;
        tokio::time::sleep(uniform_secs(self.pacing.pre_type_delay_secs)).await;

        let mut buf = [0u8; 4];
        for ch in reply.chars() {
            self.surface
                .type_text(&UiTarget::ReplyBox, ch.encode_utf8(&mut buf))
                .await?;
            tokio::time::sleep(keystroke_delay(self.pacing.typing_speed_secs)).await;
        }
        debug!(post_id = %post.id, chars = reply.chars().count(), "reply typed");
        tokio::time::sleep(uniform_secs(self.pacing.step_delay_secs)).await;

        self.surface.click(&UiTarget::SubmitButton).await?;
        tokio::time::sleep(uniform_secs(self.pacing.post_submit_pause_secs)).await;
        Ok(())
    }
}

#[async_trait]
impl<S: AutomationSurface> ActionExecutor for HumanPacedExecutor<S> {
    async fn reply(&mut self, post: &Post, reply: &str) -> Result<(), ActionError> {
        let limit = Duration::from_secs(self.pacing.action_timeout_secs);
        match tokio::time::timeout(limit, self.perform(post, reply)).await {
            Ok(Ok(())) => {
                info!(post_id = %post.id, "reply submitted");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(post_id = %post.id, error = %e, "posting action failed");
                Err(e)
            }
            Err(_) => Err(ActionError::Timeout(format!(
                "posting to {} took longer than {:?}",
                post.id, limit
            ))),
        }
    }
}

/// Surface that only logs. Used with `--dry-run` and in demos.
#[derive(Debug, Default)]
pub struct DryRunSurface {
    typed: String,
    submitted: usize,
}

impl DryRunSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies submitted so far.
    pub fn submitted(&self) -> usize {
        self.submitted
    }
}

#[async_trait]
impl AutomationSurface for DryRunSurface {
    async fn scroll(&mut self, target: &ScrollTarget) -> Result<(), ActionError> {
        debug!(element = ?target, "dry-run scroll");
        Ok(())
    }

    async fn click(&mut self, target: &UiTarget) -> Result<(), ActionError> {
        if *target == UiTarget::SubmitButton {
            self.submitted += 1;
            info!(reply = %self.typed, "dry-run: would submit reply");
            self.typed.clear();
        } else {
            debug!(element = %target, "dry-run click");
        }
        Ok(())
    }

    async fn type_text(&mut self, _target: &UiTarget, text: &str) -> Result<(), ActionError> {
        self.typed.push_str(text);
        Ok(())
    }
}
