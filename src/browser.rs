//! Headless Chrome adapter: feed discovery, the automation surface and login bootstrap.
//!
//! Needs the `browser` feature and a local Chrome/Chromium. headless_chrome is a
//! blocking API, so every driver call runs on the blocking pool.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::action::{browse_scroll_distance, ActionError, AutomationSurface, ScrollTarget, UiTarget};
use crate::config::BrowserConfig;
use crate::post::Post;
use crate::session::SessionHandle;
use crate::source::{PostSource, SourceError};

const TWEET_SELECTOR: &str = "article[data-testid='tweet']";
const LOGIN_SELECTOR: &str = "a[href='/i/flow/login'], [data-testid='loginButton']";
const REPLY_BOX_SELECTORS: [&str; 2] = ["div[data-testid='tweetTextarea_0']", "div[role='textbox']"];
const SUBMIT_SELECTORS: [&str; 2] = [
    "button[data-testid='tweetButton']",
    "button[data-testid='tweetButtonInline']",
];

/// Visible posts as a JSON string of `[{id, author, text}]`.
const EXTRACT_POSTS_JS: &str = r#"
JSON.stringify(Array.from(document.querySelectorAll("article[data-testid='tweet']")).map(a => {
  const href = Array.from(a.querySelectorAll("a[href*='/status/']"))
    .map(l => l.getAttribute('href'))
    .find(h => /\/status\/\d+/.test(h));
  const m = href && href.match(/\/([^\/]+)\/status\/(\d+)/);
  const body = a.querySelector("[data-testid='tweetText']");
  if (!m || !body) return null;
  return { id: m[2], author: m[1], text: body.innerText.trim() };
}).filter(Boolean))
"#;

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("failed to launch Chrome: {0}")]
    Launch(String),
    #[error("login failed: {0}")]
    Login(String),
}

/// Run a blocking driver call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, String> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| format!("browser task failed: {}", e))?
}

fn reply_button_selector(post_id: &str) -> String {
    format!(
        "{}:has(a[href*='/status/{}']) [data-testid='reply']",
        TWEET_SELECTOR, post_id
    )
}

fn selectors_for(target: &UiTarget) -> Vec<String> {
    match target {
        UiTarget::ReplyButton { post_id } => vec![reply_button_selector(post_id)],
        UiTarget::ReplyBox => REPLY_BOX_SELECTORS.iter().map(|s| s.to_string()).collect(),
        UiTarget::SubmitButton => SUBMIT_SELECTORS.iter().map(|s| s.to_string()).collect(),
    }
}

/// A running Chrome with one tab. Dropping it closes the browser.
pub struct ChromeSession {
    _browser: Browser,
    tab: Arc<Tab>,
    profile_dir: PathBuf,
}

impl ChromeSession {
    pub fn launch(config: &BrowserConfig, profile_dir: PathBuf) -> Result<Self, BrowserError> {
        std::fs::create_dir_all(&profile_dir).map_err(|e| BrowserError::Launch(e.to_string()))?;
        let options = LaunchOptions::default_builder()
            .headless(config.headless)
            .user_data_dir(Some(profile_dir.clone()))
            .window_size(Some((1280, 1000)))
            .idle_browser_timeout(Duration::from_secs(3600))
            .build()
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        let browser = Browser::new(options).map_err(|e| BrowserError::Launch(e.to_string()))?;
        let tab = browser
            .new_tab()
            .map_err(|e| BrowserError::Launch(e.to_string()))?;
        info!(profile = %profile_dir.display(), headless = config.headless, "Chrome launched");
        Ok(Self {
            _browser: browser,
            tab,
            profile_dir,
        })
    }

    pub fn tab(&self) -> Arc<Tab> {
        self.tab.clone()
    }

    /// Make sure the profile is logged in, asking the user to log in by hand if not.
    ///
    /// Returns the session handle to persist: the profile location plus a snapshot of
    /// cookie names, for auditing which login the profile carries.
    pub async fn ensure_login(
        &self,
        config: &BrowserConfig,
        previous: Option<&SessionHandle>,
    ) -> Result<SessionHandle, BrowserError> {
        let tab = self.tab.clone();
        let home = config.feed_url.clone();
        let timeout = Duration::from_secs(config.wait_timeout_secs);

        let logged_in = blocking({
            let tab = tab.clone();
            let home = home.clone();
            move || {
                tab.navigate_to(&home).map_err(|e| e.to_string())?;
                tab.wait_until_navigated().map_err(|e| e.to_string())?;
                std::thread::sleep(Duration::from_secs(3));
                Ok(tab.find_element(LOGIN_SELECTOR).is_err())
            }
        })
        .await
        .map_err(BrowserError::Login)?;

        if !logged_in {
            warn!("not logged in, waiting for manual login in the browser window");
            blocking(move || {
                println!("Log in to the site in the browser window, then press Enter to continue...");
                let mut line = String::new();
                std::io::stdin()
                    .read_line(&mut line)
                    .map_err(|e| e.to_string())?;
                Ok(())
            })
            .await
            .map_err(BrowserError::Login)?;
        } else if previous.is_some() {
            info!("saved session still valid");
        }

        let cookies = blocking(move || {
            tab.navigate_to(&home).map_err(|e| e.to_string())?;
            tab.wait_for_element_with_custom_timeout(TWEET_SELECTOR, timeout)
                .map_err(|e| format!("timeline did not load: {}", e))?;
            let cookies = tab.get_cookies().map_err(|e| e.to_string())?;
            Ok(cookies
                .into_iter()
                .map(|c| json!({ "name": c.name, "domain": c.domain }))
                .collect::<Vec<_>>())
        })
        .await
        .map_err(BrowserError::Login)?;

        let token = json!({
            "profile_dir": self.profile_dir.display().to_string(),
            "cookies": cookies,
        });
        let handle = match previous {
            Some(prev) => {
                let mut handle = prev.clone();
                handle.refresh(token);
                handle
            }
            None => SessionHandle::new(token),
        };
        info!("logged in");
        Ok(handle)
    }
}

/// Automation surface over a Chrome tab.
pub struct ChromeSurface {
    tab: Arc<Tab>,
    wait_timeout: Duration,
}

impl ChromeSurface {
    pub fn new(tab: Arc<Tab>, config: &BrowserConfig) -> Self {
        Self {
            tab,
            wait_timeout: Duration::from_secs(config.wait_timeout_secs),
        }
    }
}

#[async_trait]
impl AutomationSurface for ChromeSurface {
    async fn scroll(&mut self, target: &ScrollTarget) -> Result<(), ActionError> {
        let tab = self.tab.clone();
        match target {
            ScrollTarget::By(px) => {
                let js = format!("window.scrollBy(0, {});", px);
                blocking(move || tab.evaluate(&js, false).map(|_| ()).map_err(|e| e.to_string()))
                    .await
                    .map_err(ActionError::RejectedByPlatform)
            }
            ScrollTarget::IntoView(ui) => {
                let selectors = selectors_for(ui);
                let name = ui.to_string();
                blocking(move || {
                    for selector in &selectors {
                        if let Ok(element) = tab.find_element(selector) {
                            element.scroll_into_view().map_err(|e| e.to_string())?;
                            return Ok(());
                        }
                    }
                    Err(name)
                })
                .await
                .map_err(ActionError::ElementNotFound)
            }
        }
    }

    async fn click(&mut self, target: &UiTarget) -> Result<(), ActionError> {
        let tab = self.tab.clone();
        let selectors = selectors_for(target);
        let timeout = self.wait_timeout;
        let name = target.to_string();
        let submitting = *target == UiTarget::SubmitButton;

        blocking(move || {
            let mut clicked = false;
            for selector in &selectors {
                if let Ok(element) = tab.wait_for_element_with_custom_timeout(selector, timeout) {
                    element.click().map_err(|e| e.to_string())?;
                    clicked = true;
                    break;
                }
            }
            if clicked {
                Ok(())
            } else {
                Err(name)
            }
        })
        .await
        .map_err(ActionError::ElementNotFound)?;

        if submitting {
            self.confirm_submitted().await?;
        }
        Ok(())
    }

    async fn type_text(&mut self, _target: &UiTarget, text: &str) -> Result<(), ActionError> {
        // The executor clicked the box first, so it has focus.
        let tab = self.tab.clone();
        let text = text.to_string();
        blocking(move || tab.type_str(&text).map(|_| ()).map_err(|e| e.to_string()))
            .await
            .map_err(ActionError::RejectedByPlatform)
    }
}

impl ChromeSurface {
    /// The composer closes once the platform accepts the reply. An alert means it
    /// refused; a composer that simply stays open is logged and treated as posted.
    async fn confirm_submitted(&self) -> Result<(), ActionError> {
        let tab = self.tab.clone();
        let timeout = self.wait_timeout;
        let outcome = blocking(move || {
            let deadline = std::time::Instant::now() + timeout;
            while std::time::Instant::now() < deadline {
                if let Ok(alert) = tab.find_element("div[role='alert']") {
                    let text = alert.get_inner_text().unwrap_or_default();
                    if !text.trim().is_empty() {
                        return Ok(Some(text));
                    }
                }
                if tab.find_element(REPLY_BOX_SELECTORS[0]).is_err() {
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_millis(500));
            }
            Err("composer still open".to_string())
        })
        .await;

        match outcome {
            Ok(None) => Ok(()),
            Ok(Some(alert)) => Err(ActionError::RejectedByPlatform(alert)),
            Err(reason) => {
                warn!(reason = %reason, "could not confirm the reply was posted, continuing");
                Ok(())
            }
        }
    }
}

/// Post source that scrolls the live feed like a person and reads visible posts.
pub struct ChromeFeedSource {
    tab: Arc<Tab>,
    feed_url: String,
    wait_timeout: Duration,
    max_empty_scrolls: u32,
    empty_scrolls: u32,
    buffer: VecDeque<Post>,
    seen: HashSet<String>,
}

impl ChromeFeedSource {
    pub fn new(tab: Arc<Tab>, config: &BrowserConfig) -> Self {
        Self {
            tab,
            feed_url: config.feed_url.clone(),
            wait_timeout: Duration::from_secs(config.wait_timeout_secs),
            max_empty_scrolls: config.max_empty_scrolls,
            empty_scrolls: 0,
            buffer: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    async fn scroll_and_read(&mut self) -> Result<Vec<Post>, SourceError> {
        let distance = browse_scroll_distance(&mut rand::thread_rng());
        let reading = Duration::from_secs_f64(rand::thread_rng().gen_range(1.0..=3.5));

        let tab = self.tab.clone();
        let js = format!("window.scrollBy(0, {});", distance);
        blocking(move || tab.evaluate(&js, false).map(|_| ()).map_err(|e| e.to_string()))
            .await
            .map_err(SourceError::Unavailable)?;
        tokio::time::sleep(reading).await;

        let tab = self.tab.clone();
        let raw = blocking(move || {
            let result = tab
                .evaluate(EXTRACT_POSTS_JS, false)
                .map_err(|e| e.to_string())?;
            Ok(result
                .value
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| "[]".to_string()))
        })
        .await
        .map_err(SourceError::Unavailable)?;

        serde_json::from_str::<Vec<Post>>(&raw)
            .map_err(|e| SourceError::Unavailable(format!("unreadable feed snapshot: {}", e)))
    }
}

#[async_trait]
impl PostSource for ChromeFeedSource {
    async fn restart(&mut self) -> Result<(), SourceError> {
        self.buffer.clear();
        self.seen.clear();
        self.empty_scrolls = 0;

        let tab = self.tab.clone();
        let url = self.feed_url.clone();
        let timeout = self.wait_timeout;
        blocking(move || {
            tab.navigate_to(&url).map_err(|e| e.to_string())?;
            tab.wait_for_element_with_custom_timeout(TWEET_SELECTOR, timeout)
                .map_err(|e| format!("feed did not load: {}", e))?;
            Ok(())
        })
        .await
        .map_err(SourceError::Unavailable)?;

        info!(url = %self.feed_url, "feed opened");
        Ok(())
    }

    async fn next_post(&mut self) -> Result<Option<Post>, SourceError> {
        loop {
            if let Some(post) = self.buffer.pop_front() {
                return Ok(Some(post));
            }
            if self.empty_scrolls >= self.max_empty_scrolls {
                info!(scrolls = self.empty_scrolls, "no new posts after scrolling, feed exhausted");
                return Ok(None);
            }

            let mut fresh: Vec<Post> = self
                .scroll_and_read()
                .await?
                .into_iter()
                .filter(|p| self.seen.insert(p.id.clone()))
                .collect();

            if fresh.is_empty() {
                self.empty_scrolls += 1;
                debug!(empty_scrolls = self.empty_scrolls, "no new posts in view");
                continue;
            }
            self.empty_scrolls = 0;
            // Pick from the view in random order, like someone skimming.
            fresh.shuffle(&mut rand::thread_rng());
            self.buffer.extend(fresh);
        }
    }
}
