use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Agent configuration. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Run scheduling and limits
    #[serde(default)]
    pub bot: BotConfig,

    /// Content filter rules
    #[serde(default)]
    pub filter: FilterConfig,

    /// Reply generation backend
    #[serde(default)]
    pub generator: GeneratorConfig,

    /// Human-like typing and pauses
    #[serde(default)]
    pub pacing: PacingConfig,

    /// Where history and session live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Browser surface (used with the `browser` feature)
    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_max_replies_per_run")]
    pub max_replies_per_run: usize,
    /// Posts looked at per run, whatever their outcome
    #[serde(default = "default_max_posts_per_run")]
    pub max_posts_per_run: usize,
    #[serde(default = "default_min_delay_between_replies_secs")]
    pub min_delay_between_replies_secs: u64,
    #[serde(default)]
    pub manual_approval: bool,
    #[serde(default)]
    pub continuous: bool,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    /// Pause before the single generation retry
    #[serde(default = "default_generation_retry_backoff_secs")]
    pub generation_retry_backoff_secs: f64,
    /// Random extra wait on top of the minimum delay between replies
    #[serde(default = "default_reply_jitter_secs")]
    pub reply_jitter_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_blocklist")]
    pub blocklist: Vec<String>,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_shouting_min_chars")]
    pub shouting_min_chars: usize,
    /// Reject posts whose letters are less than this share Latin
    #[serde(default)]
    pub min_latin_ratio: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ollama,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_provider")]
    pub provider: Provider,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Only needed for hosted providers; `LLM_API_KEY` takes precedence
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_reply_chars")]
    pub max_reply_chars: usize,
    #[serde(default = "default_min_reply_chars")]
    pub min_reply_chars: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_persona")]
    pub persona: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// [min, max] seconds between UI steps (scroll, click)
    #[serde(default = "default_step_delay_secs")]
    pub step_delay_secs: [f64; 2],
    /// [min, max] seconds before typing starts
    #[serde(default = "default_pre_type_delay_secs")]
    pub pre_type_delay_secs: [f64; 2],
    /// Nominal seconds per character; each keystroke waits 0.7x..1.5x of it
    #[serde(default = "default_typing_speed_secs")]
    pub typing_speed_secs: f64,
    /// [min, max] seconds after submitting
    #[serde(default = "default_post_submit_pause_secs")]
    pub post_submit_pause_secs: [f64; 2],
    /// Upper bound on one whole posting action
    #[serde(default = "default_action_timeout_secs")]
    pub action_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_history_file")]
    pub history_file: String,
    #[serde(default = "default_session_file")]
    pub session_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    #[serde(default = "default_feed_url")]
    pub feed_url: String,
    #[serde(default)]
    pub headless: bool,
    /// Chrome profile directory, reused across runs
    #[serde(default)]
    pub profile_dir: Option<PathBuf>,
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// Give up on the feed after this many scrolls without a new post
    #[serde(default = "default_max_empty_scrolls")]
    pub max_empty_scrolls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log to this file instead of stdout
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

fn default_max_replies_per_run() -> usize {
    20
}

fn default_max_posts_per_run() -> usize {
    100
}

fn default_min_delay_between_replies_secs() -> u64 {
    30
}

fn default_interval_minutes() -> u64 {
    30
}

fn default_generation_retry_backoff_secs() -> f64 {
    2.0
}

fn default_reply_jitter_secs() -> f64 {
    10.0
}

fn default_blocklist() -> Vec<String> {
    [
        "kill", "death", "die", "suicide", "hate", "violence", "attack", "war", "terror",
        "bomb", "gun", "weapon",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_min_chars() -> usize {
    10
}

fn default_shouting_min_chars() -> usize {
    20
}

fn default_provider() -> Provider {
    Provider::Ollama
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "gemma3:1b".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_reply_chars() -> usize {
    200
}

fn default_min_reply_chars() -> usize {
    5
}

fn default_max_tokens() -> u32 {
    256
}

fn default_temperature() -> f64 {
    1.0
}

fn default_top_k() -> u32 {
    64
}

fn default_top_p() -> f64 {
    0.95
}

fn default_persona() -> String {
    "You are an experienced software engineer hanging out on a developer social feed. \
Reply like a real developer in a late-night group chat: plain words, specific to the post, \
with real thought instead of generic praise. You may agree or respectfully push back, add a \
tradeoff or a bit of practical experience. If the post is funny, be funny. \
Keep it to one or two short sentences, always under 200 characters. \
No emojis, no hashtags, never a single word. \
Output only the reply text: no quotes, no \"Reply:\" prefix."
        .to_string()
}

fn default_step_delay_secs() -> [f64; 2] {
    [0.3, 1.0]
}

fn default_pre_type_delay_secs() -> [f64; 2] {
    [0.5, 2.0]
}

fn default_typing_speed_secs() -> f64 {
    0.08
}

fn default_post_submit_pause_secs() -> [f64; 2] {
    [2.0, 3.0]
}

fn default_action_timeout_secs() -> u64 {
    120
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("session")
}

fn default_history_file() -> String {
    "replied_posts.jsonl".to_string()
}

fn default_session_file() -> String {
    "session.json".to_string()
}

fn default_feed_url() -> String {
    "https://x.com/home".to_string()
}

fn default_wait_timeout_secs() -> u64 {
    20
}

fn default_max_empty_scrolls() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            max_replies_per_run: default_max_replies_per_run(),
            max_posts_per_run: default_max_posts_per_run(),
            min_delay_between_replies_secs: default_min_delay_between_replies_secs(),
            manual_approval: false,
            continuous: false,
            interval_minutes: default_interval_minutes(),
            generation_retry_backoff_secs: default_generation_retry_backoff_secs(),
            reply_jitter_secs: default_reply_jitter_secs(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            blocklist: default_blocklist(),
            min_chars: default_min_chars(),
            shouting_min_chars: default_shouting_min_chars(),
            min_latin_ratio: None,
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
            max_reply_chars: default_max_reply_chars(),
            min_reply_chars: default_min_reply_chars(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            persona: default_persona(),
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            step_delay_secs: default_step_delay_secs(),
            pre_type_delay_secs: default_pre_type_delay_secs(),
            typing_speed_secs: default_typing_speed_secs(),
            post_submit_pause_secs: default_post_submit_pause_secs(),
            action_timeout_secs: default_action_timeout_secs(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            history_file: default_history_file(),
            session_file: default_session_file(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            feed_url: default_feed_url(),
            headless: false,
            profile_dir: None,
            wait_timeout_secs: default_wait_timeout_secs(),
            max_empty_scrolls: default_max_empty_scrolls(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl BotConfig {
    pub fn min_delay(&self) -> Duration {
        Duration::from_secs(self.min_delay_between_replies_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.saturating_mul(60))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.generation_retry_backoff_secs)
    }
}

impl StorageConfig {
    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join(&self.history_file)
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join(&self.session_file)
    }

    pub fn profile_dir(&self) -> PathBuf {
        self.data_dir.join("profile")
    }
}

impl GeneratorConfig {
    /// `LLM_API_KEY` wins over the configured key.
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var("LLM_API_KEY").ok().or_else(|| self.api_key.clone())
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        info!(
            max_replies_per_run = config.bot.max_replies_per_run,
            continuous = config.bot.continuous,
            model = %config.generator.model,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ranges = [
            ("pacing.step_delay_secs", self.pacing.step_delay_secs),
            ("pacing.pre_type_delay_secs", self.pacing.pre_type_delay_secs),
            ("pacing.post_submit_pause_secs", self.pacing.post_submit_pause_secs),
        ];
        for (name, [lo, hi]) in ranges {
            if !(lo.is_finite() && hi.is_finite()) || lo < 0.0 || lo > hi {
                return Err(ConfigError::Invalid(format!(
                    "{} must be [min, max] with 0 <= min <= max, got [{}, {}]",
                    name, lo, hi
                )));
            }
        }

        let non_negative = [
            ("pacing.typing_speed_secs", self.pacing.typing_speed_secs),
            ("bot.reply_jitter_secs", self.bot.reply_jitter_secs),
            (
                "bot.generation_retry_backoff_secs",
                self.bot.generation_retry_backoff_secs,
            ),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        if self.generator.max_reply_chars < 4 {
            return Err(ConfigError::Invalid(
                "generator.max_reply_chars must be at least 4".to_string(),
            ));
        }
        if self.generator.min_reply_chars > self.generator.max_reply_chars {
            return Err(ConfigError::Invalid(
                "generator.min_reply_chars exceeds generator.max_reply_chars".to_string(),
            ));
        }
        if let Some(ratio) = self.filter.min_latin_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ConfigError::Invalid(format!(
                    "filter.min_latin_ratio must be within [0, 1], got {}",
                    ratio
                )));
            }
        }
        if self.bot.max_posts_per_run == 0 {
            return Err(ConfigError::Invalid(
                "bot.max_posts_per_run must be positive".to_string(),
            ));
        }
        if self.bot.interval_minutes > MAX_INTERVAL_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "bot.interval_minutes must be at most {} (one week), got {}",
                MAX_INTERVAL_MINUTES, self.bot.interval_minutes
            )));
        }
        if self.bot.continuous && self.bot.interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "bot.interval_minutes must be positive in continuous mode".to_string(),
            ));
        }
        Ok(())
    }
}
