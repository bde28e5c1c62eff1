//! Settings for one agent run, read from the environment (and `.env`).
//!
//! Every section has a usable `Default`; only the API key is mandatory.
//! Validation happens once, before the loop starts, and reports the first
//! bad value as [`AgentError::Configuration`].

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AgentError;
use crate::guard::{DEFAULT_REPEAT_WINDOW, DEFAULT_THRASH_WINDOW};
use crate::types::{DEFAULT_MAX_ELEMENTS, DEFAULT_MAX_LABEL_CHARS, DEFAULT_MAX_STEPS};

const PLACEHOLDER_KEYS: [&str; 6] = [
    "your_api_key_here",
    "your_openrouter_api_key_here",
    "sk-your-key-here",
    "ollama",
    "test",
    "none",
];

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub http_timeout: Duration,
    /// Minimum spacing between two model calls.
    pub min_interval: Duration,
    /// Attempts per model call for network errors and timeouts.
    pub max_attempts: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            max_tokens: 2000,
            http_timeout: Duration::from_secs(120),
            min_interval: Duration::from_secs(15),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    /// Attach to an already running Chrome (`http://127.0.0.1:9222`) instead of launching one.
    pub debug_url: Option<String>,
    pub user_data_dir: Option<PathBuf>,
}

/// What to do when the loop guard fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopPolicy {
    #[default]
    Abort,
    Intervene,
}

impl FromStr for LoopPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(LoopPolicy::Abort),
            "intervene" => Ok(LoopPolicy::Intervene),
            other => Err(format!("expected 'abort' or 'intervene', got '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_steps: usize,
    /// Recent conversation entries sent with each model call.
    pub history_window: usize,
    /// Window used for the one retry after an unparseable reply.
    pub retry_window: usize,
    /// Entries kept in memory before the oldest are dropped.
    pub conversation_capacity: usize,
    pub loop_policy: LoopPolicy,
    pub repeat_window: usize,
    pub thrash_window: usize,
    /// Base pause between steps; each pause is jittered by ±50%.
    pub step_delay: Duration,
    pub captcha_poll_interval: Duration,
    pub captcha_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            history_window: 10,
            retry_window: 2,
            conversation_capacity: 200,
            loop_policy: LoopPolicy::Abort,
            repeat_window: DEFAULT_REPEAT_WINDOW,
            thrash_window: DEFAULT_THRASH_WINDOW,
            step_delay: Duration::from_secs(1),
            captcha_poll_interval: Duration::from_secs(5),
            captcha_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub action_timeout: Duration,
    pub navigation_timeout: Duration,
    pub max_attempts: u32,
    /// First retry delay; doubles on every further attempt.
    pub backoff_base: Duration,
    pub screenshot_dir: PathBuf,
    pub diagnostics_dir: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_millis(20_000),
            navigation_timeout: Duration::from_millis(60_000),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            screenshot_dir: PathBuf::from("screenshots"),
            diagnostics_dir: default_diagnostics_dir(),
        }
    }
}

fn default_diagnostics_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("webpilot").join("diagnostics"))
        .unwrap_or_else(|| PathBuf::from("diagnostics"))
}

#[derive(Debug, Clone)]
pub struct DistillConfig {
    pub max_elements: usize,
    pub max_label_chars: usize,
}

impl Default for DistillConfig {
    fn default() -> Self {
        Self {
            max_elements: DEFAULT_MAX_ELEMENTS,
            max_label_chars: DEFAULT_MAX_LABEL_CHARS,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub model: ModelConfig,
    pub browser: BrowserConfig,
    pub agent: AgentConfig,
    pub executor: ExecutorConfig,
    pub distill: DistillConfig,
}

impl Settings {
    /// Load `.env` (if present), then read the process environment.
    pub fn from_env() -> Result<Self, AgentError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup and validate them.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AgentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        let mut settings = Settings::default();

        let model = &mut settings.model;
        model.api_key = vars
            .string("OPENAI_API_KEY")
            .ok_or_else(|| AgentError::Configuration("OPENAI_API_KEY is not set".into()))?;
        vars.set_string("API_BASE_URL", &mut model.base_url);
        vars.set_string("MODEL_NAME", &mut model.model);
        vars.set("TEMPERATURE", &mut model.temperature)?;
        vars.set("MAX_TOKENS", &mut model.max_tokens)?;
        vars.set_secs("HTTP_TIMEOUT", &mut model.http_timeout)?;
        vars.set_secs("MODEL_MIN_INTERVAL_SECS", &mut model.min_interval)?;

        let browser = &mut settings.browser;
        vars.set_bool("HEADLESS", &mut browser.headless)?;
        browser.chrome_path = vars.string("CHROME_PATH").map(PathBuf::from);
        browser.debug_url = vars.string("CHROME_DEBUG_URL");
        browser.user_data_dir = vars.string("USER_DATA_DIR").map(PathBuf::from);

        let agent = &mut settings.agent;
        vars.set("MAX_STEPS", &mut agent.max_steps)?;
        vars.set("LOOP_DETECTION_WINDOW", &mut agent.repeat_window)?;
        vars.set("THRASH_WINDOW", &mut agent.thrash_window)?;
        vars.set("LOOP_POLICY", &mut agent.loop_policy)?;
        vars.set_secs("AGENT_STEP_DELAY", &mut agent.step_delay)?;
        vars.set_secs("CAPTCHA_TIMEOUT", &mut agent.captcha_timeout)?;

        let executor = &mut settings.executor;
        vars.set_millis("ACTION_TIMEOUT_MS", &mut executor.action_timeout)?;
        vars.set_millis("PAGE_LOAD_TIMEOUT_MS", &mut executor.navigation_timeout)?;
        vars.set("MAX_RETRY_ATTEMPTS", &mut executor.max_attempts)?;
        if let Some(dir) = vars.string("SCREENSHOT_DIR") {
            executor.screenshot_dir = PathBuf::from(dir);
        }
        if let Some(dir) = vars.string("DIAGNOSTICS_DIR") {
            executor.diagnostics_dir = PathBuf::from(dir);
        }

        vars.set("MAX_ELEMENTS", &mut settings.distill.max_elements)?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        let key = self.model.api_key.trim();
        if key.len() < 10 || PLACEHOLDER_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
            return Err(invalid("OPENAI_API_KEY looks like a placeholder; set a real key"));
        }

        let base = url::Url::parse(&self.model.base_url)
            .map_err(|e| invalid(format!("API_BASE_URL '{}' is not a URL: {e}", self.model.base_url)))?;
        let local = matches!(base.host_str(), Some("localhost" | "127.0.0.1"));
        if base.scheme() != "https" && !local {
            return Err(invalid(format!(
                "API_BASE_URL must use https, got '{}'",
                self.model.base_url
            )));
        }

        check_range("MAX_STEPS", self.agent.max_steps, 1, 200)?;
        check_range("MAX_RETRY_ATTEMPTS", self.executor.max_attempts, 1, 10)?;
        check_range("LOOP_DETECTION_WINDOW", self.agent.repeat_window, 2, 10)?;
        if self.agent.thrash_window <= self.agent.repeat_window {
            return Err(invalid(format!(
                "THRASH_WINDOW ({}) must be larger than LOOP_DETECTION_WINDOW ({})",
                self.agent.thrash_window, self.agent.repeat_window
            )));
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(invalid(format!(
                "TEMPERATURE must be within 0..=2, got {}",
                self.model.temperature
            )));
        }
        if self.model.max_tokens < 100 {
            return Err(invalid("MAX_TOKENS must be at least 100"));
        }
        if self.model.http_timeout < Duration::from_secs(10) {
            return Err(invalid("HTTP_TIMEOUT too low (min 10s)"));
        }
        if self.agent.step_delay > Duration::from_secs(10) {
            return Err(invalid("AGENT_STEP_DELAY must be at most 10s"));
        }
        if self.distill.max_elements == 0 {
            return Err(invalid("MAX_ELEMENTS must be positive"));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> AgentError {
    AgentError::Configuration(message.into())
}

fn check_range<T>(name: &str, value: T, min: T, max: T) -> Result<(), AgentError>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min || value > max {
        return Err(invalid(format!("{name} must be within {min}..={max}, got {value}")));
    }
    Ok(())
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn set_string(&self, key: &str, slot: &mut String) {
        if let Some(value) = self.string(key) {
            *slot = value;
        }
    }

    fn set<T>(&self, key: &str, slot: &mut T) -> Result<(), AgentError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.string(key) {
            *slot = raw
                .parse()
                .map_err(|e| invalid(format!("{key}='{raw}': {e}")))?;
        }
        Ok(())
    }

    fn set_bool(&self, key: &str, slot: &mut bool) -> Result<(), AgentError> {
        if let Some(raw) = self.string(key) {
            *slot = match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(invalid(format!("{key}='{raw}' is not a boolean"))),
            };
        }
        Ok(())
    }

    fn set_secs(&self, key: &str, slot: &mut Duration) -> Result<(), AgentError> {
        let mut secs = slot.as_secs_f64();
        self.set(key, &mut secs)?;
        *slot = Duration::try_from_secs_f64(secs)
            .map_err(|_| invalid(format!("{key} must be a non-negative number of seconds")))?;
        Ok(())
    }

    fn set_millis(&self, key: &str, slot: &mut Duration) -> Result<(), AgentError> {
        let mut millis = slot.as_millis() as u64;
        self.set(key, &mut millis)?;
        *slot = Duration::from_millis(millis);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<Settings, AgentError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| env.get(key).cloned())
    }

    const KEY: (&str, &str) = ("OPENAI_API_KEY", "sk-live-0123456789");

    #[test]
    fn defaults_with_only_a_key() {
        let settings = load(&[KEY]).unwrap();
        assert_eq!(settings.agent.max_steps, 50);
        assert_eq!(settings.agent.loop_policy, LoopPolicy::Abort);
        assert_eq!(settings.executor.max_attempts, 3);
        assert_eq!(settings.executor.action_timeout, Duration::from_secs(20));
        assert!(!settings.browser.headless);
    }

    #[test]
    fn missing_or_placeholder_key_is_rejected() {
        assert!(matches!(load(&[]), Err(AgentError::Configuration(_))));
        assert!(load(&[("OPENAI_API_KEY", "your_api_key_here")]).is_err());
        assert!(load(&[("OPENAI_API_KEY", "short")]).is_err());
    }

    #[test]
    fn base_url_must_be_https_unless_local() {
        assert!(load(&[KEY, ("API_BASE_URL", "http://api.example.com/v1")]).is_err());
        assert!(load(&[KEY, ("API_BASE_URL", "http://localhost:8080/v1")]).is_ok());
        assert!(load(&[KEY, ("API_BASE_URL", "not a url")]).is_err());
    }

    #[test]
    fn numeric_overrides_and_ranges() {
        let settings = load(&[
            KEY,
            ("MAX_STEPS", "5"),
            ("ACTION_TIMEOUT_MS", "1500"),
            ("AGENT_STEP_DELAY", "0.25"),
            ("LOOP_POLICY", "Intervene"),
            ("HEADLESS", "yes"),
        ])
        .unwrap();
        assert_eq!(settings.agent.max_steps, 5);
        assert_eq!(settings.executor.action_timeout, Duration::from_millis(1500));
        assert_eq!(settings.agent.step_delay, Duration::from_millis(250));
        assert_eq!(settings.agent.loop_policy, LoopPolicy::Intervene);
        assert!(settings.browser.headless);

        assert!(load(&[KEY, ("MAX_STEPS", "0")]).is_err());
        assert!(load(&[KEY, ("MAX_STEPS", "201")]).is_err());
        assert!(load(&[KEY, ("MAX_STEPS", "many")]).is_err());
        assert!(load(&[KEY, ("TEMPERATURE", "2.5")]).is_err());
        assert!(load(&[KEY, ("HTTP_TIMEOUT", "5")]).is_err());
        assert!(load(&[KEY, ("LOOP_POLICY", "panic")]).is_err());
    }

    #[test]
    fn thrash_window_must_exceed_repeat_window() {
        assert!(load(&[KEY, ("LOOP_DETECTION_WINDOW", "4"), ("THRASH_WINDOW", "4")]).is_err());
        assert!(load(&[KEY, ("LOOP_DETECTION_WINDOW", "4"), ("THRASH_WINDOW", "6")]).is_ok());
    }
}
