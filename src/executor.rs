//! Runs one validated [`Action`] against the browser.
//!
//! Every driver call runs under a timeout. Retryable driver errors are retried
//! with exponential backoff; a strict lookup that matches several nodes is
//! retried once in first-match mode and the result carries a warning. When an
//! operation finally fails, a screenshot and the page markup are written to
//! the diagnostics directory before the failure is returned.

use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use thiserror::Error;

use crate::action::{Action, Command};
use crate::config::ExecutorConfig;
use crate::dom::Observation;
use crate::driver::{BrowserDriver, Target};
use crate::error::{AgentError, DriverError};
use crate::types::{ActionResult, ContextStore, ElementRegistry, ErrorCode};

const MIN_WAIT_SECS: f64 = 0.5;
const MAX_WAIT_SECS: f64 = 30.0;
const MAX_QUERY_MATCHES: usize = 10;
const SCROLL_SETTLE: Duration = Duration::from_millis(500);

const BLOCKED_SCHEMES: [&str; 12] = [
    "javascript",
    "data",
    "file",
    "about",
    "chrome",
    "chrome-extension",
    "vbscript",
    "blob",
    "view-source",
    "ftp",
    "mailto",
    "tel",
];

/// Why a `navigate` URL was refused before touching the browser.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UrlPolicyError {
    #[error("URL cannot be empty")]
    Empty,

    #[error("protocol '{0}:' is not allowed")]
    BlockedProtocol(String),

    #[error("invalid URL '{url}': {reason}")]
    Invalid { url: String, reason: String },
}

impl UrlPolicyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            UrlPolicyError::BlockedProtocol(_) => ErrorCode::BlockedProtocol,
            UrlPolicyError::Empty | UrlPolicyError::Invalid { .. } => ErrorCode::InvalidUrl,
        }
    }
}

/// Accept http(s) only. A missing scheme becomes `https://`.
pub fn normalize_navigation_url(raw: &str) -> Result<String, UrlPolicyError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(UrlPolicyError::Empty);
    }
    let lower = raw.to_ascii_lowercase();

    if let Some(scheme) = BLOCKED_SCHEMES
        .iter()
        .find(|scheme| lower.starts_with(&format!("{scheme}:")))
    {
        return Err(UrlPolicyError::BlockedProtocol(scheme.to_string()));
    }

    let candidate = if lower.starts_with("http://") || lower.starts_with("https://") {
        raw.to_string()
    } else if let Some((scheme, _)) = lower.split_once("://") {
        return Err(UrlPolicyError::BlockedProtocol(scheme.to_string()));
    } else {
        format!("https://{raw}")
    };

    let parsed = url::Url::parse(&candidate).map_err(|e| UrlPolicyError::Invalid {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(UrlPolicyError::Invalid {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(parsed.to_string())
}

enum ElementOp<'a> {
    Click,
    Type { text: &'a str, press_enter: bool },
    Select { value: &'a str },
}

impl ElementOp<'_> {
    fn tag(&self) -> &'static str {
        match self {
            ElementOp::Click => "click",
            ElementOp::Type { .. } => "type",
            ElementOp::Select { .. } => "select",
        }
    }
}

/// Borrowing executor: one per step is fine, it holds no state of its own.
pub struct Executor<'a, D: BrowserDriver + ?Sized> {
    driver: &'a D,
    config: &'a ExecutorConfig,
}

impl<'a, D: BrowserDriver + ?Sized> Executor<'a, D> {
    pub fn new(driver: &'a D, config: &'a ExecutorConfig) -> Self {
        Self { driver, config }
    }

    pub async fn execute(
        &self,
        action: &Action,
        observation: &Observation,
        context: &mut ContextStore,
    ) -> ActionResult {
        let registry = &observation.registry;
        match &action.command {
            Command::Navigate { url } => self.navigate(url).await,
            Command::ClickElement { element_id } => {
                self.on_element(*element_id, registry, ElementOp::Click).await
            }
            Command::TypeText {
                element_id,
                text,
                press_enter,
            } => {
                let op = ElementOp::Type {
                    text,
                    press_enter: *press_enter,
                };
                self.on_element(*element_id, registry, op).await
            }
            Command::SelectOption { element_id, value } => {
                self.on_element(*element_id, registry, ElementOp::Select { value })
                    .await
            }
            Command::ScrollPage { direction } => {
                let scrolled = self
                    .retrying("scroll", self.config.action_timeout, || {
                        self.driver.scroll(*direction)
                    })
                    .await;
                match scrolled {
                    Ok(()) => {
                        tokio::time::sleep(SCROLL_SETTLE).await;
                        ActionResult::ok(format!("Scrolled {}", direction.as_str()))
                    }
                    Err(e) => {
                        self.capture_diagnostics("scroll").await;
                        ActionResult::failure(code_for(&e), format!("Scroll failed: {e}"))
                    }
                }
            }
            Command::TakeScreenshot => self.screenshot().await,
            Command::Wait { seconds } => wait(*seconds).await,
            Command::GoBack => {
                let went_back = self
                    .retrying("go_back", self.config.navigation_timeout, || {
                        self.driver.go_back()
                    })
                    .await;
                match went_back {
                    Ok(()) => ActionResult::ok("Went back to previous page"),
                    Err(e) => {
                        self.capture_diagnostics("go_back").await;
                        ActionResult::failure(code_for(&e), format!("Go back failed: {e}"))
                    }
                }
            }
            Command::QueryDom { query } => query_observation(&observation.summary, query),
            Command::StoreContext { items } => {
                let keys: Vec<&str> = items.keys().map(String::as_str).collect();
                let message = format!("Stored {} item(s): {}", items.len(), keys.join(", "));
                context.extend(items.iter().map(|(k, v)| (k.clone(), v.clone())));
                ActionResult::ok(message)
            }
            Command::Done { summary } => ActionResult::ok(format!("Task complete: {summary}")),
        }
    }

    async fn navigate(&self, raw: &str) -> ActionResult {
        let url = match normalize_navigation_url(raw) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(url = raw, error = %e, "navigation refused");
                return ActionResult::failure(e.code(), e.to_string());
            }
        };

        let navigated = self
            .retrying("navigate", self.config.navigation_timeout, || {
                self.driver.navigate(&url)
            })
            .await;
        match navigated {
            Ok(()) => ActionResult::ok(format!("Navigated to {url}")),
            Err(e) => {
                self.capture_diagnostics("navigate").await;
                let code = match e {
                    DriverError::Timeout(_) => ErrorCode::Timeout,
                    _ => ErrorCode::NavigationFailed,
                };
                ActionResult::failure(code, format!("Navigation to {url} failed: {e}"))
            }
        }
    }

    async fn on_element(&self, id: u32, registry: &ElementRegistry, op: ElementOp<'_>) -> ActionResult {
        match self.try_element(id, registry, &op).await {
            Ok((message, warning)) => ActionResult::ok(message).with_warning(warning),
            Err(e) => {
                if let AgentError::Selector(_) = e {
                    self.capture_diagnostics(op.tag()).await;
                }
                ActionResult::failure(element_code(&e), format!("{} on element {id} failed: {e}", op.tag()))
            }
        }
    }

    /// Resolve `id` in this observation's registry and run `op` on it.
    /// Returns the success message and the ambiguity warning, if any.
    async fn try_element(
        &self,
        id: u32,
        registry: &ElementRegistry,
        op: &ElementOp<'_>,
    ) -> Result<(String, Option<String>), AgentError> {
        let element = registry.resolve(id).ok_or(AgentError::InvalidElementId(id))?;

        let strict = Target::strict(&element.address);
        let mut warning = None;
        let mut outcome = self
            .retrying(op.tag(), self.config.action_timeout, || self.element_op(op, &strict))
            .await;

        if let Err(DriverError::Ambiguous { selector, matches }) = &outcome {
            tracing::warn!(%selector, matches, element = id, "ambiguous selector, using first match");
            warning = Some(format!(
                "Selector '{selector}' matched {matches} elements; used the first match"
            ));
        }
        if warning.is_some() {
            let loose = strict.clone().first_match();
            outcome = self
                .retrying(op.tag(), self.config.action_timeout, || self.element_op(op, &loose))
                .await;
        }
        outcome?;

        let mut message = match op {
            ElementOp::Click => format!("Clicked element {id}"),
            ElementOp::Type { press_enter, .. } => {
                let enter = if *press_enter { " and pressed Enter" } else { "" };
                format!("Typed text into element {id}{enter}")
            }
            ElementOp::Select { value } => format!("Selected option '{value}' in element {id}"),
        };
        if warning.is_some() {
            message.push_str(" (used first match)");
        }
        Ok((message, warning))
    }

    async fn element_op(&self, op: &ElementOp<'_>, target: &Target) -> Result<(), DriverError> {
        match op {
            ElementOp::Click => self.driver.click(target).await,
            ElementOp::Type { text, press_enter } => {
                self.driver.type_text(target, text).await?;
                if *press_enter {
                    self.driver.press_key("Enter").await?;
                }
                Ok(())
            }
            ElementOp::Select { value } => self.driver.select(target, value).await,
        }
    }

    async fn screenshot(&self) -> ActionResult {
        let dir = &self.config.screenshot_dir;
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            return ActionResult::failure(
                ErrorCode::ScreenshotFailed,
                format!("Cannot create {}: {e}", dir.display()),
            );
        }
        let path = dir.join(format!("screenshot_{}.png", timestamp_millis()));
        match self.driver.screenshot(&path).await {
            Ok(()) => ActionResult::ok(format!("Screenshot saved: {}", path.display()))
                .with_data(json!({ "path": path.display().to_string() })),
            Err(e) => ActionResult::failure(ErrorCode::ScreenshotFailed, format!("Screenshot failed: {e}")),
        }
    }

    /// Run `op` under `limit`, retrying retryable failures with doubling backoff.
    async fn retrying<T, F, Fut>(&self, what: &str, limit: Duration, mut op: F) -> Result<T, DriverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => Err(DriverError::Timeout(format!(
                    "{what} exceeded {}ms",
                    limit.as_millis()
                ))),
            };
            match result {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.config.backoff_base * 2u32.pow(attempt - 1);
                    tracing::debug!(what, attempt, error = %e, delay_ms = delay.as_millis() as u64, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Screenshot plus markup dump. Best effort: a failure here is logged and
    /// otherwise ignored.
    pub async fn capture_diagnostics(&self, tag: &str) -> Option<(PathBuf, PathBuf)> {
        let dir = &self.config.diagnostics_dir;
        let stem = format!("error_{tag}_{}", timestamp_millis());
        let png = dir.join(format!("{stem}.png"));
        let html = dir.join(format!("{stem}.html"));

        let captured = async {
            tokio::fs::create_dir_all(dir).await.map_err(|e| e.to_string())?;
            self.driver.screenshot(&png).await.map_err(|e| e.to_string())?;
            let markup = self.driver.content().await.map_err(|e| e.to_string())?;
            tokio::fs::write(&html, markup).await.map_err(|e| e.to_string())?;
            Ok::<_, String>(())
        }
        .await;

        match captured {
            Ok(()) => {
                tracing::info!(screenshot = %png.display(), html = %html.display(), "diagnostics captured");
                Some((png, html))
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to capture diagnostics");
                None
            }
        }
    }
}

async fn wait(requested: f64) -> ActionResult {
    let seconds = requested.clamp(MIN_WAIT_SECS, MAX_WAIT_SECS);
    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    if requested > MAX_WAIT_SECS {
        ActionResult::ok(format!("Waited {seconds} seconds (capped from {requested})"))
    } else {
        ActionResult::ok(format!("Waited {seconds} seconds"))
    }
}

fn query_observation(summary: &str, query: &str) -> ActionResult {
    let keywords: Vec<&str> = query
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|k| !k.is_empty())
        .collect();

    let mut sections = Vec::new();
    let mut found = Vec::new();
    for keyword in keywords {
        let needle = keyword.to_lowercase();
        let matches: Vec<&str> = summary
            .lines()
            .map(str::trim)
            .filter(|line| line.to_lowercase().contains(&needle))
            .collect();
        if matches.is_empty() {
            continue;
        }
        let shown = &matches[..matches.len().min(MAX_QUERY_MATCHES)];
        sections.push(format!(
            "{keyword} ({} match(es)):\n{}",
            matches.len(),
            shown.join("\n")
        ));
        found.push(json!({
            "keyword": keyword,
            "matches": shown,
            "total_count": matches.len(),
        }));
    }

    if found.is_empty() {
        return ActionResult::failure(
            ErrorCode::NotFound,
            format!("None of the keywords from '{query}' found in the current page."),
        );
    }
    ActionResult::ok(sections.join("\n\n")).with_data(json!({ "matches": found }))
}

fn element_code(e: &AgentError) -> ErrorCode {
    match e {
        AgentError::InvalidElementId(_) => ErrorCode::InvalidElementId,
        AgentError::Selector(driver) => code_for(driver),
        _ => ErrorCode::BrowserError,
    }
}

fn code_for(e: &DriverError) -> ErrorCode {
    match e {
        DriverError::Timeout(_) => ErrorCode::Timeout,
        DriverError::NotFound(_) => ErrorCode::ElementNotFound,
        DriverError::Ambiguous { .. } => ErrorCode::SelectorError,
        DriverError::Transient(_) | DriverError::Failed(_) => ErrorCode::BrowserError,
    }
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_is_added_when_missing() {
        assert_eq!(
            normalize_navigation_url("example.com/search?q=rust").unwrap(),
            "https://example.com/search?q=rust"
        );
        assert_eq!(
            normalize_navigation_url("  http://example.com ").unwrap(),
            "http://example.com/"
        );
    }

    #[test]
    fn dangerous_schemes_are_blocked() {
        for url in [
            "javascript:alert(1)",
            "JavaScript:alert(1)",
            "data:text/html,hi",
            "file:///etc/passwd",
            "about:blank",
            "chrome://settings",
            "ftp://files.example.com",
        ] {
            let err = normalize_navigation_url(url).unwrap_err();
            assert_eq!(err.code(), ErrorCode::BlockedProtocol, "{url}");
        }
        assert!(matches!(
            normalize_navigation_url("ws://example.com"),
            Err(UrlPolicyError::BlockedProtocol(scheme)) if scheme == "ws"
        ));
    }

    #[test]
    fn empty_and_hostless_urls_are_invalid() {
        assert_eq!(normalize_navigation_url("   "), Err(UrlPolicyError::Empty));
        assert_eq!(
            normalize_navigation_url("https://").unwrap_err().code(),
            ErrorCode::InvalidUrl
        );
    }

    #[test]
    fn query_reports_matches_per_keyword() {
        let summary = "URL: https://shop.example\nTitle: Shop\n\n[1] BUTTON \"Add to cart\"\n[2] A \"Cart (2)\"";
        let result = query_observation(summary, "cart, checkout");
        assert!(result.success);
        assert!(result.message.starts_with("cart (2 match(es))"));
        let data = result.data.unwrap();
        assert_eq!(data["matches"].as_array().unwrap().len(), 1);
        assert_eq!(data["matches"][0]["total_count"], 2);

        let miss = query_observation(summary, "refund");
        assert!(!miss.success);
        assert_eq!(miss.error, Some(ErrorCode::NotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_clamped() {
        let start = tokio::time::Instant::now();
        let result = wait(120.0).await;
        assert!(result.success);
        assert!(result.message.contains("capped"));
        assert_eq!(start.elapsed(), Duration::from_secs(30));

        let start = tokio::time::Instant::now();
        wait(0.0).await;
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }
}
