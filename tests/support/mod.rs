#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use webpilot::Settings;
use webpilot::action::ScrollDirection;
use webpilot::brain::ReasoningModel;
use webpilot::driver::{BrowserDriver, Target};
use webpilot::error::{AgentError, DriverError};
use webpilot::types::ChatMessage;

#[derive(Default)]
struct Page {
    url: String,
    title: String,
    elements: Vec<Value>,
    /// Address → number of live matches, for addresses that are not unique.
    duplicates: HashMap<String, usize>,
    click_failures: VecDeque<DriverError>,
    scroll_failures: VecDeque<DriverError>,
    /// Captcha probes that still report a captcha.
    captcha_probes: usize,
    calls: Vec<String>,
    closed: bool,
}

/// In-memory browser: serves a fixed element list and records every call.
#[derive(Clone, Default)]
pub struct FakeDriver {
    page: Arc<Mutex<Page>>,
}

impl FakeDriver {
    pub fn new(url: &str, title: &str) -> Self {
        let driver = Self::default();
        {
            let mut page = driver.page.lock().unwrap();
            page.url = url.to_string();
            page.title = title.to_string();
        }
        driver
    }

    pub fn with_elements(self, elements: Vec<Value>) -> Self {
        self.page.lock().unwrap().elements = elements;
        self
    }

    pub fn duplicate(&self, address: &str, matches: usize) {
        self.page
            .lock()
            .unwrap()
            .duplicates
            .insert(address.to_string(), matches);
    }

    pub fn fail_clicks(&self, errors: impl IntoIterator<Item = DriverError>) {
        self.page.lock().unwrap().click_failures.extend(errors);
    }

    pub fn fail_scrolls(&self, errors: impl IntoIterator<Item = DriverError>) {
        self.page.lock().unwrap().scroll_failures.extend(errors);
    }

    pub fn show_captcha_for(&self, probes: usize) {
        self.page.lock().unwrap().captcha_probes = probes;
    }

    pub fn calls(&self) -> Vec<String> {
        self.page.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn closed(&self) -> bool {
        self.page.lock().unwrap().closed
    }

    fn record(&self, call: String) {
        self.page.lock().unwrap().calls.push(call);
    }

    fn check(&self, target: &Target) -> Result<(), DriverError> {
        let page = self.page.lock().unwrap();
        match page.duplicates.get(&target.address) {
            Some(&matches) if target.is_strict() => Err(DriverError::Ambiguous {
                selector: target.address.clone(),
                matches,
            }),
            _ => Ok(()),
        }
    }
}

/// A raw element the way the page script reports it.
pub fn element(index: usize, tag: &str, text: &str, address: &str, y: f64) -> Value {
    json!({
        "index": index,
        "tag": tag,
        "text": text,
        "address": address,
        "y": y,
        "visible": true,
    })
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let mut page = self.page.lock().unwrap();
        page.url = url.to_string();
        page.calls.push(format!("navigate {url}"));
        Ok(())
    }

    async fn click(&self, target: &Target) -> Result<(), DriverError> {
        self.check(target)?;
        let mut page = self.page.lock().unwrap();
        page.calls.push(format!("click {}", target.address));
        match page.click_failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn type_text(&self, target: &Target, text: &str) -> Result<(), DriverError> {
        self.check(target)?;
        self.record(format!("type {} {text}", target.address));
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<(), DriverError> {
        self.record(format!("key {key}"));
        Ok(())
    }

    async fn select(&self, target: &Target, value: &str) -> Result<(), DriverError> {
        self.check(target)?;
        self.record(format!("select {} {value}", target.address));
        Ok(())
    }

    async fn scroll(&self, direction: ScrollDirection) -> Result<(), DriverError> {
        let mut page = self.page.lock().unwrap();
        page.calls.push(format!("scroll {}", direction.as_str()));
        match page.scroll_failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn go_back(&self) -> Result<(), DriverError> {
        self.record("go_back".to_string());
        Ok(())
    }

    async fn screenshot(&self, path: &Path) -> Result<(), DriverError> {
        self.record(format!("screenshot {}", path.display()));
        tokio::fs::write(path, b"\x89PNG")
            .await
            .map_err(|e| DriverError::Failed(e.to_string()))
    }

    async fn content(&self) -> Result<String, DriverError> {
        let page = self.page.lock().unwrap();
        Ok(format!("<html><title>{}</title></html>", page.title))
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        Ok(self.page.lock().unwrap().url.clone())
    }

    async fn title(&self) -> Result<String, DriverError> {
        Ok(self.page.lock().unwrap().title.clone())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        let mut page = self.page.lock().unwrap();
        if script.contains("webpilot:distill") {
            let elements = Value::Array(page.elements.clone());
            return Ok(Value::String(elements.to_string()));
        }
        if script.contains("webpilot:captcha") {
            let visible = page.captcha_probes > 0;
            page.captcha_probes = page.captcha_probes.saturating_sub(1);
            return Ok(Value::Bool(visible));
        }
        Ok(Value::Null)
    }

    async fn close(&self) -> Result<(), DriverError> {
        let mut page = self.page.lock().unwrap();
        page.closed = true;
        page.calls.push("close".to_string());
        Ok(())
    }
}

/// Replays canned replies in order; the last one repeats forever.
#[derive(Clone)]
pub struct ScriptedModel {
    replies: Arc<Mutex<VecDeque<String>>>,
    seen: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedModel {
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into_iter().map(Into::into).collect())),
            seen: Arc::default(),
        }
    }

    /// Every message list the model was called with.
    pub fn seen(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReasoningModel for ScriptedModel {
    async fn chat(&self, messages: &[ChatMessage], _temperature: f32, _max_tokens: u32) -> Result<String, AgentError> {
        self.seen.lock().unwrap().push(messages.to_vec());
        let mut replies = self.replies.lock().unwrap();
        if replies.len() > 1 {
            return Ok(replies.pop_front().unwrap_or_default());
        }
        replies
            .front()
            .cloned()
            .ok_or_else(|| AgentError::Model("no scripted reply".into()))
    }
}

/// A model endpoint that never answers: every call is a network failure.
#[derive(Clone, Default)]
pub struct UnreachableModel {
    calls: Arc<AtomicUsize>,
}

impl UnreachableModel {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningModel for UnreachableModel {
    async fn chat(&self, _messages: &[ChatMessage], _temperature: f32, _max_tokens: u32) -> Result<String, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::Network("connection refused".into()))
    }
}

/// A model call that hangs until the caller gives up on it.
#[derive(Clone, Default)]
pub struct StalledModel {
    started: Arc<AtomicUsize>,
}

impl StalledModel {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningModel for StalledModel {
    async fn chat(&self, _messages: &[ChatMessage], _temperature: f32, _max_tokens: u32) -> Result<String, AgentError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// Settings with every pause removed and output dirs under `dir`.
pub fn quiet_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.model.api_key = "sk-test-0123456789".into();
    settings.model.min_interval = Duration::ZERO;
    settings.agent.step_delay = Duration::ZERO;
    settings.agent.captcha_poll_interval = Duration::from_millis(10);
    settings.executor.backoff_base = Duration::from_millis(1);
    settings.executor.screenshot_dir = dir.join("screenshots");
    settings.executor.diagnostics_dir = dir.join("diagnostics");
    settings
}

pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
        .unwrap_or_default()
}
