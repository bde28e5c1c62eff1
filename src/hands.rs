//! [`BrowserDriver`] over a real Chrome via `headless_chrome`.
//!
//! `headless_chrome` is synchronous, so every call runs on the blocking pool
//! with its own handle to the tab.

use std::ffi::OsStr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::{Value, json};

use crate::action::ScrollDirection;
use crate::config::BrowserConfig;
use crate::driver::{BrowserDriver, Target};
use crate::error::DriverError;

const SETTLE_AFTER_CLICK: Duration = Duration::from_millis(500);
const SETTLE_AFTER_BACK: Duration = Duration::from_millis(1000);

/// One Chrome process (launched or attached) and the tab the agent drives.
pub struct ChromeDriver {
    browser: Browser,
    tab: Mutex<Arc<Tab>>,
}

impl ChromeDriver {
    /// Attach to `debug_url` when configured, otherwise launch Chrome.
    /// Blocking: call it from `spawn_blocking`.
    pub fn launch(config: &BrowserConfig) -> Result<Self, DriverError> {
        if let Some(url) = &config.debug_url {
            tracing::info!(%url, "attaching to running Chrome");
            let browser = Browser::connect(url.clone()).map_err(|e| launch_error("attach", e))?;
            let existing = browser
                .get_tabs()
                .lock()
                .map_err(|_| DriverError::Failed("tab list lock poisoned".into()))?
                .first()
                .cloned();
            let tab = match existing {
                Some(tab) => tab,
                None => browser.new_tab().map_err(|e| launch_error("new tab", e))?,
            };
            return Ok(Self {
                browser,
                tab: Mutex::new(tab),
            });
        }

        let mut args = vec![
            OsStr::new("--no-first-run"),
            OsStr::new("--no-default-browser-check"),
            OsStr::new("--disable-blink-features=AutomationControlled"),
            OsStr::new("--disable-infobars"),
            OsStr::new("--password-store=basic"),
        ];
        if config.headless {
            args.push(OsStr::new("--window-size=1366,900"));
        }

        let options = LaunchOptions {
            headless: config.headless,
            path: config.chrome_path.clone(),
            user_data_dir: config.user_data_dir.clone(),
            args,
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };

        tracing::info!(headless = config.headless, "launching Chrome");
        let browser = Browser::new(options).map_err(|e| launch_error("launch", e))?;
        let tab = browser.new_tab().map_err(|e| launch_error("new tab", e))?;
        Ok(Self {
            browser,
            tab: Mutex::new(tab),
        })
    }

    /// Switch to a fresh tab; later calls drive the new one.
    pub fn new_tab(&self) -> Result<(), DriverError> {
        let tab = self.browser.new_tab().map_err(classify)?;
        *self
            .tab
            .lock()
            .map_err(|_| DriverError::Failed("tab lock poisoned".into()))? = tab;
        Ok(())
    }

    fn tab(&self) -> Result<Arc<Tab>, DriverError> {
        self.tab
            .lock()
            .map(|tab| Arc::clone(&tab))
            .map_err(|_| DriverError::Failed("tab lock poisoned".into()))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, DriverError>
    where
        F: FnOnce(&Tab) -> Result<T, DriverError> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab()?;
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| DriverError::Failed(format!("browser task panicked: {e}")))?
    }
}

fn launch_error(what: &str, e: impl std::fmt::Display) -> DriverError {
    DriverError::Failed(format!("Chrome {what} failed: {e}"))
}

/// `headless_chrome` reports everything as `anyhow::Error`; sort by message.
fn classify(e: impl std::fmt::Display) -> DriverError {
    let message = e.to_string();
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        DriverError::Timeout(message)
    } else if lower.contains("no element") || lower.contains("could not find node") {
        DriverError::NotFound(message)
    } else if lower.contains("detached")
        || lower.contains("navigat")
        || lower.contains("context was destroyed")
        || lower.contains("not interactable")
    {
        DriverError::Transient(message)
    } else {
        DriverError::Failed(message)
    }
}

/// Count live matches and enforce the target's strictness.
fn check_matches(tab: &Tab, target: &Target) -> Result<(), DriverError> {
    let script = format!(
        "document.querySelectorAll({}).length",
        json!(target.address)
    );
    let count = tab
        .evaluate(&script, false)
        .map_err(classify)?
        .value
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;
    match count {
        0 => Err(DriverError::NotFound(target.address.clone())),
        1 => Ok(()),
        matches if target.is_strict() => Err(DriverError::Ambiguous {
            selector: target.address.clone(),
            matches,
        }),
        _ => Ok(()),
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&url)
                .and_then(|tab| tab.wait_until_navigated())
                .map_err(classify)?;
            Ok(())
        })
        .await
    }

    async fn click(&self, target: &Target) -> Result<(), DriverError> {
        let target = target.clone();
        self.blocking(move |tab| {
            check_matches(tab, &target)?;
            let element = tab.find_element(&target.address).map_err(classify)?;
            element.scroll_into_view().map_err(classify)?;
            element.click().map_err(classify)?;
            std::thread::sleep(SETTLE_AFTER_CLICK);
            Ok(())
        })
        .await
    }

    async fn type_text(&self, target: &Target, text: &str) -> Result<(), DriverError> {
        let target = target.clone();
        let text = text.to_string();
        self.blocking(move |tab| {
            check_matches(tab, &target)?;
            let element = tab.find_element(&target.address).map_err(classify)?;
            element.click().map_err(classify)?;
            element
                .call_js_fn("function() { this.value = ''; }", vec![], false)
                .map_err(classify)?;
            tab.type_str(&text).map_err(classify)?;
            Ok(())
        })
        .await
    }

    async fn press_key(&self, key: &str) -> Result<(), DriverError> {
        let key = key.to_string();
        self.blocking(move |tab| {
            tab.press_key(&key).map_err(classify)?;
            Ok(())
        })
        .await
    }

    async fn select(&self, target: &Target, value: &str) -> Result<(), DriverError> {
        let target = target.clone();
        let value = value.to_string();
        self.blocking(move |tab| {
            check_matches(tab, &target)?;
            let element = tab.find_element(&target.address).map_err(classify)?;
            let selected = element
                .call_js_fn(
                    r#"function(v) {
                        const opt = Array.from(this.options || [])
                            .find(o => o.value === v || o.text.trim() === v);
                        if (!opt) return false;
                        this.value = opt.value;
                        this.dispatchEvent(new Event('input', { bubbles: true }));
                        this.dispatchEvent(new Event('change', { bubbles: true }));
                        return true;
                    }"#,
                    vec![Value::String(value.clone())],
                    false,
                )
                .map_err(classify)?
                .value
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if selected {
                Ok(())
            } else {
                Err(DriverError::Failed(format!("no option '{value}' in {}", target.address)))
            }
        })
        .await
    }

    async fn scroll(&self, direction: ScrollDirection) -> Result<(), DriverError> {
        let script = match direction {
            ScrollDirection::Down => "window.scrollBy(0, window.innerHeight)",
            ScrollDirection::Up => "window.scrollBy(0, -window.innerHeight)",
        };
        self.evaluate(script).await.map(|_| ())
    }

    async fn go_back(&self) -> Result<(), DriverError> {
        self.blocking(|tab| {
            tab.evaluate("window.history.back()", false).map_err(classify)?;
            std::thread::sleep(SETTLE_AFTER_BACK);
            Ok(())
        })
        .await
    }

    async fn screenshot(&self, path: &Path) -> Result<(), DriverError> {
        let png = self
            .blocking(|tab| {
                tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                    .map_err(classify)
            })
            .await?;
        tokio::fs::write(path, png)
            .await
            .map_err(|e| DriverError::Failed(format!("cannot write {}: {e}", path.display())))
    }

    async fn content(&self) -> Result<String, DriverError> {
        self.blocking(|tab| tab.get_content().map_err(classify)).await
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        self.blocking(|tab| Ok(tab.get_url())).await
    }

    async fn title(&self) -> Result<String, DriverError> {
        self.blocking(|tab| tab.get_title().map_err(classify)).await
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        let script = script.to_string();
        self.blocking(move |tab| {
            let result = tab.evaluate(&script, false).map_err(classify)?;
            Ok(result.value.unwrap_or(Value::Null))
        })
        .await
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.blocking(|tab| tab.close(true).map(|_| ()).map_err(classify))
            .await
    }
}
