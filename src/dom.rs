//! Page → observation text plus a fresh element registry.

use serde::Deserialize;
use serde_json::Value;

use crate::config::DistillConfig;
use crate::driver::BrowserDriver;
use crate::error::DriverError;
use crate::types::{ElementDescriptor, ElementRegistry};

/// JavaScript injected into the page to enumerate interactive elements.
///
/// The script:
///   1. Clears `data-agent-id` markers left by the previous observation.
///   2. Collects native controls, interactive ARIA roles and `[onclick]` nodes
///      in document order.
///   3. Drops anything without a layout box, hidden by computed style, or
///      inside an `aria-hidden` subtree.
///   4. Picks an address per element: unique `id` → unique `aria-label` →
///      unique form `name` → an injected `data-agent-id` marker keyed by the
///      element's document index (so unchanged pages get the same markers).
///   5. Returns the raw fields as a JSON string; ranking happens in Rust.
const DISTILL_JS: &str = r#"/* webpilot:distill */
(() => {
  const MARKER = 'data-agent-id';
  const SELECTORS = [
    'a[href]', 'button', 'input:not([type="hidden"])', 'select', 'textarea', 'summary',
    '[role="button"]', '[role="link"]', '[role="checkbox"]', '[role="radio"]',
    '[role="menuitem"]', '[role="tab"]', '[role="option"]', '[role="switch"]',
    '[role="combobox"]', '[role="textbox"]', '[onclick]', '[contenteditable="true"]'
  ];
  document.querySelectorAll('[' + MARKER + ']').forEach(el => el.removeAttribute(MARKER));

  const unique = sel => {
    try { return document.querySelectorAll(sel).length === 1; } catch (e) { return false; }
  };
  const quote = v => '"' + String(v).replace(/\\/g, '\\\\').replace(/"/g, '\\"') + '"';
  const out = [];

  document.querySelectorAll(SELECTORS.join(',')).forEach((el, index) => {
    const rect = el.getBoundingClientRect();
    const style = window.getComputedStyle(el);
    const visible = rect.width > 0 && rect.height > 0
      && style.display !== 'none'
      && style.visibility !== 'hidden' && style.visibility !== 'collapse'
      && style.opacity !== '0'
      && !el.closest('[aria-hidden="true"]');
    if (!visible) return;

    const tag = el.tagName.toLowerCase();
    const aria = el.getAttribute('aria-label');
    const name = el.getAttribute('name');
    let address = null;
    if (el.id && unique('#' + CSS.escape(el.id))) {
      address = '#' + CSS.escape(el.id);
    } else if (aria && unique(tag + '[aria-label=' + quote(aria) + ']')) {
      address = tag + '[aria-label=' + quote(aria) + ']';
    } else if (name && unique(tag + '[name=' + quote(name) + ']')) {
      address = tag + '[name=' + quote(name) + ']';
    } else {
      el.setAttribute(MARKER, String(index));
      address = '[' + MARKER + '="' + index + '"]';
    }

    let text = '';
    if (tag === 'select') {
      text = Array.from(el.options).map(o => o.text.trim()).filter(Boolean).slice(0, 8).join(' | ');
    } else {
      text = el.innerText || el.textContent || '';
    }

    out.push({
      index: index,
      tag: tag,
      role: el.getAttribute('role'),
      input_type: tag === 'input' ? (el.type || 'text') : null,
      text: text.slice(0, 500),
      value: (tag === 'input' || tag === 'textarea') && typeof el.value === 'string' ? el.value : null,
      placeholder: el.getAttribute('placeholder'),
      aria_label: aria,
      title: el.getAttribute('title'),
      y: rect.top + window.scrollY,
      address: address,
      visible: true
    });
  });

  return JSON.stringify(out);
})()
"#;

const CAPTCHA_JS: &str = r#"/* webpilot:captcha */
(() => Boolean(
  document.querySelector("iframe[src*='recaptcha']") ||
  document.querySelector("iframe[src*='hcaptcha']") ||
  document.querySelector('div.h-captcha, div.g-recaptcha, .cf-turnstile, #challenge-form')
))()
"#;

/// Raw element as reported by the injected script.
#[derive(Debug, Clone, Deserialize)]
pub struct RawElement {
    pub index: usize,
    pub tag: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub input_type: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub aria_label: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub y: f64,
    pub address: String,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

/// One observation cycle: what the model reads plus the ids it may use.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub url: String,
    pub title: String,
    pub summary: String,
    pub registry: ElementRegistry,
    /// Visible candidates before the element cap was applied.
    pub total_candidates: usize,
}

/// Produces observations. Each call opens a new registry generation.
#[derive(Debug)]
pub struct Distiller {
    config: DistillConfig,
    generation: u64,
}

impl Distiller {
    pub fn new(config: DistillConfig) -> Self {
        Self {
            config,
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn distill<D>(&mut self, driver: &D) -> Result<Observation, DriverError>
    where
        D: BrowserDriver + ?Sized,
    {
        let raw = decode_elements(driver.evaluate(DISTILL_JS).await?)?;
        let url = driver.current_url().await?;
        let title = driver.title().await.unwrap_or_default();

        self.generation += 1;
        let total_candidates = raw.iter().filter(|e| e.visible).count();
        let elements = rank(raw, &self.config);
        let registry = ElementRegistry::new(self.generation, elements);
        let summary = render_summary(&url, &title, &registry, total_candidates);

        tracing::debug!(
            generation = self.generation,
            shown = registry.len(),
            total = total_candidates,
            "page distilled"
        );

        Ok(Observation {
            url,
            title,
            summary,
            registry,
            total_candidates,
        })
    }
}

/// True when the page shows a known captcha widget. Script errors count as "no".
pub async fn detect_captcha<D>(driver: &D) -> bool
where
    D: BrowserDriver + ?Sized,
{
    match driver.evaluate(CAPTCHA_JS).await {
        Ok(value) => value.as_bool().unwrap_or(false),
        Err(e) => {
            tracing::debug!(error = %e, "captcha probe failed");
            false
        }
    }
}

fn decode_elements(value: Value) -> Result<Vec<RawElement>, DriverError> {
    let decoded = match value {
        Value::String(json) => serde_json::from_str(&json),
        Value::Null => return Ok(Vec::new()),
        other => serde_json::from_value(other),
    };
    decoded.map_err(|e| DriverError::Failed(format!("unreadable distill output: {e}")))
}

/// Controls beat links, links beat generic clickables; a readable label adds weight.
fn priority(raw: &RawElement, label: &str) -> u32 {
    let role = raw.role.as_deref().unwrap_or_default();
    let kind = match raw.tag.as_str() {
        "input" | "textarea" | "select" | "button" => 3,
        _ if matches!(
            role,
            "button" | "checkbox" | "radio" | "switch" | "combobox" | "textbox" | "tab" | "menuitem" | "option"
        ) =>
        {
            3
        }
        "a" => 2,
        _ if role == "link" => 2,
        _ => 1,
    };
    kind * 2 + u32::from(!label.is_empty())
}

/// Apply visibility, the element cap and id assignment.
///
/// The cap keeps the highest-priority elements (document order breaks ties);
/// the survivors get ids 1.. in reading order (page y, then document order).
pub fn rank(raw: Vec<RawElement>, config: &DistillConfig) -> Vec<ElementDescriptor> {
    let mut scored: Vec<(u32, String, RawElement)> = raw
        .into_iter()
        .filter(|e| e.visible)
        .map(|e| {
            let label = label_for(&e, config.max_label_chars);
            (priority(&e, &label), label, e)
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.2.index.cmp(&b.2.index)));
    scored.truncate(config.max_elements);
    scored.sort_by(|a, b| a.2.y.total_cmp(&b.2.y).then(a.2.index.cmp(&b.2.index)));

    scored
        .into_iter()
        .zip(1u32..)
        .map(|((_, label, e), id)| ElementDescriptor {
            id,
            tag: e.tag,
            role: e.role,
            label,
            address: e.address,
            visible: e.visible,
        })
        .collect()
}

fn label_for(e: &RawElement, max_chars: usize) -> String {
    let non_empty = |s: &Option<String>| {
        s.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let text = non_empty(&e.value)
        .or_else(|| non_empty(&e.placeholder).map(|p| format!("[placeholder: {p}]")))
        .or_else(|| non_empty(&e.aria_label))
        .or_else(|| non_empty(&e.title))
        .unwrap_or_else(|| e.text.clone());
    clip(&collapse_whitespace(&text), max_chars)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    clipped.push('…');
    clipped
}

pub fn render_summary(url: &str, title: &str, registry: &ElementRegistry, total: usize) -> String {
    let mut lines = vec![
        format!("URL: {url}"),
        format!("Title: {title}"),
        String::new(),
    ];

    if registry.is_empty() {
        lines.push("No interactive elements found.".to_string());
        return lines.join("\n");
    }

    lines.push(format!(
        "Interactive elements ({} shown of {}):",
        registry.len(),
        total
    ));
    for element in registry.iter() {
        let mut line = format!("[{}] {}", element.id, element.tag.to_uppercase());
        if let Some(role) = &element.role {
            line.push_str(&format!(" role={role}"));
        }
        if !element.label.is_empty() {
            line.push_str(&format!(" \"{}\"", element.label));
        }
        lines.push(line);
    }
    if total > registry.len() {
        lines.push(format!(
            "... {} more elements not shown (use scroll_page to see more)",
            total - registry.len()
        ));
    }
    lines.join("\n")
}
