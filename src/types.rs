use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Data the model saved with `store_context`, returned with the task result.
pub type ContextStore = BTreeMap<String, Value>;

/// One interactive element as the model sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementDescriptor {
    pub id: u32,
    pub tag: String,
    pub role: Option<String>,
    /// Short, already truncated label text.
    pub label: String,
    /// Selector the browser driver understands.
    pub address: String,
    pub visible: bool,
}

/// Id → element mapping for a single observation.
///
/// Ids mean nothing outside the generation that produced them. The
/// orchestrator replaces the registry wholesale on every observation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementRegistry {
    generation: u64,
    elements: BTreeMap<u32, ElementDescriptor>,
}

impl ElementRegistry {
    pub fn new(generation: u64, elements: impl IntoIterator<Item = ElementDescriptor>) -> Self {
        Self {
            generation,
            elements: elements.into_iter().map(|e| (e.id, e)).collect(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn resolve(&self, id: u32) -> Option<&ElementDescriptor> {
        self.elements.get(&id)
    }

    /// Elements in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ElementDescriptor> {
        self.elements.values()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A message in the conversation history sent to the LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Machine-readable failure codes carried by [`ActionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    InvalidElementId,
    InvalidUrl,
    BlockedProtocol,
    NavigationFailed,
    ElementNotFound,
    SelectorError,
    Timeout,
    BrowserError,
    ScreenshotFailed,
    NotFound,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What happened when the executor ran an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    /// Set when the action succeeded through a fallback the caller should know about.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl ActionResult {
    pub(crate) fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            error: None,
            warning: None,
        }
    }

    pub(crate) fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            error: Some(code),
            warning: None,
        }
    }

    pub(crate) fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub(crate) fn with_warning(mut self, warning: Option<String>) -> Self {
        self.warning = warning;
        self
    }
}

/// Tag explaining why a task ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    LoopDetected,
    MaxStepsExceeded,
    CriticalError,
    InterventionDeclined,
    Cancelled,
}

/// Final outcome of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub summary: String,
    pub steps_taken: usize,
    pub elapsed_secs: f64,
    pub final_url: Option<String>,
    pub error: Option<FailureReason>,
    pub context: ContextStore,
}

pub const DEFAULT_MAX_STEPS: usize = 50;
pub const DEFAULT_MAX_ELEMENTS: usize = 50;
pub const DEFAULT_MAX_LABEL_CHARS: usize = 80;
