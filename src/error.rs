//! Error taxonomy for the agent loop.
//!
//! Step-local failures (selector trouble, bad model output, transient network
//! issues) are turned into conversation messages by the orchestrator. Only
//! loop, captcha and critical signals change its control flow.

use thiserror::Error;

use crate::action::{ActionError, Tool};
use crate::types::FailureReason;

/// Top-level error type shared by the loop's collaborators.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Invalid or missing settings. Fatal, raised before the loop starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Transport-level failure talking to the model or the browser.
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// The model API answered, but with something we cannot retry past
    /// (authentication, malformed payload, refusal).
    #[error("model error: {0}")]
    Model(String),

    #[error(transparent)]
    Selector(#[from] DriverError),

    #[error("invalid element id {0}: it is not in the current observation, use an id from the fresh observation")]
    InvalidElementId(u32),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    LoopDetected(#[from] LoopDetected),

    #[error("captcha detected on {url}")]
    CaptchaDetected { url: String },

    /// Unrecoverable: diagnostics are captured and the task terminates.
    #[error("critical error: {0}")]
    Critical(String),

    #[error("task cancelled")]
    Cancelled,
}

impl AgentError {
    /// Network hiccups and timeouts are worth another attempt; nothing else is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Network(_) | AgentError::Timeout(_))
    }

    /// How a task that ends on this error is tagged in its result.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            AgentError::LoopDetected(_) => FailureReason::LoopDetected,
            AgentError::CaptchaDetected { .. } => FailureReason::InterventionDeclined,
            AgentError::Cancelled => FailureReason::Cancelled,
            _ => FailureReason::CriticalError,
        }
    }
}

/// Failures reported by a [`crate::driver::BrowserDriver`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    #[error("browser operation timed out: {0}")]
    Timeout(String),

    /// Flaky failure (detached node, navigation in flight). Retry.
    #[error("transient browser failure: {0}")]
    Transient(String),

    /// A strict lookup matched more than one live node.
    #[error("selector '{selector}' matched {matches} elements")]
    Ambiguous { selector: String, matches: usize },

    #[error("no element matches '{0}'")]
    NotFound(String),

    /// Anything the driver cannot recover from by retrying.
    #[error("browser operation failed: {0}")]
    Failed(String),
}

impl DriverError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Timeout(_) | DriverError::Transient(_) | DriverError::NotFound(_)
        )
    }
}

/// The model's reply held nothing we could turn into an action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty response from model")]
    Empty,

    #[error("no valid JSON found in model response: {excerpt}")]
    NoStructure { excerpt: String },
}

/// Raised by the loop guard when the agent stops making progress.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoopDetected {
    #[error("agent stuck: '{tool}' on target '{target}' failed {count} times in a row")]
    Repeated {
        tool: Tool,
        target: String,
        count: usize,
    },

    #[error("agent stuck: last {count} actions all failed ({tools})")]
    Thrashing { count: usize, tools: String },
}

/// Why the interpreter could not hand back an action.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InterpretError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Structure was recovered but failed per-tool validation.
    #[error(transparent)]
    Invalid(#[from] ActionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_errors_map_to_failure_reasons() {
        let stuck = AgentError::from(LoopDetected::Thrashing {
            count: 5,
            tools: "click_element".into(),
        });
        assert_eq!(stuck.failure_reason(), FailureReason::LoopDetected);
        assert_eq!(AgentError::Cancelled.failure_reason(), FailureReason::Cancelled);
        assert_eq!(
            AgentError::Critical("browser gone".into()).failure_reason(),
            FailureReason::CriticalError
        );
    }

    #[test]
    fn wrapped_errors_keep_their_message() {
        let selector = AgentError::from(DriverError::NotFound("#buy".into()));
        assert_eq!(selector.to_string(), "no element matches '#buy'");
        assert!(!selector.is_retryable());

        let parse = AgentError::from(ParseError::Empty);
        assert_eq!(parse.to_string(), "empty response from model");
        assert!(AgentError::InvalidElementId(9).to_string().contains("fresh observation"));
    }
}
