use serde::Serialize;

use crate::types::FailureReason;

/// Progress notifications published by the orchestrator.
///
/// Delivered over a `tokio::sync::broadcast` channel; a send with no
/// subscribers is not an error.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Ready,
    TaskStarted {
        task: String,
    },
    Thinking {
        step: usize,
    },
    Step {
        number: usize,
        tool: String,
        description: String,
        success: bool,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    StepError {
        message: String,
    },
    /// Waiting for a human (captcha or loop intervention).
    Paused {
        reason: String,
    },
    Resumed,
    TaskComplete {
        summary: String,
        steps: usize,
    },
    TaskError {
        message: String,
        reason: Option<FailureReason>,
    },
}

impl AgentEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Ready => "ready",
            AgentEvent::TaskStarted { .. } => "task_started",
            AgentEvent::Thinking { .. } => "thinking",
            AgentEvent::Step { .. } => "step",
            AgentEvent::StepError { .. } => "step_error",
            AgentEvent::Paused { .. } => "paused",
            AgentEvent::Resumed => "resumed",
            AgentEvent::TaskComplete { .. } => "task_complete",
            AgentEvent::TaskError { .. } => "task_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let event = AgentEvent::TaskError {
            message: "max steps exceeded".into(),
            reason: Some(FailureReason::MaxStepsExceeded),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_error");
        assert_eq!(json["reason"], "MaxStepsExceeded");
        assert_eq!(event.name(), "task_error");
    }
}
