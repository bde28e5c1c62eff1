//! The Observe → Think → Act loop for one task.
//!
//! An [`Orchestrator`] owns everything a task mutates: the element registry
//! (inside the current [`Observation`]), the conversation, the loop guard
//! history and the stored context. The only suspension points are browser
//! operations, model calls and deliberate pauses, all awaited while holding
//! `&mut self`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::action::{Action, ActionError, Command, Tool};
use crate::brain::{ReasoningModel, system_prompt};
use crate::config::{LoopPolicy, Settings};
use crate::conversation::Conversation;
use crate::dom::{Distiller, Observation, detect_captcha};
use crate::driver::BrowserDriver;
use crate::error::{AgentError, InterpretError, LoopDetected};
use crate::events::AgentEvent;
use crate::executor::Executor;
use crate::guard::{HistoryRecord, LoopGuard};
use crate::interpreter;
use crate::throttle::RateLimiter;
use crate::types::{ActionResult, ChatMessage, ContextStore, FailureReason, Role, TaskResult};

const MODEL_BACKOFF_BASE: Duration = Duration::from_secs(2);
const MODEL_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// A human's answer when the agent asks for help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Resume,
    Abort,
}

/// Whoever can unstick a paused task.
#[async_trait]
pub trait Intervention: Send + Sync {
    /// The loop guard fired under [`LoopPolicy::Intervene`]. `Resume` clears
    /// the guard history and continues.
    async fn on_loop(&self, detected: &LoopDetected) -> Decision;

    /// A captcha is on screen. After `Resume` the orchestrator polls until
    /// it is gone or the captcha timeout runs out.
    async fn on_captcha(&self, _url: &str) -> Decision {
        Decision::Resume
    }
}

/// Nobody is watching: loops abort, captchas are waited out.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unattended;

#[async_trait]
impl Intervention for Unattended {
    async fn on_loop(&self, _detected: &LoopDetected) -> Decision {
        Decision::Abort
    }
}

enum Outcome {
    Done(String),
    Failed(FailureReason, String),
    Cancelled,
}

impl Outcome {
    fn failed(error: AgentError) -> Self {
        Outcome::Failed(error.failure_reason(), error.to_string())
    }
}

enum Thought {
    Act(Action),
    Rejected(ActionError),
    Skip,
}

pub struct Orchestrator<D, M> {
    driver: D,
    model: M,
    settings: Settings,
    distiller: Distiller,
    observation: Observation,
    conversation: Conversation,
    guard: LoopGuard,
    limiter: RateLimiter,
    context: ContextStore,
    steps: usize,
    events: Option<broadcast::Sender<AgentEvent>>,
    intervention: Box<dyn Intervention>,
}

impl<D, M> Orchestrator<D, M>
where
    D: BrowserDriver,
    M: ReasoningModel,
{
    pub fn new(driver: D, model: M, settings: Settings) -> Self {
        Self {
            distiller: Distiller::new(settings.distill.clone()),
            observation: Observation::default(),
            conversation: Conversation::new(String::new(), settings.agent.conversation_capacity),
            guard: LoopGuard::new(settings.agent.repeat_window, settings.agent.thrash_window),
            limiter: RateLimiter::new(settings.model.min_interval),
            context: ContextStore::new(),
            steps: 0,
            events: None,
            intervention: Box::new(Unattended),
            driver,
            model,
            settings,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_intervention(mut self, intervention: impl Intervention + 'static) -> Self {
        self.intervention = Box::new(intervention);
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Messages the next model call would see, system prompt first.
    pub fn conversation(&self) -> Vec<ChatMessage> {
        self.conversation.window(usize::MAX)
    }

    /// Run one task to completion. Never panics, never returns an error:
    /// every way of ending is described by the returned [`TaskResult`].
    pub async fn run(&mut self, task: &str, start_url: Option<&str>, cancel: CancellationToken) -> TaskResult {
        let span = tracing::info_span!("task", task = %excerpt(task, 80));
        self.run_task(task, start_url, cancel).instrument(span).await
    }

    async fn run_task(&mut self, task: &str, start_url: Option<&str>, cancel: CancellationToken) -> TaskResult {
        let started = Instant::now();
        self.reset(task);
        tracing::info!(max_steps = self.settings.agent.max_steps, "task started");
        self.emit(AgentEvent::TaskStarted { task: task.to_string() });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            outcome = self.drive(start_url) => outcome,
        };

        let final_url = self.driver.current_url().await.ok();
        if matches!(outcome, Outcome::Cancelled) {
            tracing::warn!(steps = self.steps, "task cancelled");
            self.observation = Observation::default();
            if let Err(e) = self.driver.close().await {
                tracing::warn!(error = %e, "browser teardown failed");
            }
        }

        let (success, summary, error) = match outcome {
            Outcome::Done(summary) => (true, summary, None),
            Outcome::Failed(reason, summary) => (false, summary, Some(reason)),
            Outcome::Cancelled => {
                let error = AgentError::Cancelled;
                (false, error.to_string(), Some(error.failure_reason()))
            }
        };

        let result = TaskResult {
            success,
            summary,
            steps_taken: self.steps,
            elapsed_secs: started.elapsed().as_secs_f64(),
            final_url,
            error,
            context: self.context.clone(),
        };

        if result.success {
            tracing::info!(steps = result.steps_taken, summary = %result.summary, "task complete");
            self.emit(AgentEvent::TaskComplete {
                summary: result.summary.clone(),
                steps: result.steps_taken,
            });
        } else {
            tracing::warn!(steps = result.steps_taken, reason = ?result.error, summary = %result.summary, "task failed");
            self.emit(AgentEvent::TaskError {
                message: result.summary.clone(),
                reason: result.error,
            });
        }
        result
    }

    fn reset(&mut self, task: &str) {
        self.conversation = Conversation::new(system_prompt(task), self.settings.agent.conversation_capacity);
        self.observation = Observation::default();
        self.guard.reset();
        self.context.clear();
        self.steps = 0;
    }

    async fn drive(&mut self, start_url: Option<&str>) -> Outcome {
        if let Some(url) = start_url {
            let open = Action::new("open the start page", Command::Navigate { url: url.to_string() });
            let result = Executor::new(&self.driver, &self.settings.executor)
                .execute(&open, &self.observation, &mut self.context)
                .await;
            if !result.success {
                tracing::warn!(url, message = %result.message, "start page failed to load");
                self.conversation.push(ChatMessage::user(format!(
                    "Opening the start page failed: {}",
                    result.message
                )));
            }
        }

        let max_steps = self.settings.agent.max_steps;
        loop {
            if self.steps >= max_steps {
                return Outcome::Failed(
                    FailureReason::MaxStepsExceeded,
                    format!("max steps exceeded ({max_steps})"),
                );
            }

            // Observe
            self.observation = match self.observe().await {
                Ok(observation) => observation,
                Err(e) => return self.critical(e).await,
            };
            if detect_captcha(&self.driver).await {
                match self.await_captcha().await {
                    Ok(()) => continue,
                    Err(outcome) => return outcome,
                }
            }
            self.conversation.push(ChatMessage::user(format!(
                "Current page observation:\n{}",
                self.observation.summary
            )));

            // Think
            self.emit(AgentEvent::Thinking { step: self.steps + 1 });
            let action = match self.think().await {
                Ok(Thought::Act(action)) => action,
                Ok(Thought::Rejected(e)) => {
                    self.steps += 1;
                    tracing::warn!(step = self.steps, error = %e, "model proposed an invalid action");
                    self.emit(AgentEvent::StepError { message: e.to_string() });
                    self.conversation.push(ChatMessage::user(format!(
                        "Your last reply was rejected: {e}. Reply with one valid JSON action."
                    )));
                    self.pause().await;
                    continue;
                }
                Ok(Thought::Skip) => {
                    self.steps += 1;
                    self.pause().await;
                    continue;
                }
                Err(e) => return self.critical(e).await,
            };

            // Act
            self.steps += 1;
            let step = self.steps;
            let target = action.target(&self.observation.registry);
            let result = Executor::new(&self.driver, &self.settings.executor)
                .execute(&action, &self.observation, &mut self.context)
                .await;
            self.report_step(step, &action, &result);

            if let Command::Done { summary } = &action.command {
                return Outcome::Done(summary.clone());
            }

            self.conversation.push(ChatMessage::user(describe_result(action.tool(), &result)));

            let record = HistoryRecord::new(action.tool(), target, result.success);
            if let Err(detected) = self.guard.record(record) {
                tracing::warn!(step, %detected, "loop detected");
                match self.settings.agent.loop_policy {
                    LoopPolicy::Abort => return Outcome::failed(AgentError::from(detected)),
                    LoopPolicy::Intervene => {
                        self.emit(AgentEvent::Paused { reason: detected.to_string() });
                        match self.intervention.on_loop(&detected).await {
                            Decision::Resume => {
                                tracing::info!("resumed after intervention");
                                self.guard.reset();
                                self.emit(AgentEvent::Resumed);
                                self.conversation.push(ChatMessage::user(format!(
                                    "You were stuck ({detected}). A human reviewed the page; \
                                     try a different approach."
                                )));
                            }
                            Decision::Abort => {
                                return Outcome::Failed(
                                    FailureReason::InterventionDeclined,
                                    format!("Loop detected and intervention declined: {detected}"),
                                );
                            }
                        }
                    }
                }
            }

            self.pause().await;
        }
    }

    /// Distill the page, retrying transient failures like any other browser call.
    async fn observe(&mut self) -> Result<Observation, AgentError> {
        let attempts = self.settings.executor.max_attempts.max(1);
        let limit = self.settings.executor.action_timeout;
        let mut attempt = 1;
        loop {
            let distilled = match tokio::time::timeout(limit, self.distiller.distill(&self.driver)).await {
                Ok(distilled) => distilled,
                Err(_) => Err(crate::error::DriverError::Timeout("page distillation".into())),
            };
            match distilled {
                Ok(observation) => return Ok(observation),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.settings.executor.backoff_base * 2u32.pow(attempt - 1);
                    tracing::debug!(attempt, error = %e, "observation failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(AgentError::Critical(format!("cannot observe the page: {e}"))),
            }
        }
    }

    async fn think(&mut self) -> Result<Thought, AgentError> {
        let window = self.conversation.window(self.settings.agent.history_window);
        let Some(raw) = self.ask_model(&window).await? else {
            return Ok(Thought::Skip);
        };

        match interpreter::parse(&raw) {
            Ok(action) => return Ok(self.accept(action)),
            Err(InterpretError::Invalid(e)) => return Ok(Thought::Rejected(e)),
            Err(InterpretError::Parse(e)) => {
                tracing::warn!(error = %e, "unparseable model reply, retrying with a shorter context");
            }
        }

        // The observation is the usual culprit for truncated replies: swap it
        // for a short status line and ask again with a tiny window.
        if self.conversation.last().is_some_and(|m| m.role == Role::User) {
            self.conversation.pop();
        }
        self.conversation.push(ChatMessage::user(format!(
            "Current URL: {}\nContext so far: {} items stored\n\
             Please continue with a simple action (navigate, click_element, type_text, or done).",
            self.observation.url,
            self.context.len()
        )));

        let window = self.conversation.window(self.settings.agent.retry_window);
        let Some(raw) = self.ask_model(&window).await? else {
            return Ok(Thought::Skip);
        };
        match interpreter::parse(&raw) {
            Ok(action) => Ok(self.accept(action)),
            Err(InterpretError::Invalid(e)) => Ok(Thought::Rejected(e)),
            Err(InterpretError::Parse(e)) => {
                let error = AgentError::from(e);
                tracing::warn!(%error, "model reply unparseable twice, skipping step");
                self.emit(AgentEvent::StepError { message: error.to_string() });
                self.conversation.push(ChatMessage::user(
                    "Error: unable to parse your action. Continuing with a fresh observation.",
                ));
                Ok(Thought::Skip)
            }
        }
    }

    fn accept(&mut self, action: Action) -> Thought {
        let reply = serde_json::to_string(&action.to_wire()).unwrap_or_default();
        self.conversation.push(ChatMessage::assistant(reply));
        Thought::Act(action)
    }

    /// Rate-limited model call with retries for transport failures.
    ///
    /// `Ok(None)` means the model answered with an error that only spoils
    /// this step; it is noted in the conversation. Exhausted retries are
    /// critical.
    async fn ask_model(&mut self, messages: &[ChatMessage]) -> Result<Option<String>, AgentError> {
        let config = &self.settings.model;
        let attempts = config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            self.limiter.acquire().await;
            let call = self.model.chat(messages, config.temperature, config.max_tokens);
            let reply = match tokio::time::timeout(config.http_timeout, call).await {
                Ok(reply) => reply,
                Err(_) => Err(AgentError::Timeout("model call".into())),
            };
            match reply {
                Ok(text) => return Ok(Some(text)),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = (MODEL_BACKOFF_BASE * 2u32.pow(attempt - 1)).min(MODEL_BACKOFF_MAX);
                    tracing::warn!(attempt, error = %e, "model call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(AgentError::Critical(format!(
                        "model unreachable after {attempts} attempts: {e}"
                    )));
                }
                Err(AgentError::Model(message)) => {
                    tracing::warn!(%message, "model error, skipping step");
                    self.emit(AgentEvent::StepError { message: message.clone() });
                    self.conversation.push(ChatMessage::user(format!(
                        "Error: {message}. Continuing to next step."
                    )));
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn await_captcha(&mut self) -> Result<(), Outcome> {
        let url = self.observation.url.clone();
        tracing::warn!(%url, "captcha detected, waiting for a human");
        self.emit(AgentEvent::Paused {
            reason: AgentError::CaptchaDetected { url: url.clone() }.to_string(),
        });

        if self.intervention.on_captcha(&url).await == Decision::Abort {
            return Err(Outcome::Failed(
                FailureReason::InterventionDeclined,
                format!("captcha on {url} was not resolved"),
            ));
        }

        let deadline = Instant::now() + self.settings.agent.captcha_timeout;
        while detect_captcha(&self.driver).await {
            if Instant::now() >= deadline {
                return Err(Outcome::Failed(
                    FailureReason::InterventionDeclined,
                    format!(
                        "captcha on {url} was not solved within {}s",
                        self.settings.agent.captcha_timeout.as_secs()
                    ),
                ));
            }
            tokio::time::sleep(self.settings.agent.captcha_poll_interval).await;
        }

        tracing::info!("captcha cleared, resuming");
        self.emit(AgentEvent::Resumed);
        Ok(())
    }

    async fn critical(&mut self, error: AgentError) -> Outcome {
        tracing::error!(%error, "unrecoverable error");
        Executor::new(&self.driver, &self.settings.executor)
            .capture_diagnostics("critical")
            .await;
        Outcome::failed(error)
    }

    /// Jittered pause between steps: `step_delay` scaled by U[0.5, 1.5).
    async fn pause(&self) {
        let base = self.settings.agent.step_delay;
        if base.is_zero() {
            return;
        }
        let factor = 0.5 + rand::random::<f64>();
        tokio::time::sleep(base.mul_f64(factor)).await;
    }

    fn report_step(&self, step: usize, action: &Action, result: &ActionResult) {
        if result.success {
            tracing::info!(step, tool = %action.tool(), message = %result.message, "step succeeded");
        } else {
            tracing::warn!(step, tool = %action.tool(), error = ?result.error, message = %result.message, "step failed");
        }
        if let Some(warning) = &result.warning {
            tracing::warn!(step, %warning, "step completed with a warning");
        }

        let description = if action.thought.is_empty() {
            format!("{} {}", action.tool(), action.args())
        } else {
            action.thought.clone()
        };
        self.emit(AgentEvent::Step {
            number: step,
            tool: action.tool().to_string(),
            description,
            success: result.success,
            message: result.message.clone(),
            warning: result.warning.clone(),
        });
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

fn describe_result(tool: Tool, result: &ActionResult) -> String {
    let mut text = if result.success {
        format!("Result of {tool}: OK: {}", result.message)
    } else {
        let code = result.error.map(|c| format!(" [{c}]")).unwrap_or_default();
        format!("Result of {tool}: FAILED{code}: {}", result.message)
    };
    if let Some(warning) = &result.warning {
        text.push_str(&format!("\nWarning: {warning}"));
    }
    text
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push('…');
    }
    out
}
