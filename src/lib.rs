//! Drives a web browser toward a natural-language goal with an
//! Observe → Think → Act loop around a language model.

pub mod action;
pub mod brain;
pub mod config;
pub mod conversation;
pub mod dom;
pub mod driver;
pub mod error;
pub mod events;
pub mod executor;
pub mod guard;
pub mod hands;
pub mod interpreter;
pub mod orchestrator;
pub mod throttle;
pub mod types;

pub use action::{Action, Command, Tool};
pub use brain::{OpenAiClient, ReasoningModel};
pub use config::{LoopPolicy, Settings};
pub use driver::{BrowserDriver, Target};
pub use error::{AgentError, DriverError};
pub use events::AgentEvent;
pub use hands::ChromeDriver;
pub use orchestrator::{Decision, Intervention, Orchestrator, Unattended};
pub use types::{ActionResult, TaskResult};
