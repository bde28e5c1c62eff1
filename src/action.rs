//! The closed tool set and the validated [`Action`] built from model output.
//!
//! The model names a tool with a free-form string. That string is mapped onto
//! [`Tool`] and its arguments onto the matching [`Command`] variant in one go:
//! either every required argument is present and well-typed, or construction
//! fails and nothing is executed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::types::ElementRegistry;

/// Every tool the model may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    Navigate,
    ClickElement,
    TypeText,
    SelectOption,
    ScrollPage,
    TakeScreenshot,
    Wait,
    GoBack,
    QueryDom,
    StoreContext,
    Done,
}

impl Tool {
    pub const ALL: [Tool; 11] = [
        Tool::Navigate,
        Tool::ClickElement,
        Tool::TypeText,
        Tool::SelectOption,
        Tool::ScrollPage,
        Tool::TakeScreenshot,
        Tool::Wait,
        Tool::GoBack,
        Tool::QueryDom,
        Tool::StoreContext,
        Tool::Done,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Tool::Navigate => "navigate",
            Tool::ClickElement => "click_element",
            Tool::TypeText => "type_text",
            Tool::SelectOption => "select_option",
            Tool::ScrollPage => "scroll_page",
            Tool::TakeScreenshot => "take_screenshot",
            Tool::Wait => "wait",
            Tool::GoBack => "go_back",
            Tool::QueryDom => "query_dom",
            Tool::StoreContext => "store_context",
            Tool::Done => "done",
        }
    }

    /// Tools that address an element from the current registry.
    pub fn is_element_addressed(self) -> bool {
        matches!(
            self,
            Tool::ClickElement | Tool::TypeText | Tool::SelectOption
        )
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tool {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Tool::ALL
            .into_iter()
            .find(|tool| tool.as_str() == name)
            .ok_or_else(|| ActionError::UnknownTool(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

impl ScrollDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
        }
    }
}

/// Validation failures when building an [`Action`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("action has no 'tool' field")]
    MissingTool,

    #[error("{tool} requires '{arg}' in args")]
    MissingArgument { tool: Tool, arg: &'static str },

    #[error("{tool}: '{arg}' must be {expected}")]
    InvalidArgument {
        tool: Tool,
        arg: &'static str,
        expected: &'static str,
    },

    #[error("{0}: args must be a JSON object")]
    ArgsNotObject(Tool),
}

/// Typed arguments, one shape per tool.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Navigate {
        url: String,
    },
    ClickElement {
        element_id: u32,
    },
    TypeText {
        element_id: u32,
        text: String,
        press_enter: bool,
    },
    SelectOption {
        element_id: u32,
        value: String,
    },
    ScrollPage {
        direction: ScrollDirection,
    },
    TakeScreenshot,
    Wait {
        seconds: f64,
    },
    GoBack,
    QueryDom {
        query: String,
    },
    StoreContext {
        items: BTreeMap<String, Value>,
    },
    Done {
        summary: String,
    },
}

impl Command {
    pub fn tool(&self) -> Tool {
        match self {
            Command::Navigate { .. } => Tool::Navigate,
            Command::ClickElement { .. } => Tool::ClickElement,
            Command::TypeText { .. } => Tool::TypeText,
            Command::SelectOption { .. } => Tool::SelectOption,
            Command::ScrollPage { .. } => Tool::ScrollPage,
            Command::TakeScreenshot => Tool::TakeScreenshot,
            Command::Wait { .. } => Tool::Wait,
            Command::GoBack => Tool::GoBack,
            Command::QueryDom { .. } => Tool::QueryDom,
            Command::StoreContext { .. } => Tool::StoreContext,
            Command::Done { .. } => Tool::Done,
        }
    }

    /// Canonical JSON arguments, as they go back into the conversation.
    pub fn args(&self) -> Value {
        match self {
            Command::Navigate { url } => json!({ "url": url }),
            Command::ClickElement { element_id } => json!({ "element_id": element_id }),
            Command::TypeText {
                element_id,
                text,
                press_enter,
            } => json!({ "element_id": element_id, "text": text, "press_enter": press_enter }),
            Command::SelectOption { element_id, value } => {
                json!({ "element_id": element_id, "value": value })
            }
            Command::ScrollPage { direction } => json!({ "direction": direction.as_str() }),
            Command::TakeScreenshot | Command::GoBack => json!({}),
            Command::Wait { seconds } => json!({ "seconds": seconds }),
            Command::QueryDom { query } => json!({ "query": query }),
            Command::StoreContext { items } => {
                Value::Object(items.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            }
            Command::Done { summary } => json!({ "summary": summary }),
        }
    }

    fn build(tool: Tool, args: &Map<String, Value>) -> Result<Self, ActionError> {
        let command = match tool {
            Tool::Navigate => Command::Navigate {
                url: required_str(tool, args, "url")?,
            },
            Tool::ClickElement => Command::ClickElement {
                element_id: element_id(tool, args)?,
            },
            Tool::TypeText => Command::TypeText {
                element_id: element_id(tool, args)?,
                text: required_str(tool, args, "text")?,
                press_enter: optional_bool(tool, args, "press_enter")?.unwrap_or(false),
            },
            Tool::SelectOption => Command::SelectOption {
                element_id: element_id(tool, args)?,
                value: required_str(tool, args, "value")?,
            },
            Tool::ScrollPage => {
                let raw = required_str(tool, args, "direction")?;
                let direction = match raw.to_ascii_lowercase().as_str() {
                    "up" => ScrollDirection::Up,
                    "down" => ScrollDirection::Down,
                    _ => {
                        return Err(ActionError::InvalidArgument {
                            tool,
                            arg: "direction",
                            expected: "'up' or 'down'",
                        });
                    }
                };
                Command::ScrollPage { direction }
            }
            Tool::TakeScreenshot => Command::TakeScreenshot,
            Tool::Wait => {
                let seconds = args
                    .get("seconds")
                    .ok_or(ActionError::MissingArgument {
                        tool,
                        arg: "seconds",
                    })?
                    .as_f64()
                    .ok_or(ActionError::InvalidArgument {
                        tool,
                        arg: "seconds",
                        expected: "a number",
                    })?;
                Command::Wait { seconds }
            }
            Tool::GoBack => Command::GoBack,
            Tool::QueryDom => Command::QueryDom {
                query: required_str(tool, args, "query")?,
            },
            Tool::StoreContext => Command::StoreContext {
                items: context_items(tool, args)?,
            },
            Tool::Done => Command::Done {
                summary: required_str(tool, args, "summary")?,
            },
        };
        Ok(command)
    }
}

/// One validated step requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    /// Free text, advisory only.
    pub thought: String,
    pub command: Command,
}

impl Action {
    pub fn new(thought: impl Into<String>, command: Command) -> Self {
        Self {
            thought: thought.into(),
            command,
        }
    }

    /// Build from untyped parts. `Null` args count as an empty object.
    pub fn from_parts(thought: impl Into<String>, tool: &str, args: &Value) -> Result<Self, ActionError> {
        let tool: Tool = tool.parse()?;
        let empty = Map::new();
        let args = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(ActionError::ArgsNotObject(tool)),
        };
        Ok(Self::new(thought, Command::build(tool, args)?))
    }

    /// Build from a wire object `{"thought", "tool", "args"}`.
    pub fn from_wire(value: &Value) -> Result<Self, ActionError> {
        let tool = value
            .get("tool")
            .and_then(Value::as_str)
            .ok_or(ActionError::MissingTool)?;
        let thought = value
            .get("thought")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let args = value.get("args").unwrap_or(&Value::Null);
        Self::from_parts(thought, tool, args)
    }

    pub fn tool(&self) -> Tool {
        self.command.tool()
    }

    pub fn args(&self) -> Value {
        self.command.args()
    }

    pub fn to_wire(&self) -> Value {
        json!({ "thought": self.thought, "tool": self.tool().as_str(), "args": self.args() })
    }

    pub fn element_id(&self) -> Option<u32> {
        match self.command {
            Command::ClickElement { element_id }
            | Command::TypeText { element_id, .. }
            | Command::SelectOption { element_id, .. } => Some(element_id),
            _ => None,
        }
    }

    /// Identity used by the loop guard.
    ///
    /// Element ids are re-issued every observation, so element-addressed
    /// actions key on the element's address and label instead. Ids that do
    /// not resolve key on the raw id.
    pub fn target(&self, registry: &ElementRegistry) -> String {
        if let Some(id) = self.element_id() {
            return match registry.resolve(id) {
                Some(element) => format!("{}|{}", element.address, element.label),
                None => format!("#{id}"),
            };
        }
        match &self.command {
            Command::Navigate { url } => url.clone(),
            Command::ScrollPage { direction } => direction.as_str().to_string(),
            Command::QueryDom { query } => query.clone(),
            _ => String::new(),
        }
    }
}

const RESERVED_CONTEXT_KEYS: [&str; 3] = ["tool", "thought", "reasoning"];

fn context_items(tool: Tool, args: &Map<String, Value>) -> Result<BTreeMap<String, Value>, ActionError> {
    // {"key": "name", "value": ...} form
    if let (Some(key), Some(value)) = (args.get("key"), args.get("value")) {
        let key = key
            .as_str()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(ActionError::InvalidArgument {
                tool,
                arg: "key",
                expected: "a non-empty string",
            })?;
        return Ok(BTreeMap::from([(key.to_string(), value.clone())]));
    }

    let items: BTreeMap<String, Value> = args
        .iter()
        .filter(|(key, _)| !key.trim().is_empty() && !RESERVED_CONTEXT_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.trim().to_string(), value.clone()))
        .collect();
    if items.is_empty() {
        return Err(ActionError::MissingArgument {
            tool,
            arg: "key/value",
        });
    }
    Ok(items)
}

fn required_str(tool: Tool, args: &Map<String, Value>, arg: &'static str) -> Result<String, ActionError> {
    let value = args
        .get(arg)
        .ok_or(ActionError::MissingArgument { tool, arg })?;
    let text = value.as_str().ok_or(ActionError::InvalidArgument {
        tool,
        arg,
        expected: "a string",
    })?;
    if text.trim().is_empty() {
        return Err(ActionError::MissingArgument { tool, arg });
    }
    Ok(text.to_string())
}

fn optional_bool(tool: Tool, args: &Map<String, Value>, arg: &'static str) -> Result<Option<bool>, ActionError> {
    match args.get(arg) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ActionError::InvalidArgument {
            tool,
            arg,
            expected: "a boolean",
        }),
    }
}

fn element_id(tool: Tool, args: &Map<String, Value>) -> Result<u32, ActionError> {
    let value = args.get("element_id").ok_or(ActionError::MissingArgument {
        tool,
        arg: "element_id",
    })?;
    value
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or(ActionError::InvalidArgument {
            tool,
            arg: "element_id",
            expected: "a non-negative integer",
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ElementDescriptor, ElementRegistry};

    #[test]
    fn builds_navigate() {
        let action = Action::from_parts("go", "navigate", &json!({"url": "https://example.com"})).unwrap();
        assert_eq!(action.tool(), Tool::Navigate);
        assert_eq!(
            action.command,
            Command::Navigate {
                url: "https://example.com".into()
            }
        );
    }

    #[test]
    fn unknown_tool_fails_validation() {
        let err = Action::from_parts("", "upload_file", &json!({})).unwrap_err();
        assert_eq!(err, ActionError::UnknownTool("upload_file".into()));
    }

    #[test]
    fn element_id_must_be_an_integer() {
        let err = Action::from_parts("", "click_element", &json!({"element_id": "7"})).unwrap_err();
        assert!(matches!(
            err,
            ActionError::InvalidArgument {
                arg: "element_id",
                ..
            }
        ));

        let err = Action::from_parts("", "click_element", &json!({})).unwrap_err();
        assert_eq!(
            err,
            ActionError::MissingArgument {
                tool: Tool::ClickElement,
                arg: "element_id"
            }
        );
    }

    #[test]
    fn type_text_requires_text_and_defaults_press_enter() {
        let err = Action::from_parts("", "type_text", &json!({"element_id": 3})).unwrap_err();
        assert_eq!(
            err,
            ActionError::MissingArgument {
                tool: Tool::TypeText,
                arg: "text"
            }
        );

        let action = Action::from_parts("", "type_text", &json!({"element_id": 3, "text": "rust"})).unwrap();
        assert_eq!(
            action.command,
            Command::TypeText {
                element_id: 3,
                text: "rust".into(),
                press_enter: false
            }
        );
    }

    #[test]
    fn scroll_direction_is_closed() {
        assert!(Action::from_parts("", "scroll_page", &json!({"direction": "Down"})).is_ok());
        let err = Action::from_parts("", "scroll_page", &json!({"direction": "left"})).unwrap_err();
        assert!(matches!(err, ActionError::InvalidArgument { arg: "direction", .. }));
    }

    #[test]
    fn wait_requires_numeric_seconds() {
        assert!(Action::from_parts("", "wait", &json!({"seconds": 2})).is_ok());
        assert!(Action::from_parts("", "wait", &json!({"seconds": 1.5})).is_ok());
        assert!(Action::from_parts("", "wait", &json!({"seconds": "2"})).is_err());
        assert!(Action::from_parts("", "wait", &json!({})).is_err());
    }

    #[test]
    fn store_context_accepts_both_shapes() {
        let single = Action::from_parts("", "store_context", &json!({"key": "price", "value": "42"})).unwrap();
        assert_eq!(
            single.command,
            Command::StoreContext {
                items: BTreeMap::from([("price".to_string(), json!("42"))])
            }
        );

        let multi = Action::from_parts(
            "",
            "store_context",
            &json!({"company": "Acme", "salary": 100, "thought": "ignored"}),
        )
        .unwrap();
        let Command::StoreContext { items } = multi.command else {
            panic!("expected store_context");
        };
        assert_eq!(items.len(), 2);
        assert!(!items.contains_key("thought"));

        assert!(Action::from_parts("", "store_context", &json!({})).is_err());
    }

    #[test]
    fn args_must_be_an_object() {
        let err = Action::from_parts("", "navigate", &json!(["https://x.com"])).unwrap_err();
        assert_eq!(err, ActionError::ArgsNotObject(Tool::Navigate));
        assert!(Action::from_parts("", "go_back", &Value::Null).is_ok());
    }

    #[test]
    fn target_uses_address_for_resolvable_elements() {
        let registry = ElementRegistry::new(
            1,
            vec![ElementDescriptor {
                id: 7,
                tag: "button".into(),
                role: None,
                label: "Search".into(),
                address: "#search-btn".into(),
                visible: true,
            }],
        );
        let click = Action::new("", Command::ClickElement { element_id: 7 });
        assert_eq!(click.target(&registry), "#search-btn|Search");

        let stale = Action::new("", Command::ClickElement { element_id: 9 });
        assert_eq!(stale.target(&registry), "#9");
    }

    #[test]
    fn wire_form_round_trips_tool_and_args() {
        let action = Action::from_wire(&json!({
            "thought": "search",
            "tool": "type_text",
            "args": {"element_id": 2, "text": "rust", "press_enter": true}
        }))
        .unwrap();
        assert_eq!(action.to_wire()["tool"], "type_text");
        assert_eq!(action.to_wire()["args"]["press_enter"], true);
        assert_eq!(action.thought, "search");
    }
}
