//! Progress events reported by a running task.
//!
//! An event is a flat record keyed by which optional field is populated.
//! Every event carries the id of the run that produced it, so a client
//! following a whole thread can tell concurrent runs apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tool invocation announced by the task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arguments: String,
}

/// Partial tool input streamed while a call is being prepared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInput {
    pub content: String,
}

/// Marker for a named step of a multi-step task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// A request for user input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "runID", default, skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<ToolInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Prompt>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub run_complete: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replay_complete: bool,
}

/// Which part of a `ProgressEvent` is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Input,
    ToolCall,
    ToolInput,
    Step,
    Prompt,
    Error,
    RunComplete,
    ReplayComplete,
    Content,
    Empty,
}

impl ProgressEvent {
    pub fn content(run_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn input(run_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn error(run_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn run_complete(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            run_complete: true,
            ..Default::default()
        }
    }

    /// Marks the end of history replay on a followed stream.
    pub fn replay_complete() -> Self {
        Self {
            replay_complete: true,
            ..Default::default()
        }
    }

    /// The record a decoder emits for a data line that is not valid JSON.
    pub fn decode_error(err: &serde_json::Error) -> Self {
        Self {
            error: err.to_string(),
            ..Default::default()
        }
    }

    /// Classify by the first populated field, in tag order.
    pub fn kind(&self) -> EventKind {
        if !self.input.is_empty() {
            EventKind::Input
        } else if self.tool_call.is_some() {
            EventKind::ToolCall
        } else if self.tool_input.is_some() {
            EventKind::ToolInput
        } else if self.step.is_some() {
            EventKind::Step
        } else if self.prompt.is_some() {
            EventKind::Prompt
        } else if !self.error.is_empty() {
            EventKind::Error
        } else if self.run_complete {
            EventKind::RunComplete
        } else if self.replay_complete {
            EventKind::ReplayComplete
        } else if !self.content.is_empty() {
            EventKind::Content
        } else {
            EventKind::Empty
        }
    }
}

/// Concatenate the content of `events` in arrival order.
pub fn collect_content<'a>(events: impl IntoIterator<Item = &'a ProgressEvent>) -> String {
    events
        .into_iter()
        .map(|e| e.content.as_str())
        .collect::<Vec<_>>()
        .concat()
}
