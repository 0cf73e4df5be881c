//! Transcript messages recorded for every run.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One transcript entry. Serialized as one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            name: None,
            tool_call_id: None,
            content: content.into(),
        }
    }

    /// Prompt sent on behalf of an agent. Goes over the wire as a user turn.
    pub fn agent_prompt(agent: &str, content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            name: Some(agent.to_string()),
            tool_call_id: None,
            content: content.into(),
        }
    }

    pub fn assistant(agent: &str, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            name: Some(agent.to_string()),
            tool_call_id: None,
            content: content.into(),
        }
    }

    /// Result of a tool invocation (script execution, lookup) attributed to a call id.
    pub fn tool(agent: &str, call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            name: Some(agent.to_string()),
            tool_call_id: Some(call_id.into()),
            content: content.into(),
        }
    }
}

/// Append-only message log for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}
