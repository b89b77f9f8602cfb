//! Message records carried through the `__messages__` state key.
//!
//! Messages are plain role/content pairs. The runtime itself never inspects
//! their contents; it only appends them through the
//! [`AddMessages`](crate::reducers::AddMessages) reducer so LLM, tool, and
//! agent nodes can share a conversation history.
//!
//! # Examples
//!
//! ```
//! use graphflow::message::Message;
//!
//! let user_msg = Message::user("What's the weather like?");
//! let assistant_msg = Message::assistant("Sunny, 24°C.");
//!
//! assert!(user_msg.has_role(Message::USER));
//! assert!(!assistant_msg.has_role(Message::SYSTEM));
//! ```

use serde::{Deserialize, Serialize};

/// A single conversation message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sender role; one of the role constants or a custom string.
    pub role: String,
    /// Message body.
    pub content: String,
}

impl Message {
    /// Role constant for user messages.
    pub const USER: &'static str = "user";
    /// Role constant for assistant messages.
    pub const ASSISTANT: &'static str = "assistant";
    /// Role constant for system messages.
    pub const SYSTEM: &'static str = "system";
    /// Role constant for tool results.
    pub const TOOL: &'static str = "tool";

    /// Creates a message with an arbitrary role.
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    /// Creates a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Self::USER, content)
    }

    /// Creates an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Self::ASSISTANT, content)
    }

    /// Creates a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Self::SYSTEM, content)
    }

    /// Creates a tool-result message.
    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Self::TOOL, content)
    }

    /// Returns `true` if this message carries the given role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }
}
