//! Output Schema: the closed set of content-block kinds that is both the
//! persistence format and the wire format delivered to subscribers.
//!
//! Every variant derives `Serialize`/`Deserialize` with an internal `type`
//! tag so a `Message` serializes to exactly the JSON shape stored in
//! `messages.content`/`type`/... columns and sent over the wire — no
//! separate DTO layer; the same struct serves both persistence and API
//! response roles.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Tool {
    CursorAgent,
    Claude,
    Gemini,
}

impl Tool {
    pub fn as_str(self) -> &'static str {
        match self {
            Tool::CursorAgent => "cursor-agent",
            Tool::Claude => "claude",
            Tool::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cursor-agent" => Some(Tool::CursorAgent),
            "claude" => Some(Tool::Claude),
            "gemini" => Some(Tool::Gemini),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Agent,
    Plan,
    Ask,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Running,
    Suspended,
    Ended,
    Errored,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A single chat session with one AI CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub tool: Tool,
    #[serde(default)]
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub mode: Mode,
    pub project_path: String,
    pub status: ConversationStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    pub fn new(id: String, tool: Tool, mode: Mode, project_path: String) -> Self {
        let now = now_ms();
        Self {
            id,
            tool,
            topic: String::new(),
            model: None,
            mode,
            project_path,
            status: ConversationStatus::Running,
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The closed set of content-block kinds. Internally tagged by `type` so a
/// block serializes flat, matching the `messages` table column layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { content: String },
    Thinking { content: String },
    ToolUseStart { tool_id: String, tool_name: String, input: Value },
    ToolUseResult { tool_id: String, tool_name: String, content: String, is_error: bool },
    FileRead { path: String },
    FileEdit { path: String, diff: Option<String> },
    CommandRun { command: String },
    CodeBlock { language: String, code: String },
    Diff { path: Option<String>, diff: String },
    Progress { content: String },
    ApprovalRequest { action: ApprovalAction, content: String },
    Usage { input_tokens: u64, output_tokens: u64 },
    SessionStart { model: Option<String> },
    SessionEnd { reason: String, success: bool },
    Error { content: String },
    /// Unknown-field preservation sibling: anything that fails to satisfy a
    /// typed constructor's required fields lands here instead of being
    /// dropped.
    Raw { value: Value },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    FileEdit,
    Command,
    Generic,
}

impl ContentBlock {
    /// The kind name as stored in `messages.type` / delivered in `type`.
    pub fn kind(&self) -> &'static str {
        match self {
            ContentBlock::Text { .. } => "text",
            ContentBlock::Thinking { .. } => "thinking",
            ContentBlock::ToolUseStart { .. } => "tool_use_start",
            ContentBlock::ToolUseResult { .. } => "tool_use_result",
            ContentBlock::FileRead { .. } => "file_read",
            ContentBlock::FileEdit { .. } => "file_edit",
            ContentBlock::CommandRun { .. } => "command_run",
            ContentBlock::CodeBlock { .. } => "code_block",
            ContentBlock::Diff { .. } => "diff",
            ContentBlock::Progress { .. } => "progress",
            ContentBlock::ApprovalRequest { .. } => "approval_request",
            ContentBlock::Usage { .. } => "usage",
            ContentBlock::SessionStart { .. } => "session_start",
            ContentBlock::SessionEnd { .. } => "session_end",
            ContentBlock::Error { .. } => "error",
            ContentBlock::Raw { .. } => "raw",
        }
    }

    /// Required-field constructor for `tool_use_start`; falls back to the
    /// caller providing `Raw` when any piece is missing.
    pub fn tool_use_start(tool_id: Option<String>, tool_name: Option<String>, input: Value) -> Option<Self> {
        Some(ContentBlock::ToolUseStart {
            tool_id: tool_id?,
            tool_name: tool_name?,
            input,
        })
    }

    pub fn command_run(command: Option<String>) -> Option<Self> {
        Some(ContentBlock::CommandRun { command: command?.trim().to_string() })
    }

    pub fn code_block(language: Option<String>, code: Option<String>) -> Option<Self> {
        Some(ContentBlock::CodeBlock { language: language.unwrap_or_else(|| "text".into()), code: code? })
    }
}

/// One transcript entry. The envelope fields are common to every kind;
/// `block` carries the kind-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    pub timestamp: i64,
    #[serde(default)]
    pub is_partial: bool,
    #[serde(flatten)]
    pub block: ContentBlock,
}

impl Message {
    pub fn new(conversation_id: impl Into<String>, role: Option<Role>, block: ContentBlock) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            role,
            timestamp: now_ms(),
            is_partial: false,
            block,
        }
    }

    pub fn partial(mut self) -> Self {
        self.is_partial = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_use_start_requires_id_and_name() {
        assert!(ContentBlock::tool_use_start(None, Some("Grep".into()), Value::Null).is_none());
        assert!(ContentBlock::tool_use_start(Some("t1".into()), None, Value::Null).is_none());
        assert!(ContentBlock::tool_use_start(Some("t1".into()), Some("Grep".into()), Value::Null).is_some());
    }

    #[test]
    fn message_round_trips_through_json() {
        let msg = Message::new("c1", Some(Role::Assistant), ContentBlock::Text { content: "hi".into() });
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.block, msg.block);
        assert_eq!(back.conversation_id, msg.conversation_id);
    }

    #[test]
    fn kind_name_matches_serde_tag() {
        let block = ContentBlock::CommandRun { command: "npm test".into() };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], block.kind());
    }
}
