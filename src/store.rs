//! Transcript Store: a durable, single-writer embedded database holding
//! conversations and their ordered message events; survives process
//! restart.
//!
//! A single `Connection` guarded by a `Mutex<Connection>` since the broker
//! is multi-threaded and the store is shared-read, serialized-write.
//! Schema versioning uses `PRAGMA user_version` so future migrations can
//! be additive.
//!
//! A handful of content-block kinds have no dedicated column
//! (`session_start`'s model, `approval_request`'s action, `file_edit`/
//! `diff`'s diff body) — these reuse an otherwise-unused column for that
//! kind rather than widening the schema; see `to_row`/`from_row`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::{BrokerError, BrokerResult};
use crate::schema::{ApprovalAction, Conversation, ConversationStatus, Message, Mode, Role, Tool};

const SCHEMA_VERSION: i64 = 1;

pub struct Store {
    conn: Mutex<Connection>,
    initialized: std::sync::atomic::AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub conversation_count: u64,
    pub total_messages: u64,
    /// Conversation count per tool — a natural extension of the single
    /// aggregate count, cheap to compute from the same query.
    pub by_tool: HashMap<Tool, u64>,
    pub by_status: HashMap<ConversationStatus, u64>,
}

impl Store {
    /// Opens (creating parent directories as needed) the database file at
    /// `path` but does not yet run `init` — init is a distinct, idempotent
    /// operation.
    pub fn open(path: &Path) -> BrokerResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Ok(Self { conn: Mutex::new(conn), initialized: std::sync::atomic::AtomicBool::new(false) })
    }

    pub fn open_in_memory() -> BrokerResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Mutex::new(conn), initialized: std::sync::atomic::AtomicBool::new(false) })
    }

    /// Creates schema if absent; idempotent.
    pub fn init(&self) -> BrokerResult<()> {
        let conn = self.conn.lock().unwrap();
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current == 0 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    tool TEXT NOT NULL,
                    topic TEXT NOT NULL DEFAULT '',
                    model TEXT,
                    mode TEXT NOT NULL,
                    projectPath TEXT NOT NULL,
                    status TEXT NOT NULL,
                    createdAt INTEGER NOT NULL,
                    updatedAt INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS messages (
                    rowid INTEGER PRIMARY KEY AUTOINCREMENT,
                    conversationId TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    id TEXT NOT NULL,
                    type TEXT NOT NULL,
                    role TEXT,
                    content TEXT,
                    toolId TEXT,
                    toolName TEXT,
                    input TEXT,
                    isError INTEGER,
                    path TEXT,
                    command TEXT,
                    language TEXT,
                    code TEXT,
                    inputTokens INTEGER,
                    outputTokens INTEGER,
                    timestamp INTEGER NOT NULL,
                    isPartial INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_messages_conv_ts ON messages(conversationId, timestamp);
                CREATE INDEX IF NOT EXISTS idx_messages_conv ON messages(conversationId);",
            )?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        } else {
            // Additive migrations only: a version bump must never drop
            // existing rows rather than recreating tables on a version
            // mismatch: this store is the system of record, not a
            // rebuildable index.
            migrate_forward(&conn, current)?;
        }
        drop(conn);
        self.initialized.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn require_init(&self) -> BrokerResult<()> {
        if !self.initialized.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(BrokerError::FailedPrecondition);
        }
        Ok(())
    }

    pub fn save_conversation(&self, conv: &Conversation) -> BrokerResult<()> {
        self.require_init()?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversations (id, tool, topic, model, mode, projectPath, status, createdAt, updatedAt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                tool = excluded.tool,
                topic = excluded.topic,
                model = excluded.model,
                mode = excluded.mode,
                projectPath = excluded.projectPath,
                status = excluded.status,
                updatedAt = excluded.updatedAt",
            params![
                conv.id,
                conv.tool.as_str(),
                conv.topic,
                conv.model,
                mode_str(conv.mode),
                conv.project_path,
                status_str(conv.status),
                conv.created_at,
                conv.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_conversation(&self, id: &str) -> BrokerResult<Option<Conversation>> {
        self.require_init()?;
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, tool, topic, model, mode, projectPath, status, createdAt, updatedAt
             FROM conversations WHERE id = ?1",
            params![id],
            row_to_conversation,
        )
        .optional()
        .map_err(BrokerError::from)
    }

    /// Sorted by updatedAt desc.
    pub fn get_all_conversations(&self) -> BrokerResult<Vec<Conversation>> {
        self.require_init()?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tool, topic, model, mode, projectPath, status, createdAt, updatedAt
             FROM conversations ORDER BY updatedAt DESC",
        )?;
        let rows = stmt.query_map([], row_to_conversation)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(BrokerError::from)
    }

    pub fn update_conversation_status(&self, id: &str, status: ConversationStatus) -> BrokerResult<()> {
        self.require_init()?;
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE conversations SET status = ?1, updatedAt = ?2 WHERE id = ?3",
            params![status_str(status), crate::schema::now_ms(), id],
        )?;
        if changed == 0 {
            return Err(BrokerError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Cascades to messages via `ON DELETE CASCADE`.
    pub fn delete_conversation(&self, id: &str) -> BrokerResult<()> {
        self.require_init()?;
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(BrokerError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Appends; does not deduplicate partials.
    pub fn save_message(&self, conversation_id: &str, message: &Message) -> BrokerResult<()> {
        self.require_init()?;
        let row = to_row(conversation_id, message);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages
                (conversationId, id, type, role, content, toolId, toolName, input, isError,
                 path, command, language, code, inputTokens, outputTokens, timestamp, isPartial)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                row.conversation_id,
                row.id,
                row.kind,
                row.role,
                row.content,
                row.tool_id,
                row.tool_name,
                row.input,
                row.is_error,
                row.path,
                row.command,
                row.language,
                row.code,
                row.input_tokens,
                row.output_tokens,
                row.timestamp,
                row.is_partial,
            ],
        )?;
        Ok(())
    }

    /// Sorted by (timestamp, insertion); `since` is an exclusive cursor on
    /// timestamp.
    pub fn get_messages(&self, conversation_id: &str, since: Option<i64>) -> BrokerResult<Vec<Message>> {
        self.require_init()?;
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT conversationId, id, type, role, content, toolId, toolName, input, isError,
                    path, command, language, code, inputTokens, outputTokens, timestamp, isPartial
             FROM messages
             WHERE conversationId = ?1 AND timestamp > ?2
             ORDER BY timestamp ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id, since.unwrap_or(0)], row_to_message)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(BrokerError::from)
    }

    /// Transitions every `running` conversation to `suspended`; called on
    /// shutdown and at startup recovery.
    pub fn suspend_all_active_chats(&self) -> BrokerResult<u64> {
        self.require_init()?;
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE conversations SET status = ?1, updatedAt = ?2 WHERE status = ?3",
            params![status_str(ConversationStatus::Suspended), crate::schema::now_ms(), status_str(ConversationStatus::Running)],
        )?;
        Ok(changed as u64)
    }

    pub fn get_stats(&self) -> BrokerResult<Stats> {
        self.require_init()?;
        let conn = self.conn.lock().unwrap();
        let conversation_count: i64 = conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0))?;
        let total_messages: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;

        let mut by_tool = HashMap::new();
        let mut stmt = conn.prepare("SELECT tool, COUNT(*) FROM conversations GROUP BY tool")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (tool, count) = row?;
            if let Some(tool) = Tool::parse(&tool) {
                by_tool.insert(tool, count as u64);
            }
        }

        let mut by_status = HashMap::new();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM conversations GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (status, count) = row?;
            by_status.insert(parse_status(&status), count as u64);
        }

        Ok(Stats { conversation_count: conversation_count as u64, total_messages: total_messages as u64, by_tool, by_status })
    }

    /// Flushes and releases the handle. SQLite commits each statement
    /// already; this exists to make the intent at shutdown explicit.
    pub fn close(&self) -> BrokerResult<()> {
        self.require_init()?;
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);").ok();
        Ok(())
    }

    /// Test-only fault injector: drops the messages table so subsequent
    /// `save_message` calls fail, exercising the Session Runtime's storage
    /// retry/error path without a real disk-full or I/O failure.
    #[cfg(test)]
    pub fn drop_messages_table_for_test(&self) {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("DROP TABLE messages").unwrap();
    }
}

fn migrate_forward(_conn: &Connection, _from_version: i64) -> BrokerResult<()> {
    // No migrations defined yet beyond version 1. Future schema changes
    // append ALTER TABLE statements gated on `from_version`, never a drop.
    Ok(())
}

fn mode_str(mode: Mode) -> &'static str {
    match mode {
        Mode::Agent => "agent",
        Mode::Plan => "plan",
        Mode::Ask => "ask",
    }
}

fn parse_mode(s: &str) -> Mode {
    match s {
        "plan" => Mode::Plan,
        "ask" => Mode::Ask,
        _ => Mode::Agent,
    }
}

fn status_str(status: ConversationStatus) -> &'static str {
    match status {
        ConversationStatus::Running => "running",
        ConversationStatus::Suspended => "suspended",
        ConversationStatus::Ended => "ended",
        ConversationStatus::Errored => "errored",
    }
}

fn parse_status(s: &str) -> ConversationStatus {
    match s {
        "suspended" => ConversationStatus::Suspended,
        "ended" => ConversationStatus::Ended,
        "errored" => ConversationStatus::Errored,
        _ => ConversationStatus::Running,
    }
}

fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        tool: Tool::parse(&row.get::<_, String>(1)?).unwrap_or(Tool::Claude),
        topic: row.get(2)?,
        model: row.get(3)?,
        mode: parse_mode(&row.get::<_, String>(4)?),
        project_path: row.get(5)?,
        status: parse_status(&row.get::<_, String>(6)?),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

struct MessageRow {
    conversation_id: String,
    id: String,
    kind: &'static str,
    role: Option<&'static str>,
    content: Option<String>,
    tool_id: Option<String>,
    tool_name: Option<String>,
    input: Option<String>,
    is_error: Option<bool>,
    path: Option<String>,
    command: Option<String>,
    language: Option<String>,
    code: Option<String>,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    timestamp: i64,
    is_partial: bool,
}

fn role_str(role: Option<Role>) -> Option<&'static str> {
    match role {
        Some(Role::User) => Some("user"),
        Some(Role::Assistant) => Some("assistant"),
        Some(Role::System) => Some("system"),
        None => None,
    }
}

fn parse_role(s: Option<String>) -> Option<Role> {
    match s.as_deref() {
        Some("user") => Some(Role::User),
        Some("assistant") => Some(Role::Assistant),
        Some("system") => Some(Role::System),
        _ => None,
    }
}

fn action_str(action: ApprovalAction) -> &'static str {
    match action {
        ApprovalAction::FileEdit => "file_edit",
        ApprovalAction::Command => "command",
        ApprovalAction::Generic => "generic",
    }
}

fn parse_action(s: &str) -> ApprovalAction {
    match s {
        "file_edit" => ApprovalAction::FileEdit,
        "command" => ApprovalAction::Command,
        _ => ApprovalAction::Generic,
    }
}

use crate::schema::ContentBlock;

fn to_row(conversation_id: &str, message: &Message) -> MessageRow {
    let kind = message.block.kind();
    let mut row = MessageRow {
        conversation_id: conversation_id.to_string(),
        id: message.id.clone(),
        kind,
        role: role_str(message.role),
        content: None,
        tool_id: None,
        tool_name: None,
        input: None,
        is_error: None,
        path: None,
        command: None,
        language: None,
        code: None,
        input_tokens: None,
        output_tokens: None,
        timestamp: message.timestamp,
        is_partial: message.is_partial,
    };
    match &message.block {
        ContentBlock::Text { content } | ContentBlock::Thinking { content } | ContentBlock::Progress { content } | ContentBlock::Error { content } => {
            row.content = Some(content.clone());
        }
        ContentBlock::ToolUseStart { tool_id, tool_name, input } => {
            row.tool_id = Some(tool_id.clone());
            row.tool_name = Some(tool_name.clone());
            row.input = Some(input.to_string());
        }
        ContentBlock::ToolUseResult { tool_id, tool_name, content, is_error } => {
            row.tool_id = Some(tool_id.clone());
            row.tool_name = Some(tool_name.clone());
            row.content = Some(content.clone());
            row.is_error = Some(*is_error);
        }
        ContentBlock::FileRead { path } => {
            row.path = Some(path.clone());
        }
        ContentBlock::FileEdit { path, diff } => {
            row.path = Some(path.clone());
            row.input = Some(Value::String(diff.clone().unwrap_or_default()).to_string());
        }
        ContentBlock::CommandRun { command } => {
            row.command = Some(command.clone());
        }
        ContentBlock::CodeBlock { language, code } => {
            row.language = Some(language.clone());
            row.code = Some(code.clone());
        }
        ContentBlock::Diff { path, diff } => {
            row.path = path.clone();
            row.content = Some(diff.clone());
        }
        ContentBlock::ApprovalRequest { action, content } => {
            row.content = Some(content.clone());
            row.command = Some(action_str(*action).to_string());
        }
        ContentBlock::Usage { input_tokens, output_tokens } => {
            row.input_tokens = Some(*input_tokens as i64);
            row.output_tokens = Some(*output_tokens as i64);
        }
        ContentBlock::SessionStart { model } => {
            row.content = model.clone();
        }
        ContentBlock::SessionEnd { reason, success } => {
            row.content = Some(reason.clone());
            row.is_error = Some(!*success);
        }
        ContentBlock::Raw { value } => {
            row.input = Some(value.to_string());
        }
    }
    row
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let conversation_id: String = row.get(0)?;
    let id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let role: Option<String> = row.get(3)?;
    let content: Option<String> = row.get(4)?;
    let tool_id: Option<String> = row.get(5)?;
    let tool_name: Option<String> = row.get(6)?;
    let input: Option<String> = row.get(7)?;
    let is_error: Option<bool> = row.get(8)?;
    let path: Option<String> = row.get(9)?;
    let command: Option<String> = row.get(10)?;
    let language: Option<String> = row.get(11)?;
    let code: Option<String> = row.get(12)?;
    let input_tokens: Option<i64> = row.get(13)?;
    let output_tokens: Option<i64> = row.get(14)?;
    let timestamp: i64 = row.get(15)?;
    let is_partial: bool = row.get(16)?;

    let block = match kind.as_str() {
        "text" => ContentBlock::Text { content: content.unwrap_or_default() },
        "thinking" => ContentBlock::Thinking { content: content.unwrap_or_default() },
        "progress" => ContentBlock::Progress { content: content.unwrap_or_default() },
        "error" => ContentBlock::Error { content: content.unwrap_or_default() },
        "tool_use_start" => ContentBlock::ToolUseStart {
            tool_id: tool_id.unwrap_or_default(),
            tool_name: tool_name.unwrap_or_default(),
            input: input.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or(Value::Null),
        },
        "tool_use_result" => ContentBlock::ToolUseResult {
            tool_id: tool_id.unwrap_or_default(),
            tool_name: tool_name.unwrap_or_default(),
            content: content.unwrap_or_default(),
            is_error: is_error.unwrap_or(false),
        },
        "file_read" => ContentBlock::FileRead { path: path.unwrap_or_default() },
        "file_edit" => {
            let diff = input
                .and_then(|s| serde_json::from_str::<Value>(&s).ok())
                .and_then(|v| v.as_str().map(str::to_string))
                .filter(|s| !s.is_empty());
            ContentBlock::FileEdit { path: path.unwrap_or_default(), diff }
        }
        "command_run" => ContentBlock::CommandRun { command: command.unwrap_or_default() },
        "code_block" => ContentBlock::CodeBlock { language: language.unwrap_or_default(), code: code.unwrap_or_default() },
        "diff" => ContentBlock::Diff { path, diff: content.unwrap_or_default() },
        "approval_request" => ContentBlock::ApprovalRequest {
            action: command.as_deref().map(parse_action).unwrap_or(ApprovalAction::Generic),
            content: content.unwrap_or_default(),
        },
        "usage" => ContentBlock::Usage {
            input_tokens: input_tokens.unwrap_or(0) as u64,
            output_tokens: output_tokens.unwrap_or(0) as u64,
        },
        "session_start" => ContentBlock::SessionStart { model: content },
        "session_end" => ContentBlock::SessionEnd {
            reason: content.unwrap_or_default(),
            success: !is_error.unwrap_or(false),
        },
        _ => ContentBlock::Raw {
            value: input.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or(Value::Null),
        },
    };

    Ok(Message { id, conversation_id, role: parse_role(role), timestamp, is_partial, block })
}
