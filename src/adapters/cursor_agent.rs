//! CursorAgent adapter. Native session creation via `create-chat --workspace
//! PATH`; headless sends stream JSON via `-p -f`; interactive mode drops
//! `-p` to drive a REPL in a PTY.

use serde_json::Value;

use super::{Adapter, CreateArgs, InvocationContext, ParseStrategy};
use crate::parser::ParsedBlock;
use crate::schema::{ContentBlock, Mode, Tool};

#[derive(Default)]
pub struct CursorAgentAdapter {
    availability: super::AvailabilityCache,
}

impl CursorAgentAdapter {
    pub fn is_available(&self) -> bool {
        self.availability.is_available(self.executable_names())
    }
}

fn push_common(args: &mut Vec<String>, ctx: &InvocationContext) {
    if let Some(workspace) = ctx.workspace {
        args.push("--workspace".to_string());
        args.push(workspace.to_string());
    }
    if let Some(model) = ctx.model {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    match ctx.mode {
        Mode::Plan => {
            args.push("--mode".to_string());
            args.push("plan".to_string());
        }
        Mode::Ask => {
            args.push("--mode".to_string());
            args.push("ask".to_string());
        }
        Mode::Agent => {}
    }
}

impl Adapter for CursorAgentAdapter {
    fn tool(&self) -> Tool {
        Tool::CursorAgent
    }

    fn executable_names(&self) -> &'static [&'static str] {
        &["cursor-agent"]
    }

    fn resolve_executable(&self) -> Option<String> {
        self.availability.resolve(self.executable_names())
    }

    fn parse_strategy(&self) -> ParseStrategy {
        ParseStrategy::AnsiText
    }

    fn build_create_args(&self, workspace: &str) -> CreateArgs {
        CreateArgs::Spawn(vec!["create-chat".to_string(), "--workspace".to_string(), workspace.to_string()])
    }

    fn build_send_args(&self, ctx: &InvocationContext) -> Vec<String> {
        let mut args = vec!["--resume".to_string(), ctx.session_id.to_string(), "-p".to_string(), "-f".to_string(), "--output-format".to_string(), "stream-json".to_string()];
        push_common(&mut args, ctx);
        args.push(ctx.message.to_string());
        args
    }

    fn build_interactive_args(&self, ctx: &InvocationContext) -> Vec<String> {
        let mut args = vec!["--resume".to_string(), ctx.session_id.to_string()];
        push_common(&mut args, ctx);
        args
    }

    fn parse_json_event(&self, event: &Value) -> Vec<ParsedBlock> {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            "assistant" => parse_assistant_content(event),
            "content_block_delta" => {
                let text = event
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                if text.is_empty() {
                    vec![]
                } else {
                    vec![ParsedBlock::partial(ContentBlock::Text { content: text.to_string() })]
                }
            }
            "result" => {
                let is_error = event.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                let reason = if is_error { "error" } else { "end_turn" };
                vec![ParsedBlock::whole(ContentBlock::SessionEnd { reason: reason.to_string(), success: !is_error })]
            }
            _ => vec![ParsedBlock::whole(ContentBlock::Raw { value: event.clone() })],
        }
    }

    fn parse_text_line(&self, stripped: &str, _original: &str) -> ParsedBlock {
        let trimmed = stripped.trim();
        if super::looks_like_diff_line(trimmed) {
            return ParsedBlock::whole(ContentBlock::CodeBlock { language: "diff".into(), code: stripped.to_string() });
        }
        if let Some(command) = trimmed.strip_prefix("$ ") {
            if let Some(block) = ContentBlock::command_run(Some(command.to_string())) {
                return ParsedBlock::whole(block);
            }
        }
        if let Some(path) = trimmed.strip_prefix("Reading: ") {
            return ParsedBlock::whole(ContentBlock::FileRead { path: path.trim().to_string() });
        }
        if let Some(path) = trimmed.strip_prefix("Writing: ") {
            return ParsedBlock::whole(ContentBlock::FileEdit { path: path.trim().to_string(), diff: None });
        }
        // Imprecise by construction: a bare "..." line can false-match
        // plain text, but is kept as adapter policy rather than hardened.
        if trimmed == "..." {
            return ParsedBlock::partial(ContentBlock::Thinking { content: String::new() });
        }
        if trimmed.starts_with('\u{2022}') || trimmed.starts_with('-') {
            let content = trimmed.trim_start_matches('\u{2022}').trim_start_matches('-').trim();
            return ParsedBlock::whole(ContentBlock::Progress { content: content.to_string() });
        }
        ParsedBlock::whole(ContentBlock::Text { content: stripped.to_string() })
    }
}

fn parse_assistant_content(event: &Value) -> Vec<ParsedBlock> {
    let mut out = Vec::new();
    let Some(content) = event.get("message").and_then(|m| m.get("content")).and_then(Value::as_array) else {
        return out;
    };
    for block in content {
        match block.get("type").and_then(Value::as_str).unwrap_or("") {
            "text" => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    out.push(ParsedBlock::whole(ContentBlock::Text { content: text.to_string() }));
                }
            }
            "tool_use" => {
                let tool_id = block.get("id").and_then(Value::as_str).map(str::to_string);
                let tool_name = block.get("name").and_then(Value::as_str).map(str::to_string);
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                match ContentBlock::tool_use_start(tool_id, tool_name, input) {
                    Some(b) => out.push(ParsedBlock::whole(b)),
                    None => out.push(ParsedBlock::whole(ContentBlock::Raw { value: block.clone() })),
                }
            }
            "tool_result" => {
                let tool_id = block.get("tool_use_id").and_then(Value::as_str).unwrap_or("").to_string();
                let content = block.get("content").and_then(Value::as_str).unwrap_or("").to_string();
                let is_error = block.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                out.push(ParsedBlock::whole(ContentBlock::ToolUseResult {
                    tool_id,
                    tool_name: String::new(),
                    content,
                    is_error,
                }));
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> CursorAgentAdapter {
        CursorAgentAdapter::default()
    }

    #[test]
    fn scenario_cursor_agent_tool_use() {
        let a = adapter();
        let event = json!({
            "type": "assistant",
            "message": {
                "content": [
                    {"type": "text", "text": "Listing"},
                    {"type": "tool_use", "id": "t1", "name": "Grep", "input": {"q": "x"}}
                ]
            }
        });
        let blocks = a.parse_json_event(&event);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].block, ContentBlock::Text { content: "Listing".into() });
        assert_eq!(
            blocks[1].block,
            ContentBlock::ToolUseStart { tool_id: "t1".into(), tool_name: "Grep".into(), input: json!({"q": "x"}) }
        );
    }

    #[test]
    fn command_line_becomes_command_run() {
        let a = adapter();
        let b = a.parse_text_line("$ npm test", "$ npm test");
        assert_eq!(b.block, ContentBlock::CommandRun { command: "npm test".into() });
        assert!(!b.is_partial);
    }

    #[test]
    fn build_create_args_uses_create_chat_subcommand() {
        let a = adapter();
        match a.build_create_args("/tmp/p") {
            CreateArgs::Spawn(args) => {
                assert_eq!(args[0], "create-chat");
                assert!(args.contains(&"/tmp/p".to_string()));
            }
            CreateArgs::CallerGeneratesId => panic!("cursor-agent has a native create command"),
        }
    }

    #[test]
    fn build_send_args_includes_headless_flags() {
        let a = adapter();
        let ctx = InvocationContext {
            session_id: "cid",
            workspace: Some("/tmp/p"),
            model: None,
            mode: Mode::Ask,
            message: "hi",
            is_new: false,
        };
        let args = a.build_send_args(&ctx);
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"-f".to_string()));
        assert!(args.contains(&"--mode".to_string()));
        assert!(args.contains(&"ask".to_string()));
        assert_eq!(args.last().unwrap(), "hi");
    }
}
