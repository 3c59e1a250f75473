//! Claude adapter. No explicit create command — the Broker mints a UUID
//! and passes it as `--session-id`; resolution tries `claude` then
//! `claude-code`; matches the CLI's persistent-process invocation and
//! stream-json event shapes (`message_start`/`content_block_delta`/
//! `assistant`/`result`).

use serde_json::Value;

use super::{Adapter, CreateArgs, InvocationContext, ParseStrategy};
use crate::parser::ParsedBlock;
use crate::schema::{ContentBlock, Mode, Tool};

#[derive(Default)]
pub struct ClaudeAdapter {
    availability: super::AvailabilityCache,
}

impl ClaudeAdapter {
    pub fn is_available(&self) -> bool {
        self.availability.is_available(self.executable_names())
    }
}

impl Adapter for ClaudeAdapter {
    fn tool(&self) -> Tool {
        Tool::Claude
    }

    fn executable_names(&self) -> &'static [&'static str] {
        &["claude", "claude-code"]
    }

    fn resolve_executable(&self) -> Option<String> {
        self.availability.resolve(self.executable_names())
    }

    fn parse_strategy(&self) -> ParseStrategy {
        ParseStrategy::JsonLines
    }

    fn build_create_args(&self, _workspace: &str) -> CreateArgs {
        CreateArgs::CallerGeneratesId
    }

    fn reports_session_start(&self) -> bool {
        true
    }

    fn build_send_args(&self, ctx: &InvocationContext) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--session-id".to_string(),
            ctx.session_id.to_string(),
        ];
        if let Some(workspace) = ctx.workspace {
            args.push("--workspace".to_string());
            args.push(workspace.to_string());
        }
        if let Some(model) = ctx.model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if ctx.mode == Mode::Plan {
            args.push("--permission-mode".to_string());
            args.push("plan".to_string());
        }
        args.push(ctx.message.to_string());
        args
    }

    fn build_interactive_args(&self, ctx: &InvocationContext) -> Vec<String> {
        let mut args = vec!["--resume".to_string(), "--session-id".to_string(), ctx.session_id.to_string()];
        if let Some(workspace) = ctx.workspace {
            args.push("--workspace".to_string());
            args.push(workspace.to_string());
        }
        if let Some(model) = ctx.model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args
    }

    fn parse_json_event(&self, event: &Value) -> Vec<ParsedBlock> {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
        match event_type {
            "message_start" => {
                let model = event
                    .get("message")
                    .and_then(|m| m.get("model"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                vec![ParsedBlock::whole(ContentBlock::SessionStart { model })]
            }
            "content_block_delta" => {
                let delta = event.get("delta");
                let delta_type = delta.and_then(|d| d.get("type")).and_then(Value::as_str).unwrap_or("");
                if delta_type == "text_delta" {
                    let text = delta.and_then(|d| d.get("text")).and_then(Value::as_str).unwrap_or("");
                    if text.is_empty() {
                        return vec![];
                    }
                    vec![ParsedBlock::partial(ContentBlock::Text { content: text.to_string() })]
                } else if delta_type == "thinking_delta" {
                    let text = delta.and_then(|d| d.get("thinking")).and_then(Value::as_str).unwrap_or("");
                    vec![ParsedBlock::partial(ContentBlock::Thinking { content: text.to_string() })]
                } else {
                    vec![]
                }
            }
            "content_block_start" => {
                let block = event.get("content_block");
                if block.and_then(|b| b.get("type")).and_then(Value::as_str) == Some("tool_use") {
                    let tool_id = block.and_then(|b| b.get("id")).and_then(Value::as_str).map(str::to_string);
                    let tool_name = block.and_then(|b| b.get("name")).and_then(Value::as_str).map(str::to_string);
                    let input = block.and_then(|b| b.get("input")).cloned().unwrap_or(Value::Null);
                    match ContentBlock::tool_use_start(tool_id, tool_name, input.clone()) {
                        Some(b) => vec![ParsedBlock::whole(b)],
                        None => vec![ParsedBlock::whole(ContentBlock::Raw { value: event.clone() })],
                    }
                } else {
                    vec![]
                }
            }
            "assistant" => parse_assistant_message(event),
            "message_stop" => {
                let reason = event.get("stop_reason").and_then(Value::as_str).unwrap_or("end_turn");
                vec![ParsedBlock::whole(ContentBlock::SessionEnd { reason: reason.to_string(), success: true })]
            }
            "result" => {
                let input_tokens = event
                    .get("usage")
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let output_tokens = event
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let is_error = event.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                let reason = if is_error { "error" } else { "end_turn" };
                vec![
                    ParsedBlock::whole(ContentBlock::Usage { input_tokens, output_tokens }),
                    ParsedBlock::whole(ContentBlock::SessionEnd { reason: reason.to_string(), success: !is_error }),
                ]
            }
            "system" | "user" => vec![],
            _ => vec![ParsedBlock::whole(ContentBlock::Raw { value: event.clone() })],
        }
    }

    fn parse_text_line(&self, stripped: &str, _original: &str) -> ParsedBlock {
        if super::looks_like_diff_line(stripped) {
            return ParsedBlock::whole(ContentBlock::CodeBlock { language: "diff".into(), code: stripped.to_string() });
        }
        if let Some(command) = stripped.strip_prefix("$ ") {
            if let Some(block) = ContentBlock::command_run(Some(command.to_string())) {
                return ParsedBlock::whole(block);
            }
        }
        ParsedBlock::whole(ContentBlock::Text { content: stripped.to_string() })
    }
}

fn parse_assistant_message(event: &Value) -> Vec<ParsedBlock> {
    let mut out = Vec::new();
    let Some(content) = event.get("message").and_then(|m| m.get("content")).and_then(Value::as_array) else {
        return out;
    };
    for block in content {
        match block.get("type").and_then(Value::as_str).unwrap_or("") {
            // Text is already streamed via content_block_delta; skip here
            // to avoid duplicating output.
            "text" => {}
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

    fn adapter() -> ClaudeAdapter {
        ClaudeAdapter::default()
    }

    #[test]
    fn scenario_claude_create_and_first_turn() {
        let a = adapter();
        let start = a.parse_json_event(&json!({"type":"message_start","message":{"model":"m"}}));
        assert_eq!(start.len(), 1);
        assert_eq!(start[0].block, ContentBlock::SessionStart { model: Some("m".into()) });
        assert!(!start[0].is_partial);

        let d1 = a.parse_json_event(&json!({"type":"content_block_delta","delta":{"type":"text_delta","text":"Hel"}}));
        assert_eq!(d1[0].block, ContentBlock::Text { content: "Hel".into() });
        assert!(d1[0].is_partial);

        let d2 = a.parse_json_event(&json!({"type":"content_block_delta","delta":{"type":"text_delta","text":"lo"}}));
        assert_eq!(d2[0].block, ContentBlock::Text { content: "lo".into() });
        assert!(d2[0].is_partial);

        let stop = a.parse_json_event(&json!({"type":"message_stop","stop_reason":"end_turn"}));
        assert_eq!(stop[0].block, ContentBlock::SessionEnd { reason: "end_turn".into(), success: true });
        assert!(!stop[0].is_partial);
    }

    #[test]
    fn build_send_args_uses_session_id_and_permission_mode_plan() {
        let a = adapter();
        let ctx = InvocationContext {
            session_id: "abc",
            workspace: Some("/tmp/p"),
            model: Some("sonnet"),
            mode: Mode::Plan,
            message: "hi",
            is_new: true,
        };
        let args = a.build_send_args(&ctx);
        assert!(args.contains(&"--session-id".to_string()));
        assert!(args.contains(&"abc".to_string()));
        assert!(args.contains(&"--permission-mode".to_string()));
        assert!(args.contains(&"plan".to_string()));
        assert_eq!(args.last().unwrap(), "hi");
    }

    #[test]
    fn unknown_line_becomes_text() {
        let a = adapter();
        let b = a.parse_text_line("some arbitrary output", "some arbitrary output");
        assert_eq!(b.block, ContentBlock::Text { content: "some arbitrary output".into() });
    }
}
