//! Gemini adapter. No explicit create command; caller mints an id. The
//! CLI's exact flag surface is unverified, so this adapter is kept
//! deliberately small and defensive: unrecognized shapes fall back to
//! `raw` rather than guessing at a richer contract.

use serde_json::Value;

use super::{Adapter, CreateArgs, InvocationContext, ParseStrategy};
use crate::parser::ParsedBlock;
use crate::schema::{ContentBlock, Mode, Tool};

#[derive(Default)]
pub struct GeminiAdapter {
    availability: super::AvailabilityCache,
}

impl GeminiAdapter {
    pub fn is_available(&self) -> bool {
        self.availability.is_available(self.executable_names())
    }
}

impl Adapter for GeminiAdapter {
    fn tool(&self) -> Tool {
        Tool::Gemini
    }

    fn executable_names(&self) -> &'static [&'static str] {
        &["gemini"]
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

    fn build_send_args(&self, ctx: &InvocationContext) -> Vec<String> {
        let mut args = vec!["--prompt".to_string(), ctx.message.to_string()];
        if let Some(workspace) = ctx.workspace {
            args.push("--workspace".to_string());
            args.push(workspace.to_string());
        }
        if let Some(model) = ctx.model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args.push("--session-id".to_string());
        args.push(ctx.session_id.to_string());
        args
    }

    fn build_interactive_args(&self, ctx: &InvocationContext) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(workspace) = ctx.workspace {
            args.push("--workspace".to_string());
            args.push(workspace.to_string());
        }
        if let Some(model) = ctx.model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args.push("--session-id".to_string());
        args.push(ctx.session_id.to_string());
        let _ = ctx.mode;
        args
    }

    fn parse_json_event(&self, event: &Value) -> Vec<ParsedBlock> {
        if let Some(text) = event.get("text").and_then(Value::as_str) {
            return vec![ParsedBlock::partial(ContentBlock::Text { content: text.to_string() })];
        }
        // Gemini's own CLI has been observed to emit the call under either
        // `functionCall` or `tool_call`; normalize both.
        if let Some(call) = event.get("functionCall").or_else(|| event.get("tool_call")) {
            let tool_id = call
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| call.get("name").and_then(Value::as_str).map(str::to_string));
            let tool_name = call.get("name").and_then(Value::as_str).map(str::to_string);
            let input = call.get("args").or_else(|| call.get("input")).cloned().unwrap_or(Value::Null);
            return match ContentBlock::tool_use_start(tool_id, tool_name, input) {
                Some(b) => vec![ParsedBlock::whole(b)],
                None => vec![ParsedBlock::whole(ContentBlock::Raw { value: event.clone() })],
            };
        }
        if let Some(response) = event.get("functionResponse").or_else(|| event.get("tool_result")) {
            let tool_id = response.get("id").and_then(Value::as_str).unwrap_or("").to_string();
            let tool_name = response.get("name").and_then(Value::as_str).unwrap_or("").to_string();
            let content = response
                .get("response")
                .or_else(|| response.get("content"))
                .map(|v| v.to_string())
                .unwrap_or_default();
            let is_error = response.get("error").is_some();
            return vec![ParsedBlock::whole(ContentBlock::ToolUseResult { tool_id, tool_name, content, is_error })];
        }
        if event.get("type").and_then(Value::as_str) == Some("done") {
            let success = event.get("error").is_none();
            return vec![ParsedBlock::whole(ContentBlock::SessionEnd {
                reason: if success { "end_turn".into() } else { "error".into() },
                success,
            })];
        }
        vec![ParsedBlock::whole(ContentBlock::Raw { value: event.clone() })]
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
        ParsedBlock::whole(ContentBlock::Text { content: stripped.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> GeminiAdapter {
        GeminiAdapter::default()
    }

    #[test]
    fn normalizes_function_call_alternate_name() {
        let a = adapter();
        let event = json!({"functionCall": {"id": "t1", "name": "Grep", "args": {"q": "x"}}});
        let blocks = a.parse_json_event(&event);
        assert_eq!(
            blocks[0].block,
            ContentBlock::ToolUseStart { tool_id: "t1".into(), tool_name: "Grep".into(), input: json!({"q": "x"}) }
        );
    }

    #[test]
    fn normalizes_tool_call_alternate_name() {
        let a = adapter();
        let event = json!({"tool_call": {"id": "t2", "name": "Read", "input": {"path": "a.rs"}}});
        let blocks = a.parse_json_event(&event);
        assert_eq!(
            blocks[0].block,
            ContentBlock::ToolUseStart { tool_id: "t2".into(), tool_name: "Read".into(), input: json!({"path": "a.rs"}) }
        );
    }

    #[test]
    fn unmatched_event_shape_becomes_raw() {
        let a = adapter();
        let event = json!({"something": "else"});
        let blocks = a.parse_json_event(&event);
        assert_eq!(blocks[0].block.kind(), "raw");
    }

    #[test]
    fn build_send_args_uses_prompt_flag_and_no_dash_p() {
        let a = adapter();
        let ctx = InvocationContext {
            session_id: "gid",
            workspace: None,
            model: Some("gemini-pro"),
            mode: Mode::Agent,
            message: "hi",
            is_new: true,
        };
        let args = a.build_send_args(&ctx);
        assert_eq!(args[0], "--prompt");
        assert!(!args.contains(&"-p".to_string()));
        assert!(args.contains(&"gid".to_string()));
    }
}
