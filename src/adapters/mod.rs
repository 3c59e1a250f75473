//! Adapter Registry: one adapter per supported CLI tool, each knowing how
//! to build invocations for create/send/interactive modes and how to parse
//! one raw chunk into zero-or-more content blocks.
//!
//! Adapters are plain structs implementing the `Adapter` trait — a
//! capability record, not an inheritance hierarchy. The registry built by
//! `default_registry()` is immutable after startup and freely shared.

pub mod claude;
pub mod cursor_agent;
pub mod gemini;

use std::collections::HashMap;
use std::sync::OnceLock;

use serde_json::Value;

use crate::parser::ParsedBlock;
use crate::schema::{ApprovalAction, Mode, Tool};

/// Whether an adapter's live stream is structured JSON per line or free
/// text with ANSI escapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStrategy {
    JsonLines,
    AnsiText,
}

/// How a conversation id comes into being for this adapter: either the
/// CLI itself mints and prints one, or the caller must generate one.
pub enum CreateArgs {
    /// The child process is spawned with these args and prints the id on
    /// stdout; `parse_create_output` extracts it.
    Spawn(Vec<String>),
    /// No create command exists; the Broker must mint a UUID itself.
    CallerGeneratesId,
}

/// Everything an adapter needs to build a send/interactive invocation.
pub struct InvocationContext<'a> {
    pub session_id: &'a str,
    pub workspace: Option<&'a str>,
    pub model: Option<&'a str>,
    pub mode: Mode,
    pub message: &'a str,
    /// True on the first message of a conversation (affects --session-id
    /// vs --resume for adapters without a create command).
    pub is_new: bool,
}

pub trait Adapter: Send + Sync {
    fn tool(&self) -> Tool;

    /// Candidate executable names tried in order (Claude tries `claude`
    /// then `claude-code`).
    fn executable_names(&self) -> &'static [&'static str];

    /// Resolves this adapter's executable against `PATH`, memoized per
    /// adapter after first success. Each adapter delegates to its own
    /// `AvailabilityCache` field.
    fn resolve_executable(&self) -> Option<String>;

    fn parse_strategy(&self) -> ParseStrategy;

    fn build_create_args(&self, workspace: &str) -> CreateArgs;

    fn build_send_args(&self, ctx: &InvocationContext) -> Vec<String>;

    fn build_interactive_args(&self, ctx: &InvocationContext) -> Vec<String>;

    /// Trims whitespace and returns the printed id verbatim.
    fn parse_create_output(&self, raw: &str) -> String {
        raw.trim().to_string()
    }

    /// Returns an ordered list of content blocks from one structured event,
    /// each tagged with whether it is a streaming-partial record carrying
    /// cumulative content.
    fn parse_json_event(&self, event: &Value) -> Vec<ParsedBlock>;

    /// Inspects one ANSI-stripped line; always returns exactly one block.
    /// Unrecognized lines become `text`.
    fn parse_text_line(&self, stripped: &str, original: &str) -> ParsedBlock;

    /// Categorizes a prompt into `file_edit|command|generic` by keyword
    /// match, or `None` if it isn't an approval prompt at all.
    fn detect_approval_request(&self, stripped: &str) -> Option<ApprovalAction> {
        default_detect_approval_request(stripped)
    }

    /// Whether this adapter's own stream emits its own `session_start`
    /// block (Claude's `message_start` event, for example). When false,
    /// the Session Runtime synthesizes one on the first dispatched turn so
    /// every conversation still opens with exactly one.
    fn reports_session_start(&self) -> bool {
        false
    }
}

/// Shared keyword classifier used by every adapter's default approval
/// detection.
pub fn default_detect_approval_request(stripped: &str) -> Option<ApprovalAction> {
    let lower = stripped.to_lowercase();
    let looks_like_prompt = lower.contains("(y/n)")
        || lower.contains("[y/n]")
        || lower.contains("yes/no")
        || lower.contains("do you want to");
    if !looks_like_prompt {
        return None;
    }
    if lower.contains("edit") || lower.contains("write") || lower.contains("file") {
        Some(ApprovalAction::FileEdit)
    } else if lower.contains("run") || lower.contains("command") || lower.contains("execute") {
        Some(ApprovalAction::Command)
    } else {
        Some(ApprovalAction::Generic)
    }
}

/// Caches an adapter's `which <tool>` probe after first success.
pub struct AvailabilityCache {
    found: OnceLock<String>,
}

impl Default for AvailabilityCache {
    fn default() -> Self {
        Self { found: OnceLock::new() }
    }
}

impl AvailabilityCache {
    /// Returns the resolved executable path, probing `PATH` for each
    /// candidate name in order the first time this is called and caching
    /// the result for the process lifetime.
    pub fn resolve(&self, candidates: &[&'static str]) -> Option<String> {
        if let Some(found) = self.found.get() {
            return Some(found.clone());
        }
        for name in candidates {
            if let Some(path) = probe_which(name) {
                let _ = self.found.set(path.clone());
                return Some(path);
            }
        }
        None
    }

    pub fn is_available(&self, candidates: &[&'static str]) -> bool {
        self.resolve(candidates).is_some()
    }
}

fn probe_which(name: &str) -> Option<String> {
    let output = std::process::Command::new("which").arg(name).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if path.is_empty() { None } else { Some(path) }
}

/// Builds the immutable tool -> adapter registry used for the process
/// lifetime.
pub fn default_registry() -> HashMap<Tool, Box<dyn Adapter>> {
    let mut map: HashMap<Tool, Box<dyn Adapter>> = HashMap::new();
    map.insert(Tool::CursorAgent, Box::new(cursor_agent::CursorAgentAdapter::default()));
    map.insert(Tool::Claude, Box::new(claude::ClaudeAdapter::default()));
    map.insert(Tool::Gemini, Box::new(gemini::GeminiAdapter::default()));
    map
}

/// Strips diff-looking content (`^[-+@]` prefixes across a block) into a
/// `code_block` with `language=diff`. Shared by adapters whose text-line
/// parsing wants this heuristic.
pub fn looks_like_diff_line(line: &str) -> bool {
    line.starts_with('+') || line.starts_with('-') || line.starts_with('@')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_cache_does_not_memoize_a_miss() {
        let cache = AvailabilityCache::default();
        // A name that will never exist on PATH. Only a success is cached;
        // repeated misses must re-probe rather than latch onto `None`, so
        // this just asserts repeated calls stay consistent.
        assert!(!cache.is_available(&["definitely-not-a-real-cli-binary-xyz"]));
        assert!(!cache.is_available(&["definitely-not-a-real-cli-binary-xyz"]));
    }

    #[test]
    fn default_approval_detection_categorizes_by_keyword() {
        assert_eq!(
            default_detect_approval_request("Do you want to edit file x? (y/n)"),
            Some(ApprovalAction::FileEdit)
        );
        assert_eq!(
            default_detect_approval_request("Run this command? (y/n)"),
            Some(ApprovalAction::Command)
        );
        assert_eq!(default_detect_approval_request("just some text"), None);
    }
}
