//! Provider adapters: each names a CLI, builds its invocation, and parses its
//! stdout into a normalized [`AgentEvent`]. Adapters store only pure
//! functions — no per-provider state lives here; the registry is a plain
//! lookup table keyed by name.

pub mod claude;
pub mod codex;
pub mod opencode;

use std::collections::BTreeMap;

/// Normalized event produced by a provider's line parser. Parsers are total:
/// every line maps to exactly one of these (or `None` for an empty line).
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Text(String),
    Thinking(String),
    ToolUse { name: String, input: serde_json::Value },
    ToolResult(String),
    System(String),
    Error(String),
    Ignore,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub streaming: bool,
    pub max_turns: bool,
    pub system_prompt: bool,
    pub agent_teams: bool,
    pub model_selection: bool,
    pub dangerous_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingType {
    Boolean,
    String,
    Select,
    Number,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettingDescriptor {
    pub key: &'static str,
    pub label: &'static str,
    pub description: Option<&'static str>,
    pub setting_type: SettingType,
    pub default: serde_json::Value,
    pub options: Option<Vec<&'static str>>,
    pub range: Option<(f64, f64)>,
}

/// Per-session context fed to `build_args`/`build_env`: everything the
/// adapter needs to know about this particular invocation.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub prompt: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_turns: Option<u32>,
    pub dangerous_mode: bool,
    pub settings: BTreeMap<String, serde_json::Value>,
}

pub trait Adapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn binary(&self) -> &'static str;
    fn default_model(&self) -> Option<&'static str>;
    fn capabilities(&self) -> Capabilities;
    fn settings(&self) -> Vec<SettingDescriptor>;

    fn build_args(&self, ctx: &SessionContext) -> Vec<String>;

    fn build_env(&self, _ctx: &SessionContext) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Pure, total. `None` only for an empty line.
    fn parse_line(&self, line: &str) -> Option<AgentEvent>;

    fn is_success_exit(&self, code: i32) -> bool {
        code == 0
    }

    fn is_noise_line(&self, _line: &str) -> bool {
        false
    }
}

/// Plain name -> adapter lookup. Built once at startup.
pub struct ProviderRegistry {
    adapters: BTreeMap<&'static str, Box<dyn Adapter>>,
}

impl ProviderRegistry {
    pub fn with_builtin_adapters() -> Self {
        let mut adapters: BTreeMap<&'static str, Box<dyn Adapter>> = BTreeMap::new();
        let claude = claude::ClaudeAdapter;
        let codex = codex::CodexAdapter;
        let opencode = opencode::OpencodeAdapter;
        adapters.insert(claude.name(), Box::new(claude));
        adapters.insert(codex.name(), Box::new(codex));
        adapters.insert(opencode.name(), Box::new(opencode));
        Self { adapters }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Adapter> {
        self.adapters.get(name).map(|b| b.as_ref())
    }

    /// Register an additional adapter, overriding any existing one with the
    /// same name. Used by deployments that add a provider beyond the three
    /// built in, and by tests that stub a trivial child process.
    pub fn register(&mut self, adapter: Box<dyn Adapter>) {
        self.adapters.insert(adapter.name(), adapter);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.adapters.keys().copied().collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtin_adapters()
    }
}

/// Truncate `s` to at most `max` characters, preserving char boundaries.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

/// Compact one-line summary of a JSON blob the assistant emitted instead of
/// prose. Total: never panics, output length is always `<= 200`.
pub fn summarize_json(value: &serde_json::Value) -> String {
    const MAX_LEN: usize = 200;

    fn salient_parameter(input: &serde_json::Value) -> String {
        match input {
            serde_json::Value::Object(map) => map
                .values()
                .next()
                .map(value_to_short_string)
                .unwrap_or_default(),
            other => value_to_short_string(other),
        }
    }

    fn value_to_short_string(v: &serde_json::Value) -> String {
        match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn summarize_block(block: &serde_json::Value) -> String {
        let block_type = block.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match block_type {
            "tool_use" => {
                let name = block.get("name").and_then(|n| n.as_str()).unwrap_or("tool");
                let input = block.get("input").cloned().unwrap_or(serde_json::Value::Null);
                format!("{name} \u{2192} {}", salient_parameter(&input))
            }
            "text" => {
                let text = block.get("text").and_then(|t| t.as_str()).unwrap_or("");
                truncate(text, 80)
            }
            _ => truncate(&block.to_string(), 80),
        }
    }

    let summary = if let Some(content) = value.get("content").and_then(|c| c.as_array()) {
        content.iter().map(summarize_block).collect::<Vec<_>>().join("; ")
    } else if value.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
        let name = value.get("name").and_then(|n| n.as_str()).unwrap_or("tool");
        let input = value.get("input").cloned().unwrap_or(serde_json::Value::Null);
        format!("{name} \u{2192} {}", salient_parameter(&input))
    } else {
        let type_s = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let model_s = value.get("model").and_then(|t| t.as_str()).unwrap_or("");
        let stop_reason_s = value.get("stop_reason").and_then(|t| t.as_str()).unwrap_or("");
        [type_s, model_s, stop_reason_s]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" \u{b7} ")
    };

    truncate(&summary, MAX_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("hello", 10), "hello");
    }

    #[test]
    fn truncate_cuts_long_strings() {
        let s = "a".repeat(300);
        assert_eq!(truncate(&s, 200).chars().count(), 200);
    }

    #[test]
    fn registry_has_all_builtin_adapters() {
        let registry = ProviderRegistry::with_builtin_adapters();
        assert!(registry.get("claude").is_some());
        assert!(registry.get("codex").is_some());
        assert!(registry.get("opencode").is_some());
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn summarize_json_tool_use_block() {
        let v: serde_json::Value = serde_json::from_str(
            r#"{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/a.rs"}}]}"#,
        )
        .unwrap();
        let summary = summarize_json(&v);
        assert_eq!(summary, "Read \u{2192} /a.rs");
    }

    #[test]
    fn summarize_json_text_block() {
        let v: serde_json::Value =
            serde_json::from_str(r#"{"content":[{"type":"text","text":"hello world"}]}"#).unwrap();
        assert_eq!(summarize_json(&v), "hello world");
    }

    #[test]
    fn summarize_json_single_tool_use() {
        let v: serde_json::Value =
            serde_json::from_str(r#"{"type":"tool_use","name":"Bash","input":{"command":"ls"}}"#).unwrap();
        assert_eq!(summarize_json(&v), "Bash \u{2192} ls");
    }

    #[test]
    fn summarize_json_falls_back_to_type_fields() {
        let v: serde_json::Value =
            serde_json::from_str(r#"{"type":"message","model":"claude-3","stop_reason":"end_turn"}"#)
                .unwrap();
        assert_eq!(summarize_json(&v), "message \u{b7} claude-3 \u{b7} end_turn");
    }

    #[test]
    fn summarize_json_is_total_for_empty_object() {
        let v: serde_json::Value = serde_json::from_str("{}").unwrap();
        assert_eq!(summarize_json(&v), "");
    }

    #[test]
    fn summarize_json_truncates_to_200() {
        let big_text = "x".repeat(500);
        let v: serde_json::Value =
            serde_json::from_str(&format!(r#"{{"content":[{{"type":"text","text":"{big_text}"}}]}}"#))
                .unwrap();
        assert!(summarize_json(&v).len() <= 200);
    }
}
