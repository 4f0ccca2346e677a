//! Streaming "claude-like" adapter: `stream-json` output over stdout, one
//! JSON object per line.

use std::collections::BTreeMap;

use super::{
    Adapter, AgentEvent, Capabilities, SessionContext, SettingDescriptor, SettingType,
    summarize_json, truncate,
};

const NOISE_SUBTYPES: &[&str] = &["hook_started", "hook_response", "init", "config"];

pub struct ClaudeAdapter;

impl Adapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn display_name(&self) -> &'static str {
        "Claude"
    }

    fn binary(&self) -> &'static str {
        "claude"
    }

    fn default_model(&self) -> Option<&'static str> {
        Some("sonnet")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            max_turns: true,
            system_prompt: true,
            agent_teams: true,
            model_selection: true,
            dangerous_mode: true,
        }
    }

    fn settings(&self) -> Vec<SettingDescriptor> {
        vec![
            SettingDescriptor {
                key: "disable_slash_commands",
                label: "Disable slash commands",
                description: Some("Strip slash-command handling from the child session"),
                setting_type: SettingType::Boolean,
                default: serde_json::Value::Bool(false),
                options: None,
                range: None,
            },
            SettingDescriptor {
                key: "max_turns",
                label: "Max turns",
                description: Some("Upper bound on agent turns for a single session"),
                setting_type: SettingType::Number,
                default: serde_json::Value::Number(50.into()),
                options: None,
                range: Some((1.0, 500.0)),
            },
        ]
    }

    fn build_args(&self, ctx: &SessionContext) -> Vec<String> {
        let mut args = vec!["-p".to_string(), ctx.prompt.clone(), "--output-format".to_string(), "stream-json".to_string()];
        if let Some(max_turns) = ctx.max_turns {
            args.push("--max-turns".to_string());
            args.push(max_turns.to_string());
        }
        if let Some(model) = &ctx.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if ctx.dangerous_mode {
            args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(system_prompt) = &ctx.system_prompt {
            args.push("--system-prompt".to_string());
            args.push(system_prompt.clone());
        }
        if ctx.settings.get("disable_slash_commands").and_then(|v| v.as_bool()).unwrap_or(false) {
            args.push("--disable-slash-commands".to_string());
        }
        args
    }

    fn build_env(&self, _ctx: &SessionContext) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn parse_line(&self, line: &str) -> Option<AgentEvent> {
        if line.trim().is_empty() {
            return None;
        }

        let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
            let trimmed = line.trim();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                return Some(AgentEvent::Thinking(truncate(trimmed, 200)));
            }
            return Some(AgentEvent::System(truncate(trimmed, 500)));
        };

        let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match kind {
            "assistant" => {
                let content = value
                    .pointer("/message/content")
                    .cloned()
                    .unwrap_or(serde_json::Value::Array(vec![]));
                let blocks = content.as_array().cloned().unwrap_or_default();
                let has_tool_use = blocks.iter().any(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"));
                if has_tool_use {
                    Some(AgentEvent::Thinking(summarize_json(&value.get("message").cloned().unwrap_or(value.clone()))))
                } else {
                    let text: String = blocks
                        .iter()
                        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("\n");
                    Some(AgentEvent::Text(truncate(&text, 800)))
                }
            }
            "tool_use" => {
                let name = value.get("name").and_then(|n| n.as_str()).unwrap_or("tool").to_string();
                let input = value.get("input").cloned().unwrap_or(serde_json::Value::Null);
                Some(AgentEvent::ToolUse { name, input })
            }
            "system" => {
                let subtype = value.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
                if NOISE_SUBTYPES.contains(&subtype) {
                    Some(AgentEvent::Ignore)
                } else {
                    let content = value
                        .get("message")
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| summarize_json(&value));
                    Some(AgentEvent::System(truncate(&content, 500)))
                }
            }
            "result" => {
                let content = value
                    .get("result")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| summarize_json(&value));
                Some(AgentEvent::System(truncate(&content, 500)))
            }
            "error" => {
                let content = value
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| summarize_json(&value));
                Some(AgentEvent::Error(truncate(&content, 500)))
            }
            _ => Some(AgentEvent::Thinking(summarize_json(&value))),
        }
    }

    fn is_success_exit(&self, code: i32) -> bool {
        code == 0
    }

    fn is_noise_line(&self, line: &str) -> bool {
        line.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SessionContext {
        SessionContext { prompt: "build the login page".into(), ..Default::default() }
    }

    #[test]
    fn build_args_includes_prompt_and_stream_flag() {
        let adapter = ClaudeAdapter;
        let args = adapter.build_args(&ctx());
        assert!(args.contains(&"build the login page".to_string()));
        assert!(args.contains(&"stream-json".to_string()));
    }

    #[test]
    fn build_args_includes_model_when_set() {
        let adapter = ClaudeAdapter;
        let mut c = ctx();
        c.model = Some("opus".into());
        let args = adapter.build_args(&c);
        let idx = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[idx + 1], "opus");
    }

    #[test]
    fn build_args_includes_dangerous_flag() {
        let adapter = ClaudeAdapter;
        let mut c = ctx();
        c.dangerous_mode = true;
        let args = adapter.build_args(&c);
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn parse_line_empty_returns_none() {
        let adapter = ClaudeAdapter;
        assert_eq!(adapter.parse_line(""), None);
        assert_eq!(adapter.parse_line("   "), None);
    }

    #[test]
    fn parse_line_assistant_text() {
        let adapter = ClaudeAdapter;
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi there"}]}}"#;
        assert_eq!(adapter.parse_line(line), Some(AgentEvent::Text("hi there".into())));
    }

    #[test]
    fn parse_line_assistant_tool_use_is_thinking() {
        let adapter = ClaudeAdapter;
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"a.rs"}}]}}"#;
        match adapter.parse_line(line) {
            Some(AgentEvent::Thinking(s)) => assert!(s.contains("Read")),
            other => panic!("expected Thinking, got {other:?}"),
        }
    }

    #[test]
    fn parse_line_drops_noise_system_subtype() {
        let adapter = ClaudeAdapter;
        let line = r#"{"type":"system","subtype":"init"}"#;
        assert_eq!(adapter.parse_line(line), Some(AgentEvent::Ignore));
    }

    #[test]
    fn parse_line_keeps_non_noise_system_subtype() {
        let adapter = ClaudeAdapter;
        let line = r#"{"type":"system","subtype":"warning","message":"low disk space"}"#;
        assert_eq!(adapter.parse_line(line), Some(AgentEvent::System("low disk space".into())));
    }

    #[test]
    fn parse_line_tool_use_top_level() {
        let adapter = ClaudeAdapter;
        let line = r#"{"type":"tool_use","name":"Bash","input":{"command":"ls"}}"#;
        match adapter.parse_line(line) {
            Some(AgentEvent::ToolUse { name, .. }) => assert_eq!(name, "Bash"),
            other => panic!("expected ToolUse, got {other:?}"),
        }
    }

    #[test]
    fn parse_line_malformed_json_looking_line_is_thinking() {
        let adapter = ClaudeAdapter;
        let line = "{not valid json";
        assert_eq!(adapter.parse_line(line), Some(AgentEvent::Thinking("{not valid json".into())));
    }

    #[test]
    fn parse_line_plain_text_is_system() {
        let adapter = ClaudeAdapter;
        let line = "starting up...";
        assert_eq!(adapter.parse_line(line), Some(AgentEvent::System("starting up...".into())));
    }

    #[test]
    fn parse_line_never_panics_on_arbitrary_input() {
        let adapter = ClaudeAdapter;
        for line in ["", "{}", "[]", "null", "\"just a string\"", "12345", "{\"type\":123}"] {
            let _ = adapter.parse_line(line);
        }
    }
}
