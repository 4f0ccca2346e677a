//! Non-streaming "codex-like" adapter: `exec --json`, one JSON object per
//! line wrapping `item.started`/`item.completed` envelopes.

use std::collections::BTreeMap;

use super::{
    Adapter, AgentEvent, Capabilities, SessionContext, SettingDescriptor, SettingType,
    summarize_json, truncate,
};

pub struct CodexAdapter;

impl Adapter for CodexAdapter {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn display_name(&self) -> &'static str {
        "Codex"
    }

    fn binary(&self) -> &'static str {
        "codex"
    }

    fn default_model(&self) -> Option<&'static str> {
        Some("o4-mini")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            max_turns: false,
            system_prompt: false,
            agent_teams: false,
            model_selection: true,
            dangerous_mode: true,
        }
    }

    fn settings(&self) -> Vec<SettingDescriptor> {
        vec![SettingDescriptor {
            key: "sandbox",
            label: "Sandbox mode",
            description: Some("Codex's filesystem/network sandbox policy"),
            setting_type: SettingType::Select,
            default: serde_json::Value::String("workspace-write".into()),
            options: Some(vec!["read-only", "workspace-write", "danger-full-access"]),
            range: None,
        }]
    }

    fn build_args(&self, ctx: &SessionContext) -> Vec<String> {
        let sandbox = ctx
            .settings
            .get("sandbox")
            .and_then(|v| v.as_str())
            .unwrap_or("workspace-write")
            .to_string();
        let mut args = vec!["exec".to_string(), "--json".to_string(), "--sandbox".to_string(), sandbox];
        if let Some(model) = &ctx.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if ctx.dangerous_mode {
            args.push("--full-auto".to_string());
        }
        args.push(ctx.prompt.clone());
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

        let envelope = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        if envelope == "item.started" {
            return Some(AgentEvent::Ignore);
        }
        if envelope != "item.completed" {
            return Some(AgentEvent::Thinking(summarize_json(&value)));
        }

        let item = value.get("item").cloned().unwrap_or(serde_json::Value::Null);
        let item_type = item.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match item_type {
            "agent_message" => {
                let text = item.get("text").and_then(|t| t.as_str()).unwrap_or("");
                Some(AgentEvent::Text(truncate(text, 800)))
            }
            "reasoning" => {
                let text = item.get("text").and_then(|t| t.as_str()).unwrap_or("");
                Some(AgentEvent::Thinking(truncate(text, 200)))
            }
            "tool_call" => {
                let name = item.get("name").and_then(|n| n.as_str()).unwrap_or("tool").to_string();
                let input = item.get("input").cloned().unwrap_or(serde_json::Value::Null);
                Some(AgentEvent::ToolUse { name, input })
            }
            "tool_call_output" => {
                let output = item.get("output").and_then(|o| o.as_str()).unwrap_or("");
                Some(AgentEvent::ToolResult(truncate(output, 500)))
            }
            "command_execution" => {
                let command = item.get("command").and_then(|c| c.as_str()).unwrap_or("");
                let exit_code = item.get("exit_code").and_then(|c| c.as_i64()).unwrap_or(-1);
                Some(AgentEvent::System(truncate(&format!("$ {command} (exit {exit_code})"), 500)))
            }
            _ => Some(AgentEvent::Thinking(summarize_json(&item))),
        }
    }

    fn is_success_exit(&self, code: i32) -> bool {
        code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SessionContext {
        SessionContext { prompt: "implement feature f1".into(), ..Default::default() }
    }

    #[test]
    fn build_args_includes_exec_and_sandbox() {
        let adapter = CodexAdapter;
        let args = adapter.build_args(&ctx());
        assert!(args.contains(&"exec".to_string()));
        assert!(args.contains(&"--sandbox".to_string()));
        assert!(args.contains(&"workspace-write".to_string()));
        assert_eq!(args.last(), Some(&"implement feature f1".to_string()));
    }

    #[test]
    fn build_args_respects_sandbox_setting() {
        let adapter = CodexAdapter;
        let mut c = ctx();
        c.settings.insert("sandbox".into(), serde_json::Value::String("read-only".into()));
        let args = adapter.build_args(&c);
        assert!(args.contains(&"read-only".to_string()));
    }

    #[test]
    fn parse_line_item_started_is_ignored() {
        let adapter = CodexAdapter;
        let line = r#"{"type":"item.started","item":{"type":"agent_message"}}"#;
        assert_eq!(adapter.parse_line(line), Some(AgentEvent::Ignore));
    }

    #[test]
    fn parse_line_agent_message_completed() {
        let adapter = CodexAdapter;
        let line = r#"{"type":"item.completed","item":{"type":"agent_message","text":"done"}}"#;
        assert_eq!(adapter.parse_line(line), Some(AgentEvent::Text("done".into())));
    }

    #[test]
    fn parse_line_reasoning_is_thinking() {
        let adapter = CodexAdapter;
        let line = r#"{"type":"item.completed","item":{"type":"reasoning","text":"considering approach"}}"#;
        assert_eq!(adapter.parse_line(line), Some(AgentEvent::Thinking("considering approach".into())));
    }

    #[test]
    fn parse_line_tool_call() {
        let adapter = CodexAdapter;
        let line = r#"{"type":"item.completed","item":{"type":"tool_call","name":"apply_patch","input":{"path":"a.rs"}}}"#;
        match adapter.parse_line(line) {
            Some(AgentEvent::ToolUse { name, .. }) => assert_eq!(name, "apply_patch"),
            other => panic!("expected ToolUse, got {other:?}"),
        }
    }

    #[test]
    fn parse_line_command_execution_aggregates() {
        let adapter = CodexAdapter;
        let line = r#"{"type":"item.completed","item":{"type":"command_execution","command":"cargo test","exit_code":0}}"#;
        assert_eq!(
            adapter.parse_line(line),
            Some(AgentEvent::System("$ cargo test (exit 0)".into()))
        );
    }

    #[test]
    fn parse_line_tool_call_output() {
        let adapter = CodexAdapter;
        let line = r#"{"type":"item.completed","item":{"type":"tool_call_output","output":"ok"}}"#;
        assert_eq!(adapter.parse_line(line), Some(AgentEvent::ToolResult("ok".into())));
    }

    #[test]
    fn parse_line_never_panics_on_arbitrary_input() {
        let adapter = CodexAdapter;
        for line in ["", "{}", "not json at all", "{\"type\":\"item.completed\"}"] {
            let _ = adapter.parse_line(line);
        }
    }
}
