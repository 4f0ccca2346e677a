//! Non-streaming "opencode-like" adapter: `run --format json`, one flat JSON
//! object per line.

use std::collections::BTreeMap;

use super::{
    Adapter, AgentEvent, Capabilities, SessionContext, SettingDescriptor, SettingType,
    summarize_json, truncate,
};

pub struct OpencodeAdapter;

impl Adapter for OpencodeAdapter {
    fn name(&self) -> &'static str {
        "opencode"
    }

    fn display_name(&self) -> &'static str {
        "Opencode"
    }

    fn binary(&self) -> &'static str {
        "opencode"
    }

    fn default_model(&self) -> Option<&'static str> {
        None
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: false,
            max_turns: false,
            system_prompt: true,
            agent_teams: false,
            model_selection: true,
            dangerous_mode: false,
        }
    }

    fn settings(&self) -> Vec<SettingDescriptor> {
        vec![SettingDescriptor {
            key: "format",
            label: "Output format",
            description: Some("Wire format opencode should emit on stdout"),
            setting_type: SettingType::Select,
            default: serde_json::Value::String("json".into()),
            options: Some(vec!["json"]),
            range: None,
        }]
    }

    fn build_args(&self, ctx: &SessionContext) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--format".to_string(), "json".to_string()];
        if let Some(model) = &ctx.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(system_prompt) = &ctx.system_prompt {
            args.push("--system-prompt".to_string());
            args.push(system_prompt.clone());
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

        let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        if kind.starts_with("step_") {
            return Some(AgentEvent::Ignore);
        }

        match kind {
            "text" => {
                let content = value.get("content").and_then(|c| c.as_str()).unwrap_or("");
                Some(AgentEvent::Text(truncate(content, 800)))
            }
            "tool_use" => {
                let name = value.get("name").and_then(|n| n.as_str()).unwrap_or("tool").to_string();
                let input = value.get("input").cloned().unwrap_or(serde_json::Value::Null);
                Some(AgentEvent::ToolUse { name, input })
            }
            "error" => {
                let message = value.get("message").and_then(|m| m.as_str()).unwrap_or("");
                Some(AgentEvent::Error(truncate(message, 500)))
            }
            _ => Some(AgentEvent::Thinking(summarize_json(&value))),
        }
    }

    fn is_success_exit(&self, code: i32) -> bool {
        code == 0
    }
}
