//! Provider listing (§4.8): name, display name, capabilities, and the
//! typed setting descriptors the UI renders as a settings form.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde::Serialize;

use super::AppState;
use crate::providers::{Capabilities, SettingType};

#[derive(Debug, Serialize)]
pub struct SettingDescriptorView {
    pub key: &'static str,
    pub label: &'static str,
    pub description: Option<&'static str>,
    #[serde(rename = "type")]
    pub setting_type: SettingTypeView,
    pub default: serde_json::Value,
    pub options: Option<Vec<&'static str>>,
    pub range: Option<(f64, f64)>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingTypeView {
    Boolean,
    String,
    Select,
    Number,
}

impl From<SettingType> for SettingTypeView {
    fn from(t: SettingType) -> Self {
        match t {
            SettingType::Boolean => SettingTypeView::Boolean,
            SettingType::String => SettingTypeView::String,
            SettingType::Select => SettingTypeView::Select,
            SettingType::Number => SettingTypeView::Number,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProviderView {
    pub name: &'static str,
    pub display_name: &'static str,
    pub default_model: Option<&'static str>,
    pub capabilities: Capabilities,
    pub settings: Vec<SettingDescriptorView>,
}

pub async fn list_providers(State(state): State<Arc<AppState>>) -> Json<Vec<ProviderView>> {
    let mut views = Vec::new();
    for name in state.orchestrator.providers.names() {
        let Some(adapter) = state.orchestrator.providers.get(name) else { continue };
        views.push(ProviderView {
            name: adapter.name(),
            display_name: adapter.display_name(),
            default_model: adapter.default_model(),
            capabilities: adapter.capabilities(),
            settings: adapter
                .settings()
                .into_iter()
                .map(|s| SettingDescriptorView {
                    key: s.key,
                    label: s.label,
                    description: s.description,
                    setting_type: s.setting_type.into(),
                    default: s.default,
                    options: s.options,
                    range: s.range,
                })
                .collect(),
        });
    }
    Json(views)
}
