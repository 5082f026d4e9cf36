use serde::{Deserialize, Serialize};

/// A tool advertised by a provider in its `tools/list` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

impl Tool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Lowercased `name + description`, used by the keyword heuristics.
    pub(crate) fn search_text(&self) -> String {
        let mut text = self.name.to_lowercase();
        if let Some(ref desc) = self.description {
            text.push(' ');
            text.push_str(&desc.to_lowercase());
        }
        text
    }
}

/// A tool paired with the provider that exposes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderTool {
    #[serde(flatten)]
    pub tool: Tool,
    pub provider_name: String,
}

impl ProviderTool {
    pub fn new(tool: Tool, provider_name: impl Into<String>) -> Self {
        Self {
            tool,
            provider_name: provider_name.into(),
        }
    }
}
