//! Selective tool filtering.
//!
//! A tool is hidden when its name is block-listed, when its heuristic
//! category is blocked, or when a context filter is set and the tool is tied
//! to a language or project type outside that context.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::models::Tool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Filesystem,
    Memory,
    Web,
    VersionControl,
    Search,
    General,
}

const CATEGORY_KEYWORDS: &[(ToolCategory, &[&str])] = &[
    (
        ToolCategory::Filesystem,
        &["file", "directory", "folder", "path", "filesystem"],
    ),
    (
        ToolCategory::Memory,
        &["memory", "remember", "recall", "knowledge", "entity", "entities", "observation"],
    ),
    (
        ToolCategory::Web,
        &["http", "fetch", "url", "web", "browser", "download", "scrape"],
    ),
    (
        ToolCategory::VersionControl,
        &["git", "commit", "branch", "merge", "pull_request", "repository"],
    ),
    (
        ToolCategory::Search,
        &["search", "find", "query", "grep", "lookup"],
    ),
];

impl ToolCategory {
    /// First category whose keyword occurs in the tool's name or description.
    pub fn of(tool: &Tool) -> Self {
        let text = tool.search_text();
        CATEGORY_KEYWORDS
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
            .map(|(category, _)| *category)
            .unwrap_or(ToolCategory::General)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Memory => "memory",
            Self::Web => "web",
            Self::VersionControl => "version_control",
            Self::Search => "search",
            Self::General => "general",
        }
    }
}

impl std::str::FromStr for ToolCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "filesystem" | "fs" => Ok(Self::Filesystem),
            "memory" => Ok(Self::Memory),
            "web" => Ok(Self::Web),
            "version_control" | "vcs" | "git" => Ok(Self::VersionControl),
            "search" => Ok(Self::Search),
            "general" => Ok(Self::General),
            other => Err(format!("Unknown tool category: {}", other)),
        }
    }
}

/// Words that tie a tool to one language or project type.
const CONTEXT_VOCABULARY: &[&str] = &[
    "python", "javascript", "typescript", "rust", "golang", "java", "ruby", "solidity", "php",
    "csharp", "swift", "kotlin", "react", "vue", "django", "flask", "rails", "node", "docker",
    "kubernetes",
];

const EXTENSION_LANGUAGES: &[(&str, &str)] = &[
    ("py", "python"),
    ("js", "javascript"),
    ("jsx", "react"),
    ("ts", "typescript"),
    ("tsx", "react"),
    ("rs", "rust"),
    ("go", "golang"),
    ("java", "java"),
    ("rb", "ruby"),
    ("sol", "solidity"),
    ("php", "php"),
    ("cs", "csharp"),
    ("swift", "swift"),
    ("kt", "kotlin"),
    ("vue", "vue"),
];

/// The project a tool list is being prepared for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContextFilter {
    /// Extensions (`rs`, `.py`) or language names.
    pub file_types: Vec<String>,
    pub project_types: Vec<String>,
}

impl ContextFilter {
    fn keywords(&self) -> HashSet<String> {
        let mut keywords = HashSet::new();
        for ft in &self.file_types {
            let ft = ft.trim_start_matches('.').to_lowercase();
            if let Some((_, lang)) = EXTENSION_LANGUAGES.iter().find(|(ext, _)| *ext == ft) {
                keywords.insert(lang.to_string());
            }
            keywords.insert(ft);
        }
        for pt in &self.project_types {
            keywords.insert(pt.to_lowercase());
        }
        keywords
    }

    /// Tools mentioning no context word always pass; otherwise at least one
    /// mentioned word must belong to this context.
    pub fn matches(&self, tool: &Tool) -> bool {
        let text = tool.search_text();
        let mentioned: Vec<&str> = text
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|word| CONTEXT_VOCABULARY.contains(word))
            .collect();
        if mentioned.is_empty() {
            return true;
        }
        let keywords = self.keywords();
        mentioned.iter().any(|word| keywords.contains(*word))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolFilter {
    pub blocked_tools: HashSet<String>,
    pub blocked_categories: HashSet<ToolCategory>,
    pub context: Option<ContextFilter>,
}

impl ToolFilter {
    pub fn block_tool(mut self, name: impl Into<String>) -> Self {
        self.blocked_tools.insert(name.into());
        self
    }

    pub fn block_category(mut self, category: ToolCategory) -> Self {
        self.blocked_categories.insert(category);
        self
    }

    pub fn with_context(mut self, context: ContextFilter) -> Self {
        self.context = Some(context);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.blocked_tools.is_empty() && self.blocked_categories.is_empty() && self.context.is_none()
    }

    pub fn allows(&self, tool: &Tool) -> bool {
        if self.blocked_tools.contains(&tool.name) {
            return false;
        }
        if !self.blocked_categories.is_empty()
            && self.blocked_categories.contains(&ToolCategory::of(tool))
        {
            return false;
        }
        match self.context {
            Some(ref context) => context.matches(tool),
            None => true,
        }
    }

    pub fn apply(&self, tools: &[Tool]) -> Vec<Tool> {
        if self.is_empty() {
            return tools.to_vec();
        }
        tools.iter().filter(|t| self.allows(t)).cloned().collect()
    }
}
