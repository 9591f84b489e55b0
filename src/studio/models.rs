use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Target stack for a generated app. `NextJs` is the primary framework and
/// the fallback whenever classification or template lookup fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    Nextjs,
    React,
    Vue,
    Svelte,
    Angular,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nextjs => "nextjs",
            Self::React => "react",
            Self::Vue => "vue",
            Self::Svelte => "svelte",
            Self::Angular => "angular",
        }
    }

    /// All frameworks, in classifier preference order.
    pub fn all() -> &'static [Framework] {
        &[
            Self::Nextjs,
            Self::React,
            Self::Vue,
            Self::Svelte,
            Self::Angular,
        ]
    }

    /// Name of the sandbox template this framework provisions from.
    pub fn template(&self) -> String {
        format!("kiln-{}", self.as_str())
    }

    pub fn dev_port(&self) -> u16 {
        match self {
            Self::Nextjs => 3000,
            Self::React | Self::Vue | Self::Svelte => 5173,
            Self::Angular => 4200,
        }
    }

    pub fn lint_command(&self) -> &'static str {
        match self {
            Self::Nextjs => "npx next lint",
            Self::Angular => "npx ng lint",
            _ => "npx eslint .",
        }
    }

    pub fn build_command(&self) -> &'static str {
        "npm run build"
    }

    /// Import prefix that generated code must reference for this framework,
    /// if it has a structural compliance requirement. Next.js apps are
    /// expected to build on the shared component library.
    pub fn required_import(&self) -> Option<&'static str> {
        match self {
            Self::Nextjs => Some("@/components/ui/"),
            _ => None,
        }
    }
}

impl Default for Framework {
    fn default() -> Self {
        Self::Nextjs
    }
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nextjs" | "next.js" | "next" => Ok(Self::Nextjs),
            "react" => Ok(Self::React),
            "vue" => Ok(Self::Vue),
            "svelte" => Ok(Self::Svelte),
            "angular" => Ok(Self::Angular),
            _ => Err(format!("Invalid framework: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

/// Whether a persisted assistant message records a successful result or a
/// degraded/failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Result,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "result" => Ok(Self::Result),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid message kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Completed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid message status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub framework: Option<Framework>,
    pub created_at: String,
}

/// Conversation record persisted at run completion. Immutable afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub project_id: i64,
    pub role: MessageRole,
    pub content: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub created_at: String,
}

/// The persisted artifact produced by one run: the generated file map plus
/// the sandbox it lives in. Updated in place by later fix/transfer calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub id: i64,
    pub project_id: i64,
    pub sandbox_id: String,
    pub sandbox_url: String,
    pub title: String,
    pub files: BTreeMap<String, String>,
    pub framework: Framework,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

/// A single file produced or requested by the agent's tool surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

/// Per-run agent state. Owned exclusively by one workflow run and passed by
/// value between the router, validation, fix, and aggregation stages.
///
/// `files` is monotonic: tool handlers only insert or overwrite entries,
/// never remove them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub summary: String,
    pub files: BTreeMap<String, String>,
    pub framework: Framework,
    pub summary_retry_count: u32,
}

impl AgentState {
    pub fn new(framework: Framework) -> Self {
        Self {
            summary: String::new(),
            files: BTreeMap::new(),
            framework,
            summary_retry_count: 0,
        }
    }

    /// Seed state from an existing fragment (fix/transfer paths).
    pub fn from_files(framework: Framework, files: BTreeMap<String, String>) -> Self {
        Self {
            summary: String::new(),
            files,
            framework,
            summary_retry_count: 0,
        }
    }

    pub fn has_files(&self) -> bool {
        !self.files.is_empty()
    }

    pub fn has_summary(&self) -> bool {
        !self.summary.trim().is_empty()
    }

    /// Merge written files into state. Create-or-overwrite, never prune.
    pub fn merge_files(&mut self, entries: &[FileEntry]) {
        for entry in entries {
            self.files.insert(entry.path.clone(), entry.content.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framework_roundtrip() {
        for s in &["nextjs", "react", "vue", "svelte", "angular"] {
            let parsed: Framework = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("cobol".parse::<Framework>().is_err());
    }

    #[test]
    fn test_framework_aliases() {
        assert_eq!("next.js".parse::<Framework>().unwrap(), Framework::Nextjs);
        assert_eq!("next".parse::<Framework>().unwrap(), Framework::Nextjs);
    }

    #[test]
    fn test_framework_default_is_nextjs() {
        assert_eq!(Framework::default(), Framework::Nextjs);
    }

    #[test]
    fn test_framework_template_names() {
        assert_eq!(Framework::Nextjs.template(), "kiln-nextjs");
        assert_eq!(Framework::Svelte.template(), "kiln-svelte");
    }

    #[test]
    fn test_only_nextjs_has_required_import() {
        assert!(Framework::Nextjs.required_import().is_some());
        for fw in &[
            Framework::React,
            Framework::Vue,
            Framework::Svelte,
            Framework::Angular,
        ] {
            assert!(fw.required_import().is_none());
        }
    }

    #[test]
    fn test_message_enums_roundtrip() {
        for s in &["user", "assistant"] {
            assert_eq!(s.parse::<MessageRole>().unwrap().as_str(), *s);
        }
        for s in &["result", "error"] {
            assert_eq!(s.parse::<MessageKind>().unwrap().as_str(), *s);
        }
        for s in &["pending", "completed"] {
            assert_eq!(s.parse::<MessageStatus>().unwrap().as_str(), *s);
        }
    }

    #[test]
    fn test_serde_produces_lowercase_strings() {
        assert_eq!(
            serde_json::to_string(&Framework::Nextjs).unwrap(),
            "\"nextjs\""
        );
        assert_eq!(
            serde_json::to_string(&MessageKind::Error).unwrap(),
            "\"error\""
        );
        assert_eq!(
            serde_json::from_str::<MessageStatus>("\"completed\"").unwrap(),
            MessageStatus::Completed
        );
    }

    #[test]
    fn test_agent_state_merge_is_monotonic() {
        let mut state = AgentState::new(Framework::Nextjs);
        state.merge_files(&[
            FileEntry {
                path: "app/page.tsx".into(),
                content: "v1".into(),
            },
            FileEntry {
                path: "app/layout.tsx".into(),
                content: "layout".into(),
            },
        ]);
        assert_eq!(state.files.len(), 2);

        state.merge_files(&[FileEntry {
            path: "app/page.tsx".into(),
            content: "v2".into(),
        }]);
        // Overwrite, never prune
        assert_eq!(state.files.len(), 2);
        assert_eq!(state.files.get("app/page.tsx").unwrap(), "v2");
        assert_eq!(state.files.get("app/layout.tsx").unwrap(), "layout");
    }

    #[test]
    fn test_agent_state_summary_detection() {
        let mut state = AgentState::new(Framework::React);
        assert!(!state.has_summary());
        state.summary = "   ".into();
        assert!(!state.has_summary());
        state.summary = "Built a todo app".into();
        assert!(state.has_summary());
    }
}
