use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// When the user is asked before a tool call executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Everything runs without confirmation.
    #[default]
    Never,
    /// Commands run sandboxed; failures that look like sandbox denials are
    /// escalated to the user for an unsandboxed retry.
    OnFailure,
    /// Read-only tools and known-safe commands run automatically; anything
    /// mutating waits for the user.
    UnlessTrusted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProvider {
    Openai,
    Anthropic,
}

/// Whether the provider may perform web searches on the model's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebSearchMode {
    #[default]
    Disabled,
    Cached,
    Live,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    /// Explicit provider; when absent the provider is inferred from the
    /// model name (`claude*` routes to Anthropic).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ModelProvider>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Total context window in tokens; 0 means unknown.
    #[serde(default)]
    pub context_window: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-5".to_string(),
            provider: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            context_window: 0,
        }
    }
}

fn enabled() -> bool {
    true
}

/// Which tool families are offered to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "enabled")]
    pub shell: bool,
    #[serde(default = "enabled")]
    pub read_file: bool,
    #[serde(default = "enabled")]
    pub write_file: bool,
    #[serde(default = "enabled")]
    pub list_dir: bool,
    #[serde(default = "enabled")]
    pub grep_files: bool,
    #[serde(default = "enabled")]
    pub apply_patch: bool,
    /// Interactive exec sessions (`exec_command` / `write_stdin`).
    #[serde(default = "enabled")]
    pub exec_sessions: bool,
    #[serde(default = "enabled")]
    pub update_plan: bool,
    #[serde(default = "enabled")]
    pub request_user_input: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell: true,
            read_file: true,
            write_file: true,
            list_dir: true,
            grep_files: true,
            apply_patch: true,
            exec_sessions: true,
            update_plan: true,
            request_user_input: true,
        }
    }
}

fn default_repeat_threshold() -> u32 {
    3
}

fn default_max_log_entries() -> usize {
    4096
}

fn default_max_log_bytes() -> usize {
    4 * 1024 * 1024
}

/// Frozen per-session configuration. Instruction fields are resolved once
/// during startup and then never change, so a resumed session replays
/// identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfiguration {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub web_search_mode: WebSearchMode,
    pub cwd: PathBuf,
    #[serde(default)]
    pub session_source: String,
    /// Replaces the built-in base prompt entirely when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_instructions: Option<String>,
    /// The user's personal instructions, appended after project docs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_instructions: Option<String>,
    /// Developer-role instructions; composed from approval mode and cwd
    /// during startup when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developer_instructions: Option<String>,
    /// Project docs (AGENTS.md) supplied by the front-end; merged with
    /// whatever the startup loader finds on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_docs: Option<String>,
    /// Directory holding the exec-policy rules file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_home: Option<PathBuf>,
    /// Auto-compaction trigger in estimated prompt tokens; 0 disables.
    #[serde(default)]
    pub auto_compact_token_limit: u64,
    /// Consecutive identical tool batches before the turn is force-stopped.
    #[serde(default = "default_repeat_threshold")]
    pub repeat_detection_threshold: u32,
    /// Label of the worker queue tool tasks are pinned to, when the
    /// deployment routes work by queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_task_queue: Option<String>,
    /// Log growth bounds that trigger a state snapshot and in-place restart.
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: usize,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            tools: ToolsConfig::default(),
            approval_mode: ApprovalMode::default(),
            web_search_mode: WebSearchMode::default(),
            cwd: PathBuf::from("."),
            session_source: String::new(),
            base_instructions: None,
            user_instructions: None,
            developer_instructions: None,
            project_docs: None,
            agent_home: None,
            auto_compact_token_limit: 0,
            repeat_detection_threshold: default_repeat_threshold(),
            session_task_queue: None,
            max_log_entries: default_max_log_entries(),
            max_log_bytes: default_max_log_bytes(),
        }
    }
}
