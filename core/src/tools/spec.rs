//! JSON tool specs advertised to the model, in the neutral
//! `{name, description, parameters}` shape providers translate from.

use serde_json::json;
use serde_json::Value;

use tether_protocol::ToolsConfig;

/// Specs for every enabled tool, including the two the orchestrator
/// intercepts itself (`update_plan`, `request_user_input`).
pub fn tool_specs(config: &ToolsConfig) -> Vec<Value> {
    let mut specs = Vec::new();

    if config.shell {
        specs.push(json!({
            "name": "shell",
            "description": "Execute a command given as an argument vector (no shell interpretation).",
            "parameters": {
                "type": "object",
                "properties": {
                    "command": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Program and arguments, e.g. [\"git\", \"status\"].",
                    },
                    "workdir": {"type": "string", "description": "Working directory override."},
                },
                "required": ["command"],
            },
        }));
        specs.push(json!({
            "name": "shell_command",
            "description": "Execute a command string through the user's shell.",
            "parameters": {
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "workdir": {"type": "string"},
                    "login": {"type": "boolean", "description": "Use a login shell (-lc). Default true."},
                },
                "required": ["command"],
            },
        }));
    }

    if config.exec_sessions {
        specs.push(json!({
            "name": "exec_command",
            "description": "Start a command and collect output until it exits or the yield time elapses. Long-running commands keep running and return a session ID for write_stdin.",
            "parameters": {
                "type": "object",
                "properties": {
                    "cmd": {"type": "string", "description": "Command string to run."},
                    "workdir": {"type": "string"},
                    "shell": {"type": "string", "description": "Shell binary to wrap the command with."},
                    "login": {"type": "boolean"},
                    "tty": {"type": "boolean", "description": "Allocate a PTY so the command can be driven interactively."},
                    "yield_time_ms": {"type": "integer", "description": "How long to collect output before yielding (250-30000, default 10000)."},
                },
                "required": ["cmd"],
            },
        }));
        specs.push(json!({
            "name": "write_stdin",
            "description": "Send characters to a running exec session's stdin and collect new output. Empty chars just polls.",
            "parameters": {
                "type": "object",
                "properties": {
                    "session_id": {"type": "integer"},
                    "chars": {"type": "string"},
                    "yield_time_ms": {"type": "integer"},
                },
                "required": ["session_id"],
            },
        }));
    }

    if config.read_file {
        specs.push(json!({
            "name": "read_file",
            "description": "Read a file, optionally a line window of it.",
            "parameters": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "offset": {"type": "integer", "description": "1-based first line to read."},
                    "limit": {"type": "integer", "description": "Maximum number of lines."},
                },
                "required": ["path"],
            },
        }));
    }

    if config.write_file {
        specs.push(json!({
            "name": "write_file",
            "description": "Create or overwrite a file with the given content.",
            "parameters": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                },
                "required": ["path", "content"],
            },
        }));
    }

    if config.list_dir {
        specs.push(json!({
            "name": "list_dir",
            "description": "List directory entries, directories first.",
            "parameters": {
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "depth": {"type": "integer", "description": "Recursion depth, default 1."},
                },
                "required": ["path"],
            },
        }));
    }

    if config.grep_files {
        specs.push(json!({
            "name": "grep_files",
            "description": "Find files whose contents match a regular expression, most recently modified first.",
            "parameters": {
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "include": {"type": "string", "description": "Glob filter, e.g. *.rs."},
                    "path": {"type": "string"},
                    "limit": {"type": "integer"},
                },
                "required": ["pattern"],
            },
        }));
    }

    if config.apply_patch {
        specs.push(json!({
            "name": "apply_patch",
            "description": "Apply a patch envelope (*** Begin Patch ... *** End Patch) adding, updating, or deleting files.",
            "parameters": {
                "type": "object",
                "properties": {
                    "input": {"type": "string", "description": "The full patch envelope."},
                },
                "required": ["input"],
            },
        }));
    }

    if config.update_plan {
        specs.push(json!({
            "name": "update_plan",
            "description": "Replace the working plan shown to the user. At most one step may be in_progress.",
            "parameters": {
                "type": "object",
                "properties": {
                    "explanation": {"type": "string"},
                    "plan": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "step": {"type": "string"},
                                "status": {"type": "string", "enum": ["pending", "in_progress", "completed"]},
                            },
                            "required": ["step", "status"],
                        },
                    },
                },
                "required": ["plan"],
            },
        }));
    }

    if config.request_user_input {
        specs.push(json!({
            "name": "request_user_input",
            "description": "Ask the user up to four multiple-choice questions and wait for answers.",
            "parameters": {
                "type": "object",
                "properties": {
                    "questions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "id": {"type": "string"},
                                "header": {"type": "string"},
                                "question": {"type": "string"},
                                "is_other": {"type": "boolean"},
                                "options": {
                                    "type": "array",
                                    "items": {
                                        "type": "object",
                                        "properties": {
                                            "label": {"type": "string"},
                                            "description": {"type": "string"},
                                        },
                                        "required": ["label"],
                                    },
                                },
                            },
                            "required": ["id", "question", "options"],
                        },
                    },
                },
                "required": ["questions"],
            },
        }));
    }

    specs
}
