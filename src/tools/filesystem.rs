//! Filesystem tools, jailed to the configured workspace.
//!
//! Reads are gated by `allow_file_read`, writes by `allow_file_write`; any
//! path resolving outside the workspace fails with `path_not_allowed`.

use async_trait::async_trait;
use serde_json::json;
use walkdir::WalkDir;

use super::{
    ToolCategory, ToolErrorType, ToolExecutionContext, ToolHandler, ToolResult, ToolSpec,
};

/// Maximum readable file size.
const MAX_READ_BYTES: u64 = 10 * 1024 * 1024;

/// Maximum file size scanned by grep.
const MAX_GREP_FILE_BYTES: u64 = 1024 * 1024;

/// Maximum matches returned by glob/grep.
const MAX_MATCHES: usize = 200;

fn path_denied(path: &str) -> ToolResult {
    ToolResult::error_result(
        format!("Path not allowed: {path}"),
        ToolErrorType::PathNotAllowed,
    )
}

fn read_denied() -> ToolResult {
    ToolResult::error_result(
        "File reads not allowed in this context",
        ToolErrorType::PermissionDenied,
    )
}

fn write_denied() -> ToolResult {
    ToolResult::error_result(
        "File writes not allowed in this context",
        ToolErrorType::PermissionDenied,
    )
}

/// Read a file's contents.
pub struct ReadFileHandler;

#[async_trait]
impl ToolHandler for ReadFileHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_file".to_owned(),
            description: "Read a file from the workspace. Limited to 10 MB.".to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the workspace."}
                },
                "required": ["path"]
            }),
            category: ToolCategory::Filesystem,
            energy_cost: 1,
            requires_approval: false,
            is_read_only: true,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        context: &ToolExecutionContext,
    ) -> ToolResult {
        if !context.allow_file_read {
            return read_denied();
        }
        let raw_path = arguments
            .get("path")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if !context.is_path_allowed(raw_path) {
            return path_denied(raw_path);
        }
        let path = context.resolve_path(raw_path);

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(_) => {
                return ToolResult::error_result(
                    format!("File not found: {raw_path}"),
                    ToolErrorType::FileNotFound,
                )
            }
        };
        if metadata.len() > MAX_READ_BYTES {
            return ToolResult::error_result(
                format!("File exceeds 10 MB limit: {raw_path}"),
                ToolErrorType::FileTooLarge,
            );
        }

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let lines = content.lines().count();
                ToolResult::success_result(
                    json!({"path": raw_path, "content": content, "lines": lines}),
                    Some(format!("Read {raw_path} ({lines} lines)")),
                )
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ToolResult::error_result(e.to_string(), ToolErrorType::PermissionDenied)
            }
            Err(e) => ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed),
        }
    }
}

/// Write (create or overwrite) a file.
pub struct WriteFileHandler;

#[async_trait]
impl ToolHandler for WriteFileHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "write_file".to_owned(),
            description: "Write content to a file in the workspace, creating parent \
                          directories as needed."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the workspace."},
                    "content": {"type": "string", "description": "Content to write."}
                },
                "required": ["path", "content"]
            }),
            category: ToolCategory::Filesystem,
            energy_cost: 2,
            requires_approval: true,
            is_read_only: false,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        context: &ToolExecutionContext,
    ) -> ToolResult {
        if !context.allow_file_write {
            return write_denied();
        }
        let raw_path = arguments
            .get("path")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let content = arguments
            .get("content")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if !context.is_path_allowed(raw_path) {
            return path_denied(raw_path);
        }
        let path = context.resolve_path(raw_path);

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed);
            }
        }

        match tokio::fs::write(&path, content).await {
            Ok(()) => ToolResult::success_result(
                json!({"path": raw_path, "bytes": content.len()}),
                Some(format!("Wrote {} bytes to {raw_path}", content.len())),
            ),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ToolResult::error_result(e.to_string(), ToolErrorType::PermissionDenied)
            }
            Err(e) => ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed),
        }
    }
}

/// Replace an exact string in a file.
pub struct EditFileHandler;

#[async_trait]
impl ToolHandler for EditFileHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "edit_file".to_owned(),
            description: "Replace an exact string in a file. The old string must appear \
                          exactly once unless replace_all is set."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Path relative to the workspace."},
                    "old_string": {"type": "string", "description": "Exact text to replace."},
                    "new_string": {"type": "string", "description": "Replacement text."},
                    "replace_all": {
                        "type": "boolean", "default": false,
                        "description": "Replace every occurrence."
                    }
                },
                "required": ["path", "old_string", "new_string"]
            }),
            category: ToolCategory::Filesystem,
            energy_cost: 2,
            requires_approval: true,
            is_read_only: false,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        context: &ToolExecutionContext,
    ) -> ToolResult {
        if !context.allow_file_write {
            return write_denied();
        }
        let raw_path = arguments
            .get("path")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let old_string = arguments
            .get("old_string")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let new_string = arguments
            .get("new_string")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let replace_all = arguments
            .get("replace_all")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        if !context.is_path_allowed(raw_path) {
            return path_denied(raw_path);
        }
        let path = context.resolve_path(raw_path);

        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(_) => {
                return ToolResult::error_result(
                    format!("File not found: {raw_path}"),
                    ToolErrorType::FileNotFound,
                )
            }
        };

        let occurrences = content.matches(old_string).count();
        if occurrences == 0 {
            return ToolResult::error_result(
                "old_string not found in file",
                ToolErrorType::InvalidParams,
            );
        }
        if occurrences > 1 && !replace_all {
            return ToolResult::error_result(
                format!("old_string appears {occurrences} times; pass replace_all to replace every occurrence"),
                ToolErrorType::InvalidParams,
            );
        }

        let updated = if replace_all {
            content.replace(old_string, new_string)
        } else {
            content.replacen(old_string, new_string, 1)
        };

        match tokio::fs::write(&path, &updated).await {
            Ok(()) => ToolResult::success_result(
                json!({"path": raw_path, "replacements": if replace_all { occurrences } else { 1 }}),
                Some(format!("Edited {raw_path}")),
            ),
            Err(e) => ToolResult::error_result(e.to_string(), ToolErrorType::ExecutionFailed),
        }
    }
}

/// Find files by glob pattern.
pub struct GlobHandler;

#[async_trait]
impl ToolHandler for GlobHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "glob".to_owned(),
            description: "Find files matching a glob pattern (supports *, **, ?).".to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Glob pattern, e.g. src/**/*.rs."},
                    "path": {
                        "type": "string",
                        "description": "Directory to search under (default: workspace root)."
                    }
                },
                "required": ["pattern"]
            }),
            category: ToolCategory::Filesystem,
            energy_cost: 1,
            requires_approval: false,
            is_read_only: true,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        context: &ToolExecutionContext,
    ) -> ToolResult {
        if !context.allow_file_read {
            return read_denied();
        }
        let pattern = arguments
            .get("pattern")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let base = arguments
            .get("path")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(".");
        if !context.is_path_allowed(base) {
            return path_denied(base);
        }
        let root = context.resolve_path(base);

        let Ok(matcher) = glob_to_regex(pattern) else {
            return ToolResult::error_result(
                format!("invalid glob pattern: {pattern}"),
                ToolErrorType::InvalidParams,
            );
        };

        let mut matches = Vec::new();
        for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if matcher.is_match(&relative) {
                matches.push(relative);
                if matches.len() >= MAX_MATCHES {
                    break;
                }
            }
        }
        matches.sort();

        let count = matches.len();
        ToolResult::success_result(
            json!({"pattern": pattern, "matches": matches, "count": count}),
            Some(format!("{count} files match '{pattern}'")),
        )
    }
}

/// Search file contents with a regex.
pub struct GrepHandler;

#[async_trait]
impl ToolHandler for GrepHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "grep".to_owned(),
            description: "Search file contents with a regular expression. Returns matching \
                          lines with file and line number."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string", "description": "Regular expression."},
                    "path": {
                        "type": "string",
                        "description": "Directory to search under (default: workspace root)."
                    },
                    "file_glob": {
                        "type": "string",
                        "description": "Optional glob filter on file paths, e.g. *.rs."
                    }
                },
                "required": ["pattern"]
            }),
            category: ToolCategory::Filesystem,
            energy_cost: 1,
            requires_approval: false,
            is_read_only: true,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        context: &ToolExecutionContext,
    ) -> ToolResult {
        if !context.allow_file_read {
            return read_denied();
        }
        let pattern = arguments
            .get("pattern")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        let base = arguments
            .get("path")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(".");
        let file_glob = arguments
            .get("file_glob")
            .and_then(serde_json::Value::as_str);

        if !context.is_path_allowed(base) {
            return path_denied(base);
        }
        let root = context.resolve_path(base);

        let Ok(re) = regex::Regex::new(pattern) else {
            return ToolResult::error_result(
                format!("invalid regex: {pattern}"),
                ToolErrorType::InvalidParams,
            );
        };
        let file_matcher = match file_glob.map(glob_to_regex) {
            Some(Ok(matcher)) => Some(matcher),
            Some(Err(_)) => {
                return ToolResult::error_result(
                    format!("invalid file glob: {}", file_glob.unwrap_or_default()),
                    ToolErrorType::InvalidParams,
                )
            }
            None => None,
        };

        let mut matches = Vec::new();
        'outer: for entry in WalkDir::new(&root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            if entry
                .metadata()
                .map(|m| m.len() > MAX_GREP_FILE_BYTES)
                .unwrap_or(true)
            {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if let Some(matcher) = &file_matcher {
                let name_matches = matcher.is_match(&relative)
                    || entry
                        .file_name()
                        .to_str()
                        .map(|n| matcher.is_match(n))
                        .unwrap_or(false);
                if !name_matches {
                    continue;
                }
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            for (line_no, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    matches.push(json!({
                        "file": relative,
                        "line": line_no.saturating_add(1),
                        "text": line.trim_end(),
                    }));
                    if matches.len() >= MAX_MATCHES {
                        break 'outer;
                    }
                }
            }
        }

        let count = matches.len();
        ToolResult::success_result(
            json!({"pattern": pattern, "matches": matches, "count": count}),
            Some(format!("{count} matching lines")),
        )
    }
}

/// List a directory's entries.
pub struct ListDirectoryHandler;

#[async_trait]
impl ToolHandler for ListDirectoryHandler {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_directory".to_owned(),
            description: "List the entries of a directory in the workspace.".to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory path (default: workspace root)."
                    }
                }
            }),
            category: ToolCategory::Filesystem,
            energy_cost: 1,
            requires_approval: false,
            is_read_only: true,
            supports_parallel: true,
            allowed_contexts: ToolSpec::all_contexts(),
        }
    }

    async fn execute(
        &self,
        arguments: &serde_json::Value,
        context: &ToolExecutionContext,
    ) -> ToolResult {
        if !context.allow_file_read {
            return read_denied();
        }
        let raw_path = arguments
            .get("path")
            .and_then(serde_json::Value::as_str)
            .unwrap_or(".");
        if !context.is_path_allowed(raw_path) {
            return path_denied(raw_path);
        }
        let path = context.resolve_path(raw_path);

        let mut reader = match tokio::fs::read_dir(&path).await {
            Ok(reader) => reader,
            Err(_) => {
                return ToolResult::error_result(
                    format!("Directory not found: {raw_path}"),
                    ToolErrorType::DirectoryNotFound,
                )
            }
        };

        let mut entries = Vec::new();
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            let size = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            entries.push(json!({"name": name, "is_dir": is_dir, "size": size}));
        }
        entries.sort_by(|a, b| {
            a.get("name")
                .and_then(serde_json::Value::as_str)
                .cmp(&b.get("name").and_then(serde_json::Value::as_str))
        });

        let count = entries.len();
        ToolResult::success_result(
            json!({"path": raw_path, "entries": entries, "count": count}),
            Some(format!("{count} entries in {raw_path}")),
        )
    }
}

/// Translate a glob pattern into an anchored regex.
///
/// `**` crosses directory separators, `*` and `?` do not.
fn glob_to_regex(pattern: &str) -> Result<regex::Regex, regex::Error> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Swallow a following slash so `**/` also matches zero dirs.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '.' | '+' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out.push('$');
    regex::Regex::new(&out)
}

/// Create all filesystem tool handlers.
pub fn create_filesystem_tools() -> Vec<std::sync::Arc<dyn ToolHandler>> {
    vec![
        std::sync::Arc::new(ReadFileHandler),
        std::sync::Arc::new(WriteFileHandler),
        std::sync::Arc::new(EditFileHandler),
        std::sync::Arc::new(GlobHandler),
        std::sync::Arc::new(GrepHandler),
        std::sync::Arc::new(ListDirectoryHandler),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_single_star_stays_in_dir() {
        let re = glob_to_regex("src/*.rs").expect("regex");
        assert!(re.is_match("src/main.rs"));
        assert!(!re.is_match("src/sub/mod.rs"));
        assert!(!re.is_match("other/main.rs"));
    }

    #[test]
    fn test_glob_double_star_crosses_dirs() {
        let re = glob_to_regex("src/**/*.rs").expect("regex");
        assert!(re.is_match("src/main.rs"));
        assert!(re.is_match("src/deep/nested/mod.rs"));
        assert!(!re.is_match("src/main.py"));
    }

    #[test]
    fn test_glob_question_mark() {
        let re = glob_to_regex("file?.txt").expect("regex");
        assert!(re.is_match("file1.txt"));
        assert!(!re.is_match("file12.txt"));
        assert!(!re.is_match("file/.txt"));
    }

    #[test]
    fn test_glob_escapes_regex_chars() {
        let re = glob_to_regex("notes.(draft).md").expect("regex");
        assert!(re.is_match("notes.(draft).md"));
        assert!(!re.is_match("notesX(draft)Ymd"));
    }
}
