//! Filesystem tool handlers against a temporary workspace.

use serde_json::json;

use hexis::tools::filesystem::{
    EditFileHandler, GlobHandler, GrepHandler, ListDirectoryHandler, ReadFileHandler,
    WriteFileHandler,
};
use hexis::tools::{ToolContext, ToolErrorType, ToolExecutionContext, ToolHandler};

fn workspace_context(dir: &tempfile::TempDir, allow_write: bool) -> ToolExecutionContext {
    ToolExecutionContext {
        tool_context: ToolContext::Chat,
        call_id: "test-call".to_owned(),
        heartbeat_id: None,
        energy_available: None,
        workspace_path: Some(dir.path().to_string_lossy().into_owned()),
        allow_network: false,
        allow_shell: false,
        allow_file_write: allow_write,
        allow_file_read: true,
    }
}

#[tokio::test]
async fn write_then_read_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = workspace_context(&dir, true);

    let write = WriteFileHandler
        .execute(&json!({"path": "notes/hello.txt", "content": "line one\nline two\n"}), &ctx)
        .await;
    assert!(write.success, "write failed: {:?}", write.error);

    let read = ReadFileHandler
        .execute(&json!({"path": "notes/hello.txt"}), &ctx)
        .await;
    assert!(read.success);
    assert_eq!(read.output["content"], json!("line one\nline two\n"));
    assert_eq!(read.output["lines"], json!(2));
}

#[tokio::test]
async fn read_missing_file_is_typed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = workspace_context(&dir, false);

    let result = ReadFileHandler
        .execute(&json!({"path": "absent.txt"}), &ctx)
        .await;
    assert!(!result.success);
    assert_eq!(result.error_type, Some(ToolErrorType::FileNotFound));
}

#[tokio::test]
async fn paths_outside_workspace_are_denied() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = workspace_context(&dir, true);

    for path in ["../escape.txt", "/etc/passwd", "a/../../b"] {
        let result = ReadFileHandler.execute(&json!({"path": path}), &ctx).await;
        assert!(!result.success, "{path} should be denied");
        assert_eq!(result.error_type, Some(ToolErrorType::PathNotAllowed));
    }
}

#[tokio::test]
async fn write_without_permission_is_denied() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = workspace_context(&dir, false);

    let result = WriteFileHandler
        .execute(&json!({"path": "x.txt", "content": "nope"}), &ctx)
        .await;
    assert!(!result.success);
    assert_eq!(result.error_type, Some(ToolErrorType::PermissionDenied));
}

#[tokio::test]
async fn edit_replaces_unique_occurrence() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = workspace_context(&dir, true);

    WriteFileHandler
        .execute(&json!({"path": "code.rs", "content": "fn old_name() {}\n"}), &ctx)
        .await;
    let edit = EditFileHandler
        .execute(
            &json!({"path": "code.rs", "old_string": "old_name", "new_string": "new_name"}),
            &ctx,
        )
        .await;
    assert!(edit.success);

    let read = ReadFileHandler.execute(&json!({"path": "code.rs"}), &ctx).await;
    assert_eq!(read.output["content"], json!("fn new_name() {}\n"));
}

#[tokio::test]
async fn edit_rejects_ambiguous_match_without_replace_all() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = workspace_context(&dir, true);

    WriteFileHandler
        .execute(&json!({"path": "dup.txt", "content": "aaa aaa"}), &ctx)
        .await;
    let edit = EditFileHandler
        .execute(
            &json!({"path": "dup.txt", "old_string": "aaa", "new_string": "bbb"}),
            &ctx,
        )
        .await;
    assert!(!edit.success);
    assert_eq!(edit.error_type, Some(ToolErrorType::InvalidParams));

    let edit_all = EditFileHandler
        .execute(
            &json!({"path": "dup.txt", "old_string": "aaa", "new_string": "bbb", "replace_all": true}),
            &ctx,
        )
        .await;
    assert!(edit_all.success);
    let read = ReadFileHandler.execute(&json!({"path": "dup.txt"}), &ctx).await;
    assert_eq!(read.output["content"], json!("bbb bbb"));
}

#[tokio::test]
async fn glob_finds_nested_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = workspace_context(&dir, true);

    for path in ["src/main.rs", "src/deep/mod.rs", "docs/readme.md"] {
        WriteFileHandler
            .execute(&json!({"path": path, "content": "x"}), &ctx)
            .await;
    }

    let result = GlobHandler
        .execute(&json!({"pattern": "src/**/*.rs"}), &ctx)
        .await;
    assert!(result.success);
    assert_eq!(result.output["count"], json!(2));
    let matches = result.output["matches"].as_array().expect("array");
    assert!(matches.contains(&json!("src/main.rs")));
    assert!(matches.contains(&json!("src/deep/mod.rs")));
}

#[tokio::test]
async fn grep_reports_file_and_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = workspace_context(&dir, true);

    WriteFileHandler
        .execute(
            &json!({"path": "log.txt", "content": "ok\nERROR: boom\nok\n"}),
            &ctx,
        )
        .await;

    let result = GrepHandler
        .execute(&json!({"pattern": "^ERROR:"}), &ctx)
        .await;
    assert!(result.success);
    assert_eq!(result.output["count"], json!(1));
    assert_eq!(result.output["matches"][0]["file"], json!("log.txt"));
    assert_eq!(result.output["matches"][0]["line"], json!(2));
}

#[tokio::test]
async fn list_directory_sorts_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = workspace_context(&dir, true);

    for path in ["b.txt", "a.txt"] {
        WriteFileHandler
            .execute(&json!({"path": path, "content": ""}), &ctx)
            .await;
    }

    let result = ListDirectoryHandler.execute(&json!({}), &ctx).await;
    assert!(result.success);
    assert_eq!(result.output["entries"][0]["name"], json!("a.txt"));
    assert_eq!(result.output["entries"][1]["name"], json!("b.txt"));
}

#[tokio::test]
async fn missing_directory_is_typed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = workspace_context(&dir, false);

    let result = ListDirectoryHandler
        .execute(&json!({"path": "not/here"}), &ctx)
        .await;
    assert!(!result.success);
    assert_eq!(result.error_type, Some(ToolErrorType::DirectoryNotFound));
}
