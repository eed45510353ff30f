//! CLI contract tests.

use assert_cmd::Command;

#[test]
fn help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("hexis").expect("binary builds");
    let assert = cmd.arg("--help").assert().success();
    let output = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    for subcommand in ["worker", "status", "init", "instance", "consents", "tools"] {
        assert!(output.contains(subcommand), "help should mention {subcommand}");
    }
}

#[test]
fn unknown_subcommand_exits_with_usage_error() {
    let mut cmd = Command::cargo_bin("hexis").expect("binary builds");
    cmd.arg("definitely-not-a-command").assert().failure().code(2);
}

#[test]
fn worker_rejects_bad_mode() {
    let mut cmd = Command::cargo_bin("hexis").expect("binary builds");
    // An invalid mode is a domain failure, reported before any DB contact.
    cmd.args(["worker", "--mode", "neither"]).assert().code(1);
}

#[test]
fn version_flag_works() {
    let mut cmd = Command::cargo_bin("hexis").expect("binary builds");
    cmd.arg("--version").assert().success();
}
