//! Integration tests for the tool system (no substrate required).

#[path = "tools/filesystem_test.rs"]
mod filesystem_test;
