//! Integration tests for the instance registry.

#[path = "instance/registry_test.rs"]
mod registry_test;
