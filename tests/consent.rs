//! Integration tests for the consent subsystem.

#[path = "consent/certificates_test.rs"]
mod certificates_test;
