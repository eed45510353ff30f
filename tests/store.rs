//! Substrate integration tests.
//!
//! These require a live Postgres and are gated on `HEXIS_TEST_DSN`; they skip
//! cleanly when it is unset.

#[path = "store/db_test.rs"]
mod db_test;
