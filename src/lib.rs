#![allow(missing_docs)] // TODO: enforce once the store API settles

//! Hexis — persistent cognitive agent runtime.
//!
//! The Postgres substrate is the single source of truth: memories, goals,
//! heartbeats, scheduled work, in-flight external calls, and the outbox all
//! live there. Worker processes are stateless dispatchers that poll the
//! substrate, service external calls (LLM "think" calls and tool executions),
//! and apply results back atomically.

pub mod bridge;
pub mod broker;
pub mod calls;
pub mod config;
pub mod consent;
pub mod heartbeat;
pub mod instance;
pub mod llm;
pub mod logging;
pub mod store;
pub mod subconscious;
pub mod tools;
pub mod worker;
