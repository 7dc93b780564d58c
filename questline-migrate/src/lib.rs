//! Questline Migration Library
//!
//! Command handlers and settings resolution used by the `questline-migrate`
//! binary (main.rs). Handlers write to any `Write` pair so they can be
//! driven against the in-process ledger in tests.

pub mod commands;
pub mod settings;
