//! Deterministic, pure logic shared by the orchestration layer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod answers;
pub mod content;
pub mod repo_ref;
pub mod response;
pub mod timeline;
pub mod types;
