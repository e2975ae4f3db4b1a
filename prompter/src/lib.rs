//! Orchestration core for repository-scoped AI conversations.
//!
//! A conversation is a multi-turn exchange with an external AI CLI running
//! inside a local working copy of a remote repository. The working copy is
//! provisioned in the background, turns are serialized per session, and the
//! generated prompt is finally published to an issue tracker.
//!
//! - **[`core`]**: Pure, deterministic logic (response decoding, timeline
//!   reconstruction, answer assembly, publish body composition). No I/O.
//! - **[`io`]**: Collaborators with side effects (store, AI CLI, git, issue
//!   tracker, child processes). Each sits behind a trait so tests can script it.
//!
//! Orchestration modules ([`locks`], [`provisioning`], [`turn`], [`dispatch`],
//! [`service`]) coordinate core logic with I/O behind the [`Prompter`] facade.

pub mod core;
pub mod dispatch;
pub mod io;
pub mod locks;
pub mod logging;
pub mod provisioning;
pub mod service;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod turn;

pub use service::{Collaborators, Prompter, RequestError};
