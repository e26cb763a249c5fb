//! # Core
//!
//! Core building blocks: kernel inspection, attachment planning, the stack
//! engine and the plumbing in between.

pub(crate) mod errno;
pub(crate) mod events;
pub(crate) mod feat;
pub(crate) mod inspect;
pub(crate) mod perf;
pub(crate) mod probe;
pub(crate) mod stack;

use thiserror::Error;

/// Failure categories of the tool. Configuration and planning errors abort
/// before anything is attached; attach errors abort after cleaning up partial
/// attachments; runtime errors never abort, they are counted and reported.
#[derive(Debug, Error)]
pub(crate) enum RetsnoopError {
    #[error("configuration: {0}")]
    Config(String),
    #[error("planning: {0}")]
    Plan(String),
    #[error("attach: {0}")]
    Attach(String),
}
