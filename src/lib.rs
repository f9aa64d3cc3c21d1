//! Concurrent multi-target generation with chained proofreading.
//!
//! A parent document is fanned out to one work unit per target. Each unit is
//! created under a single-flight rule, runs exactly one model call, and on
//! completion gets a derived proofreading unit. A background tracker polls
//! unit status and flags stalls; the caller drives retries and cancels through
//! a [`orchestrator::RunHandle`].

pub mod anthropic;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod extractor;
pub mod invoker;
pub mod logging;
pub mod orchestrator;
pub mod output;
pub mod state_machine;
pub mod store;
mod supervisor;
pub mod task;
pub mod tracker;
pub mod ui;

#[cfg(test)]
mod testing;
