//! vigild — watches a git branch and runs a validation command against every
//! file touched by new commits, with bounded concurrency and preemption of
//! stale runs.

pub mod config;
pub mod controller;
pub mod report;
pub mod watcher;
