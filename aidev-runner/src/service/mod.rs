//! Service Module
//!
//! Business logic layer for the daemon.
//! Services drive the repositories and the AI gateway; the pipeline ties
//! them together into one run.

pub mod context;
pub mod parse;
pub mod pipeline;
pub mod prompts;
pub mod review;

pub use pipeline::{Collaborators, Pipeline, PipelineSettings, RunObserver};
