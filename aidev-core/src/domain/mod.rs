//! Core domain types
//!
//! This module contains the core domain structures used across AIDev crates.
//! They are shared between the daemon (which owns and persists them) and the
//! operator tools (which display them).

pub mod audit;
pub mod issue;
pub mod patch;
pub mod provider;
pub mod run;
