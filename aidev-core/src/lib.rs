//! AIDev Core
//!
//! Core types shared by the AIDev daemon, its gateway and its operator tools.
//!
//! This crate contains:
//! - Domain types: providers, roles, pipeline runs, patch candidates, issues, audit events
//! - DTOs: Data transfer objects for the operator API

pub mod domain;
pub mod dto;
