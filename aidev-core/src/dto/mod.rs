//! Data transfer objects for the operator API

pub mod provider;
pub mod run;
