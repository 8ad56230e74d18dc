//! Repository layer
//!
//! Collaborators the pipeline drives: the issue tracker, source control,
//! the test sandbox, checkpoint storage and the audit log. Each one is a
//! trait so the pipeline can be exercised against in-memory fakes.

mod audit;
mod checkpoints;
mod error;
mod git;
mod issues;
mod sandbox;

// Re-export traits
pub use audit::AuditLog;
pub use checkpoints::CheckpointStore;
pub use git::SourceControl;
pub use issues::IssueSource;
pub use sandbox::SandboxRuntime;

// Re-export implementations
pub use audit::JsonlAuditLog;
pub use checkpoints::FileCheckpointStore;
pub use git::GitSourceControl;
pub use issues::GitHubIssueSource;
pub use sandbox::{PodmanSandbox, check_podman_available};

pub use error::{CollabResult, CollaboratorError};
