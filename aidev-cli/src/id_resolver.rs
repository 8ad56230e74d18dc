//! ID resolver module
//!
//! Resolves run id prefixes to full UUIDs by listing the daemon's runs, so
//! operators can type the first few characters of an id.

use aidev_client::OperatorClient;
use anyhow::{Context, Result, anyhow};
use uuid::Uuid;

use crate::types::IdOrPrefix;

/// Picks the single id starting with `prefix`
fn match_prefix(ids: &[Uuid], prefix: &str) -> Result<Uuid> {
    let matches: Vec<_> = ids
        .iter()
        .filter(|id| id.to_string().starts_with(prefix))
        .collect();

    match matches.len() {
        0 => Err(anyhow!("No run found with ID starting with '{}'", prefix)),
        1 => Ok(*matches[0]),
        _ => {
            let ids: Vec<String> = matches.iter().map(|id| id.to_string()).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple runs: {}",
                prefix,
                ids.join(", ")
            ))
        }
    }
}

/// Resolve a run ID or prefix to a full UUID
///
/// A full UUID is returned as is; a prefix must match exactly one live run.
pub async fn resolve_run_id(client: &OperatorClient, id_or_prefix: &IdOrPrefix) -> Result<Uuid> {
    let prefix = match id_or_prefix {
        IdOrPrefix::Full(uuid) => return Ok(*uuid),
        IdOrPrefix::Prefix(prefix) => prefix,
    };

    let runs = client
        .list_runs()
        .await
        .context("Failed to fetch runs for ID resolution")?;
    let ids: Vec<Uuid> = runs.iter().map(|r| r.id).collect();

    match_prefix(&ids, prefix)
}
