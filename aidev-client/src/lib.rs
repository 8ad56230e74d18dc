//! AIDev HTTP Client
//!
//! A type-safe HTTP client for the AIDev daemon's operator API, used by the
//! `aidev` CLI.
//!
//! # Example
//!
//! ```no_run
//! use aidev_client::OperatorClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = OperatorClient::new("http://localhost:8700");
//!
//!     for run in client.list_runs().await? {
//!         println!("{} {} {}", run.id, run.issue, run.state);
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
mod providers;
mod runs;

// Re-export commonly used types
pub use error::{ClientError, Result};

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for the AIDev operator API
///
/// - Run inspection (list, get)
/// - Manual intervention (cancel, override, dismiss)
/// - Provider quota and health
#[derive(Debug, Clone)]
pub struct OperatorClient {
    /// Base URL of the daemon (e.g., "http://localhost:8700")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl OperatorClient {
    /// Create a new operator client
    ///
    /// # Example
    /// ```
    /// use aidev_client::OperatorClient;
    ///
    /// let client = OperatorClient::new("http://localhost:8700");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new operator client with a custom HTTP client
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the daemon
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status and deserialize the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Check the status of a response that carries no body
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_trims_trailing_slash() {
        let client = OperatorClient::new("http://localhost:8700/");
        assert_eq!(client.base_url(), "http://localhost:8700");
    }
}
