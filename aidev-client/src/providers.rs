//! Provider-related API endpoints

use aidev_core::dto::provider::ProviderStatus;

use crate::OperatorClient;
use crate::error::Result;

impl OperatorClient {
    /// Quota usage and health of every provider profile
    pub async fn list_providers(&self) -> Result<Vec<ProviderStatus>> {
        let url = format!("{}/api/providers", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }
}
