//! Filament-inventory client (spec §6.4). External collaborator invoked by
//! the Usage Tracker, following the same `reqwest`-based HTTP client
//! pattern used for update-checking, retargeted at a REST inventory
//! service (Spoolman-shaped API).

use serde::{Deserialize, Serialize};

use crate::error::FlotillaError;
use crate::types::ActiveSpool;

#[derive(Clone, Debug, Serialize)]
pub struct UsageUpdateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_length: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Spool {
    pub id: String,
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub remaining_weight: Option<f64>,
}

impl Spool {
    pub fn to_active_spool(&self) -> ActiveSpool {
        ActiveSpool {
            spool_id: self.id.clone(),
            material: self.material.clone(),
            remaining_weight_grams: self.remaining_weight,
        }
    }
}

/// Thin HTTP client over the external inventory service. The core never
/// assumes a specific deployment's base URL beyond what configuration gives
/// it.
pub struct SpoolmanClient {
    http: reqwest::Client,
    base_url: String,
}

impl SpoolmanClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        SpoolmanClient {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// §6.4: exactly one of weight/length must be set; rejects otherwise.
    pub async fn update_usage(
        &self,
        spool_id: &str,
        use_weight: Option<f64>,
        use_length: Option<f64>,
    ) -> Result<Spool, FlotillaError> {
        if use_weight.is_none() && use_length.is_none() {
            return Err(FlotillaError::validation(
                "updateUsage requires use_weight or use_length",
            ));
        }
        if use_weight.is_some() && use_length.is_some() {
            return Err(FlotillaError::validation(
                "updateUsage accepts only one of use_weight or use_length",
            ));
        }

        let url = format!("{}/api/v1/spool/{}/use", self.base_url, spool_id);
        let response = self
            .http
            .put(&url)
            .json(&UsageUpdateRequest { use_weight, use_length })
            .send()
            .await
            .map_err(upstream_error)?;

        if !response.status().is_success() {
            return Err(FlotillaError::upstream(format!(
                "spool usage update failed with status {}",
                response.status()
            )));
        }
        response.json::<Spool>().await.map_err(upstream_error)
    }
}

fn upstream_error(err: reqwest::Error) -> FlotillaError {
    FlotillaError::upstream(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_usage_rejects_when_neither_field_set() {
        let client = SpoolmanClient::new("http://localhost:7912");
        let result = client.update_usage("spool-1", None, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn update_usage_rejects_when_both_fields_set() {
        let client = SpoolmanClient::new("http://localhost:7912");
        let result = client.update_usage("spool-1", Some(1.0), Some(1.0)).await;
        assert!(result.is_err());
    }
}
