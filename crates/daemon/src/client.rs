//! Client for the registry HTTP API.

use crate::error::RegistryError;
use crate::registry::AddressRecord;
use log::debug;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// Body of a `/get` hit. Only `address` is required; a registry may also
/// echo the `id`.
#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    address: String,
}

/// Talks to a registry at `base_url` (e.g. `http://203.0.113.1:21200`).
#[derive(Debug, Clone)]
pub struct RegistryClient {
    base_url: String,
    client: reqwest::Client,
}

impl RegistryClient {
    /// Create a new registry client.
    pub fn new(registry_url: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: registry_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Publish `address` under `id`. Overwrites any previous record.
    pub async fn register(&self, id: &str, address: &str) -> Result<(), RegistryError> {
        let url = format!("{}/register", self.base_url);
        let record = AddressRecord {
            id: id.to_string(),
            address: address.to_string(),
        };
        debug!("POST {} {:?}", url, record);

        let response = self.client.post(&url).json(&record).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    /// Current address registered under `id`.
    pub async fn lookup(&self, id: &str) -> Result<String, RegistryError> {
        let url = format!("{}/get", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("id", id)])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(RegistryError::NotFound(id.to_string())),
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(RegistryError::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }
        }

        let found: LookupResponse = response.json().await?;
        let address = found.address.trim();
        if address.is_empty() {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(address.to_string())
    }

    /// Every record the registry currently holds.
    pub async fn list(&self) -> Result<Vec<AddressRecord>, RegistryError> {
        let url = format!("{}/all", self.base_url);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        // An older registry answers `null` for an empty table.
        let records: Option<Vec<AddressRecord>> = response.json().await?;
        Ok(records.unwrap_or_default())
    }
}
