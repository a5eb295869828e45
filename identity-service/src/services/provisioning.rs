//! Client for the downstream mail-system provisioning API.
//!
//! Provisioning runs after the core mutation has committed. A failure is
//! logged and reported back as a partial-success flag; it never undoes the
//! identity change it accompanies.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::time::Duration;

use crate::config::ProvisioningConfig;

#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    async fn create_account(
        &self,
        email: &str,
        display_name: &str,
        password: &str,
    ) -> Result<(), anyhow::Error>;
    async fn update_password(&self, email: &str, password: &str) -> Result<(), anyhow::Error>;
    async fn delete_account(&self, email: &str) -> Result<(), anyhow::Error>;
}

pub struct HttpProvisioningClient {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpProvisioningClient {
    pub fn new(
        base_url: &str,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build provisioning HTTP client: {}", e))?;

        tracing::info!(base_url = %base_url, "Provisioning client configured");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.header("X-API-Key", key.expose_secret()),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<StatusCode, anyhow::Error> {
        let response = builder.send().await.map_err(|e| {
            tracing::error!(error = %e, operation = %what, "Provisioning request failed");
            anyhow::anyhow!("Provisioning request failed: {}", e)
        })?;
        Ok(response.status())
    }
}

fn expect_success(status: StatusCode, what: &str) -> Result<(), anyhow::Error> {
    if status.is_success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Provisioning {} returned {}", what, status))
    }
}

#[async_trait]
impl ProvisioningClient for HttpProvisioningClient {
    async fn create_account(
        &self,
        email: &str,
        display_name: &str,
        password: &str,
    ) -> Result<(), anyhow::Error> {
        let builder = self.request(reqwest::Method::POST, "/accounts").json(&json!({
            "email": email,
            "displayName": display_name,
            "password": password,
        }));
        expect_success(self.send(builder, "create_account").await?, "create_account")
    }

    async fn update_password(&self, email: &str, password: &str) -> Result<(), anyhow::Error> {
        let builder = self
            .request(reqwest::Method::PUT, &format!("/accounts/{}/password", email))
            .json(&json!({ "password": password }));
        expect_success(self.send(builder, "update_password").await?, "update_password")
    }

    async fn delete_account(&self, email: &str) -> Result<(), anyhow::Error> {
        let builder = self.request(reqwest::Method::DELETE, &format!("/accounts/{}", email));
        match self.send(builder, "delete_account").await? {
            // Already gone downstream.
            StatusCode::NOT_FOUND => Ok(()),
            status => expect_success(status, "delete_account"),
        }
    }
}

/// Used when no provisioning endpoint is configured.
pub struct DisabledProvisioning;

#[async_trait]
impl ProvisioningClient for DisabledProvisioning {
    async fn create_account(&self, _: &str, _: &str, _: &str) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn update_password(&self, _: &str, _: &str) -> Result<(), anyhow::Error> {
        Ok(())
    }

    async fn delete_account(&self, _: &str) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

pub fn from_config(
    config: &ProvisioningConfig,
) -> Result<std::sync::Arc<dyn ProvisioningClient>, anyhow::Error> {
    match &config.base_url {
        Some(url) => Ok(std::sync::Arc::new(HttpProvisioningClient::new(
            url,
            config.api_key.clone(),
            Duration::from_secs(config.timeout_seconds),
        )?)),
        None => {
            tracing::info!("Provisioning disabled");
            Ok(std::sync::Arc::new(DisabledProvisioning))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_provisioning_is_noop() {
        let client = from_config(&ProvisioningConfig::default()).unwrap();
        assert!(client.create_account("a@x.com", "A", "pw").await.is_ok());
        assert!(client.delete_account("a@x.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails() {
        let client =
            HttpProvisioningClient::new("http://127.0.0.1:9", None, Duration::from_millis(200))
                .unwrap();
        assert!(client.update_password("a@x.com", "pw").await.is_err());
    }
}
