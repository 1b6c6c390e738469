use reqwest::StatusCode;
use std::time::Duration;

use super::{ConfigError, RawSettings};

// ============================================================================
// Consul KV configuration source
// ============================================================================
//
// Reads one value per key from `<addr>/v1/kv/<key_root><key>?raw`.
// A key that does not exist reads as an empty value, which is then reported
// by the completeness check like any other missing setting.
//
// ============================================================================

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ConsulKv {
    client: reqwest::Client,
    base_url: String,
    key_root: String,
}

impl ConsulKv {
    pub fn new(addr: &str, key_root: &str) -> Self {
        let addr = addr.trim().trim_end_matches('/');
        let base_url = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };

        let mut key_root = key_root.trim().to_string();
        if !key_root.ends_with('/') {
            key_root.push('/');
        }

        Self {
            client: reqwest::Client::new(),
            base_url,
            key_root,
        }
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}{}?raw", self.base_url, self.key_root, key)
    }

    /// Read a single raw value
    pub async fn get(&self, key: &str) -> Result<String, ConfigError> {
        let full_key = format!("{}{}", self.key_root, key);
        let consul_error = |source| ConfigError::Consul {
            key: full_key.clone(),
            source,
        };

        let response = self
            .client
            .get(self.key_url(key))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(consul_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(key = %full_key, "Key not present in consul");
            return Ok(String::new());
        }

        response
            .error_for_status()
            .map_err(consul_error)?
            .text()
            .await
            .map_err(consul_error)
    }

    /// Overwrite the connection settings of `raw` with the values stored in consul
    pub(crate) async fn apply(&self, raw: &mut RawSettings) -> Result<(), ConfigError> {
        raw.aws_region = self.get("awsRegion").await?;
        raw.queue_url = self.get("queueUrl").await?;
        raw.db_host = self.get("dbHost").await?;
        raw.db_name = self.get("dbName").await?;
        raw.db_user = self.get("dbUser").await?;
        raw.db_password = self.get("dbPassword").await?;
        raw.db_port = self.get("dbPort").await?;
        Ok(())
    }
}
