//! Remote configuration service client
//!
//! ```text
//!   GET  {base}/config/v1/{key}  → {"configKey": k, "configValue": v}   (404 = absent)
//!   POST {base}/config/v1        ← {"configKey": k, "configValue": v}
//! ```
//!
//! Values are strings; the keys below are pulled at start-up and applied
//! over the file and environment configuration.

use serde::{Deserialize, Serialize};

use super::{HttpClient, BACKGROUND_CALL_TIMEOUT};
use crate::config::ApplicationConfig;
use crate::context::Deadline;
use crate::error::{Error, Result};

pub const KEY_FAN_OUT_LIMIT: &str = "fleet.mixer.fan_out_limit";
pub const KEY_MAX_WRITE_RETRIES: &str = "fleet.router.max_write_retries";
pub const KEY_DURABLE_WRITES: &str = "fleet.leaf.durable_writes";
pub const KEY_MAX_CONCURRENT: &str = "fleet.scheduler.max_concurrent";

/// One stored key/value pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEntry {
    pub config_key: String,
    pub config_value: String,
}

pub struct ConfigServiceClient {
    http: HttpClient,
    base: String,
}

impl ConfigServiceClient {
    pub fn new(base: &str) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new()?,
            base: HttpClient::base_url(base),
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let deadline = Deadline::after(BACKGROUND_CALL_TIMEOUT);
        let url = format!("{}/config/v1/{}", self.base, key);
        let entry: Option<ConfigEntry> = self.http.get_optional(&url, &deadline).await?;
        Ok(entry.map(|e| e.config_value))
    }

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let deadline = Deadline::after(BACKGROUND_CALL_TIMEOUT);
        let url = format!("{}/config/v1", self.base);
        let entry = ConfigEntry {
            config_key: key.to_string(),
            config_value: value.to_string(),
        };
        self.http.post_unit(&url, &entry, &deadline).await
    }

    /// Typed read; a value that does not parse is a configuration error
    pub async fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key).await? {
            None => Ok(None),
            Some(raw) => parse_value(key, &raw).map(Some),
        }
    }

    /// Pull every known key and apply what is present
    pub async fn apply_to(&self, config: &mut ApplicationConfig) -> Result<usize> {
        let mut applied = 0;
        if let Some(v) = self.get_parsed::<usize>(KEY_FAN_OUT_LIMIT).await? {
            config.mixer.fan_out_limit = v;
            applied += 1;
        }
        if let Some(v) = self.get_parsed::<u32>(KEY_MAX_WRITE_RETRIES).await? {
            config.router.max_write_retries = v;
            applied += 1;
        }
        if let Some(v) = self.get_parsed::<bool>(KEY_DURABLE_WRITES).await? {
            config.leaf.durable_writes = v;
            applied += 1;
        }
        if let Some(v) = self.get_parsed::<usize>(KEY_MAX_CONCURRENT).await? {
            config.scheduler.max_concurrent = v;
            applied += 1;
        }
        if applied > 0 {
            tracing::info!(applied, "Applied remote configuration");
        }
        Ok(applied)
    }
}

pub fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Configuration(format!("remote value for {key} ({raw:?}): {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_uses_camel_case() {
        let entry: ConfigEntry =
            serde_json::from_str(r#"{"configKey":"a","configValue":"true"}"#).unwrap();
        assert_eq!(entry.config_key, "a");
        assert!(serde_json::to_string(&entry).unwrap().contains("configValue"));
    }

    #[test]
    fn test_parse_value() {
        assert!(parse_value::<bool>("k", " true ").unwrap());
        assert_eq!(parse_value::<usize>("k", "16").unwrap(), 16);
        assert!(matches!(
            parse_value::<usize>("k", "lots"),
            Err(Error::Configuration(_))
        ));
    }
}
