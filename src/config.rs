//! Coordinator configuration: wire types, fetch and periodic refresh.
//!
//! The coordinator hands the agent its probe parameters and target lists as
//! a JSON document with all durations in integer nanoseconds. The initial
//! fetch is fatal when it fails; refreshes keep the previous config.

use crate::report::sign;
use anyhow::{bail, Context, Result};
use log::{info, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// serde codec for `Duration` as integer nanoseconds on the wire.
mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}

/// Parameters of one ping burst.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingConfig {
    /// How often each target is probed.
    #[serde(with = "duration_nanos")]
    pub frequency: Duration,
    /// Pause between consecutive probes of one run.
    #[serde(with = "duration_nanos")]
    pub interval: Duration,
    /// Per-probe deadline.
    #[serde(with = "duration_nanos")]
    pub timeout: Duration,
    /// Probes per run.
    pub count: u32,
}

/// Parameters of one MTR run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MtrConfig {
    #[serde(with = "duration_nanos")]
    pub frequency: Duration,
    #[serde(with = "duration_nanos")]
    pub timeout: Duration,
    #[serde(with = "duration_nanos")]
    pub interval: Duration,
    pub max_ttl: u8,
    /// Rounds per run.
    pub count: u32,
}

/// The full document served by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub ping_config: PingConfig,
    pub mtr_config: MtrConfig,
    pub ping_targets: Vec<String>,
    pub mtr_targets: Vec<String>,
}

/// Error body the coordinator sends with non-200 responses.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrResponse {
    pub message: String,
}

/// Some coordinator deployments pad response bodies with NULs; strip them
/// before JSON decoding.
pub(crate) fn trim_nul(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| *b != 0).map_or(start, |p| p + 1);
    &bytes[start..end]
}

/// Fetches and refreshes the agent's config from the coordinator, signing
/// each request with the shared secret.
pub struct ConfigClient {
    http: reqwest::Client,
    fetch_url: String,
    refresh_url: String,
    name: String,
    secret: Vec<u8>,
}

impl ConfigClient {
    /// `base` is the coordinator origin, e.g. `http://star.example:8080`.
    pub fn new(http: reqwest::Client, base: &str, name: &str, secret: &[u8]) -> Self {
        ConfigClient {
            http,
            fetch_url: format!("{base}/config?nocache=1"),
            refresh_url: format!("{base}/config?update=1&nocache=1"),
            name: name.to_string(),
            secret: secret.to_vec(),
        }
    }

    /// Initial fetch. A failure here is fatal to the agent.
    pub async fn fetch(&self) -> Result<AgentConfig> {
        self.get(&self.fetch_url).await
    }

    /// Periodic refresh; the caller keeps the previous config on failure.
    pub async fn refresh(&self) -> Result<AgentConfig> {
        self.get(&self.refresh_url).await
    }

    async fn get(&self, url: &str) -> Result<AgentConfig> {
        let response = self
            .http
            .get(url)
            .header("Content-Type", "application/json;charset=UTF-8")
            .header("X-StarPing-Name", &self.name)
            .header("X-StarPing-Signature", sign(&self.secret, self.name.as_bytes()))
            .send()
            .await
            .context("config request failed")?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .context("failed reading config response body")?;
        let body = trim_nul(&body);
        if status != StatusCode::OK {
            let message = match serde_json::from_slice::<ErrResponse>(body) {
                Ok(err) => err.message,
                Err(_) => String::from_utf8_lossy(body).into_owned(),
            };
            bail!("coordinator returned {status}: {message}");
        }
        serde_json::from_slice(body).context("bad config response")
    }
}

/// Refresh the config every `every`, publishing successful fetches through
/// the watch handle. The first attempt runs one full period after startup.
pub fn spawn_refresh(
    client: Arc<ConfigClient>,
    updates: watch::Sender<Arc<AgentConfig>>,
    every: Duration,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            match client.refresh().await {
                Ok(config) => {
                    info!("config updated from the coordinator");
                    let _ = updates.send(Arc::new(config));
                }
                Err(err) => warn!("failed to update config from the coordinator: {err:#}"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AgentConfig {
        AgentConfig {
            ping_config: PingConfig {
                frequency: Duration::from_secs(60),
                interval: Duration::from_millis(100),
                timeout: Duration::from_secs(1),
                count: 10,
            },
            mtr_config: MtrConfig {
                frequency: Duration::from_secs(300),
                timeout: Duration::from_secs(1),
                interval: Duration::from_millis(50),
                max_ttl: 30,
                count: 3,
            },
            ping_targets: vec!["192.0.2.1".into(), "2001:db8::1".into()],
            mtr_targets: vec!["192.0.2.1".into()],
        }
    }

    #[test]
    fn config_json_round_trip() {
        let config = sample();
        let encoded = serde_json::to_vec(&config).unwrap();
        let decoded: AgentConfig = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn durations_travel_as_nanoseconds() {
        let encoded = serde_json::to_value(sample().ping_config).unwrap();
        assert_eq!(encoded["frequency"], 60_000_000_000u64);
        assert_eq!(encoded["interval"], 100_000_000u64);
        let decoded: PingConfig = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.frequency, Duration::from_secs(60));
    }

    #[test]
    fn coordinator_document_shape_is_accepted() {
        let raw = r#"{
            "ping_config": {"frequency": 60000000000, "timeout": 1000000000,
                            "interval": 100000000, "count": 10},
            "mtr_config": {"frequency": 300000000000, "timeout": 1000000000,
                           "interval": 50000000, "max_ttl": 30, "count": 3},
            "ping_targets": ["1.1.1.1"],
            "mtr_targets": []
        }"#;
        let config: AgentConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.ping_config.count, 10);
        assert_eq!(config.mtr_config.max_ttl, 30);
        assert_eq!(config.ping_targets, vec!["1.1.1.1"]);
        assert!(config.mtr_targets.is_empty());
    }

    #[test]
    fn nul_padding_is_trimmed() {
        assert_eq!(trim_nul(b"\0\0{}\0"), b"{}");
        assert_eq!(trim_nul(b"{}"), b"{}");
        assert_eq!(trim_nul(b"\0\0\0"), b"");
        assert_eq!(trim_nul(b""), b"");
    }
}
