/*
 * Copyright 2025 Carver Automation Corporation.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::channel::ReconnectPolicy;
use crate::error::{Error, Result};
use crate::events::Domain;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_stream_url")]
    pub url: String,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// A streamed domain silent for this long is demoted to polling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_after_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// `{service}` is replaced with the service name.
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default)]
    pub domain_paths: DomainPaths,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainPaths {
    #[serde(default = "default_enterprise_path")]
    pub enterprise: String,
    #[serde(default = "default_analytics_path")]
    pub analytics: String,
    #[serde(default = "default_performance_path")]
    pub performance: String,
    #[serde(default = "default_ai_path")]
    pub ai: String,
    #[serde(default = "default_collaboration_path")]
    pub collaboration: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    /// Seconds between probe cycles after initialisation; 0 disables.
    #[serde(default = "default_probe_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_services")]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_enterprise_interval_ms")]
    pub enterprise_interval_ms: u64,
    #[serde(default = "default_analytics_interval_ms")]
    pub analytics_interval_ms: u64,
    #[serde(default = "default_performance_interval_ms")]
    pub performance_interval_ms: u64,
    #[serde(default = "default_ai_interval_ms")]
    pub ai_interval_ms: u64,
    #[serde(default = "default_collaboration_interval_ms")]
    pub collaboration_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: default_stream_url(),
            base_delay_ms: default_base_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            stale_after_ms: None,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_ms: default_request_timeout_ms(),
            health_path: default_health_path(),
            domain_paths: DomainPaths::default(),
        }
    }
}

impl Default for DomainPaths {
    fn default() -> Self {
        Self {
            enterprise: default_enterprise_path(),
            analytics: default_analytics_path(),
            performance: default_performance_path(),
            ai: default_ai_path(),
            collaboration: default_collaboration_path(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout_ms(),
            interval_secs: default_probe_interval_secs(),
            services: default_services(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enterprise_interval_ms: default_enterprise_interval_ms(),
            analytics_interval_ms: default_analytics_interval_ms(),
            performance_interval_ms: default_performance_interval_ms(),
            ai_interval_ms: default_ai_interval_ms(),
            collaboration_interval_ms: default_collaboration_interval_ms(),
        }
    }
}

impl StreamConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after_ms.map(Duration::from_millis)
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl DomainPaths {
    pub fn path(&self, domain: Domain) -> &str {
        match domain {
            Domain::Enterprise => &self.enterprise,
            Domain::Analytics => &self.analytics,
            Domain::Performance => &self.performance,
            Domain::Ai => &self.ai,
            Domain::Collaboration => &self.collaboration,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

impl PollingConfig {
    pub fn interval(&self, domain: Domain) -> Duration {
        let ms = match domain {
            Domain::Enterprise => self.enterprise_interval_ms,
            Domain::Analytics => self.analytics_interval_ms,
            Domain::Performance => self.performance_interval_ms,
            Domain::Ai => self.ai_interval_ms,
            Domain::Collaboration => self.collaboration_interval_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn intervals(&self) -> BTreeMap<Domain, Duration> {
        Domain::ALL
            .into_iter()
            .map(|domain| (domain, self.interval(domain)))
            .collect()
    }
}

impl SyncConfig {
    const FILE_NAME: &'static str = "platform-sync.toml";

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: SyncConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `config_path`, or search the default locations if `None`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        if let Some(path) = config_path {
            info!(path, "loading config from specified path");
            return Self::from_file(path);
        }
        Self::load_from_defaults()
    }

    /// Tries ./platform-sync.toml, /etc/serviceradar/platform-sync.toml and
    /// ~/.config/serviceradar/platform-sync.toml, falling back to defaults.
    pub fn load_from_defaults() -> Result<Self> {
        let mut paths = vec![
            format!("./{}", Self::FILE_NAME),
            format!("/etc/serviceradar/{}", Self::FILE_NAME),
        ];
        if let Ok(home) = std::env::var("HOME") {
            paths.push(format!("{home}/.config/serviceradar/{}", Self::FILE_NAME));
        }

        for path in &paths {
            if Path::new(path).exists() {
                info!(path = %path, "loading config");
                return Self::from_file(path);
            }
        }

        debug!(searched = ?paths, "no config file found, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream.url.trim().is_empty() {
            return Err(Error::Config("stream.url must not be empty".into()));
        }
        if self.stream.base_delay_ms == 0 {
            return Err(Error::Config("stream.base_delay_ms must be positive".into()));
        }
        if self.stream.connect_timeout_ms == 0 {
            return Err(Error::Config(
                "stream.connect_timeout_ms must be positive".into(),
            ));
        }
        if self.stream.stale_after_ms == Some(0) {
            return Err(Error::Config(
                "stream.stale_after_ms must be positive when set".into(),
            ));
        }
        if self.backend.request_timeout_ms == 0 {
            return Err(Error::Config(
                "backend.request_timeout_ms must be positive".into(),
            ));
        }
        if self.probe.timeout_ms == 0 {
            return Err(Error::Config("probe.timeout_ms must be positive".into()));
        }
        if self.probe.services.is_empty() {
            return Err(Error::Config(
                "probe.services must name at least one service".into(),
            ));
        }
        for domain in Domain::ALL {
            if self.polling.interval(domain).is_zero() {
                return Err(Error::Config(format!(
                    "polling interval for {domain} must be positive"
                )));
            }
        }
        Ok(())
    }

    /// Example configuration for `--generate-config`.
    pub fn example_toml() -> String {
        let mut example = SyncConfig::default();
        example.stream.stale_after_ms = Some(120_000);
        match toml::to_string_pretty(&example) {
            Ok(body) => format!(
                "# serviceradar-platform-sync configuration\n\
                 # Every field is optional; omitted fields take the values shown.\n\n{body}"
            ),
            Err(_) => "# Failed to generate example".to_string(),
        }
    }
}

fn default_stream_url() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_health_path() -> String {
    "/api/health/{service}".to_string()
}

fn default_enterprise_path() -> String {
    "/api/enterprise/overview".to_string()
}

fn default_analytics_path() -> String {
    "/api/analytics/summary".to_string()
}

fn default_performance_path() -> String {
    "/api/performance/metrics".to_string()
}

fn default_ai_path() -> String {
    "/api/ai/status".to_string()
}

fn default_collaboration_path() -> String {
    "/api/collaboration/sessions".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_services() -> Vec<String> {
    [
        "api-gateway",
        "auth",
        "analytics",
        "performance",
        "ai-coordinator",
        "collaboration",
        "enterprise",
        "notifications",
        "search",
        "storage",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_enterprise_interval_ms() -> u64 {
    60_000
}

fn default_analytics_interval_ms() -> u64 {
    30_000
}

fn default_performance_interval_ms() -> u64 {
    5_000
}

fn default_ai_interval_ms() -> u64 {
    10_000
}

fn default_collaboration_interval_ms() -> u64 {
    15_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.stream.url, "ws://localhost:8080/ws");
        assert_eq!(config.stream.max_reconnect_attempts, 5);
        assert_eq!(config.probe.services.len(), 10);
        assert_eq!(
            config.polling.interval(Domain::Performance),
            Duration::from_secs(5)
        );
        assert!(config.stream.stale_after().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_content = r#"
[stream]
url = "wss://radar.example.com/ws"
base_delay_ms = 250

[probe]
interval_secs = 0
services = ["core", "poller"]

[polling]
ai_interval_ms = 2500
"#;

        let config: SyncConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.stream.url, "wss://radar.example.com/ws");
        assert_eq!(
            config.stream.reconnect_policy().base_delay,
            Duration::from_millis(250)
        );
        assert_eq!(config.stream.connect_timeout_ms, 10_000);
        assert_eq!(config.probe.interval(), None);
        assert_eq!(config.probe.services, vec!["core", "poller"]);
        assert_eq!(config.polling.interval(Domain::Ai), Duration::from_millis(2500));
        assert_eq!(
            config.polling.interval(Domain::Enterprise),
            Duration::from_secs(60)
        );
        assert_eq!(config.backend.domain_paths.path(Domain::Ai), "/api/ai/status");
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[backend]\nbase_url = \"http://core:8090\"\nrequest_timeout_ms = 2000"
        )
        .unwrap();

        let config = SyncConfig::from_file(file.path()).unwrap();
        assert_eq!(config.backend.base_url, "http://core:8090");
        assert_eq!(config.backend.request_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = SyncConfig::from_file("/nonexistent/platform-sync.toml").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SyncConfig::default();
        config.polling.collaboration_interval_ms = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = SyncConfig::default();
        config.probe.services.clear();
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.stream.stale_after_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_toml_parses_back() {
        let example = SyncConfig::example_toml();
        let parsed: SyncConfig = toml::from_str(&example).unwrap();
        assert_eq!(parsed.stream.stale_after_ms, Some(120_000));
        assert_eq!(parsed.polling, PollingConfig::default());
    }
}
