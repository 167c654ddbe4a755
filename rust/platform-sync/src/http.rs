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

//! reqwest-backed domain queries and service health checks.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::trace;

use crate::backend::{DomainQuery, ServiceCheck};
use crate::config::{BackendConfig, DomainPaths};
use crate::error::{Error, Result};
use crate::events::Domain;
use crate::probe::ServiceStatus;

pub struct HttpBackend {
    client: Client,
    base_url: String,
    health_path: String,
    paths: DomainPaths,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            health_path: config.health_path.clone(),
            paths: config.domain_paths.clone(),
        })
    }

    pub fn domain_url(&self, domain: Domain) -> String {
        format!("{}{}", self.base_url, self.paths.path(domain))
    }

    pub fn health_url(&self, service: &str) -> String {
        format!(
            "{}{}",
            self.base_url,
            self.health_path.replace("{service}", service)
        )
    }
}

#[async_trait]
impl DomainQuery for HttpBackend {
    async fn fetch(&self, domain: Domain) -> Result<Value> {
        let url = self.domain_url(domain);
        trace!(%domain, %url, "querying domain");
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Query {
                domain,
                message: format!("HTTP {status}"),
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl ServiceCheck for HttpBackend {
    async fn check(&self, service: &str) -> Result<ServiceStatus> {
        let url = self.health_url(service);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("{service} health returned HTTP {status}")));
        }
        let body = response.text().await?;
        Ok(status_from_body(&body))
    }
}

/// A 2xx health response is healthy unless its JSON body says
/// `"status": "degraded"`.
fn status_from_body(body: &str) -> ServiceStatus {
    let reported = serde_json::from_str::<Value>(body).ok().and_then(|value| {
        value
            .get("status")
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase)
    });
    match reported.as_deref() {
        Some("degraded") => ServiceStatus::Degraded,
        _ => ServiceStatus::Healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_urls_from_config() {
        let config = BackendConfig {
            base_url: "http://core:8090/".to_string(),
            ..BackendConfig::default()
        };
        let backend = HttpBackend::new(&config).unwrap();

        assert_eq!(
            backend.domain_url(Domain::Performance),
            "http://core:8090/api/performance/metrics"
        );
        assert_eq!(
            backend.health_url("search"),
            "http://core:8090/api/health/search"
        );
    }

    #[test]
    fn health_body_status() {
        assert_eq!(status_from_body(r#"{"status":"Degraded"}"#), ServiceStatus::Degraded);
        assert_eq!(status_from_body(r#"{"status":"ok"}"#), ServiceStatus::Healthy);
        assert_eq!(status_from_body("OK"), ServiceStatus::Healthy);
        assert_eq!(status_from_body(""), ServiceStatus::Healthy);
    }
}
