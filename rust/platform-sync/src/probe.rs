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

//! Concurrent health checks against every known backend service.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use crate::backend::ServiceCheck;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub status: ServiceStatus,
    pub last_checked: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of one probe cycle. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub total: usize,
    pub healthy_count: usize,
    pub percentage: f64,
    pub services: BTreeMap<String, ServiceHealth>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn from_services(services: impl IntoIterator<Item = ServiceHealth>) -> Self {
        let services: BTreeMap<String, ServiceHealth> = services
            .into_iter()
            .map(|health| (health.name.clone(), health))
            .collect();
        let total = services.len();
        let healthy_count = services
            .values()
            .filter(|s| s.status == ServiceStatus::Healthy)
            .count();
        let percentage = if total == 0 {
            0.0
        } else {
            healthy_count as f64 * 100.0 / total as f64
        };

        Self {
            total,
            healthy_count,
            percentage,
            services,
            checked_at: Utc::now(),
        }
    }

    /// Report used when no probe has completed yet.
    pub fn empty() -> Self {
        Self::from_services(Vec::new())
    }

    pub fn all_healthy(&self) -> bool {
        self.total > 0 && self.healthy_count == self.total
    }

    /// True when both reports cover the same services with the same statuses.
    pub fn same_statuses(&self, other: &HealthReport) -> bool {
        self.services.len() == other.services.len()
            && self.services.iter().all(|(name, health)| {
                other
                    .services
                    .get(name)
                    .is_some_and(|o| o.status == health.status)
            })
    }
}

/// Issues one check per service concurrently, each bounded by `timeout`, so a
/// full cycle completes within a single timeout regardless of service count.
pub struct ServiceProbe {
    services: Vec<String>,
    checker: Arc<dyn ServiceCheck>,
    timeout: Duration,
}

impl ServiceProbe {
    pub fn new(services: Vec<String>, checker: Arc<dyn ServiceCheck>, timeout: Duration) -> Self {
        let mut services = services;
        services.sort();
        services.dedup();
        Self {
            services,
            checker,
            timeout,
        }
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    pub async fn check_all(&self) -> HealthReport {
        let started = Instant::now();
        let results = join_all(self.services.iter().map(|name| self.check_one(name))).await;
        let report = HealthReport::from_services(results);
        info!(
            total = report.total,
            healthy = report.healthy_count,
            percentage = report.percentage,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "service probe complete"
        );
        report
    }

    async fn check_one(&self, name: &str) -> ServiceHealth {
        let started = Instant::now();
        let (status, detail) = match timeout(self.timeout, self.checker.check(name)).await {
            Ok(Ok(status)) => (status, None),
            Ok(Err(err)) => {
                debug!(service = %name, error = %err, "health check failed");
                (ServiceStatus::Unreachable, Some(err.to_string()))
            }
            Err(_) => {
                debug!(service = %name, timeout_ms = self.timeout.as_millis() as u64, "health check timed out");
                (
                    ServiceStatus::Unreachable,
                    Some(format!("timed out after {:?}", self.timeout)),
                )
            }
        };
        let latency_ms = match status {
            ServiceStatus::Unreachable => None,
            _ => Some(started.elapsed().as_millis() as u64),
        };

        ServiceHealth {
            name: name.to_string(),
            status,
            last_checked: Utc::now(),
            latency_ms,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::check_fn;
    use crate::error::Error;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("svc-{i:02}")).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn completes_within_one_timeout_regardless_of_count() {
        let checker = check_fn(|_| async {
            tokio::time::sleep(Duration::from_millis(800)).await;
            Ok(ServiceStatus::Healthy)
        });
        let probe = ServiceProbe::new(names(40), checker, Duration::from_secs(2));

        let started = Instant::now();
        let report = probe.check_all().await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(800) && elapsed < Duration::from_secs(2));
        assert_eq!(report.total, 40);
        assert_eq!(report.services.len(), 40);
        assert_eq!(report.percentage, 100.0);
        assert!(report.all_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_and_failing_services_are_unreachable() {
        let checker = check_fn(|name| async move {
            match name.as_str() {
                "hung" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ServiceStatus::Healthy)
                }
                "broken" => Err(Error::Transport("connection refused".into())),
                "slow" => Ok(ServiceStatus::Degraded),
                _ => Ok(ServiceStatus::Healthy),
            }
        });
        let services = vec!["hung", "broken", "slow", "ok"]
            .into_iter()
            .map(String::from)
            .collect();
        let probe = ServiceProbe::new(services, checker, Duration::from_secs(5));

        let started = Instant::now();
        let report = probe.check_all().await;

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
        assert_eq!(report.total, 4);
        assert_eq!(report.healthy_count, 1);
        assert_eq!(report.percentage, 25.0);
        assert_eq!(report.services["hung"].status, ServiceStatus::Unreachable);
        assert_eq!(report.services["broken"].status, ServiceStatus::Unreachable);
        assert_eq!(report.services["slow"].status, ServiceStatus::Degraded);
        assert!(report.services["broken"]
            .detail
            .as_deref()
            .is_some_and(|d| d.contains("connection refused")));
    }

    #[tokio::test]
    async fn duplicate_service_names_are_probed_once() {
        let checker = check_fn(|_| async { Ok(ServiceStatus::Healthy) });
        let services = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let probe = ServiceProbe::new(services, checker, Duration::from_secs(1));

        assert_eq!(probe.check_all().await.total, 2);
    }

    #[test]
    fn empty_report_is_not_healthy() {
        let report = HealthReport::empty();
        assert_eq!(report.percentage, 0.0);
        assert!(!report.all_healthy());
    }

    #[test]
    fn status_comparison_ignores_timestamps() {
        let health = |status| ServiceHealth {
            name: "api".into(),
            status,
            last_checked: Utc::now(),
            latency_ms: Some(3),
            detail: None,
        };
        let a = HealthReport::from_services(vec![health(ServiceStatus::Healthy)]);
        let b = HealthReport::from_services(vec![health(ServiceStatus::Healthy)]);
        let c = HealthReport::from_services(vec![health(ServiceStatus::Degraded)]);

        assert!(a.same_statuses(&b));
        assert!(!a.same_statuses(&c));
    }
}
