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

//! Point-in-time aggregate of every domain plus service health.
//!
//! Each domain query is one branch of a join in which a failing branch yields
//! an annotated substitute instead of failing the join, so a snapshot is always
//! produced.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::backend::DomainQuery;
use crate::error::{Error, Result};
use crate::events::Domain;
use crate::polling::PollingScheduler;
use crate::probe::{HealthReport, ServiceProbe};

/// Where a domain's value in a snapshot came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DataOrigin {
    /// Returned by the backend for this snapshot.
    Live,
    /// The live query failed; this is the last value seen for the domain.
    LastKnown { since: DateTime<Utc>, reason: String },
    /// The live query failed and nothing was ever seen; static placeholder.
    Fallback { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainData {
    pub value: Value,
    pub origin: DataOrigin,
}

impl DomainData {
    pub fn live(value: Value) -> Self {
        Self {
            value,
            origin: DataOrigin::Live,
        }
    }

    pub fn is_live(&self) -> bool {
        self.origin == DataOrigin::Live
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlatformSnapshot {
    pub services: HealthReport,
    pub enterprise: DomainData,
    pub analytics: DomainData,
    pub performance: DomainData,
    pub ai: DomainData,
    pub collaboration: DomainData,
    pub timestamp: DateTime<Utc>,
    pub all_services_connected: bool,
}

impl PlatformSnapshot {
    pub fn domain(&self, domain: Domain) -> &DomainData {
        match domain {
            Domain::Enterprise => &self.enterprise,
            Domain::Analytics => &self.analytics,
            Domain::Performance => &self.performance,
            Domain::Ai => &self.ai,
            Domain::Collaboration => &self.collaboration,
        }
    }

    /// Domains whose value is not live.
    pub fn degraded_domains(&self) -> Vec<Domain> {
        Domain::ALL
            .into_iter()
            .filter(|domain| !self.domain(*domain).is_live())
            .collect()
    }
}

/// Placeholder used when a domain has never produced data.
pub fn fallback_value(domain: Domain) -> Value {
    json!({
        "domain": domain.as_str(),
        "available": false,
    })
}

/// Await one branch of a partial-failure join. Errors and timeouts both come
/// back as `Err`, so the caller can substitute a value for that branch alone.
pub async fn settle<T, F>(operation: &str, limit: Duration, branch: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(limit, branch).await {
        Ok(outcome) => outcome,
        Err(_) => Err(Error::timeout(operation, limit)),
    }
}

pub struct SnapshotBuilder {
    query: Arc<dyn DomainQuery>,
    probe: Arc<ServiceProbe>,
    query_timeout: Duration,
    last_known: Option<Arc<PollingScheduler>>,
}

impl SnapshotBuilder {
    pub fn new(query: Arc<dyn DomainQuery>, probe: Arc<ServiceProbe>, query_timeout: Duration) -> Self {
        Self {
            query,
            probe,
            query_timeout,
            last_known: None,
        }
    }

    /// Reuse values cached by `scheduler` when a live query fails, and feed
    /// successful live values back into it.
    pub fn with_last_known(mut self, scheduler: Arc<PollingScheduler>) -> Self {
        self.last_known = Some(scheduler);
        self
    }

    /// Query every domain and probe every service concurrently.
    pub async fn build_snapshot(&self) -> PlatformSnapshot {
        let started = Instant::now();
        let (services, enterprise, analytics, performance, ai, collaboration) = futures::join!(
            self.probe.check_all(),
            self.domain(Domain::Enterprise),
            self.domain(Domain::Analytics),
            self.domain(Domain::Performance),
            self.domain(Domain::Ai),
            self.domain(Domain::Collaboration),
        );

        let all_services_connected = services.all_healthy();
        let snapshot = PlatformSnapshot {
            services,
            enterprise,
            analytics,
            performance,
            ai,
            collaboration,
            timestamp: Utc::now(),
            all_services_connected,
        };

        let degraded = snapshot.degraded_domains();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if degraded.is_empty() {
            info!(elapsed_ms, all_services_connected, "snapshot built");
        } else {
            warn!(elapsed_ms, ?degraded, "snapshot built with substituted domains");
        }
        snapshot
    }

    async fn domain(&self, domain: Domain) -> DomainData {
        let operation = format!("{domain} query");
        match settle(&operation, self.query_timeout, self.query.fetch(domain)).await {
            Ok(value) => {
                if let Some(scheduler) = &self.last_known {
                    scheduler.remember(domain, value.clone());
                }
                DomainData::live(value)
            }
            Err(err) => {
                debug!(%domain, error = %err, "domain query failed");
                self.substitute(domain, err)
            }
        }
    }

    fn substitute(&self, domain: Domain, err: Error) -> DomainData {
        let reason = err.to_string();
        match self.last_known.as_ref().and_then(|s| s.latest(domain)) {
            Some(last) => DomainData {
                value: last.payload,
                origin: DataOrigin::LastKnown {
                    since: last.fetched_at,
                    reason,
                },
            },
            None => DomainData {
                value: fallback_value(domain),
                origin: DataOrigin::Fallback { reason },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{check_fn, query_fn};
    use crate::bus::EventBus;
    use crate::probe::ServiceStatus;
    use pretty_assertions::assert_eq;

    fn probe() -> Arc<ServiceProbe> {
        Arc::new(ServiceProbe::new(
            vec!["api".into(), "search".into()],
            check_fn(|_| async { Ok(ServiceStatus::Healthy) }),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn one_failing_domain_is_substituted() {
        let query = query_fn(|domain| async move {
            if domain == Domain::Ai {
                Err(Error::Query {
                    domain,
                    message: "coordinator offline".into(),
                })
            } else {
                Ok(json!({ "name": domain.as_str() }))
            }
        });
        let builder = SnapshotBuilder::new(query, probe(), Duration::from_secs(1));

        let snapshot = builder.build_snapshot().await;

        assert_eq!(snapshot.degraded_domains(), vec![Domain::Ai]);
        assert_eq!(snapshot.analytics, DomainData::live(json!({"name": "analytics"})));
        assert_eq!(snapshot.ai.value, fallback_value(Domain::Ai));
        assert!(matches!(
            &snapshot.ai.origin,
            DataOrigin::Fallback { reason } if reason.contains("coordinator offline")
        ));
        assert!(snapshot.all_services_connected);
        assert_eq!(snapshot.services.percentage, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_query_times_out_into_last_known_value() {
        let scheduler = Arc::new(PollingScheduler::new(Arc::new(EventBus::new())));
        scheduler.remember(Domain::Collaboration, json!({"sessions": 7}));

        let query = query_fn(|domain| async move {
            if domain == Domain::Collaboration {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(json!({}))
        });
        let builder = SnapshotBuilder::new(query, probe(), Duration::from_secs(2))
            .with_last_known(scheduler);

        let started = Instant::now();
        let snapshot = builder.build_snapshot().await;

        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(snapshot.collaboration.value, json!({"sessions": 7}));
        assert!(matches!(
            snapshot.collaboration.origin,
            DataOrigin::LastKnown { .. }
        ));
        assert_eq!(snapshot.degraded_domains(), vec![Domain::Collaboration]);
    }

    #[tokio::test]
    async fn live_values_refresh_the_cache() {
        let scheduler = Arc::new(PollingScheduler::new(Arc::new(EventBus::new())));
        let builder = SnapshotBuilder::new(
            query_fn(|_| async { Ok(json!({"ok": true})) }),
            probe(),
            Duration::from_secs(1),
        )
        .with_last_known(scheduler.clone());

        builder.build_snapshot().await;

        assert_eq!(
            scheduler.latest(Domain::Enterprise).map(|v| v.payload),
            Some(json!({"ok": true}))
        );
    }
}
