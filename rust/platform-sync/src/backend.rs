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

//! Seams to the backend request functions.
//!
//! The synchronization layer never speaks HTTP directly; it calls these traits.
//! [`crate::http::HttpBackend`] is the production implementation, and
//! [`query_fn`] / [`check_fn`] wrap plain async closures for tests and
//! embedding.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::events::Domain;
use crate::probe::ServiceStatus;

/// Fetches the current data for one backend domain.
#[async_trait]
pub trait DomainQuery: Send + Sync {
    async fn fetch(&self, domain: Domain) -> Result<Value>;
}

/// Lightweight health check against one named backend service.
#[async_trait]
pub trait ServiceCheck: Send + Sync {
    async fn check(&self, service: &str) -> Result<ServiceStatus>;
}

struct FnQuery<F>(F);

#[async_trait]
impl<F, Fut> DomainQuery for FnQuery<F>
where
    F: Fn(Domain) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn fetch(&self, domain: Domain) -> Result<Value> {
        (self.0)(domain).await
    }
}

struct FnCheck<F>(F);

#[async_trait]
impl<F, Fut> ServiceCheck for FnCheck<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ServiceStatus>> + Send,
{
    async fn check(&self, service: &str) -> Result<ServiceStatus> {
        (self.0)(service.to_string()).await
    }
}

/// Wrap an async closure as a [`DomainQuery`].
pub fn query_fn<F, Fut>(f: F) -> Arc<dyn DomainQuery>
where
    F: Fn(Domain) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnQuery(f))
}

/// Wrap an async closure as a [`ServiceCheck`].
pub fn check_fn<F, Fut>(f: F) -> Arc<dyn ServiceCheck>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ServiceStatus>> + Send + 'static,
{
    Arc::new(FnCheck(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;

    #[tokio::test]
    async fn closures_act_as_backend_functions() {
        let query = query_fn(|domain| async move {
            match domain {
                Domain::Ai => Err(Error::Query {
                    domain,
                    message: "offline".into(),
                }),
                other => Ok(json!({ "domain": other.as_str() })),
            }
        });
        let check = check_fn(|name| async move {
            if name == "search" {
                Ok(ServiceStatus::Degraded)
            } else {
                Ok(ServiceStatus::Healthy)
            }
        });

        assert_eq!(
            query.fetch(Domain::Analytics).await.unwrap(),
            json!({"domain": "analytics"})
        );
        assert!(query.fetch(Domain::Ai).await.is_err());
        assert_eq!(check.check("search").await.unwrap(), ServiceStatus::Degraded);
        assert_eq!(check.check("billing").await.unwrap(), ServiceStatus::Healthy);
    }
}
