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

//! Independently timed periodic fetches, one task per registered domain.
//!
//! Fetches for a domain run inline in that domain's task, so a new fetch never
//! starts while the previous one is in flight; ticks missed by a slow fetch are
//! skipped rather than queued.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::DomainQuery;
use crate::bus::EventBus;
use crate::degradation::DomainSource;
use crate::error::{Error, Result};
use crate::events::{Domain, StreamEvent, SyncEvent, Transport};

/// Returned by [`PollingScheduler::register_stream`]; cancels exactly one
/// registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollHandle {
    id: u64,
    domain: Domain,
}

impl PollHandle {
    pub fn domain(&self) -> Domain {
        self.domain
    }
}

/// Most recent successful fetch for a domain.
#[derive(Debug, Clone, PartialEq)]
pub struct LastValue {
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
}

type LatestValues = Arc<RwLock<BTreeMap<Domain, LastValue>>>;

pub struct PollingScheduler {
    bus: Arc<EventBus>,
    next_id: AtomicU64,
    streams: Mutex<BTreeMap<u64, JoinHandle<()>>>,
    latest: LatestValues,
}

impl PollingScheduler {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            next_id: AtomicU64::new(1),
            streams: Mutex::new(BTreeMap::new()),
            latest: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    fn streams(&self) -> MutexGuard<'_, BTreeMap<u64, JoinHandle<()>>> {
        match self.streams.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start polling `domain` every `every`, bounding each fetch by
    /// `fetch_timeout`. The first fetch happens immediately. A zero interval
    /// is rejected.
    pub fn register_stream(
        &self,
        domain: Domain,
        fetch: Arc<dyn DomainQuery>,
        every: Duration,
        fetch_timeout: Duration,
    ) -> Result<PollHandle> {
        if every.is_zero() {
            return Err(Error::Config(format!(
                "polling interval for {domain} must be non-zero"
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let bus = Arc::clone(&self.bus);
        let latest = Arc::clone(&self.latest);

        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                poll_once(domain, fetch.as_ref(), fetch_timeout, &bus, &latest).await;
            }
        });

        info!(%domain, interval_ms = every.as_millis() as u64, "registered polling stream");
        self.streams().insert(id, task);
        Ok(PollHandle { id, domain })
    }

    /// Stop one registration. Unknown or already cancelled handles are a no-op.
    pub fn cancel(&self, handle: &PollHandle) {
        if let Some(task) = self.streams().remove(&handle.id) {
            task.abort();
            debug!(domain = %handle.domain, "cancelled polling stream");
        }
    }

    /// Stop every registration.
    pub fn cancel_all(&self) {
        let streams = std::mem::take(&mut *self.streams());
        if !streams.is_empty() {
            debug!(count = streams.len(), "cancelling all polling streams");
        }
        for task in streams.into_values() {
            task.abort();
        }
    }

    pub fn active_count(&self) -> usize {
        self.streams().len()
    }

    /// Last successfully fetched value for `domain`, if any.
    pub fn latest(&self, domain: Domain) -> Option<LastValue> {
        match self.latest.read() {
            Ok(latest) => latest.get(&domain).cloned(),
            Err(poisoned) => poisoned.into_inner().get(&domain).cloned(),
        }
    }

    /// Record a value obtained outside the scheduler (for example a pushed
    /// message) so later fallbacks can reuse it.
    pub fn remember(&self, domain: Domain, payload: Value) {
        store(&self.latest, domain, payload);
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn store(latest: &LatestValues, domain: Domain, payload: Value) {
    let value = LastValue {
        payload,
        fetched_at: Utc::now(),
    };
    match latest.write() {
        Ok(mut latest) => latest.insert(domain, value),
        Err(poisoned) => poisoned.into_inner().insert(domain, value),
    };
}

async fn poll_once(
    domain: Domain,
    fetch: &dyn DomainQuery,
    fetch_timeout: Duration,
    bus: &EventBus,
    latest: &LatestValues,
) {
    match timeout(fetch_timeout, fetch.fetch(domain)).await {
        Ok(Ok(payload)) => {
            store(latest, domain, payload.clone());
            bus.emit(SyncEvent::Data(StreamEvent::new(
                domain.kind(),
                payload,
                Transport::Polling,
            )));
        }
        Ok(Err(err)) => {
            warn!(%domain, error = %err, "poll failed; keeping previous value");
        }
        Err(_) => {
            warn!(
                %domain,
                timeout_ms = fetch_timeout.as_millis() as u64,
                "poll timed out; keeping previous value"
            );
        }
    }
}

/// Polling strategy: one scheduler registration per active domain.
pub struct PollingSource {
    scheduler: Arc<PollingScheduler>,
    query: Arc<dyn DomainQuery>,
    intervals: BTreeMap<Domain, Duration>,
    fetch_timeout: Duration,
    handles: Mutex<BTreeMap<Domain, PollHandle>>,
}

impl PollingSource {
    const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

    pub fn new(
        scheduler: Arc<PollingScheduler>,
        query: Arc<dyn DomainQuery>,
        intervals: BTreeMap<Domain, Duration>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            scheduler,
            query,
            intervals,
            fetch_timeout,
            handles: Mutex::new(BTreeMap::new()),
        }
    }

    fn handles(&self) -> MutexGuard<'_, BTreeMap<Domain, PollHandle>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_active(&self, domain: Domain) -> bool {
        self.handles().contains_key(&domain)
    }
}

impl DomainSource for PollingSource {
    fn transport(&self) -> Transport {
        Transport::Polling
    }

    fn activate(&self, domain: Domain) {
        let mut handles = self.handles();
        if handles.contains_key(&domain) {
            return;
        }
        let every = self
            .intervals
            .get(&domain)
            .copied()
            .unwrap_or(Self::DEFAULT_INTERVAL);
        match self.scheduler.register_stream(
            domain,
            Arc::clone(&self.query),
            every,
            self.fetch_timeout,
        ) {
            Ok(handle) => {
                handles.insert(domain, handle);
            }
            Err(err) => error!(%domain, error = %err, "domain left unpolled"),
        }
    }

    fn deactivate(&self, domain: Domain) {
        if let Some(handle) = self.handles().remove(&domain) {
            self.scheduler.cancel(&handle);
        }
    }
}
