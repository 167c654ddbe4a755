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

//! The explicitly owned entry point subscribers talk to.
//!
//! A [`PlatformSync`] is created once at startup, initialised, and destroyed at
//! shutdown. Subscribers only see the event bus and snapshots; which transport
//! carries each domain is decided internally.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, trace, warn};

use crate::backend::{DomainQuery, ServiceCheck};
use crate::bus::{EventBus, Subscription};
use crate::channel::{
    ChannelListener, ChannelState, CloseReason, StreamConnector, StreamingChannel,
};
use crate::config::SyncConfig;
use crate::degradation::{DegradationController, StreamingSource, SyncMode};
use crate::error::{DecodeError, Result};
use crate::events::{Domain, EventKind, StreamEvent, SyncEvent, Transport};
use crate::http::HttpBackend;
use crate::polling::{PollingScheduler, PollingSource};
use crate::probe::{HealthReport, ServiceProbe};
use crate::snapshot::{PlatformSnapshot, SnapshotBuilder};
use crate::ws::WsConnector;

/// Republishes channel callbacks onto the bus and feeds the controller.
struct Router {
    bus: Arc<EventBus>,
    streaming: Arc<StreamingSource>,
    controller: Arc<DegradationController>,
    scheduler: Arc<PollingScheduler>,
    last_seen: Mutex<BTreeMap<Domain, Instant>>,
}

impl Router {
    fn last_seen(&self) -> MutexGuard<'_, BTreeMap<Domain, Instant>> {
        match self.last_seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn forget(&self) {
        self.last_seen().clear();
    }

    /// Streamed domains that have been silent for at least `stale_after`.
    fn stale_domains(&self, stale_after: Duration) -> Vec<Domain> {
        let now = Instant::now();
        self.last_seen()
            .iter()
            .filter(|(domain, seen)| {
                self.streaming.accepts(**domain) && now.duration_since(**seen) >= stale_after
            })
            .map(|(domain, _)| *domain)
            .collect()
    }
}

impl ChannelListener for Router {
    fn on_state(&self, state: ChannelState) {
        if state == ChannelState::Open {
            let now = Instant::now();
            let mut last_seen = self.last_seen();
            for domain in Domain::ALL.into_iter().filter(Domain::has_stream) {
                last_seen.insert(domain, now);
            }
        }
        self.controller.on_channel_state(state);
        self.bus.emit(SyncEvent::ChannelStateChanged(state));
    }

    fn on_message(&self, event: StreamEvent) {
        if let Some(domain) = event.kind.domain() {
            if !self.streaming.accepts(domain) {
                trace!(%domain, "domain is polled; dropping streamed message");
                return;
            }
            self.last_seen().insert(domain, Instant::now());
            self.scheduler.remember(domain, event.payload.clone());
        }
        self.bus.emit(SyncEvent::Data(event));
    }

    fn on_malformed(&self, error: &DecodeError, bytes: usize) {
        self.bus.emit(SyncEvent::MalformedMessage {
            reason: error.to_string(),
            bytes,
        });
    }

    fn on_close(&self, reason: &CloseReason) {
        debug!(%reason, "stream session ended");
    }

    fn on_exhausted(&self, attempts: u32) {
        self.controller.on_exhausted(attempts);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Destroyed,
}

struct Inner {
    config: SyncConfig,
    bus: Arc<EventBus>,
    probe: Arc<ServiceProbe>,
    scheduler: Arc<PollingScheduler>,
    controller: Arc<DegradationController>,
    router: Arc<Router>,
    channel: StreamingChannel,
    snapshots: SnapshotBuilder,
    latest_snapshot: RwLock<Option<Arc<PlatformSnapshot>>>,
    latest_health: RwLock<Option<Arc<HealthReport>>>,
    lifecycle: Mutex<Lifecycle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        match self.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_running(&self) -> bool {
        *self.lifecycle() == Lifecycle::Running
    }

    /// Store `report` and emit it when forced or when any status changed.
    fn publish_health(&self, report: HealthReport, force: bool) {
        let report = Arc::new(report);
        let changed = {
            let mut latest = match self.latest_health.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let changed = latest
                .as_ref()
                .map_or(true, |previous| !previous.same_statuses(&report));
            *latest = Some(Arc::clone(&report));
            changed
        };
        if force || changed {
            self.bus.emit(SyncEvent::Health(report));
        }
    }

    /// Return to a first-initialisation state after `destroy`: live mode,
    /// no demotions, a full reconnect budget and no cached results.
    fn restart(&self) {
        self.bus.reopen();
        self.controller.reset();
        self.channel.clear_budget();
        self.router.forget();
        match self.latest_snapshot.write() {
            Ok(mut latest) => *latest = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        match self.latest_health.write() {
            Ok(mut latest) => *latest = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        debug!("platform sync state cleared for re-initialisation");
    }

    fn store_snapshot(&self, snapshot: PlatformSnapshot) -> Arc<PlatformSnapshot> {
        let snapshot = Arc::new(snapshot);
        match self.latest_snapshot.write() {
            Ok(mut latest) => *latest = Some(Arc::clone(&snapshot)),
            Err(poisoned) => *poisoned.into_inner() = Some(Arc::clone(&snapshot)),
        }
        snapshot
    }

    async fn refresh(&self) {
        let snapshot = self.snapshots.build_snapshot().await;
        if !self.is_running() {
            return;
        }
        self.publish_health(snapshot.services.clone(), false);
        let snapshot = self.store_snapshot(snapshot);
        self.bus.emit(SyncEvent::SnapshotRefreshed(snapshot));
    }

    /// Wait until the first connect attempt resolves one way or the other.
    async fn await_first_connect(&self) -> bool {
        let mut states = self.channel.subscribe();
        let settled = async {
            loop {
                let state = *states.borrow_and_update();
                match state {
                    ChannelState::Open => return true,
                    ChannelState::Reconnecting | ChannelState::Exhausted => return false,
                    ChannelState::Connecting | ChannelState::Closed => {}
                }
                if states.changed().await.is_err() {
                    return false;
                }
            }
        };
        // Leave room past the connect timeout for the state change to land.
        let limit = self.config.stream.connect_timeout() + Duration::from_millis(100);
        timeout(limit, settled).await.unwrap_or(false)
    }
}

async fn probe_loop(inner: Arc<Inner>, every: Duration) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let report = inner.probe.check_all().await;
        if !inner.is_running() {
            return;
        }
        inner.publish_health(report, false);
    }
}

async fn staleness_watchdog(inner: Arc<Inner>, stale_after: Duration) {
    let period = (stale_after / 2).max(Duration::from_millis(50));
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if inner.channel.state() != ChannelState::Open {
            continue;
        }
        for domain in inner.router.stale_domains(stale_after) {
            warn!(
                %domain,
                stale_after_ms = stale_after.as_millis() as u64,
                "no streamed data for domain"
            );
            inner.controller.on_domain_failure(domain);
        }
    }
}

async fn mode_watcher(inner: Arc<Inner>) {
    let mut modes = inner.controller.subscribe();
    while modes.changed().await.is_ok() {
        let mode = *modes.borrow_and_update();
        debug!(%mode, "refreshing snapshot after mode change");
        inner.refresh().await;
    }
}

/// Builder for [`PlatformSync`]. Backend functions and the stream connector
/// default to the HTTP and WebSocket implementations.
pub struct PlatformSyncBuilder {
    config: SyncConfig,
    query: Option<Arc<dyn DomainQuery>>,
    checker: Option<Arc<dyn ServiceCheck>>,
    connector: Option<Arc<dyn StreamConnector>>,
}

impl PlatformSyncBuilder {
    pub fn query(mut self, query: Arc<dyn DomainQuery>) -> Self {
        self.query = Some(query);
        self
    }

    pub fn checker(mut self, checker: Arc<dyn ServiceCheck>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> Result<PlatformSync> {
        let config = self.config;
        config.validate()?;

        let (query, checker) = match (self.query, self.checker) {
            (Some(query), Some(checker)) => (query, checker),
            (query, checker) => {
                let http = Arc::new(HttpBackend::new(&config.backend)?);
                let query = query.unwrap_or_else(|| Arc::clone(&http) as Arc<dyn DomainQuery>);
                let checker = checker.unwrap_or_else(|| http as Arc<dyn ServiceCheck>);
                (query, checker)
            }
        };
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector) as Arc<dyn StreamConnector>);

        let bus = Arc::new(EventBus::new());
        let probe = Arc::new(ServiceProbe::new(
            config.probe.services.clone(),
            checker,
            config.probe.timeout(),
        ));
        let scheduler = Arc::new(PollingScheduler::new(Arc::clone(&bus)));
        let streaming = Arc::new(StreamingSource::new());
        let polling = Arc::new(PollingSource::new(
            Arc::clone(&scheduler),
            Arc::clone(&query),
            config.polling.intervals(),
            config.backend.request_timeout(),
        ));
        let controller = Arc::new(DegradationController::new(
            Arc::clone(&bus),
            streaming.clone(),
            polling,
        ));
        let router = Arc::new(Router {
            bus: Arc::clone(&bus),
            streaming,
            controller: Arc::clone(&controller),
            scheduler: Arc::clone(&scheduler),
            last_seen: Mutex::new(BTreeMap::new()),
        });
        let channel = StreamingChannel::new(
            connector,
            router.clone(),
            config.stream.reconnect_policy(),
            config.stream.connect_timeout(),
        );
        let snapshots = SnapshotBuilder::new(query, Arc::clone(&probe), config.backend.request_timeout())
            .with_last_known(Arc::clone(&scheduler));

        Ok(PlatformSync {
            inner: Arc::new(Inner {
                config,
                bus,
                probe,
                scheduler,
                controller,
                router,
                channel,
                snapshots,
                latest_snapshot: RwLock::new(None),
                latest_health: RwLock::new(None),
                lifecycle: Mutex::new(Lifecycle::Idle),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }
}

pub struct PlatformSync {
    inner: Arc<Inner>,
}

impl PlatformSync {
    pub fn builder(config: SyncConfig) -> PlatformSyncBuilder {
        PlatformSyncBuilder {
            config,
            query: None,
            checker: None,
            connector: None,
        }
    }

    /// Build with the HTTP backend and WebSocket connector.
    pub fn new(config: SyncConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Probe every service, open the stream, start polling and publish the
    /// first snapshot. Returns whether anything is reachable: at least one
    /// healthy service or an open stream. Never fails.
    pub async fn initialize(&self) -> bool {
        let inner = &self.inner;
        let restarting = {
            let mut lifecycle = inner.lifecycle();
            let previous = *lifecycle;
            if previous == Lifecycle::Running {
                debug!("already initialised");
                drop(lifecycle);
                return inner.channel.state() == ChannelState::Open
                    || self
                        .latest_health()
                        .is_some_and(|health| health.healthy_count > 0);
            }
            *lifecycle = Lifecycle::Running;
            previous == Lifecycle::Destroyed
        };
        if restarting {
            inner.restart();
        }

        let baseline = inner.probe.check_all().await;
        let reachable_services = baseline.healthy_count;
        inner.publish_health(baseline, true);

        inner.controller.start();
        inner.channel.open(inner.config.stream.url.clone());
        let opened = inner.await_first_connect().await;

        if !inner.is_running() {
            debug!("destroyed during initialisation");
            return false;
        }

        {
            let mut tasks = inner.tasks();
            tasks.push(tokio::spawn(mode_watcher(Arc::clone(inner))));
            if let Some(every) = inner.config.probe.interval() {
                tasks.push(tokio::spawn(probe_loop(Arc::clone(inner), every)));
            }
            if let Some(stale_after) = inner.config.stream.stale_after() {
                tasks.push(tokio::spawn(staleness_watchdog(Arc::clone(inner), stale_after)));
            }
        }

        inner.refresh().await;

        let connected = reachable_services > 0 || opened;
        if connected {
            info!(reachable_services, stream_open = opened, "platform sync initialised");
        } else {
            warn!("platform sync initialised with no reachable backend");
        }
        connected
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on(kind, handler)
    }

    pub fn on_any<F>(&self, handler: F) -> Vec<Subscription>
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.bus.on_any(handler)
    }

    pub fn off(&self, subscription: &Subscription) {
        self.inner.bus.off(subscription);
    }

    /// Build and return a fresh snapshot.
    pub async fn snapshot(&self) -> PlatformSnapshot {
        let snapshot = self.inner.snapshots.build_snapshot().await;
        self.inner.store_snapshot(snapshot.clone());
        snapshot
    }

    /// Rebuild the snapshot and publish it to subscribers.
    pub async fn refresh(&self) {
        self.inner.refresh().await;
    }

    /// Tear everything down: no handler runs and no timer fires afterwards.
    /// Calling it again is a no-op.
    pub fn destroy(&self) {
        let inner = &self.inner;
        {
            let mut lifecycle = inner.lifecycle();
            if *lifecycle == Lifecycle::Destroyed {
                return;
            }
            *lifecycle = Lifecycle::Destroyed;
        }

        inner.bus.close();
        inner.controller.stop();
        inner.channel.close();
        inner.scheduler.cancel_all();
        for task in inner.tasks().drain(..) {
            task.abort();
        }
        info!("platform sync destroyed");
    }

    /// Deliberate recovery: clear demotions and the reconnect budget, return
    /// to live mode and reopen the stream.
    pub fn reset(&self) {
        if !self.inner.is_running() {
            return;
        }
        self.inner.controller.reset();
        self.inner.channel.reset();
    }

    /// Queue a client status message on the open stream.
    pub fn send_status(&self, payload: Value) -> Result<()> {
        let frame = json!({ "type": "status", "payload": payload }).to_string();
        self.inner.channel.send(frame).map_err(|err| {
            debug!(error = %err, "status message not sent");
            err
        })
    }

    pub fn mode(&self) -> SyncMode {
        self.inner.controller.mode()
    }

    /// Transport currently serving `domain`.
    pub fn transport_for(&self, domain: Domain) -> Transport {
        self.inner.controller.transport_for(domain)
    }

    pub fn channel_state(&self) -> ChannelState {
        self.inner.channel.state()
    }

    /// Stream of mode values, starting with the current one.
    pub fn watch_mode(&self) -> WatchStream<SyncMode> {
        WatchStream::new(self.inner.controller.subscribe())
    }

    pub fn latest_snapshot(&self) -> Option<Arc<PlatformSnapshot>> {
        match self.inner.latest_snapshot.read() {
            Ok(latest) => latest.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn latest_health(&self) -> Option<Arc<HealthReport>> {
        match self.inner.latest_health.read() {
            Ok(latest) => latest.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Drop for PlatformSync {
    fn drop(&mut self) {
        self.destroy();
    }
}
