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

//! Push/pull transport decision.
//!
//! The controller owns the [`SyncMode`] and assigns every [`Domain`] to one of
//! two [`DomainSource`] strategies. A domain is served by polling when it has
//! no push counterpart, when the channel is not open, when it has been demoted
//! after a streaming failure, or when the layer is in [`SyncMode::Fallback`].
//! Degrading is automatic; recovering to [`SyncMode::Live`] only happens via
//! [`DegradationController::reset`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::channel::ChannelState;
use crate::events::{Domain, SyncEvent, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Streaming is the primary path for every push-capable domain.
    Live,
    /// Streaming is up but some domains were demoted to polling.
    Hybrid,
    /// Polling only.
    Fallback,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Live => f.write_str("live"),
            SyncMode::Hybrid => f.write_str("hybrid"),
            SyncMode::Fallback => f.write_str("fallback"),
        }
    }
}

/// A strategy that can deliver a domain's data onto the bus.
pub trait DomainSource: Send + Sync {
    fn transport(&self) -> Transport;

    /// Start delivering `domain`. Activating an active domain is a no-op.
    fn activate(&self, domain: Domain);

    /// Stop delivering `domain`. Deactivating an inactive domain is a no-op.
    fn deactivate(&self, domain: Domain);
}

/// Streaming strategy: the channel is shared by all domains, so activation
/// only gates which domains' pushed messages are republished.
#[derive(Default)]
pub struct StreamingSource {
    accepted: RwLock<BTreeSet<Domain>>,
}

impl StreamingSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether pushed data for `domain` should reach subscribers.
    pub fn accepts(&self, domain: Domain) -> bool {
        match self.accepted.read() {
            Ok(accepted) => accepted.contains(&domain),
            Err(poisoned) => poisoned.into_inner().contains(&domain),
        }
    }

    fn accepted(&self) -> std::sync::RwLockWriteGuard<'_, BTreeSet<Domain>> {
        match self.accepted.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl DomainSource for StreamingSource {
    fn transport(&self) -> Transport {
        Transport::Streaming
    }

    fn activate(&self, domain: Domain) {
        self.accepted().insert(domain);
    }

    fn deactivate(&self, domain: Domain) {
        self.accepted().remove(&domain);
    }
}

struct Inner {
    mode: SyncMode,
    channel: ChannelState,
    demoted: BTreeSet<Domain>,
    assigned: BTreeMap<Domain, Transport>,
    degraded_announced: bool,
    running: bool,
}

pub struct DegradationController {
    bus: Arc<EventBus>,
    streaming: Arc<dyn DomainSource>,
    polling: Arc<dyn DomainSource>,
    mode: watch::Sender<SyncMode>,
    inner: Mutex<Inner>,
}

impl DegradationController {
    pub fn new(
        bus: Arc<EventBus>,
        streaming: Arc<dyn DomainSource>,
        polling: Arc<dyn DomainSource>,
    ) -> Self {
        let (mode, _) = watch::channel(SyncMode::Live);
        Self {
            bus,
            streaming,
            polling,
            mode,
            inner: Mutex::new(Inner {
                mode: SyncMode::Live,
                channel: ChannelState::Closed,
                demoted: BTreeSet::new(),
                assigned: BTreeMap::new(),
                degraded_announced: false,
                running: false,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn mode(&self) -> SyncMode {
        *self.mode.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncMode> {
        self.mode.subscribe()
    }

    /// Domains currently demoted to polling while the channel stays open.
    pub fn demoted(&self) -> Vec<Domain> {
        self.inner().demoted.iter().copied().collect()
    }

    /// Transport currently assigned to `domain`.
    pub fn transport_for(&self, domain: Domain) -> Transport {
        decide(&self.inner(), domain)
    }

    /// Begin assigning domains to sources.
    pub fn start(&self) {
        let mut inner = self.inner();
        inner.running = true;
        self.apply(&mut inner);
    }

    /// Deactivate every domain on both sources and stop reacting to input.
    pub fn stop(&self) {
        let mut inner = self.inner();
        inner.running = false;
        for (domain, transport) in std::mem::take(&mut inner.assigned) {
            self.source(transport).deactivate(domain);
        }
    }

    pub fn on_channel_state(&self, state: ChannelState) {
        let mut inner = self.inner();
        inner.channel = state;
        self.apply(&mut inner);
    }

    /// The channel spent its reconnect budget: everything moves to polling
    /// and stays there until [`reset`](Self::reset).
    pub fn on_exhausted(&self, attempts: u32) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner();
            if !inner.running {
                return;
            }
            inner.channel = ChannelState::Exhausted;
            if !inner.degraded_announced {
                inner.degraded_announced = true;
                events.push(SyncEvent::ConnectivityDegraded { attempts });
            }
            if let Some(change) = self.set_mode(&mut inner, SyncMode::Fallback) {
                warn!(attempts, "streaming exhausted; switching to polling-only mode");
                events.push(change);
            }
            self.apply(&mut inner);
        }
        self.publish(events);
    }

    /// A single push-capable domain stopped delivering while the channel
    /// stayed open. Demotes that domain to polling.
    pub fn on_domain_failure(&self, domain: Domain) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner();
            if !inner.running
                || !domain.has_stream()
                || inner.mode == SyncMode::Fallback
                || inner.channel != ChannelState::Open
            {
                return;
            }
            if !inner.demoted.insert(domain) {
                return;
            }
            warn!(%domain, "streamed domain failed; demoting to polling");
            if inner.mode == SyncMode::Live {
                events.extend(self.set_mode(&mut inner, SyncMode::Hybrid));
            }
            self.apply(&mut inner);
        }
        self.publish(events);
    }

    /// Deliberate recovery to [`SyncMode::Live`]. Clears demotions and re-arms
    /// the one-shot connectivity-degraded notification.
    pub fn reset(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner();
            inner.demoted.clear();
            inner.degraded_announced = false;
            if let Some(change) = self.set_mode(&mut inner, SyncMode::Live) {
                info!("degradation reset; returning to live mode");
                events.push(change);
            }
            self.apply(&mut inner);
        }
        self.publish(events);
    }

    fn set_mode(&self, inner: &mut Inner, to: SyncMode) -> Option<SyncEvent> {
        let from = inner.mode;
        if from == to {
            return None;
        }
        inner.mode = to;
        self.mode.send_replace(to);
        info!(%from, %to, "sync mode changed");
        Some(SyncEvent::ModeChanged { from, to })
    }

    fn source(&self, transport: Transport) -> &Arc<dyn DomainSource> {
        match transport {
            Transport::Streaming => &self.streaming,
            Transport::Polling => &self.polling,
        }
    }

    // Runs under the lock so source activations never interleave.
    fn apply(&self, inner: &mut Inner) {
        if !inner.running {
            return;
        }
        for domain in Domain::ALL {
            let wanted = decide(inner, domain);
            let current = inner.assigned.insert(domain, wanted);
            if current == Some(wanted) {
                continue;
            }
            if let Some(previous) = current {
                self.source(previous).deactivate(domain);
            }
            let source = self.source(wanted);
            debug_assert_eq!(source.transport(), wanted, "source wired to the wrong slot");
            debug!(%domain, transport = %source.transport(), "assigning domain transport");
            source.activate(domain);
        }
    }

    fn publish(&self, events: Vec<SyncEvent>) {
        for event in events {
            self.bus.emit(event);
        }
    }
}

fn decide(inner: &Inner, domain: Domain) -> Transport {
    if !domain.has_stream()
        || inner.mode == SyncMode::Fallback
        || inner.channel != ChannelState::Open
        || inner.demoted.contains(&domain)
    {
        Transport::Polling
    } else {
        Transport::Streaming
    }
}
