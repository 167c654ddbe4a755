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

//! Scripted fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use platform_sync::{
    check_fn, query_fn, Domain, DomainQuery, Error, EventKind, PlatformSync, Result,
    ServiceCheck, ServiceStatus, StreamConnection, StreamConnector, SyncConfig, SyncEvent,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// What the fake server does with one connection.
#[derive(Debug, Clone)]
pub enum Session {
    /// Fail the connect call.
    Refuse,
    /// Accept, replay the frames, then close.
    Close(Vec<String>),
    /// Accept, replay the frames, then stay open for [`FakeConnector::push`].
    Hold(Vec<String>),
}

pub struct FakeConnector {
    script: Mutex<VecDeque<Session>>,
    then: Session,
    connects: Mutex<Vec<Instant>>,
    live: Mutex<Option<mpsc::UnboundedSender<String>>>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl FakeConnector {
    pub fn scripted(script: Vec<Session>, then: Session) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            then,
            connects: Mutex::new(Vec::new()),
            live: Mutex::new(None),
            sent: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn always(session: Session) -> Arc<Self> {
        Self::scripted(Vec::new(), session)
    }

    pub fn connects(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.connects.lock().unwrap().clone()
    }

    /// Push a frame on the currently held session.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        match self.live.lock().unwrap().as_ref() {
            Some(tx) => tx.send(frame.into()).is_ok(),
            None => false,
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamConnector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>> {
        self.connects.lock().unwrap().push(Instant::now());
        let session = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.then.clone());

        let (frames, hold) = match session {
            Session::Refuse => {
                return Err(Error::Connect {
                    url: url.to_string(),
                    message: "connection refused".into(),
                })
            }
            Session::Close(frames) => (frames, false),
            Session::Hold(frames) => (frames, true),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.live.lock().unwrap() = hold.then_some(tx);
        Ok(Box::new(FakeConnection {
            frames: frames.into(),
            hold,
            pushed: rx,
            sent: Arc::clone(&self.sent),
        }))
    }
}

struct FakeConnection {
    frames: VecDeque<String>,
    hold: bool,
    pushed: mpsc::UnboundedReceiver<String>,
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl StreamConnection for FakeConnection {
    async fn recv(&mut self) -> Option<Result<String>> {
        if let Some(frame) = self.frames.pop_front() {
            return Some(Ok(frame));
        }
        if !self.hold {
            return None;
        }
        self.pushed.recv().await.map(Ok)
    }

    async fn send(&mut self, text: String) -> Result<()> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Domain query that echoes the domain name, counts calls per domain and can
/// be told to fail specific domains.
#[derive(Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<Domain>>,
    failing: Mutex<Vec<Domain>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, domain: Domain) {
        self.failing.lock().unwrap().push(domain);
    }

    pub fn calls(&self, domain: Domain) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|d| **d == domain)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl DomainQuery for FakeBackend {
    async fn fetch(&self, domain: Domain) -> Result<Value> {
        self.calls.lock().unwrap().push(domain);
        if self.failing.lock().unwrap().contains(&domain) {
            return Err(Error::Query {
                domain,
                message: "service unavailable".into(),
            });
        }
        Ok(json!({ "domain": domain.as_str() }))
    }
}

/// Checker whose services are healthy while `up` is set.
pub struct Switch {
    pub up: Arc<AtomicBool>,
    pub calls: Arc<AtomicUsize>,
}

impl Switch {
    pub fn new(up: bool) -> Self {
        Self {
            up: Arc::new(AtomicBool::new(up)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn checker(&self) -> Arc<dyn ServiceCheck> {
        let up = Arc::clone(&self.up);
        let calls = Arc::clone(&self.calls);
        check_fn(move |name| {
            calls.fetch_add(1, Ordering::SeqCst);
            let up = up.load(Ordering::SeqCst);
            async move {
                if up {
                    Ok(ServiceStatus::Healthy)
                } else {
                    Err(Error::Transport(format!("{name} unreachable")))
                }
            }
        })
    }
}

pub fn healthy_checker() -> Arc<dyn ServiceCheck> {
    check_fn(|_| async { Ok(ServiceStatus::Healthy) })
}

pub fn static_query() -> Arc<dyn DomainQuery> {
    query_fn(|domain| async move { Ok(json!({ "domain": domain.as_str() })) })
}

/// Ten services, 1s reconnect base, no periodic probing or staleness checks.
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.stream.url = "ws://fake/stream".into();
    config.stream.base_delay_ms = 1_000;
    config.probe.interval_secs = 0;
    config.probe.services = (1..=10).map(|i| format!("service-{i:02}")).collect();
    config
}

/// Every event the layer published, in order.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl EventLog {
    pub fn attach(sync: &PlatformSync) -> Self {
        let log = Self::default();
        let events = Arc::clone(&log.events);
        sync.on_any(move |event| events.lock().unwrap().push(event.clone()));
        log
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn all(&self) -> Vec<SyncEvent> {
        self.events.lock().unwrap().clone()
    }
}

pub fn assert_near(actual: Duration, expected: Duration) {
    assert!(
        actual >= expected && actual <= expected + Duration::from_millis(50),
        "expected ~{expected:?}, got {actual:?}"
    );
}
