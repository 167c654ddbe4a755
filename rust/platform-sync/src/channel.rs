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

//! Persistent server-push connection with bounded exponential-backoff
//! reconnection.
//!
//! The channel owns exactly one background task per `open`. Every unexpected
//! close or failed connect consumes one unit of the reconnect budget; the
//! budget is restored once a session delivers a decodable message. When the
//! budget is spent the channel parks in [`ChannelState::Exhausted`] and stays
//! there until [`StreamingChannel::reset`].

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{DecodeError, Error, Result};
use crate::events::StreamEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
    Reconnecting,
    Exhausted,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closed => "closed",
            ChannelState::Reconnecting => "reconnecting",
            ChannelState::Exhausted => "exhausted",
        };
        f.write_str(name)
    }
}

/// Opens connections to the streaming endpoint.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>>;
}

/// One established bidirectional session.
#[async_trait]
pub trait StreamConnection: Send {
    /// Next inbound text frame; `None` once the remote side has closed.
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn send(&mut self, text: String) -> Result<()>;

    async fn close(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called; never followed by a reconnect.
    Requested,
    /// The server ended the session.
    Remote,
    Error(String),
    ConnectFailed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => f.write_str("closed by caller"),
            CloseReason::Remote => f.write_str("closed by server"),
            CloseReason::Error(e) => write!(f, "transport error: {e}"),
            CloseReason::ConnectFailed(e) => write!(f, "connect failed: {e}"),
        }
    }
}

/// Internal callbacks fired by the channel task. Implemented by the layer's
/// router, which republishes onto the event bus.
pub trait ChannelListener: Send + Sync {
    fn on_state(&self, _state: ChannelState) {}
    fn on_open(&self) {}
    fn on_message(&self, event: StreamEvent);
    fn on_malformed(&self, _error: &DecodeError, _bytes: usize) {}
    fn on_close(&self, _reason: &CloseReason) {}
    fn on_error(&self, _error: &Error) {}
    fn on_exhausted(&self, _attempts: u32) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// `base_delay * 2^attempt`, saturating.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

struct Shared {
    state: watch::Sender<ChannelState>,
    // Bumped by every open/close; a runner whose generation is stale may not
    // write state or fire callbacks.
    generation: Mutex<u64>,
    attempts: AtomicU32,
}

impl Shared {
    fn generation(&self) -> MutexGuard<'_, u64> {
        match self.generation.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct RunningTask {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    outbound: mpsc::UnboundedSender<String>,
}

pub struct StreamingChannel {
    connector: Arc<dyn StreamConnector>,
    listener: Arc<dyn ChannelListener>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    shared: Arc<Shared>,
    url: Mutex<Option<String>>,
    task: Mutex<Option<RunningTask>>,
}

impl StreamingChannel {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        listener: Arc<dyn ChannelListener>,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Closed);
        Self {
            connector,
            listener,
            policy,
            connect_timeout,
            shared: Arc::new(Shared {
                state,
                generation: Mutex::new(0),
                attempts: AtomicU32::new(0),
            }),
            url: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<RunningTask>> {
        match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Reconnect attempts consumed since the last healthy session.
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Start the connection task. A no-op while a task is already running.
    pub fn open(&self, url: impl Into<String>) {
        let url = url.into();
        let mut task = self.task();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!(%url, "stream channel already running");
            return;
        }

        match self.url.lock() {
            Ok(mut guard) => *guard = Some(url.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(url.clone()),
        }

        let generation = {
            let mut generation = self.shared.generation();
            *generation += 1;
            *generation
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let runner = Runner {
            url,
            connector: Arc::clone(&self.connector),
            listener: Arc::clone(&self.listener),
            policy: self.policy,
            connect_timeout: self.connect_timeout,
            shared: Arc::clone(&self.shared),
            generation,
            shutdown: shutdown_rx,
            outbound: outbound_rx,
        };

        *task = Some(RunningTask {
            handle: tokio::spawn(runner.run()),
            shutdown: shutdown_tx,
            outbound: outbound_tx,
        });
    }

    /// Caller-initiated close. Terminates the task and suppresses any
    /// reconnect that was pending.
    pub fn close(&self) {
        let running = self.task().take();
        let previous = {
            let mut generation = self.shared.generation();
            *generation += 1;
            self.shared.state.send_replace(ChannelState::Closed)
        };
        if previous != ChannelState::Closed {
            self.listener.on_state(ChannelState::Closed);
        }
        if let Some(running) = running {
            // The runner closes the socket gracefully once it sees the flag.
            let _ = running.shutdown.send(true);
            debug!("stream channel close requested");
        }
    }

    /// Give the next [`open`](Self::open) a full reconnect budget.
    pub fn clear_budget(&self) {
        self.shared.attempts.store(0, Ordering::SeqCst);
    }

    /// Clear the reconnect budget and reopen against the last URL.
    pub fn reset(&self) {
        self.close();
        self.clear_budget();
        let url = match self.url.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(url) = url {
            info!(%url, "resetting stream channel");
            self.open(url);
        }
    }

    /// Queue a client status message for the open session.
    pub fn send(&self, text: String) -> Result<()> {
        if self.state() != ChannelState::Open {
            return Err(Error::Transport(format!(
                "stream is {}, not open",
                self.state()
            )));
        }
        match self.task().as_ref() {
            Some(running) => running
                .outbound
                .send(text)
                .map_err(|_| Error::Transport("stream task stopped".into())),
            None => Err(Error::Transport("stream task stopped".into())),
        }
    }
}

impl Drop for StreamingChannel {
    fn drop(&mut self) {
        if let Some(running) = self.task().take() {
            let _ = running.shutdown.send(true);
        }
    }
}

enum SessionEnd {
    Requested,
    Lost(CloseReason),
}

struct Runner {
    url: String,
    connector: Arc<dyn StreamConnector>,
    listener: Arc<dyn ChannelListener>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    shared: Arc<Shared>,
    generation: u64,
    shutdown: watch::Receiver<bool>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl Runner {
    fn is_current(&self) -> bool {
        *self.shared.generation() == self.generation && !*self.shutdown.borrow()
    }

    fn transition(&self, state: ChannelState) {
        let generation = self.shared.generation();
        if *generation != self.generation {
            return;
        }
        let previous = self.shared.state.send_replace(state);
        drop(generation);
        if previous != state {
            debug!(from = %previous, to = %state, "stream channel state change");
            self.listener.on_state(state);
        }
    }

    async fn run(mut self) {
        loop {
            if !self.is_current() {
                break;
            }
            self.transition(ChannelState::Connecting);

            let outcome = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => break,
                result = timeout(self.connect_timeout, self.connector.connect(&self.url)) => result,
            };

            let reason = match outcome {
                Ok(Ok(conn)) => match self.session(conn).await {
                    SessionEnd::Requested => break,
                    SessionEnd::Lost(reason) => reason,
                },
                Ok(Err(err)) => {
                    warn!(url = %self.url, error = %err, "stream connect failed");
                    self.listener.on_error(&err);
                    CloseReason::ConnectFailed(err.to_string())
                }
                Err(_) => {
                    let err = Error::timeout("stream connect", self.connect_timeout);
                    warn!(url = %self.url, error = %err, "stream connect failed");
                    self.listener.on_error(&err);
                    CloseReason::ConnectFailed(err.to_string())
                }
            };

            if !self.is_current() {
                break;
            }

            let attempt = self.shared.attempts.load(Ordering::SeqCst);
            if attempt >= self.policy.max_attempts {
                warn!(
                    url = %self.url,
                    attempts = attempt,
                    %reason,
                    "stream reconnect budget exhausted"
                );
                self.transition(ChannelState::Exhausted);
                self.listener.on_exhausted(attempt);
                break;
            }

            self.shared.attempts.store(attempt + 1, Ordering::SeqCst);
            let delay = self.policy.delay_for(attempt);
            info!(
                attempt = attempt + 1,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                %reason,
                "scheduling stream reconnect"
            );
            self.transition(ChannelState::Reconnecting);

            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => break,
                _ = sleep(delay) => {}
            }
        }
        debug!(url = %self.url, "stream channel task stopped");
    }

    async fn session(&mut self, mut conn: Box<dyn StreamConnection>) -> SessionEnd {
        if !self.is_current() {
            conn.close().await;
            return SessionEnd::Requested;
        }
        self.transition(ChannelState::Open);
        info!(url = %self.url, "stream open");
        self.listener.on_open();

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => {
                    if timeout(self.connect_timeout, conn.close()).await.is_err() {
                        debug!("stream close handshake timed out");
                    }
                    self.listener.on_close(&CloseReason::Requested);
                    return SessionEnd::Requested;
                }
                Some(text) = self.outbound.recv() => {
                    if let Err(err) = conn.send(text).await {
                        warn!(error = %err, "failed to send status message");
                        self.listener.on_error(&err);
                        let reason = CloseReason::Error(err.to_string());
                        self.listener.on_close(&reason);
                        return SessionEnd::Lost(reason);
                    }
                }
                message = conn.recv() => match message {
                    Some(Ok(text)) => self.deliver(&text),
                    Some(Err(err)) if !err.is_recoverable() => self.reject(err),
                    Some(Err(err)) => {
                        warn!(error = %err, "stream transport error");
                        self.listener.on_error(&err);
                        let reason = CloseReason::Error(err.to_string());
                        self.listener.on_close(&reason);
                        return SessionEnd::Lost(reason);
                    }
                    None => {
                        info!(url = %self.url, "stream closed by server");
                        self.listener.on_close(&CloseReason::Remote);
                        return SessionEnd::Lost(CloseReason::Remote);
                    }
                },
            }
        }
    }

    fn deliver(&self, text: &str) {
        if !self.is_current() {
            return;
        }
        match StreamEvent::decode(text) {
            Ok(event) => {
                if self.shared.attempts.swap(0, Ordering::SeqCst) > 0 {
                    debug!("stream healthy again; reconnect budget restored");
                }
                self.listener.on_message(event);
            }
            Err(err) => {
                warn!(error = %err, bytes = text.len(), "dropping malformed stream message");
                self.listener.on_malformed(&err, text.len());
            }
        }
    }

    // A per-message failure: the session itself is still usable.
    fn reject(&self, err: Error) {
        if !self.is_current() {
            return;
        }
        match err {
            Error::Decode(err) => {
                let bytes = match err {
                    DecodeError::InvalidUtf8 { bytes } => bytes,
                    _ => 0,
                };
                warn!(error = %err, bytes, "dropping undecodable stream frame");
                self.listener.on_malformed(&err, bytes);
            }
            err => {
                warn!(error = %err, "dropping stream frame");
                self.listener.on_error(&err);
            }
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
