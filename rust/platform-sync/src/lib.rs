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

//! Real-time backend synchronization layer.
//!
//! Keeps a client continuously informed about a constellation of backend
//! services over an unreliable network. A persistent stream is the primary
//! transport; per-domain polling takes over for domains without a push
//! counterpart, for domains whose stream went quiet, and for everything once
//! the stream exhausts its reconnect budget. Subscribers only see typed
//! events on the [`EventBus`] and aggregated [`PlatformSnapshot`]s.
//!
//! ```no_run
//! use platform_sync::{EventKind, PlatformSync, SyncConfig, SyncEvent};
//!
//! # async fn run() -> platform_sync::Result<()> {
//! let sync = PlatformSync::new(SyncConfig::default())?;
//! let sub = sync.on(EventKind::ConnectivityDegraded, |event| {
//!     if let SyncEvent::ConnectivityDegraded { attempts } = event {
//!         eprintln!("stream gave up after {attempts} attempts");
//!     }
//! });
//! let connected = sync.initialize().await;
//! let snapshot = sync.snapshot().await;
//! println!("{connected} {}%", snapshot.services.percentage);
//! sync.off(&sub);
//! sync.destroy();
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod bus;
pub mod channel;
pub mod cli;
pub mod config;
pub mod degradation;
pub mod error;
pub mod events;
pub mod http;
pub mod polling;
pub mod probe;
pub mod snapshot;
pub mod sync;
pub mod telemetry;
pub mod ws;

pub use backend::{check_fn, query_fn, DomainQuery, ServiceCheck};
pub use bus::{EventBus, Subscription};
pub use channel::{ChannelState, ReconnectPolicy, StreamConnection, StreamConnector, StreamingChannel};
pub use config::SyncConfig;
pub use degradation::{DegradationController, DomainSource, SyncMode};
pub use error::{DecodeError, Error, Result};
pub use events::{DataKind, Domain, EventKind, StreamEvent, SyncEvent, Transport};
pub use polling::{PollHandle, PollingScheduler};
pub use probe::{HealthReport, ServiceHealth, ServiceProbe, ServiceStatus};
pub use snapshot::{DataOrigin, DomainData, PlatformSnapshot, SnapshotBuilder};
pub use sync::{PlatformSync, PlatformSyncBuilder};
