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

use anyhow::{Context, Result};
use tokio_stream::StreamExt;
use tracing::{info, warn};

use platform_sync::cli::Cli;
use platform_sync::telemetry::init_tracing;
use platform_sync::{PlatformSync, SyncConfig, SyncEvent};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    if cli.generate_config {
        println!("{}", SyncConfig::example_toml());
        return Ok(());
    }

    init_tracing(cli.debug);

    let config = SyncConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    info!(
        stream = %config.stream.url,
        backend = %config.backend.base_url,
        services = config.probe.services.len(),
        "starting platform sync"
    );

    let sync = PlatformSync::new(config).context("failed to build platform sync")?;
    sync.on_any(log_event);

    if !sync.initialize().await {
        warn!("no backend reachable yet; continuing in degraded mode");
    }

    let mut modes = sync.watch_mode();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            Some(mode) = modes.next() => {
                info!(%mode, "current sync mode");
            }
        }
    }

    sync.destroy();
    Ok(())
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::Data(data) => {
            info!(kind = %data.kind, origin = %data.origin, "data update");
        }
        SyncEvent::Health(report) => {
            info!(
                healthy = report.healthy_count,
                total = report.total,
                percentage = report.percentage,
                "service health"
            );
        }
        SyncEvent::MalformedMessage { reason, bytes } => {
            warn!(%reason, bytes, "malformed stream message");
        }
        SyncEvent::ConnectivityDegraded { attempts } => {
            warn!(attempts, "streaming unavailable; polling only");
        }
        SyncEvent::ModeChanged { from, to } => {
            info!(%from, %to, "mode changed");
        }
        SyncEvent::ChannelStateChanged(state) => {
            info!(%state, "stream state");
        }
        SyncEvent::SnapshotRefreshed(snapshot) => {
            info!(
                all_services_connected = snapshot.all_services_connected,
                degraded = ?snapshot.degraded_domains(),
                "snapshot refreshed"
            );
        }
    }
}
