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

//! Event vocabulary shared by every producer and consumer.
//!
//! Producers (streaming channel, polling scheduler, service probe, degradation
//! controller) publish [`SyncEvent`] values; subscribers register per
//! [`EventKind`] and match on the variant.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::ChannelState;
use crate::degradation::SyncMode;
use crate::error::DecodeError;
use crate::probe::HealthReport;
use crate::snapshot::PlatformSnapshot;

/// Independently queryable category of backend data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Enterprise,
    Analytics,
    Performance,
    Ai,
    Collaboration,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::Enterprise,
        Domain::Analytics,
        Domain::Performance,
        Domain::Ai,
        Domain::Collaboration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Enterprise => "enterprise",
            Domain::Analytics => "analytics",
            Domain::Performance => "performance",
            Domain::Ai => "ai",
            Domain::Collaboration => "collaboration",
        }
    }

    /// Event kind published for this domain's data.
    pub fn kind(&self) -> DataKind {
        match self {
            Domain::Enterprise => DataKind::Enterprise,
            Domain::Analytics => DataKind::Analytics,
            Domain::Performance => DataKind::Performance,
            Domain::Ai => DataKind::AiStatus,
            Domain::Collaboration => DataKind::Collaboration,
        }
    }

    /// Enterprise data is pull-only; every other domain has a push counterpart.
    pub fn has_stream(&self) -> bool {
        !matches!(self, Domain::Enterprise)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of data types carried by [`StreamEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataKind {
    Health,
    Performance,
    Analytics,
    AiStatus,
    Collaboration,
    Alert,
    Enterprise,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Health => "health",
            DataKind::Performance => "performance",
            DataKind::Analytics => "analytics",
            DataKind::AiStatus => "ai-status",
            DataKind::Collaboration => "collaboration",
            DataKind::Alert => "alert",
            DataKind::Enterprise => "enterprise",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "health" => Some(DataKind::Health),
            "performance" => Some(DataKind::Performance),
            "analytics" => Some(DataKind::Analytics),
            "ai-status" => Some(DataKind::AiStatus),
            "collaboration" => Some(DataKind::Collaboration),
            "alert" => Some(DataKind::Alert),
            "enterprise" => Some(DataKind::Enterprise),
            _ => None,
        }
    }

    /// Queryable domain backing this kind, if any.
    pub fn domain(&self) -> Option<Domain> {
        match self {
            DataKind::Enterprise => Some(Domain::Enterprise),
            DataKind::Analytics => Some(Domain::Analytics),
            DataKind::Performance => Some(Domain::Performance),
            DataKind::AiStatus => Some(Domain::Ai),
            DataKind::Collaboration => Some(Domain::Collaboration),
            DataKind::Health | DataKind::Alert => None,
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which transport delivered a piece of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Streaming,
    Polling,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Streaming => f.write_str("streaming"),
            Transport::Polling => f.write_str("polling"),
        }
    }
}

/// Unit of domain data flowing onto the event bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamEvent {
    pub kind: DataKind,
    pub payload: Value,
    pub origin: Transport,
    pub received_at: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(kind: DataKind, payload: Value, origin: Transport) -> Self {
        Self {
            kind,
            payload,
            origin,
            received_at: Utc::now(),
        }
    }

    /// Decode a `{ "type": string, "payload": any }` envelope received on the
    /// streaming channel. The payload itself is passed through opaque.
    pub fn decode(text: &str) -> std::result::Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut envelope) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let kind = match envelope.get("type") {
            Some(Value::String(name)) => {
                DataKind::from_wire(name).ok_or_else(|| DecodeError::UnknownType(name.clone()))?
            }
            _ => return Err(DecodeError::MissingType),
        };

        let payload = envelope
            .remove("payload")
            .ok_or(DecodeError::MissingPayload)?;

        Ok(Self::new(kind, payload, Transport::Streaming))
    }
}

/// Subscription key. One per [`SyncEvent`] shape, with data events split by
/// their [`DataKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Health,
    Performance,
    Analytics,
    AiStatus,
    Collaboration,
    Enterprise,
    Alert,
    MalformedMessage,
    ConnectivityDegraded,
    ModeChanged,
    ChannelState,
    Snapshot,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::Health,
        EventKind::Performance,
        EventKind::Analytics,
        EventKind::AiStatus,
        EventKind::Collaboration,
        EventKind::Enterprise,
        EventKind::Alert,
        EventKind::MalformedMessage,
        EventKind::ConnectivityDegraded,
        EventKind::ModeChanged,
        EventKind::ChannelState,
        EventKind::Snapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Health => "health",
            EventKind::Performance => "performance",
            EventKind::Analytics => "analytics",
            EventKind::AiStatus => "ai-status",
            EventKind::Collaboration => "collaboration",
            EventKind::Enterprise => "enterprise",
            EventKind::Alert => "alert",
            EventKind::MalformedMessage => "malformed-message",
            EventKind::ConnectivityDegraded => "connectivity-degraded",
            EventKind::ModeChanged => "mode-changed",
            EventKind::ChannelState => "channel-state",
            EventKind::Snapshot => "snapshot",
        }
    }
}

impl From<DataKind> for EventKind {
    fn from(kind: DataKind) -> Self {
        match kind {
            DataKind::Health => EventKind::Health,
            DataKind::Performance => EventKind::Performance,
            DataKind::Analytics => EventKind::Analytics,
            DataKind::AiStatus => EventKind::AiStatus,
            DataKind::Collaboration => EventKind::Collaboration,
            DataKind::Alert => EventKind::Alert,
            DataKind::Enterprise => EventKind::Enterprise,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a subscriber can observe.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Domain data from either transport.
    Data(StreamEvent),
    /// Result of a service probe cycle.
    Health(Arc<HealthReport>),
    /// A streamed message was dropped because it failed to decode.
    MalformedMessage { reason: String, bytes: usize },
    /// The streaming channel exhausted its reconnect budget.
    ConnectivityDegraded { attempts: u32 },
    ModeChanged { from: SyncMode, to: SyncMode },
    ChannelStateChanged(ChannelState),
    SnapshotRefreshed(Arc<PlatformSnapshot>),
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::Data(event) => event.kind.into(),
            SyncEvent::Health(_) => EventKind::Health,
            SyncEvent::MalformedMessage { .. } => EventKind::MalformedMessage,
            SyncEvent::ConnectivityDegraded { .. } => EventKind::ConnectivityDegraded,
            SyncEvent::ModeChanged { .. } => EventKind::ModeChanged,
            SyncEvent::ChannelStateChanged(_) => EventKind::ChannelState,
            SyncEvent::SnapshotRefreshed(_) => EventKind::Snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_known_envelope() {
        let event =
            StreamEvent::decode(r#"{"type":"ai-status","payload":{"agents":3}}"#).unwrap();
        assert_eq!(event.kind, DataKind::AiStatus);
        assert_eq!(event.payload, json!({"agents": 3}));
        assert_eq!(event.origin, Transport::Streaming);
        assert_eq!(SyncEvent::Data(event).kind(), EventKind::AiStatus);
    }

    #[test]
    fn rejects_malformed_envelopes() {
        assert!(matches!(
            StreamEvent::decode("{not json"),
            Err(DecodeError::InvalidJson(_))
        ));
        assert!(matches!(
            StreamEvent::decode("[1,2]"),
            Err(DecodeError::NotAnObject)
        ));
        assert!(matches!(
            StreamEvent::decode(r#"{"payload":{}}"#),
            Err(DecodeError::MissingType)
        ));
        assert!(matches!(
            StreamEvent::decode(r#"{"type":"weather","payload":{}}"#),
            Err(DecodeError::UnknownType(t)) if t == "weather"
        ));
        assert!(matches!(
            StreamEvent::decode(r#"{"type":"alert"}"#),
            Err(DecodeError::MissingPayload)
        ));
    }

    #[test]
    fn domain_kind_mapping_is_consistent() {
        for domain in Domain::ALL {
            assert_eq!(domain.kind().domain(), Some(domain));
        }
        assert_eq!(DataKind::Alert.domain(), None);
        assert!(!Domain::Enterprise.has_stream());
        assert!(Domain::Performance.has_stream());
    }

    #[test]
    fn wire_names_round_trip_through_serde() {
        let kind: DataKind = serde_json::from_str("\"ai-status\"").unwrap();
        assert_eq!(kind, DataKind::AiStatus);
        assert_eq!(DataKind::from_wire(kind.as_str()), Some(kind));
    }
}
