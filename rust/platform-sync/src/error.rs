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

//! Error types for the synchronization layer.

use std::time::Duration;

use thiserror::Error;

use crate::events::Domain;

/// Result type for synchronization operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the backend.
#[derive(Error, Debug)]
pub enum Error {
    /// The streaming endpoint could not be reached.
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    /// An established stream failed mid-session.
    #[error("stream transport error: {0}")]
    Transport(String),

    /// A network call exceeded its bound.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },

    /// A backend domain query failed.
    #[error("{domain} query failed: {message}")]
    Query { domain: Domain, message: String },

    /// An inbound stream message could not be decoded.
    #[error("malformed stream message: {0}")]
    Decode(#[from] DecodeError),

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Error {
    /// Transport-level failures are retried with backoff and never surface
    /// to subscribers as hard failures.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Connect { .. } | Error::Transport(_) | Error::Timeout { .. } | Error::Http(_)
        )
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

/// Failures decoding the `{ "type": ..., "payload": ... }` wire envelope.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("envelope missing string field `type`")]
    MissingType,

    #[error("unknown event type `{0}`")]
    UnknownType(String),

    #[error("envelope missing field `payload`")]
    MissingPayload,

    #[error("binary frame of {bytes} bytes is not valid UTF-8")]
    InvalidUtf8 { bytes: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_recoverable() {
        assert!(Error::Transport("reset by peer".into()).is_recoverable());
        assert!(Error::timeout("probe", Duration::from_secs(5)).is_recoverable());
        assert!(!Error::Decode(DecodeError::NotAnObject).is_recoverable());
        assert!(!Error::Config("bad".into()).is_recoverable());
        assert!(!Error::from(DecodeError::InvalidUtf8 { bytes: 3 }).is_recoverable());
    }

    #[test]
    fn query_error_names_domain() {
        let err = Error::Query {
            domain: Domain::Analytics,
            message: "503".into(),
        };
        assert_eq!(err.to_string(), "analytics query failed: 503");
    }
}
