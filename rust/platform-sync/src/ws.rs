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

//! WebSocket transport for the streaming channel.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::channel::{StreamConnection, StreamConnector};
use crate::error::{DecodeError, Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn StreamConnection>> {
        let (socket, response) = connect_async(url).await.map_err(|e| Error::Connect {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        debug!(%url, status = %response.status(), "websocket handshake complete");
        Ok(Box::new(WsConnection { socket }))
    }
}

struct WsConnection {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamConnection for WsConnection {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            let message = match self.socket.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(Error::Transport(e.to_string()))),
            };
            match message {
                Message::Text(text) => return Some(Ok(text)),
                Message::Binary(bytes) => return Some(decode_binary(bytes)),
                Message::Close(frame) => {
                    debug!(?frame, "websocket close frame received");
                    return None;
                }
                // Pongs are queued by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("skipping websocket control frame");
                }
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<()> {
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.socket.close(None).await {
            debug!(error = %e, "websocket close handshake failed");
        }
    }
}

fn decode_binary(bytes: Vec<u8>) -> Result<String> {
    let len = bytes.len();
    String::from_utf8(bytes).map_err(|_| Error::Decode(DecodeError::InvalidUtf8 { bytes: len }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_frames_must_be_utf8() {
        assert_eq!(
            decode_binary(br#"{"type":"alert","payload":{}}"#.to_vec()).unwrap(),
            r#"{"type":"alert","payload":{}}"#
        );

        let err = decode_binary(vec![b'{', 0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, Error::Decode(DecodeError::InvalidUtf8 { bytes: 3 })));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn invalid_url_is_a_connect_error() {
        let err = match WsConnector.connect("not a websocket url").await {
            Ok(_) => panic!("connect should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, Error::Connect { .. }));
        assert!(err.is_recoverable());
    }
}
