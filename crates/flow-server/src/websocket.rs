// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistent-connection transport: agents keep a websocket open on [`FLOW_ENDPOINT_PATH`]
//! and send one flow message per frame.
//!
//! Every connection runs on its own task. All connections of a transport share a single
//! [`OverloadCounter`], so the overload log reports lost flows aggregated over every
//! connected agent rather than per peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{is_authorized, AuthenticationBackend};
use crate::codec::FlowCodec;
use crate::errors::Creation;
use crate::flow::MAX_FLOW_MESSAGE_SIZE;
use crate::intake::{IntakeQueue, OverloadCounter};
use crate::transport::ingest;

pub const FLOW_ENDPOINT_PATH: &str = "/ws/agent/flow";

/// Time an agent has to complete the websocket upgrade after connecting.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct WebSocketTransport {
    listener: TcpListener,
    codec: Arc<dyn FlowCodec>,
    auth: Arc<AuthenticationBackend>,
    overload: Arc<OverloadCounter>,
}

/// State shared by every connection of one transport.
#[derive(Clone)]
struct ConnectionContext {
    codec: Arc<dyn FlowCodec>,
    auth: Arc<AuthenticationBackend>,
    overload: Arc<OverloadCounter>,
    queue: IntakeQueue,
    cancel_token: CancellationToken,
}

impl WebSocketTransport {
    pub async fn bind(
        host: &str,
        port: u16,
        codec: Arc<dyn FlowCodec>,
        auth: Arc<AuthenticationBackend>,
    ) -> Result<Self, Creation> {
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Creation::Bind {
                addr: addr.clone(),
                source,
            })?;
        debug!(
            "Flow server listening for websocket agents on {}{}",
            addr, FLOW_ENDPOINT_PATH
        );

        Ok(Self {
            listener,
            codec,
            auth,
            overload: Arc::new(OverloadCounter::new()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts accepting agents. Once `cancel_token` is cancelled the listener stops and the
    /// returned handle completes after every open connection has been closed.
    pub fn serve(self, queue: IntakeQueue, cancel_token: CancellationToken) -> JoinHandle<()> {
        let context = ConnectionContext {
            codec: self.codec,
            auth: self.auth,
            overload: self.overload,
            queue,
            cancel_token,
        };
        let listener = self.listener;

        tokio::spawn(async move { accept_loop(listener, context).await })
    }
}

async fn accept_loop(listener: TcpListener, context: ConnectionContext) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = context.cancel_token.cancelled() => break,
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    error!("Websocket connection task failed: {}", e);
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(handle_connection(stream, peer, context.clone()));
                }
                Err(e) => error!("Error while accepting websocket agent: {}", e),
            },
        }
    }

    drop(listener);
    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined {
            error!("Websocket connection task failed: {}", e);
        }
    }
    debug!("Websocket flow transport stopped");
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Runs the websocket handshake: path and token are checked before the upgrade is accepted.
async fn accept_agent(
    stream: TcpStream,
    auth: &AuthenticationBackend,
) -> Result<WebSocketStream<TcpStream>, WsError> {
    let expected = auth.token().await;
    let callback = |request: &Request, response: Response| {
        if request.uri().path() != FLOW_ENDPOINT_PATH {
            return Err(reject(StatusCode::NOT_FOUND, "unknown endpoint"));
        }
        if !is_authorized(expected, request) {
            return Err(reject(StatusCode::UNAUTHORIZED, "invalid authentication token"));
        }
        Ok(response)
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_FLOW_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(MAX_FLOW_MESSAGE_SIZE);

    tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, context: ConnectionContext) {
    // peers that never complete the upgrade must not hold the transport open
    let handshake = timeout(HANDSHAKE_TIMEOUT, accept_agent(stream, &context.auth));
    let mut ws_stream = tokio::select! {
        biased;
        _ = context.cancel_token.cancelled() => {
            debug!("Transport stopping, dropping agent {} before handshake", peer);
            return;
        }
        accepted = handshake => match accepted {
            Ok(Ok(ws_stream)) => ws_stream,
            Ok(Err(e)) => {
                warn!("Websocket handshake with {} failed: {}", peer, e);
                return;
            }
            Err(_elapsed) => {
                warn!("Websocket handshake with {} timed out", peer);
                return;
            }
        },
    };
    info!("Agent {} connected", peer);

    loop {
        let frame = tokio::select! {
            biased;
            _ = context.cancel_token.cancelled() => break,
            frame = ws_stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Binary(data))) => {
                ingest(
                    context.codec.as_ref(),
                    &data,
                    &peer,
                    &context.queue,
                    &context.overload,
                );
            }
            Some(Ok(Message::Text(text))) => {
                ingest(
                    context.codec.as_ref(),
                    text.as_bytes(),
                    &peer,
                    &context.queue,
                    &context.overload,
                );
            }
            Some(Ok(Message::Close(_))) | None => break,
            // ping and pong frames are answered by tungstenite itself
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("Error while reading from agent {}: {}", peer, e);
                break;
            }
        }
    }

    match timeout(CLOSE_TIMEOUT, ws_stream.close(None)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Error while closing connection with agent {}: {}", peer, e),
        Err(_elapsed) => debug!("Agent {} did not take the close frame in time", peer),
    }
    info!("Agent {} disconnected", peer);
}
