// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::auth::AuthenticationBackend;
use crate::codec::FlowCodec;
use crate::config::{FlowServerConfig, Protocol};
use crate::errors::Creation;
use crate::intake::{Admission, IntakeQueue, OverloadCounter};
use crate::udp::UdpTransport;
use crate::websocket::WebSocketTransport;

/// Transport agents push flows through, chosen once from the configuration.
pub enum Transport {
    Udp(UdpTransport),
    WebSocket(WebSocketTransport),
}

impl Transport {
    /// Binds the transport selected by `config.protocol`.
    pub async fn from_config(
        config: &FlowServerConfig,
        codec: Arc<dyn FlowCodec>,
        auth: Arc<AuthenticationBackend>,
    ) -> Result<Self, Creation> {
        match config.protocol {
            Protocol::Udp => Ok(Transport::Udp(
                UdpTransport::bind(&config.host, config.port, codec).await?,
            )),
            Protocol::WebSocket => Ok(Transport::WebSocket(
                WebSocketTransport::bind(&config.host, config.port, codec, auth).await?,
            )),
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            Transport::Udp(_) => Protocol::Udp,
            Transport::WebSocket(_) => Protocol::WebSocket,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Transport::Udp(transport) => transport.local_addr(),
            Transport::WebSocket(transport) => transport.local_addr(),
        }
    }

    /// Spawns the transport's receive loop.
    pub fn serve(self, queue: IntakeQueue, cancel_token: CancellationToken) -> JoinHandle<()> {
        match self {
            Transport::Udp(transport) => transport.serve(queue, cancel_token),
            Transport::WebSocket(transport) => transport.serve(queue, cancel_token),
        }
    }
}

/// Decodes one datagram or frame and offers it to the intake queue. Undecodable bytes are
/// logged and skipped.
pub(crate) fn ingest(
    codec: &dyn FlowCodec,
    data: &[u8],
    peer: &dyn Display,
    queue: &IntakeQueue,
    overload: &OverloadCounter,
) -> Option<Admission> {
    trace!("Received {} bytes of flows from {}", data.len(), peer);

    match codec.decode(data) {
        Ok(msg) => Some(queue.push(msg, overload)),
        Err(e) => {
            error!("{} (from {})", e, peer);
            None
        }
    }
}
