// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Datagram transport: one flow message per UDP datagram.
//!
//! The receive loop wakes up at least every [`READ_TIMEOUT`] so a stop request is noticed
//! even when no agent is sending. Decoded messages are pushed onto the intake queue without
//! waiting; when the queue is saturated they are dropped and accounted on the transport's
//! overload counter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::codec::FlowCodec;
use crate::errors::Creation;
use crate::flow::MAX_FLOW_MESSAGE_SIZE;
use crate::intake::{Admission, IntakeQueue, OverloadCounter};
use crate::transport::ingest;

/// Upper bound on a single socket wait, so cancellation is observed promptly.
pub const READ_TIMEOUT: Duration = Duration::from_millis(200);

// BufferReader abstracts where datagrams come from.
enum BufferReader {
    UdpSocket(tokio::net::UdpSocket),

    /// Mirror reader for testing - replays a fixed buffer
    #[allow(dead_code)]
    MirrorTest(Vec<u8>, SocketAddr),
}

impl BufferReader {
    async fn read(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        match self {
            BufferReader::UdpSocket(socket) => socket.recv_from(buf).await,
            BufferReader::MirrorTest(data, src) => {
                let amt = data.len().min(buf.len());
                buf[..amt].copy_from_slice(&data[..amt]);
                Ok((amt, *src))
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            BufferReader::UdpSocket(socket) => socket.local_addr(),
            BufferReader::MirrorTest(_, src) => Ok(*src),
        }
    }
}

pub struct UdpTransport {
    buffer_reader: BufferReader,
    codec: Arc<dyn FlowCodec>,
    overload: OverloadCounter,
}

impl UdpTransport {
    /// Binds the UDP socket agents send to.
    pub async fn bind(host: &str, port: u16, codec: Arc<dyn FlowCodec>) -> Result<Self, Creation> {
        let addr = format!("{host}:{port}");
        let socket = tokio::net::UdpSocket::bind(&addr)
            .await
            .map_err(|source| Creation::Bind {
                addr: addr.clone(),
                source,
            })?;
        debug!("Flow server listening for datagrams on {}", addr);

        Ok(Self {
            buffer_reader: BufferReader::UdpSocket(socket),
            codec,
            overload: OverloadCounter::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.buffer_reader.local_addr()
    }

    /// Starts the receive loop. The loop exits once `cancel_token` is cancelled.
    pub fn serve(self, queue: IntakeQueue, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.spin(&queue, &cancel_token).await })
    }

    async fn spin(&self, queue: &IntakeQueue, cancel_token: &CancellationToken) {
        let mut buf = vec![0u8; MAX_FLOW_MESSAGE_SIZE];

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                read = timeout(READ_TIMEOUT, self.buffer_reader.read(&mut buf)) => read,
            };

            match read {
                // nothing received within the timeout, check for cancellation again
                Err(_elapsed) => continue,
                Ok(Err(e)) => error!("Error while reading from flow socket: {}", e),
                Ok(Ok((amt, src))) => {
                    self.consume(&buf[..amt], src, queue);
                }
            }
        }
        debug!("Datagram flow transport stopped");
    }

    fn consume(&self, data: &[u8], src: SocketAddr, queue: &IntakeQueue) -> Option<Admission> {
        ingest(self.codec.as_ref(), data, &src, queue, &self.overload)
    }
}
