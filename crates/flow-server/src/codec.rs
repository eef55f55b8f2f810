// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decoding of flow messages received from agents.

use prost::Message;

use crate::errors::DecodeError;
use crate::flow::FlowMessage;

/// Turns the bytes of one datagram or websocket frame into a [`FlowMessage`].
pub trait FlowCodec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<FlowMessage, DecodeError>;
}

/// Protobuf codec, the wire format spoken by capture agents.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtobufCodec;

impl FlowCodec for ProtobufCodec {
    fn decode(&self, bytes: &[u8]) -> Result<FlowMessage, DecodeError> {
        Ok(FlowMessage::decode(bytes)?)
    }
}
