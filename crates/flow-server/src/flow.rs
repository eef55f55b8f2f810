// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Flow records exchanged between capture agents and the flow server.
//!
//! Agents push [`FlowMessage`]s, each carrying complete [`Flow`] records for newly
//! observed conversations and [`FlowUpdate`] deltas for conversations already reported.
//! The types are protobuf messages so they can be decoded straight from a datagram or a
//! websocket frame, and they serialize with `serde` for live subscribers.

use serde::Serialize;

/// Maximum number of bytes captured from a single raw packet.
pub const MAX_CAPTURE_LENGTH: usize = 4096;

/// Maximum number of raw packets an agent attaches to a single flow.
pub const MAX_RAW_PACKET_LIMIT: usize = 10;

/// Nominal encoded size of a flow without raw packets.
pub const DEFAULT_PROTOBUF_FLOW_SIZE: usize = 500;

/// Worst-case encoded size of a single flow message.
///
/// Each flow can carry `MAX_RAW_PACKET_LIMIT` captures of `MAX_CAPTURE_LENGTH` bytes on top
/// of its own fields.
pub const MAX_FLOW_MESSAGE_SIZE: usize =
    MAX_CAPTURE_LENGTH * MAX_RAW_PACKET_LIMIT + DEFAULT_PROTOBUF_FLOW_SIZE;

/// Why a flow stopped being tracked by the agent.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration, Serialize,
)]
#[repr(i32)]
pub enum FinishType {
    NotFinished = 0,
    TcpFin = 1,
    TcpRst = 2,
    Timeout = 3,
}

/// One protocol layer of a flow (link, network or transport).
#[derive(Clone, PartialEq, ::prost::Message, Serialize)]
pub struct FlowLayer {
    #[prost(string, tag = "1")]
    pub protocol: String,
    #[prost(string, tag = "2")]
    pub a: String,
    #[prost(string, tag = "3")]
    pub b: String,
    #[prost(int64, tag = "4")]
    pub id: i64,
}

/// Packet and byte counters, in both directions.
#[derive(Clone, PartialEq, Eq, ::prost::Message, Serialize)]
pub struct FlowMetric {
    #[prost(int64, tag = "1")]
    pub a_b_packets: i64,
    #[prost(int64, tag = "2")]
    pub a_b_bytes: i64,
    #[prost(int64, tag = "3")]
    pub b_a_packets: i64,
    #[prost(int64, tag = "4")]
    pub b_a_bytes: i64,
    #[prost(int64, tag = "5")]
    pub start: i64,
    #[prost(int64, tag = "6")]
    pub last: i64,
    #[prost(int64, tag = "7")]
    pub rtt: i64,
}

/// Connection establishment and teardown timestamps of a TCP flow.
#[derive(Clone, PartialEq, Eq, ::prost::Message, Serialize)]
pub struct TcpMetric {
    #[prost(int64, tag = "1")]
    pub a_b_syn_start: i64,
    #[prost(int64, tag = "2")]
    pub b_a_syn_start: i64,
    #[prost(int64, tag = "3")]
    pub a_b_fin_start: i64,
    #[prost(int64, tag = "4")]
    pub b_a_fin_start: i64,
    #[prost(int64, tag = "5")]
    pub a_b_rst_start: i64,
    #[prost(int64, tag = "6")]
    pub b_a_rst_start: i64,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message, Serialize)]
pub struct IpMetric {
    #[prost(int64, tag = "1")]
    pub fragments: i64,
    #[prost(int64, tag = "2")]
    pub fragment_errors: i64,
}

/// A packet captured verbatim by the agent.
#[derive(Clone, PartialEq, Eq, ::prost::Message, Serialize)]
pub struct RawPacket {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(int64, tag = "2")]
    pub index: i64,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

/// A complete flow record, identified by its `uuid`.
#[derive(Clone, PartialEq, ::prost::Message, Serialize)]
pub struct Flow {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, tag = "2")]
    pub layers_path: String,
    #[prost(string, tag = "3")]
    pub node_tid: String,
    #[prost(message, optional, tag = "4")]
    pub link: Option<FlowLayer>,
    #[prost(message, optional, tag = "5")]
    pub network: Option<FlowLayer>,
    #[prost(message, optional, tag = "6")]
    pub transport: Option<FlowLayer>,
    #[prost(string, tag = "7")]
    pub application: String,
    #[prost(message, optional, tag = "8")]
    pub metric: Option<FlowMetric>,
    #[prost(message, optional, tag = "9")]
    pub last_update_metric: Option<FlowMetric>,
    #[prost(message, optional, tag = "10")]
    pub tcp_metric: Option<TcpMetric>,
    #[prost(message, optional, tag = "11")]
    pub ip_metric: Option<IpMetric>,
    #[prost(int64, tag = "12")]
    pub start: i64,
    #[prost(int64, tag = "13")]
    pub last: i64,
    #[prost(enumeration = "FinishType", tag = "14")]
    pub finish_type: i32,
    #[prost(int64, tag = "15")]
    pub raw_packets_captured: i64,
    #[prost(message, repeated, tag = "16")]
    pub last_raw_packets: Vec<RawPacket>,
}

/// A partial record for a flow already reported by the agent.
///
/// Metric fields are only present when they changed since the last report.
#[derive(Clone, PartialEq, ::prost::Message, Serialize)]
pub struct FlowUpdate {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(message, optional, tag = "2")]
    pub metric: Option<FlowMetric>,
    #[prost(message, optional, tag = "3")]
    pub last_update_metric: Option<FlowMetric>,
    #[prost(message, optional, tag = "4")]
    pub tcp_metric: Option<TcpMetric>,
    #[prost(message, optional, tag = "5")]
    pub ip_metric: Option<IpMetric>,
    #[prost(int64, tag = "6")]
    pub last: i64,
    #[prost(enumeration = "FinishType", tag = "7")]
    pub finish_type: i32,
    #[prost(int64, tag = "8")]
    pub raw_packets_captured: i64,
    #[prost(message, repeated, tag = "9")]
    pub last_raw_packets: Vec<RawPacket>,
}

/// Unit of transfer between an agent and the flow server.
#[derive(Clone, PartialEq, ::prost::Message, Serialize)]
pub struct FlowMessage {
    #[prost(message, repeated, tag = "1")]
    pub flows: Vec<Flow>,
    #[prost(message, repeated, tag = "2")]
    pub updates: Vec<FlowUpdate>,
}

impl FlowMessage {
    /// Number of records carried by the message, used for loss accounting.
    pub fn flow_units(&self) -> usize {
        self.flows.len() + self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty() && self.updates.is_empty()
    }
}
