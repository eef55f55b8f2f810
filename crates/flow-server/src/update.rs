// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Merging of partial flow updates into resident flow records.

use crate::flow::{Flow, FlowUpdate};

/// Applies `update` onto `flow`.
///
/// Metric fields absent from the update leave the flow untouched. `last` and `finish_type`
/// are always overwritten. Once the agent reports captured raw packets, the packets kept on
/// the flow are dropped so they are not accumulated twice.
pub fn update_flow<'a>(flow: &'a mut Flow, update: &FlowUpdate) -> &'a mut Flow {
    if let Some(last_update_metric) = &update.last_update_metric {
        flow.last_update_metric = Some(last_update_metric.clone());
    }
    if let Some(metric) = &update.metric {
        flow.metric = Some(metric.clone());
    }
    if let Some(tcp_metric) = &update.tcp_metric {
        flow.tcp_metric = Some(tcp_metric.clone());
    }
    if let Some(ip_metric) = &update.ip_metric {
        flow.ip_metric = Some(ip_metric.clone());
    }
    flow.last = update.last;
    flow.finish_type = update.finish_type;

    if update.raw_packets_captured > 0 {
        flow.last_raw_packets.clear();
    }
    flow
}

impl Flow {
    /// Owning variant of [`update_flow`].
    #[must_use]
    pub fn apply_update(mut self, update: &FlowUpdate) -> Flow {
        update_flow(&mut self, update);
        self
    }
}
