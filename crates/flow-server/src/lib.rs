// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod auth;
pub mod batcher;
pub mod codec;
pub mod config;
pub mod errors;
pub mod flow;
pub mod intake;
pub mod server;
pub mod storage;
pub mod subscriber;
pub mod transport;
pub mod udp;
pub mod update;
pub mod websocket;
