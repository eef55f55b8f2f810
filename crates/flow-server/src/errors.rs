// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors returned while building a flow server. The server is never started when one of
/// these is returned.
#[derive(Debug, thiserror::Error)]
pub enum Creation {
    #[error("Invalid protocol {0}")]
    InvalidProtocol(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("bulk_maxdelay must be positive values, got {0}")]
    NegativeBulkMaxDelay(i64),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// A flow message could not be decoded from the bytes received from an agent.
#[derive(Debug, thiserror::Error)]
#[error("Error while parsing flow: {0}")]
pub struct DecodeError(#[from] prost::DecodeError);

/// Errors reported by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Storage backend unavailable")]
    Unavailable,
}
