// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;
use std::sync::Arc;
use std::{future::Future, pin::Pin};

use subtle::ConstantTimeEq;
use tokio::sync::OnceCell;
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
pub const AUTH_TOKEN_QUERY_PARAM: &str = "token";

pub type TokenResolverFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = String> + Send>> + Send + Sync>;

/// Decides which agents may open a websocket connection.
#[derive(Clone, Default)]
pub enum AuthenticationBackend {
    /// Every agent is accepted.
    #[default]
    NoAuth,
    Static(String),
    /// Token fetched once, on the first connection.
    Dynamic {
        resolver_fn: TokenResolverFn,
        token: Arc<OnceCell<String>>,
    },
}

impl AuthenticationBackend {
    pub fn new_from_resolver(resolver_fn: TokenResolverFn) -> Self {
        Self::Dynamic {
            resolver_fn,
            token: Arc::new(OnceCell::new()),
        }
    }

    pub fn new_from_static_token(token: &str) -> Self {
        Self::Static(token.to_string())
    }

    /// `Static` when a token is configured, `NoAuth` otherwise.
    pub fn from_token(token: Option<&str>) -> Self {
        match token {
            Some(token) => Self::new_from_static_token(token),
            None => Self::NoAuth,
        }
    }

    /// Token agents must present, `None` when authentication is disabled.
    pub async fn token(&self) -> Option<&str> {
        match self {
            Self::NoAuth => None,
            Self::Static(token) => Some(token.as_str()),
            Self::Dynamic { resolver_fn, token } => Some(
                token
                    .get_or_init(|| async { (resolver_fn)().await })
                    .await
                    .as_str(),
            ),
        }
    }
}

impl Debug for AuthenticationBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAuth => write!(f, "AuthenticationBackend::NoAuth"),
            Self::Static(_) => write!(f, "AuthenticationBackend::Static"),
            Self::Dynamic { .. } => write!(f, "AuthenticationBackend::Dynamic"),
        }
    }
}

/// Checks the handshake request against `expected`.
///
/// The token is looked up in the `Authorization: Bearer` header, then `X-Auth-Token`, then
/// the `token` query parameter. Runs inside the synchronous handshake callback, so the
/// expected token must already be resolved.
pub fn is_authorized(expected: Option<&str>, request: &Request) -> bool {
    let Some(expected) = expected else {
        return true;
    };

    match presented_token(request) {
        Some(presented) => bool::from(presented.as_bytes().ct_eq(expected.as_bytes())),
        None => false,
    }
}

fn presented_token(request: &Request) -> Option<&str> {
    let headers = request.headers();

    if let Some(bearer) = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        return Some(bearer.trim());
    }

    if let Some(token) = headers
        .get(AUTH_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        return Some(token.trim());
    }

    request.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == AUTH_TOKEN_QUERY_PARAM)
            .map(|(_, value)| value)
    })
}
