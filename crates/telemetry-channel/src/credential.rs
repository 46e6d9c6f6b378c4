// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;
use std::sync::Arc;
use std::{future::Future, pin::Pin};
use tokio::sync::OnceCell;

pub type TokenResolverFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync>;

/// Supplies the bearer token attached to every transmission.
///
/// The capability is injected once through the channel configuration. A
/// dynamic resolver runs on first use; a successful result is cached, a
/// failed one is retried on the next request.
#[derive(Clone)]
pub enum TokenSupplier {
    Static(String),
    Dynamic {
        resolver_fn: TokenResolverFn,
        token: Arc<OnceCell<String>>,
    },
}

impl TokenSupplier {
    pub fn new_from_resolver(resolver_fn: TokenResolverFn) -> Self {
        Self::Dynamic {
            resolver_fn,
            token: Arc::new(OnceCell::new()),
        }
    }

    pub fn new_from_static_token(token: &str) -> Self {
        Self::Static(token.to_string())
    }

    pub async fn get_token(&self) -> Option<&str> {
        match self {
            Self::Static(token) => Some(token),
            Self::Dynamic { resolver_fn, token } => token
                .get_or_try_init(|| async { (resolver_fn)().await.ok_or(()) })
                .await
                .ok()
                .map(String::as_str),
        }
    }
}

impl Debug for TokenSupplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenSupplier")
    }
}
