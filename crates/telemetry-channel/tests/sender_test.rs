// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use mockito::{Matcher, Server};
use std::sync::Arc;
use std::time::Duration;
use telemetry_channel::config::connection_string::track_endpoint;
use telemetry_channel::sender::MAX_RETRY_AFTER;
use telemetry_channel::serializer::{Payload, CONTENT_TYPE};
use telemetry_channel::{
    ChannelConfig, HttpSender, SendOutcome, Sender, TokenSupplier, Transmission,
};
use tokio_util::sync::CancellationToken;

fn config(base: &str) -> ChannelConfig {
    ChannelConfig {
        endpoint: track_endpoint(base).expect("failed to build endpoint"),
        instrumentation_key: "test-ikey".to_string(),
        request_timeout: Duration::from_secs(5),
        ..ChannelConfig::default()
    }
}

fn transmission(config: &ChannelConfig) -> Transmission {
    Transmission::new(
        config.endpoint.clone(),
        Payload {
            bytes: Bytes::from_static(b"{\"name\":\"Event\"}"),
            content_type: CONTENT_TYPE,
            content_encoding: Some("gzip"),
            record_count: 1,
        },
    )
}

async fn send_once(config: ChannelConfig) -> SendOutcome {
    let sender = HttpSender::new(&config);
    sender
        .send(&transmission(&config), &CancellationToken::new())
        .await
}

#[tokio::test]
async fn success_posts_payload_with_content_headers() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v2/track")
        .match_header("content-type", CONTENT_TYPE)
        .match_header("content-encoding", "gzip")
        .match_header("authorization", Matcher::Missing)
        .match_body("{\"name\":\"Event\"}")
        .with_status(200)
        .create_async()
        .await;

    let outcome = send_once(config(&server.url())).await;
    assert_eq!(outcome, SendOutcome::Success { status: 200 });
    mock.assert_async().await;
}

#[tokio::test]
async fn throttled_response_carries_retry_after() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/v2/track")
        .with_status(429)
        .with_header("retry-after", "7")
        .create_async()
        .await;

    let outcome = send_once(config(&server.url())).await;
    assert_eq!(
        outcome,
        SendOutcome::RetryableThrottled {
            status: 429,
            retry_after: Some(Duration::from_secs(7)),
        }
    );
}

#[tokio::test]
async fn oversized_retry_after_is_capped() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/v2/track")
        .with_status(429)
        .with_header("retry-after", "18446744073709551615")
        .create_async()
        .await;

    let outcome = send_once(config(&server.url())).await;
    assert_eq!(
        outcome,
        SendOutcome::RetryableThrottled {
            status: 429,
            retry_after: Some(MAX_RETRY_AFTER),
        }
    );
}

#[tokio::test]
async fn legacy_throttle_status_is_throttled() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/v2/track")
        .with_status(439)
        .create_async()
        .await;

    let outcome = send_once(config(&server.url())).await;
    assert_eq!(
        outcome,
        SendOutcome::RetryableThrottled {
            status: 439,
            retry_after: None,
        }
    );
}

#[tokio::test]
async fn server_error_is_transient() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/v2/track")
        .with_status(503)
        .create_async()
        .await;

    let outcome = send_once(config(&server.url())).await;
    assert!(matches!(
        outcome,
        SendOutcome::RetryableTransient {
            status: Some(503),
            ..
        }
    ));
}

#[tokio::test]
async fn client_error_is_terminal_with_body_in_reason() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/v2/track")
        .with_status(400)
        .with_body("invalid instrumentation key")
        .create_async()
        .await;

    let outcome = send_once(config(&server.url())).await;
    match outcome {
        SendOutcome::Terminal { status, reason } => {
            assert_eq!(status, Some(400));
            assert!(reason.contains("invalid instrumentation key"), "{reason}");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn connection_refused_is_transient() {
    let config = config("http://127.0.0.1:1");
    let sender = HttpSender::new(&config);
    let outcome = sender
        .send(&transmission(&config), &CancellationToken::new())
        .await;
    assert!(matches!(
        outcome,
        SendOutcome::RetryableTransient { status: None, .. }
    ));
}

#[tokio::test]
async fn token_supplier_adds_bearer_header() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v2/track")
        .match_header("authorization", "Bearer secret-token")
        .with_status(200)
        .create_async()
        .await;

    let config = ChannelConfig {
        token_supplier: Some(Arc::new(TokenSupplier::new_from_static_token(
            "secret-token",
        ))),
        ..config(&server.url())
    };
    let outcome = send_once(config).await;
    assert_eq!(outcome, SendOutcome::Success { status: 200 });
    mock.assert_async().await;
}

#[tokio::test]
async fn cancelled_send_returns_promptly() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v2/track")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let config = config(&server.url());
    let sender = HttpSender::new(&config);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = tokio::time::timeout(
        Duration::from_secs(1),
        sender.send(&transmission(&config), &cancel),
    )
    .await
    .expect("cancelled send did not return");
    assert_eq!(outcome, SendOutcome::Cancelled);
    mock.assert_async().await;
}
