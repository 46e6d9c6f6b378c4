// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error;
use std::time::Duration;
use tracing::error;

use crate::config::ChannelConfig;

/// Builds the HTTP client shared by every send of a channel.
///
/// An unusable proxy setting falls back to a direct connection rather than
/// leaving the channel without a client.
#[must_use]
pub fn get_client(config: &ChannelConfig) -> reqwest::Client {
    match build_client(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "CHANNEL | Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client(config, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "CHANNEL | Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(
    config: &ChannelConfig,
    allow_proxy: bool,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if allow_proxy {
        if let Some(https_uri) = &config.https_proxy {
            client = client.proxy(reqwest::Proxy::https(https_uri.as_str())?);
        }
    }

    Ok(client.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_client_with_valid_proxy() {
        let config = ChannelConfig {
            https_proxy: Some("http://proxy.local:3128".to_string()),
            ..ChannelConfig::default()
        };
        assert!(build_client(&config, true).is_ok());
    }

    #[test]
    #[traced_test]
    fn test_invalid_proxy_falls_back_to_direct_client() {
        let config = ChannelConfig {
            https_proxy: Some("::not a proxy::".to_string()),
            ..ChannelConfig::default()
        };
        assert!(build_client(&config, true).is_err());
        let _client = get_client(&config);
        assert!(logs_contain("falling back to direct connection"));
    }
}
