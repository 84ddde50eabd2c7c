use std::time::Duration;

use anyhow::{Context, Result};

const SYSTEM_PROXY_ENV: &str = "CHATLOOM_ENABLE_SYSTEM_PROXY";

/// Shared reqwest client for every outbound collaborator.
///
/// System proxy discovery is opt-in through `CHATLOOM_ENABLE_SYSTEM_PROXY`; when
/// it fails (some platforms panic inside discovery) the client is rebuilt with
/// `no_proxy`.
pub fn build_http_client_with_timeout(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let allow_system_proxy = std::env::var(SYSTEM_PROXY_ENV)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        if let Ok(Ok(client)) = std::panic::catch_unwind(|| attempt_build(timeout, false)) {
            return Ok(client);
        }

        tracing::warn!(
            "HTTP client initialization with system proxy discovery failed; retrying with no_proxy"
        );
    }

    match std::panic::catch_unwind(|| attempt_build(timeout, true)) {
        Ok(result) => result.context("Failed to initialize HTTP client"),
        Err(_) => anyhow::bail!("HTTP client initialization panicked"),
    }
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
