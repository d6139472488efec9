//! HTTP Adapters
//!
//! reqwest-backed implementations of the collaborator traits:
//!
//! - [`RestClient`] - PostgREST-style [`QueryApi`](crate::client::QueryApi)
//!   and [`WriteApi`](crate::client::WriteApi)
//! - [`SseTransport`] - [`ChangeFeedTransport`](crate::client::ChangeFeedTransport)
//!   over a server-sent-events stream
//! - [`QaClient`] - [`DocumentQa`](crate::client::DocumentQa)

pub mod qa;
pub mod rest;
pub mod sse;

pub use qa::QaClient;
pub use rest::RestClient;
pub use sse::{SseDecoder, SseTransport};

use reqwest::{RequestBuilder, Response};

use crate::shared::error::{Result, SyncError};

/// Attach the API key as both `apikey` and bearer token
pub(crate) fn authorize(request: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) => request
            .header("apikey", key)
            .header("Authorization", format!("Bearer {}", key)),
        None => request,
    }
}

/// Turn a non-success response into an error built by `make`
pub(crate) async fn check_status(
    response: Response,
    make: impl FnOnce(String) -> SyncError,
) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| status.to_string());
    Err(make(format!("{} - {}", status, body.trim())))
}
