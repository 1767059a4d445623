// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use otlp_envelope::SpanEnvelope;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use tokio::time::Instant;
use tracing::debug;

use crate::credentials::VendorCredential;
use crate::errors::DeliveryError;

/// Posts envelopes to vendor collectors.
#[derive(Clone)]
pub struct CollectorClient {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl CollectorClient {
    pub fn new(client: reqwest::Client, request_timeout: Duration) -> Self {
        CollectorClient {
            client,
            request_timeout,
        }
    }

    /// Sends one envelope with the credential's auth headers and the
    /// envelope's own content headers. The request is cut off at the request
    /// timeout or at `deadline`, whichever comes first.
    pub async fn deliver(
        &self,
        credential: &VendorCredential,
        envelope: &SpanEnvelope,
        deadline: Instant,
    ) -> Result<(), DeliveryError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DeliveryError::Timeout);
        }
        let url = credential.traces_url();
        let url = reqwest::Url::parse(&url).map_err(|_| DeliveryError::InvalidEndpoint(url))?;

        let mut request = self
            .client
            .post(url)
            .headers(credential.headers.clone())
            .header(CONTENT_TYPE, envelope.content_type.as_str())
            .timeout(remaining.min(self.request_timeout))
            .body(envelope.payload.clone());
        if let Some(encoding) = envelope.content_encoding.header_value() {
            request = request.header(CONTENT_ENCODING, encoding);
        }

        let started = Instant::now();
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout
            } else {
                DeliveryError::Network(e)
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(
                "delivered {} bytes to vendor {} in {} ms",
                envelope.payload.len(),
                credential.vendor,
                started.elapsed().as_millis()
            );
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(DeliveryError::Status { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialRecord;
    use mockito::{Matcher, Server};
    use otlp_envelope::{ContentEncoding, ContentType};

    fn credential(endpoint: &str, auth: &str) -> VendorCredential {
        VendorCredential::from_record(
            "honeycomb",
            CredentialRecord {
                name: "honeycomb".to_string(),
                endpoint: endpoint.to_string(),
                auth: auth.to_string(),
            },
            Instant::now(),
            Duration::from_secs(300),
        )
        .unwrap()
    }

    fn client() -> CollectorClient {
        CollectorClient::new(reqwest::Client::new(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_posts_payload_with_merged_headers() {
        let mut server = Server::new_async().await;
        let envelope = SpanEnvelope::new(
            "checkout",
            ContentType::Protobuf,
            ContentEncoding::Gzip,
            &[],
        )
        .unwrap();
        let mock = server
            .mock("POST", "/v1/traces")
            .match_header("x-honeycomb-team", "abc123")
            .match_header("content-type", "application/x-protobuf")
            .match_header("content-encoding", "gzip")
            .match_body(Matcher::from(envelope.payload.to_vec()))
            .with_status(200)
            .create_async()
            .await;

        client()
            .deliver(
                &credential(&server.url(), "x-honeycomb-team=abc123"),
                &envelope,
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_identity_payload_has_no_encoding_header() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/traces")
            .match_header("content-type", "application/json")
            .match_header("content-encoding", Matcher::Missing)
            .match_header("authorization", "Bearer token")
            .with_status(202)
            .create_async()
            .await;
        let envelope = SpanEnvelope::new(
            "checkout",
            ContentType::Json,
            ContentEncoding::Identity,
            br#"{"resourceSpans":[]}"#,
        )
        .unwrap();

        client()
            .deliver(
                &credential(&server.url(), "Bearer token"),
                &envelope,
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejection_carries_status() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/traces")
            .with_status(401)
            .with_body("bad key")
            .create_async()
            .await;
        let envelope =
            SpanEnvelope::new("checkout", ContentType::Json, ContentEncoding::Identity, b"{}")
                .unwrap();

        let err = client()
            .deliver(
                &credential(&server.url(), ""),
                &envelope,
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert!(err.to_string().contains("bad key"));
    }

    #[tokio::test]
    async fn test_spent_budget_skips_the_call() {
        let envelope =
            SpanEnvelope::new("checkout", ContentType::Json, ContentEncoding::Identity, b"{}")
                .unwrap();
        let err = client()
            .deliver(
                &credential("http://127.0.0.1:9", ""),
                &envelope,
                Instant::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout));
    }
}
