// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use otlp_envelope::SpanEnvelope;

/// Picks the destination vendor of each envelope: its own `vendor` tag, or
/// the deployment's default vendor when untagged.
#[derive(Clone, Debug)]
pub struct Router {
    default_vendor: String,
}

impl Router {
    pub fn new(default_vendor: impl Into<String>) -> Self {
        Router {
            default_vendor: default_vendor.into(),
        }
    }

    pub fn vendor_for<'a>(&'a self, envelope: &'a SpanEnvelope) -> &'a str {
        envelope.vendor_tag().unwrap_or(&self.default_vendor)
    }

    /// Tags every envelope with its resolved vendor.
    pub fn resolve(&self, envelopes: Vec<SpanEnvelope>) -> Vec<SpanEnvelope> {
        envelopes
            .into_iter()
            .map(|envelope| {
                let vendor = self.vendor_for(&envelope).to_string();
                envelope.with_vendor(vendor)
            })
            .collect()
    }
}
