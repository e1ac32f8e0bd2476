//! Event fan-out pipeline
//!
//! One inbound gateway event flows parse -> dedup-mark -> (200 to the
//! gateway) -> filter -> forward. The caller acknowledges the gateway before
//! calling `dispatch`, so delivery work never holds up the gateway's view of
//! our latency. Filtering works from a registry snapshot; registrations and
//! prunes that land mid-event do not affect it.

use crate::allowlist::AllowlistStore;
use crate::config::ForwardConfig;
use crate::dedup::DedupCache;
use crate::events::{EventKind, EventPayload, WebhookEnvelope};
use crate::registry::{Subscriber, SubscriberRegistry};
use anyhow::Context;
use hyper::body::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Deadline for a single forward attempt
const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("failed to parse webhook envelope: {0}")]
    Envelope(serde_json::Error),

    #[error("failed to parse {kind} payload: {source}")]
    Payload {
        kind: EventKind,
        source: serde_json::Error,
    },

    #[error("missing phone number in {0} payload")]
    MissingPhoneNumber(EventKind),
}

/// Outcome of the synchronous part of ingress handling
#[derive(Debug)]
pub enum Prepared {
    /// Already seen within the dedup window; acknowledge and stop
    Duplicate,
    /// Acknowledge, then dispatch
    Forward(ParsedEvent),
}

/// The routing-relevant fields of a parsed event
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub kind: EventKind,
    pub message_id: String,
    pub phone_number: String,
}

/// Shared fan-out pipeline state
pub struct FanoutEngine {
    registry: Arc<SubscriberRegistry>,
    allowlist: Arc<AllowlistStore>,
    dedup: Arc<DedupCache>,
    http: reqwest::Client,
    attempts: u32,
    retry_delay: Duration,
}

impl FanoutEngine {
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        allowlist: Arc<AllowlistStore>,
        dedup: Arc<DedupCache>,
        forward: &ForwardConfig,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()
            .context("failed to build forwarder HTTP client")?;

        Ok(Self {
            registry,
            allowlist,
            dedup,
            http,
            attempts: forward.attempts,
            retry_delay: forward.retry_delay(),
        })
    }

    /// Parse and dedup-mark one inbound body. Errors map to 400 at the edge;
    /// both Ok variants are acknowledged with 200.
    pub fn prepare(&self, kind: EventKind, body: &[u8]) -> Result<Prepared, IngressError> {
        let envelope: WebhookEnvelope =
            serde_json::from_slice(body).map_err(IngressError::Envelope)?;

        let payload = EventPayload::parse(kind, &envelope.payload)
            .map_err(|source| IngressError::Payload { kind, source })?;

        let base = payload.base();
        if base.phone_number.is_empty() {
            return Err(IngressError::MissingPhoneNumber(kind));
        }

        match &payload {
            EventPayload::Received(p) => info!(
                kind = %kind,
                from = %p.base.phone_number,
                message_id = %p.base.message_id,
                received_at = %p.received_at,
                "Webhook event"
            ),
            EventPayload::Sent(p) => info!(
                kind = %kind,
                to = %p.base.phone_number,
                message_id = %p.base.message_id,
                sent_at = %p.sent_at,
                "Webhook event"
            ),
            EventPayload::Delivered(p) => info!(
                kind = %kind,
                to = %p.base.phone_number,
                message_id = %p.base.message_id,
                delivered_at = %p.delivered_at,
                "Webhook event"
            ),
            EventPayload::Failed(p) => info!(
                kind = %kind,
                to = %p.base.phone_number,
                message_id = %p.base.message_id,
                failed_at = %p.failed_at,
                reason = %p.reason,
                "Webhook event"
            ),
        }

        // an empty message id cannot be deduplicated; let the event through
        if !base.message_id.is_empty() {
            let key = DedupCache::key(kind, &base.message_id);
            if self.dedup.seen_and_mark(&key) {
                info!(kind = %kind, message_id = %base.message_id, "Duplicate event, dropping");
                return Ok(Prepared::Duplicate);
            }
        }

        Ok(Prepared::Forward(ParsedEvent {
            kind,
            message_id: base.message_id.clone(),
            phone_number: base.phone_number.clone(),
        }))
    }

    /// Filter subscribers and forward the original body to each match.
    /// Waits for all forwarders of this event to finish.
    pub async fn dispatch(&self, event: &ParsedEvent, body: Bytes) {
        let ring = match self.allowlist.ring_of(&event.phone_number) {
            Some(ring) => ring,
            None => {
                info!(
                    kind = %event.kind,
                    phone_number = %event.phone_number,
                    "Sender not in allowlist, dropping event"
                );
                return;
            }
        };

        let targets: Vec<Subscriber> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|sub| sub.kinds.accepts(event.kind) && sub.ring == ring)
            .collect();

        if targets.is_empty() {
            debug!(kind = %event.kind, ring = %ring, "No matching subscribers");
            return;
        }

        let mut handles = Vec::with_capacity(targets.len());
        for sub in targets {
            let url = format!("{}/{}", sub.webhook_url, event.kind.short());
            handles.push(tokio::spawn(forward(
                self.http.clone(),
                sub.id,
                url,
                body.clone(),
                self.attempts,
                self.retry_delay,
            )));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Deliver one event to one subscriber with bounded retries. An attempt
/// succeeds iff the response status is 2xx; the wait between attempts is
/// fixed, no backoff.
async fn forward(
    http: reqwest::Client,
    subscriber_id: String,
    url: String,
    body: Bytes,
    attempts: u32,
    retry_delay: Duration,
) {
    for attempt in 1..=attempts {
        match http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.clone())
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!(
                    subscriber = %subscriber_id,
                    url = %url,
                    status = response.status().as_u16(),
                    attempt,
                    max_attempts = attempts,
                    "Forwarded event"
                );
                return;
            }
            Ok(response) => {
                warn!(
                    subscriber = %subscriber_id,
                    url = %url,
                    status = response.status().as_u16(),
                    attempt,
                    max_attempts = attempts,
                    "Subscriber rejected event"
                );
            }
            Err(e) => {
                warn!(
                    subscriber = %subscriber_id,
                    url = %url,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Failed to reach subscriber"
                );
            }
        }

        if attempt < attempts {
            tokio::time::sleep(retry_delay).await;
        }
    }
}
