//! State transition events.

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::request::{CertificateRequest, RequestId, RequestState};

/// Log target transition events are written to, one JSON object per line.
pub const EVENT_LOG_TARGET: &str = "certctl::events";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    pub request_id: RequestId,
    pub issuer: String,
    pub domains: Vec<String>,
    pub from: RequestState,
    pub to: RequestState,
    /// Error code and message when the transition was caused by a failure.
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl TransitionEvent {
    pub fn new(req: &CertificateRequest, from: RequestState, at: OffsetDateTime) -> Self {
        TransitionEvent {
            request_id: req.id,
            issuer: req.issuer.clone(),
            domains: req.domains.to_vec(),
            from,
            to: req.state,
            error: (req.state == RequestState::Failed)
                .then(|| req.last_error.as_ref())
                .flatten()
                .map(|err| format!("{}: {err}", err.code())),
            at,
        }
    }
}

/// Fans events out to subscribers and the event log.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TransitionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: TransitionEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => log::info!(target: EVENT_LOG_TARGET, "{json}"),
            Err(err) => log::warn!(target: EVENT_LOG_TARGET, "cannot serialize event: {err}"),
        }

        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
