//! Pending operator decisions.
//!
//! A caller opens a request and waits a bounded time for an answer. Any
//! number of responders may see the request through [`DecisionBroker::subscribe`];
//! the first answer wins and every later one, including answers arriving
//! after the deadline, is rejected.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Buffered notices per subscriber before old ones are dropped.
const NOTICE_CAPACITY: usize = 64;

/// A request waiting for an answer.
#[derive(Debug, Clone)]
pub struct PendingDecision<R> {
    pub request_id: String,
    pub summary: String,
    pub choices: Vec<R>,
    pub default: R,
    pub timeout: Duration,
}

/// How a request was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision<R> {
    pub request_id: String,
    pub value: R,
    /// `true` when nobody answered in time and `value` is the default.
    pub timed_out: bool,
}

/// First-response-wins decision exchange.
pub struct DecisionBroker<R> {
    pending: Mutex<HashMap<String, oneshot::Sender<R>>>,
    notices: broadcast::Sender<PendingDecision<R>>,
}

impl<R> Default for DecisionBroker<R>
where
    R: Clone + fmt::Display + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<R> DecisionBroker<R>
where
    R: Clone + fmt::Display + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            pending: Mutex::new(HashMap::new()),
            notices,
        }
    }

    /// Receive every request opened from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PendingDecision<R>> {
        self.notices.subscribe()
    }

    /// Open a request and wait up to `timeout` for an answer.
    pub async fn request(
        &self,
        summary: impl Into<String>,
        choices: Vec<R>,
        default: R,
        timeout: Duration,
    ) -> Decision<R> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        let notice = PendingDecision {
            request_id: request_id.clone(),
            summary: summary.into(),
            choices,
            default: default.clone(),
            timeout,
        };
        if self.notices.send(notice).is_err() {
            debug!(request_id, "No decision responders subscribed");
        }

        let answer = tokio::time::timeout(timeout, rx).await;
        // Late answers find nothing to resolve.
        self.pending.lock().await.remove(&request_id);

        match answer {
            Ok(Ok(value)) => {
                info!(request_id, %value, "Operator decision received");
                Decision {
                    request_id,
                    value,
                    timed_out: false,
                }
            }
            _ => {
                let err = EngineError::DecisionTimeout {
                    request_id: request_id.clone(),
                };
                warn!(error = %err, default = %default, "Applying default decision");
                Decision {
                    request_id,
                    value: default,
                    timed_out: true,
                }
            }
        }
    }

    /// Answer a request. Returns `false` if it is unknown, already answered
    /// or expired.
    pub async fn respond(&self, request_id: &str, value: R) -> bool {
        let Some(tx) = self.pending.lock().await.remove(request_id) else {
            debug!(request_id, "Rejected answer for unknown or resolved request");
            return false;
        };
        tx.send(value).is_ok()
    }

    pub async fn pending_ids(&self) -> Vec<String> {
        self.pending.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use conductor_core::RecoveryAction;
    use std::sync::Arc;

    fn broker() -> Arc<DecisionBroker<RecoveryAction>> {
        Arc::new(DecisionBroker::new())
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_to_default() {
        let broker = broker();
        let started = tokio::time::Instant::now();

        let decision = broker
            .request("agent stuck", RecoveryAction::ALL.to_vec(), RecoveryAction::Continue, Duration::from_secs(30))
            .await;

        assert!(decision.timed_out);
        assert_eq!(decision.value, RecoveryAction::Continue);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(broker.pending_ids().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn first_response_wins() {
        let broker = broker();
        let mut notices = broker.subscribe();

        let responder = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                let notice = notices.recv().await.unwrap();
                assert_eq!(notice.summary, "agent stuck");
                assert_eq!(notice.default, RecoveryAction::Continue);
                let first = broker.respond(&notice.request_id, RecoveryAction::Restart).await;
                let second = broker.respond(&notice.request_id, RecoveryAction::Kill).await;
                (first, second)
            })
        };

        let decision = broker
            .request("agent stuck", RecoveryAction::ALL.to_vec(), RecoveryAction::Continue, Duration::from_secs(30))
            .await;

        assert!(!decision.timed_out);
        assert_eq!(decision.value, RecoveryAction::Restart);
        assert_eq!(responder.await.unwrap(), (true, false));
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_is_rejected() {
        let broker = broker();
        let mut notices = broker.subscribe();

        let decision = broker
            .request("memory", vec![RecoveryAction::Kill], RecoveryAction::Continue, Duration::from_secs(1))
            .await;
        assert!(decision.timed_out);

        let notice = notices.recv().await.unwrap();
        assert!(!broker.respond(&notice.request_id, RecoveryAction::Kill).await);
    }

    #[tokio::test]
    async fn unknown_request_is_rejected() {
        assert!(!broker().respond("nope", RecoveryAction::Debug).await);
    }
}
