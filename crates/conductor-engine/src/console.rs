//! Terminal prompts answering pending operator decisions.

use std::fmt::Display;
use std::sync::Arc;

use dialoguer::Select;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::health::{DecisionBroker, InterruptController, PendingDecision};

/// Prompt on the terminal for every recovery and conflict decision.
///
/// Requests are answered one at a time. An answer given after the decision
/// timed out is discarded by the broker.
pub fn spawn_console_responder(interrupts: Arc<InterruptController>) -> JoinHandle<()> {
    let mut actions = interrupts.actions().subscribe();
    let mut conflicts = interrupts.conflicts().subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                notice = actions.recv() => match notice {
                    Ok(pending) => answer(interrupts.actions(), pending).await,
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed recovery decisions"),
                    Err(RecvError::Closed) => break,
                },
                notice = conflicts.recv() => match notice {
                    Ok(pending) => answer(interrupts.conflicts(), pending).await,
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed conflict decisions"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    })
}

async fn answer<R>(broker: &DecisionBroker<R>, pending: PendingDecision<R>)
where
    R: Clone + Display + PartialEq + Send + Sync + 'static,
{
    let items: Vec<String> = pending.choices.iter().map(ToString::to_string).collect();
    let default = pending
        .choices
        .iter()
        .position(|c| *c == pending.default)
        .unwrap_or(0);
    let prompt = format!(
        "{} [default {} in {}s]",
        pending.summary,
        pending.default,
        pending.timeout.as_secs()
    );

    let picked = tokio::task::spawn_blocking(move || {
        Select::new()
            .with_prompt(prompt)
            .items(&items)
            .default(default)
            .interact_opt()
    })
    .await;

    let index = match picked {
        Ok(Ok(Some(index))) => index,
        Ok(Ok(None)) => {
            debug!(request_id = %pending.request_id, "Prompt dismissed, default will apply");
            return;
        }
        Ok(Err(e)) => {
            warn!(request_id = %pending.request_id, error = %e, "Operator prompt failed");
            return;
        }
        Err(e) => {
            warn!(request_id = %pending.request_id, error = %e, "Operator prompt task failed");
            return;
        }
    };
    let Some(value) = pending.choices.get(index).cloned() else {
        return;
    };
    if !broker.respond(&pending.request_id, value).await {
        warn!(request_id = %pending.request_id, "Answer arrived too late, default was applied");
    }
}
