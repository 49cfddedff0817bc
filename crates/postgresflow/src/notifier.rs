//! Notifier (spec §4.4): a dedicated connection issuing `LISTEN <channel>`,
//! fanning out parsed payloads to in-process subscribers. Built on
//! `sqlx::postgres::PgListener`, matching the pack's convention for this
//! exact pattern (`other_examples/…thalamiq-zunder…postgres.rs`).

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// The two payload shapes the core recognizes (spec §4.4); anything else
/// is ignored by subscribers, not rejected by the Notifier itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAvailablePayload {
    pub queue_name: String,
    pub scheduled_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone)]
pub enum NotifierMessage {
    JobAvailable(JobAvailablePayload),
    /// A payload that parsed as JSON but didn't match a recognized shape
    /// (e.g. a UI lifecycle event) — forwarded so a dashboard-style
    /// subscriber could use it; the core's own subscribers (the Poller)
    /// ignore it.
    Unrecognized(serde_json::Value),
}

#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<NotifierMessage>,
}

impl Notifier {
    pub fn subscribe(&self) -> broadcast::Receiver<NotifierMessage> {
        self.sender.subscribe()
    }

    /// Spawns the listener loop on its own connection and returns a
    /// handle whose only public surface is `subscribe`. Reconnects with
    /// exponential backoff on any connection loss, re-issuing `LISTEN`
    /// automatically (spec §4.1's "lost LISTEN state is re-established on
    /// reconnect").
    pub fn spawn(pool: PgPool, channel: String, keepalive_interval: Duration, cancel: CancellationToken) -> Self {
        let (sender, _) = broadcast::channel(1024);
        let task_sender = sender.clone();

        tokio::spawn(async move {
            let mut backoff = Duration::from_millis(500);
            const MAX_BACKOFF: Duration = Duration::from_secs(30);

            loop {
                if cancel.is_cancelled() {
                    return;
                }
                match run_once(&pool, &channel, keepalive_interval, &task_sender, &cancel).await {
                    Ok(()) => return, // cancelled cleanly
                    Err(err) => {
                        tracing::warn!(
                            target: "pgflow::notifier",
                            error = %err,
                            backoff_ms = backoff.as_millis() as u64,
                            "notifier disconnected, reconnecting"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => return,
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        });

        Self { sender }
    }
}

async fn run_once(
    pool: &PgPool,
    channel: &str,
    keepalive_interval: Duration,
    sender: &broadcast::Sender<NotifierMessage>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(channel).await?;
    tracing::info!(target: "pgflow::notifier", channel, "listening");

    let mut keepalive = tokio::time::interval(keepalive_interval);
    keepalive.tick().await; // first tick fires immediately; discard it

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = keepalive.tick() => {
                // A lightweight round-trip to detect a stuck connection
                // before it's needed for a real notification.
                sqlx::query("SELECT 1").execute(&mut *listener).await?;
            }
            notification = listener.recv() => {
                let notification = notification?;
                let payload = notification.payload();
                let message = parse_payload(payload);
                // Non-blocking: `send` never awaits, so a slow subscriber
                // lags (drops old messages) instead of stalling this loop.
                let _ = sender.send(message);
            }
        }
    }
}

fn parse_payload(payload: &str) -> NotifierMessage {
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value) => {
            if value.get("queue_name").and_then(|v| v.as_str()).is_some() {
                match serde_json::from_value::<JobAvailablePayload>(value.clone()) {
                    Ok(parsed) => NotifierMessage::JobAvailable(parsed),
                    Err(_) => NotifierMessage::Unrecognized(value),
                }
            } else {
                NotifierMessage::Unrecognized(value)
            }
        }
        Err(_) => NotifierMessage::Unrecognized(serde_json::Value::String(payload.to_string())),
    }
}

/// Builds the NOTIFY payload for an enqueued job (spec §4.4: "MUST at
/// minimum carry `queue_name`").
pub fn job_available_payload(queue_name: &str, scheduled_at: Option<chrono::DateTime<chrono::Utc>>) -> serde_json::Value {
    serde_json::json!({ "queue_name": queue_name, "scheduled_at": scheduled_at })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_available_payload() {
        let raw = r#"{"queue_name": "mailers", "scheduled_at": null}"#;
        match parse_payload(raw) {
            NotifierMessage::JobAvailable(p) => assert_eq!(p.queue_name, "mailers"),
            _ => panic!("expected JobAvailable"),
        }
    }

    #[test]
    fn unrecognized_payload_does_not_error() {
        let raw = r#"{"event": "job_finished", "job_id": "abc"}"#;
        match parse_payload(raw) {
            NotifierMessage::Unrecognized(_) => {}
            _ => panic!("expected Unrecognized"),
        }
    }
}
