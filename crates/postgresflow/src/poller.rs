//! Poller (spec §4.5): a periodic waker for the Scheduler. Polling
//! happens only on the timer tick or a matching Notifier payload — never
//! on any other trigger, per spec's stated core invariant.

use crate::notifier::{Notifier, NotifierMessage};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Compiled form of the `queues` configuration string (spec §4.5
/// grammar): comma-separated, `*` matches any, `-name` excludes, bare
/// `name` includes. An ordered (non-wildcard) list also implies
/// queue-rank ordering at dequeue time.
#[derive(Debug, Clone)]
pub struct QueueFilter {
    pub include_all: bool,
    pub included: Vec<String>,
    pub excluded: Vec<String>,
}

impl QueueFilter {
    pub fn parse(spec: &str) -> Self {
        let mut include_all = false;
        let mut included = Vec::new();
        let mut excluded = Vec::new();

        for raw in spec.split(',') {
            let item = raw.trim();
            if item.is_empty() {
                continue;
            }
            if item == "*" {
                include_all = true;
            } else if let Some(name) = item.strip_prefix('-') {
                excluded.push(name.trim().to_string());
            } else {
                included.push(item.to_string());
            }
        }

        Self {
            include_all,
            included,
            excluded,
        }
    }

    pub fn matches(&self, queue_name: &str) -> bool {
        if self.excluded.iter().any(|q| q == queue_name) {
            return false;
        }
        if self.include_all {
            return true;
        }
        if self.included.is_empty() {
            // No explicit includes and no wildcard: matches everything
            // not explicitly excluded, same as an all-exclusions filter.
            return true;
        }
        self.included.iter().any(|q| q == queue_name)
    }

    /// Queue-rank map for [`crate::jobs::repo::DequeueOrdering`], present
    /// only when the operator gave an explicit ordered, non-wildcard
    /// list (spec §4.5: "an ordered list implies queue-rank ordering").
    pub fn queue_ranks(&self) -> Option<std::collections::HashMap<String, i32>> {
        if self.include_all || self.included.is_empty() {
            return None;
        }
        Some(
            self.included
                .iter()
                .enumerate()
                .map(|(rank, name)| (name.clone(), rank as i32))
                .collect(),
        )
    }

    /// The explicit include list, for queries that need a concrete `IN
    /// (...)` filter. `None` when the filter matches all queues.
    pub fn explicit_includes(&self) -> Option<Vec<String>> {
        if self.include_all || self.included.is_empty() {
            None
        } else {
            Some(self.included.clone())
        }
    }
}

/// Signal the Poller sends to wake a Scheduler worker loop. Carries no
/// payload — a wakeup just means "go look for candidates again".
#[derive(Debug, Clone, Copy)]
pub struct Wakeup;

pub struct Poller {
    wakeup_tx: mpsc::Sender<Wakeup>,
}

impl Poller {
    /// Spawns the timer + notification-subscription loop. The first timer
    /// tick fires after one `poll_interval`, not immediately (spec §4.5).
    pub fn spawn(
        notifier: &Notifier,
        filter: QueueFilter,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Wakeup>) {
        let (wakeup_tx, wakeup_rx) = mpsc::channel(64);
        let mut notifications = notifier.subscribe();
        let task_tx = wakeup_tx.clone();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(poll_interval);
            timer.tick().await; // consume the immediate first tick

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = timer.tick() => {
                        let _ = task_tx.send(Wakeup).await;
                    }
                    message = notifications.recv() => {
                        match message {
                            Ok(NotifierMessage::JobAvailable(payload)) => {
                                if filter.matches(&payload.queue_name) {
                                    let _ = task_tx.send(Wakeup).await;
                                }
                            }
                            Ok(NotifierMessage::Unrecognized(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                                // Dropped messages under load; the next timer
                                // tick is the backstop (spec §4.5/§5).
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        }
                    }
                }
            }
        });

        (Self { wakeup_tx }, wakeup_rx)
    }

    /// Lets a caller add another recipient at runtime (spec §4.5
    /// "Recipients may be added/removed at runtime") by cloning the
    /// sender half.
    pub fn sender(&self) -> mpsc::Sender<Wakeup> {
        self.wakeup_tx.clone()
    }
}
