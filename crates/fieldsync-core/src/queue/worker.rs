//! Background dispatch pool
//!
//! Keeps up to `concurrency` dispatches in flight and refills a slot as soon
//! as one finishes. Abandoned leases are reclaimed on start and then every
//! half lease, so an attempt lost to a storage error or a panicked task
//! becomes eligible again without a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tokio::task::{Id, JoinSet};

use super::{DispatchOutcome, DispatchQueue};

const MIN_RECOVERY_INTERVAL: Duration = Duration::from_millis(10);

/// Background worker that polls the queue and dispatches ready entries.
pub struct DispatchWorker {
    queue: Arc<DispatchQueue>,
    work_available: Arc<Notify>,
    poll_interval: Duration,
    recovery_interval: Duration,
    concurrency: usize,
}

/// Dispatch tasks currently running, keyed by task id
struct InFlight {
    tasks: JoinSet<crate::Result<DispatchOutcome>>,
    entries: HashMap<Id, String>,
}

impl InFlight {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            entries: HashMap::new(),
        }
    }

    fn contains(&self, entry_id: &str) -> bool {
        self.entries.values().any(|id| id == entry_id)
    }

    fn spawn(&mut self, queue: &Arc<DispatchQueue>, entry_id: String) {
        let queue = Arc::clone(queue);
        let task_entry = entry_id.clone();
        let handle = self
            .tasks
            .spawn(async move { queue.dispatch(&task_entry).await });
        self.entries.insert(handle.id(), entry_id);
    }

    /// Wait for the next task; `None` when nothing is running.
    async fn join_next(&mut self) -> Option<DispatchOutcome> {
        let joined = self.tasks.join_next_with_id().await?;
        match joined {
            Ok((task_id, Ok(outcome))) => {
                self.entries.remove(&task_id);
                Some(outcome)
            }
            Ok((task_id, Err(err))) => {
                let entry_id = self.entries.remove(&task_id).unwrap_or_default();
                tracing::error!(entry_id = %entry_id, error = %err, "Analysis dispatch failed");
                None
            }
            Err(err) => {
                let entry_id = self.entries.remove(&err.id()).unwrap_or_default();
                tracing::error!(entry_id = %entry_id, error = %err, "Analysis dispatch task panicked");
                None
            }
        }
    }
}

impl DispatchWorker {
    pub fn new(queue: Arc<DispatchQueue>, work_available: Arc<Notify>) -> Self {
        let config = queue.config();
        let poll_interval = config.poll_interval;
        let recovery_interval = (config.lease_timeout / 2).max(MIN_RECOVERY_INTERVAL);
        let concurrency = config.concurrency.max(1);
        Self {
            queue,
            work_available,
            poll_interval,
            recovery_interval,
            concurrency,
        }
    }

    /// Run until a shutdown signal is received.
    ///
    /// Dispatches already in flight run to completion before this returns.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        tracing::info!(
            concurrency = self.concurrency,
            poll_ms = u64::try_from(self.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "Analysis worker started"
        );

        let mut in_flight = InFlight::new();
        let mut recovery = tokio::time::interval(self.recovery_interval);
        recovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            self.fill(&mut in_flight).await;

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Analysis worker shutting down");
                    break;
                }
                _ = recovery.tick() => self.recover().await,
                _ = in_flight.join_next(), if !in_flight.tasks.is_empty() => {}
                () = self.work_available.notified() => {}
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        while !in_flight.tasks.is_empty() {
            in_flight.join_next().await;
        }
    }

    /// Start dispatches for ready entries until every slot is busy.
    async fn fill(&self, in_flight: &mut InFlight) {
        let free = self.concurrency.saturating_sub(in_flight.tasks.len());
        if free == 0 {
            return;
        }

        // Entries spawned but not yet claimed still read as ready.
        let ready = match self.queue.ready(free + in_flight.tasks.len()).await {
            Ok(ready) => ready,
            Err(err) => {
                tracing::error!(error = %err, "Analysis queue poll failed");
                return;
            }
        };
        let to_spawn: Vec<String> = ready
            .into_iter()
            .filter(|entry_id| !in_flight.contains(entry_id))
            .take(free)
            .collect();
        for entry_id in to_spawn {
            in_flight.spawn(&self.queue, entry_id);
        }
    }

    async fn recover(&self) {
        if let Err(err) = self.queue.recover().await {
            tracing::error!(error = %err, "Analysis lease recovery failed");
        }
    }
}
