//! Periodic collection scheduling
//!
//! Each enabled object type gets its own task that sleeps until the type is
//! due, runs one collection, reports the run to the health channel and goes
//! back to sleep for its interval. Tasks share nothing but the collector, so
//! a slow or failing object type never delays another.

use crate::checkpoint::Checkpoint;
use crate::collector::{CollectionRun, Collector};
use crate::error::{IngestError, Result};
use crate::health::HealthReporter;
use crate::object_types::{ObjectTypeRegistry, ObjectTypeSpec};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Completed runs buffered between collection tasks and the health reporter.
const RUN_CHANNEL_CAPACITY: usize = 64;

/// Time left until `spec` is due, given when it last ran.
pub fn due_in(spec: &ObjectTypeSpec, checkpoint: &Checkpoint, now: DateTime<Utc>) -> Duration {
    let Some(last) = checkpoint.last_run_time else {
        return Duration::ZERO;
    };
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    spec.interval.saturating_sub(elapsed)
}

struct Shared {
    collector: Arc<Collector>,
    health: Arc<HealthReporter>,
    limiter: Option<Arc<Semaphore>>,
}

impl Shared {
    /// Wait for a concurrency slot, or `None` if cancelled first.
    async fn permit(&self, cancel: &CancellationToken) -> Option<Option<OwnedSemaphorePermit>> {
        let Some(ref limiter) = self.limiter else {
            return Some(None);
        };
        tokio::select! {
            _ = cancel.cancelled() => None,
            permit = Arc::clone(limiter).acquire_owned() => permit.ok().map(Some),
        }
    }
}

/// Owns one task per enabled object type.
pub struct Scheduler {
    registry: ObjectTypeRegistry,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: BTreeMap<String, JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// `max_concurrent_runs == 0` leaves concurrency unbounded.
    pub fn new(
        registry: ObjectTypeRegistry,
        collector: Arc<Collector>,
        health: Arc<HealthReporter>,
        max_concurrent_runs: usize,
    ) -> Self {
        for spec in registry.all() {
            health.register(&spec.name, spec.sourcetype, spec.enabled);
        }
        let limiter = (max_concurrent_runs > 0).then(|| Arc::new(Semaphore::new(max_concurrent_runs)));

        Self {
            registry,
            shared: Arc::new(Shared {
                collector,
                health,
                limiter,
            }),
            cancel: CancellationToken::new(),
            tasks: BTreeMap::new(),
            reporter: None,
        }
    }

    /// Names of the object types with a running task.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Spawn the health consumer and one task per enabled object type.
    pub async fn start(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            return Err(IngestError::config("scheduler already started"));
        }

        // every fallible read happens before anything is spawned
        let now = Utc::now();
        let mut first_runs = Vec::new();
        for spec in self.registry.enabled() {
            let checkpoint = self.shared.collector.checkpoints().get(&spec.name).await?;
            first_runs.push((spec, due_in(spec, &checkpoint, now)));
        }

        let (runs_tx, runs_rx) = mpsc::channel(RUN_CHANNEL_CAPACITY);
        self.reporter = Some(tokio::spawn(
            Arc::clone(&self.shared.health).consume(runs_rx),
        ));

        for (spec, delay) in first_runs {
            debug!(object_type = %spec.name, ?delay, "Scheduling first run");
            let handle = tokio::spawn(object_loop(
                Arc::clone(spec),
                Arc::clone(&self.shared),
                self.cancel.child_token(),
                runs_tx.clone(),
                delay,
            ));
            self.tasks.insert(spec.name.clone(), handle);
        }

        info!(
            object_types = self.tasks.len(),
            disabled = self.registry.len() - self.tasks.len(),
            "Scheduler started"
        );
        Ok(())
    }

    /// Cancel all tasks at their next page boundary and wait for them.
    pub async fn shutdown(mut self) {
        info!("Stopping collection tasks");
        self.cancel.cancel();

        for (name, handle) in std::mem::take(&mut self.tasks) {
            if let Err(e) = handle.await {
                warn!(object_type = %name, error = %e, "Collection task ended abnormally");
            }
        }

        // every sender lived in a task, so the reporter drains and exits
        if let Some(reporter) = self.reporter.take() {
            if let Err(e) = reporter.await {
                warn!(error = %e, "Health reporter ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }

    /// One pass over the selected object types, concurrently, then return.
    ///
    /// With an empty `only` every enabled type is considered. Types that are
    /// not yet due are skipped unless `force` is set.
    pub async fn run_once_all(&self, force: bool, only: &[String]) -> Result<Vec<CollectionRun>> {
        let selected: Vec<Arc<ObjectTypeSpec>> = if only.is_empty() {
            self.registry.enabled().cloned().collect()
        } else {
            only.iter()
                .map(|name| {
                    self.registry
                        .get(name)
                        .cloned()
                        .ok_or_else(|| IngestError::UnknownObjectType(name.clone()))
                })
                .collect::<Result<_>>()?
        };

        let now = Utc::now();
        let mut due = Vec::with_capacity(selected.len());
        for spec in selected {
            let checkpoint = self.shared.collector.checkpoints().get(&spec.name).await?;
            let wait = due_in(&spec, &checkpoint, now);
            if force || wait.is_zero() {
                due.push(spec);
            } else {
                debug!(object_type = %spec.name, ?wait, "Not due yet, skipping");
            }
        }

        info!(object_types = due.len(), force, "Running one collection pass");

        let runs = join_all(due.iter().map(|spec| {
            let shared = Arc::clone(&self.shared);
            let cancel = self.cancel.child_token();
            async move {
                let _permit = shared.permit(&cancel).await;
                shared.health.mark_running(&spec.name);
                let run = shared.collector.run(spec, &cancel).await;
                shared.health.observe(&run).await;
                run
            }
        }))
        .await;

        Ok(runs)
    }
}

async fn object_loop(
    spec: Arc<ObjectTypeSpec>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    runs: mpsc::Sender<CollectionRun>,
    mut delay: Duration,
) {
    loop {
        if let Ok(wait) = chrono::Duration::from_std(delay) {
            shared.health.set_next_due(&spec.name, Utc::now() + wait);
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {},
        }

        let Some(permit) = shared.permit(&cancel).await else {
            break;
        };

        shared.health.mark_running(&spec.name);
        let run = shared.collector.run(&spec, &cancel).await;
        drop(permit);

        if runs.send(run).await.is_err() {
            warn!(object_type = %spec.name, "Health channel closed");
            break;
        }
        if cancel.is_cancelled() {
            break;
        }
        delay = spec.interval;
    }
    debug!(object_type = %spec.name, "Collection task stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_due_in_from_last_run() {
        let registry = ObjectTypeRegistry::builtin();
        let alerts = registry.get("alerts").unwrap();
        let now = Utc::now();

        let never = Checkpoint::new("alerts");
        assert_eq!(due_in(alerts, &never, now), Duration::ZERO);

        let mut recent = Checkpoint::new("alerts");
        recent.last_run_time = Some(now - chrono::Duration::minutes(20));
        assert_eq!(due_in(alerts, &recent, now), Duration::from_secs(40 * 60));

        let mut stale = Checkpoint::new("alerts");
        stale.last_run_time = Some(now - chrono::Duration::hours(3));
        assert_eq!(due_in(alerts, &stale, now), Duration::ZERO);

        // clock moved backwards
        let mut future = Checkpoint::new("alerts");
        future.last_run_time = Some(now + chrono::Duration::minutes(5));
        assert_eq!(due_in(alerts, &future, now), alerts.interval);
    }
}
