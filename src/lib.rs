//! loadstorm -- concurrent HTTP/1.1 load generator.
//!
//! A fixed pool of workers drives requests against one or more targets
//! until a per-worker quota is reached, a wall-clock deadline elapses, or
//! the run is interrupted. Byte-level throughput is measured on the wire
//! and outcomes are classified as success (200..=226), network failure or
//! bad status. Failed responses can be captured to a JSON-lines file.

pub mod capture;
pub mod config;
pub mod controller;
pub mod report;
pub mod sources;
pub mod template;
pub mod transport;
pub mod worker;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::CaptureSink;
use crate::config::RunConfig;
use crate::controller::{InterruptSource, TerminationController, Trigger};
use crate::report::Summary;
use crate::template::RequestTemplate;
use crate::transport::{Connector, ThroughputCounters};
use crate::worker::{tally_slots, Worker, WorkerResult, WorkerShared};

/// Everything a finished (or interrupted) run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub summary: Summary,
    /// Per-worker counters, indexed by worker id.
    pub workers: Vec<WorkerResult>,
}

/// A configured load test, ready to run once.
pub struct LoadTest {
    run_id: Uuid,
    config: RunConfig,
    template: Arc<RequestTemplate>,
}

impl LoadTest {
    pub fn new(config: RunConfig, template: RequestTemplate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            config,
            template: Arc::new(template),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// A termination controller for this run's stop condition.
    pub fn controller(&self, source: InterruptSource) -> TerminationController {
        TerminationController::new(self.config.stop, source)
    }

    /// Drive the worker pool until `controller` or quota completion ends
    /// the run, then aggregate.
    ///
    /// Workers still running when the run ends are aborted; their counters
    /// are read as they stand.
    pub async fn run(self, mut controller: TerminationController) -> Result<RunOutcome> {
        ensure!(
            controller.stop_condition() == self.config.stop,
            "controller stops on {:?} but the run is configured for {:?}",
            controller.stop_condition(),
            self.config.stop
        );

        let capture = match self.config.capture_path() {
            Some(path) => Some(Arc::new(CaptureSink::open(path).await?)),
            None => None,
        };

        controller
            .arm()
            .context("failed to install interrupt handler")?;

        let counters = Arc::new(ThroughputCounters::new());
        let tallies = tally_slots(self.config.clients);
        let shared = WorkerShared {
            run_id: self.run_id,
            template: self.template.clone(),
            connector: Connector::new(counters.clone(), self.config.timeouts),
            tallies: tallies.clone(),
            capture,
            quota: self.config.stop.quota(),
        };

        info!(
            run_id = %self.run_id,
            clients = self.config.clients,
            targets = self.template.targets().len(),
            "Dispatching {} clients",
            self.config.clients
        );

        let start = Instant::now();
        let mut workers = JoinSet::new();
        for id in 0..self.config.clients {
            workers.spawn(Worker::new(id, shared.clone()).run());
        }

        let trigger = tokio::select! {
            _ = join_all(&mut workers) => Trigger::Completed,
            trigger = controller.wait() => trigger,
        };
        let elapsed = start.elapsed();
        debug!(?trigger, elapsed_ms = elapsed.as_millis() as u64, "run ended");

        // Workers only yield with a consistent tally, so once every task
        // has observed the abort the snapshot satisfies the outcome sum.
        workers.abort_all();
        join_all(&mut workers).await;
        let results: Vec<WorkerResult> = tallies.iter().map(|t| t.snapshot()).collect();
        let throughput = counters.snapshot();

        let summary = report::aggregate(self.run_id, trigger, &results, throughput, elapsed);

        Ok(RunOutcome {
            run_id: self.run_id,
            trigger,
            summary,
            workers: results,
        })
    }
}

async fn join_all(workers: &mut JoinSet<WorkerResult>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                warn!(error = %e, "worker panicked");
            }
        }
    }
}
