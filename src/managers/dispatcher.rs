use crate::errors::FleetError;
use crate::managers::channel::{execute_unit, AbortSignal, ChannelConnector, ChannelGuard};
use crate::managers::report::{Report, ResultAggregator};
use crate::model::{ExecutionOutcome, ExecutionUnit, Target};
use crate::services::logger::Logger;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinError, JoinHandle};

/// Run-scoped cancellation signal. Clones observe the same signal.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Fans one execution unit out over many targets with a bounded pool.
///
/// Every target ends up with exactly one outcome in the report. Failures
/// on one target never touch another, and the call itself only fails on
/// bad arguments.
#[derive(Clone)]
pub struct FleetDispatcher {
    connector: Arc<dyn ChannelConnector>,
    logger: Logger,
}

struct RunShared {
    connector: Arc<dyn ChannelConnector>,
    unit: Arc<ExecutionUnit>,
    queue: Mutex<VecDeque<Target>>,
    aggregator: ResultAggregator,
    per_target_timeout: Duration,
    cancel: CancelToken,
    logger: Logger,
}

impl FleetDispatcher {
    pub fn new(connector: Arc<dyn ChannelConnector>, logger: Logger) -> Self {
        Self {
            connector,
            logger: logger.child("dispatch"),
        }
    }

    pub async fn dispatch(
        &self,
        targets: Vec<Target>,
        unit: ExecutionUnit,
        concurrency_limit: usize,
        per_target_timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Report, FleetError> {
        if concurrency_limit == 0 {
            return Err(FleetError::invalid_params(
                "concurrency limit must be at least 1",
            ));
        }
        if per_target_timeout.is_zero() {
            return Err(FleetError::invalid_params(
                "per-target timeout must be positive",
            ));
        }
        if targets.is_empty() {
            return Ok(Report::empty());
        }
        let mut names = BTreeSet::new();
        for target in &targets {
            if !names.insert(target.name.clone()) {
                return Err(FleetError::invalid_params(format!(
                    "target {} appears more than once",
                    target.name
                )));
            }
        }

        let workers = concurrency_limit.min(targets.len());
        self.logger.info(
            "dispatch started",
            Some(&serde_json::json!({
                "targets": targets.len(),
                "workers": workers,
                "kind": unit.kind(),
                "unit": unit.describe(),
                "connect_timeout_ms": per_target_timeout.as_millis() as u64,
            })),
        );

        let shared = Arc::new(RunShared {
            connector: self.connector.clone(),
            unit: Arc::new(unit),
            queue: Mutex::new(targets.into_iter().collect()),
            aggregator: ResultAggregator::new(),
            per_target_timeout,
            cancel: cancel.clone(),
            logger: self.logger.clone(),
        });

        let handles: Vec<_> = (0..workers)
            .map(|_| tokio::spawn(worker(shared.clone())))
            .collect();
        for joined in futures::future::join_all(handles).await {
            if let Err(err) = joined {
                self.logger.error(
                    "dispatch worker aborted",
                    Some(&serde_json::json!({ "error": err.to_string() })),
                );
            }
        }

        // A worker that died between taking a target and recording it
        // must not make the target vanish from the report.
        for name in &names {
            if !shared.aggregator.contains(name) {
                shared.aggregator.record(
                    name,
                    ExecutionOutcome::error("worker exited before recording an outcome"),
                );
            }
        }

        let report = shared.aggregator.report();
        let summary = report.summary();
        self.logger.info(
            "dispatch finished",
            Some(&serde_json::json!({
                "success": summary.success_count,
                "failure": summary.failure_count,
                "error": summary.error_count,
            })),
        );
        Ok(report)
    }
}

async fn worker(shared: Arc<RunShared>) {
    loop {
        let next = shared
            .queue
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .pop_front();
        let Some(target) = next else {
            break;
        };
        let name = target.name.clone();
        let outcome = if shared.cancel.is_cancelled() {
            ExecutionOutcome::error("cancelled before start")
        } else {
            run_target(&shared, target).await
        };
        shared.logger.debug(
            "target finished",
            Some(&serde_json::json!({ "target": name, "class": outcome.class() })),
        );
        shared.aggregator.record(&name, outcome);
    }
}

/// Runs one target on the blocking pool.
///
/// `per_target_timeout` bounds channel establishment only; once the
/// channel is up, execution is bounded by the channel's own call timeout.
/// On timeout or cancel the target's work is aborted, and the worker waits
/// for it to release its channel before taking another target, so the
/// number of open channels never exceeds the pool size.
async fn run_target(shared: &Arc<RunShared>, target: Target) -> ExecutionOutcome {
    let abort = AbortSignal::new();
    let (connected_tx, connected_rx) = oneshot::channel();
    let deadline = Instant::now() + shared.per_target_timeout;
    let mut handle = {
        let connector = shared.connector.clone();
        let unit = shared.unit.clone();
        let abort = abort.clone();
        tokio::task::spawn_blocking(move || {
            run_target_blocking(connector.as_ref(), &target, &unit, deadline, &abort, connected_tx)
        })
    };

    let stopped = tokio::select! {
        connected = tokio::time::timeout(shared.per_target_timeout, connected_rx) => match connected {
            // A dropped sender means the task died; the join below reports it.
            Ok(_) => None,
            Err(_) => Some(ExecutionOutcome::error(format!(
                "channel not ready, timed out after {}ms",
                shared.per_target_timeout.as_millis()
            ))),
        },
        _ = shared.cancel.cancelled() => Some(cancelled_outcome()),
    };
    if let Some(outcome) = stopped {
        return abandon(&abort, handle, outcome).await;
    }

    tokio::select! {
        joined = &mut handle => joined_outcome(joined),
        _ = shared.cancel.cancelled() => abandon(&abort, handle, cancelled_outcome()).await,
    }
}

fn cancelled_outcome() -> ExecutionOutcome {
    ExecutionOutcome::error("cancelled while in flight")
}

fn joined_outcome(joined: Result<ExecutionOutcome, JoinError>) -> ExecutionOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(err) => ExecutionOutcome::error(format!("target task failed: {}", err)),
    }
}

/// Aborts the target's work and waits until its channel is closed. The
/// caller's outcome wins over whatever the task produced.
async fn abandon(
    abort: &AbortSignal,
    handle: JoinHandle<ExecutionOutcome>,
    outcome: ExecutionOutcome,
) -> ExecutionOutcome {
    abort.abort();
    let _ = handle.await;
    outcome
}

fn run_target_blocking(
    connector: &dyn ChannelConnector,
    target: &Target,
    unit: &ExecutionUnit,
    deadline: Instant,
    abort: &AbortSignal,
    connected: oneshot::Sender<()>,
) -> ExecutionOutcome {
    let built = connector.connect(target, deadline, abort);
    let _ = connected.send(());
    let channel = match built {
        Ok(channel) => channel,
        Err(err) => return ExecutionOutcome::error(err.to_string()),
    };
    let mut guard = ChannelGuard::new(channel);
    if abort.is_aborted() {
        return ExecutionOutcome::error("abandoned after connect");
    }
    match execute_unit(guard.channel(), target, unit) {
        Ok(outcome) => outcome,
        Err(err) => ExecutionOutcome::error(err.to_string()),
    }
}
