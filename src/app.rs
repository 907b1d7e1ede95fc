//! Pipeline supervisor
//!
//! Wires the publisher, the consumption loops and the HTTP listener to one
//! shared [`CancellationToken`]. The token fires on an operator signal, on
//! a fatal broker error in any loop, or when the listener fails; every
//! task is then given a bounded grace period to stop before the
//! supervisor gives up on it.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::config::Config;
use crate::error::{Result, VisitstreamError};
use crate::http;
use crate::pipeline::{
    CommitMode, ConsumeError, ConsumptionLoop, DayReporter, EventHandler, InsertVisitHandler,
    LoopSummary,
};
use crate::publisher::Publisher;
use crate::service::VisitService;
use crate::storage::VisitStore;

/// Final state of one consumption loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopReport {
    pub group_id: String,
    pub summary: LoopSummary,
}

/// What the supervisor observed while shutting down.
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// Loops that stopped cleanly.
    pub loops: Vec<LoopReport>,
    /// Failures of loops or the listener, in the order they were joined.
    pub failures: Vec<String>,
    /// True if some task did not stop within the grace period.
    pub timed_out: bool,
}

impl PipelineReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.timed_out
    }
}

enum TaskOutcome {
    Loop {
        group_id: String,
        result: std::result::Result<LoopSummary, ConsumeError>,
    },
    Listener(std::result::Result<(), VisitstreamError>),
}

/// Owns every long-lived task of a running pipeline.
pub struct Supervisor {
    config: Config,
    broker: Arc<dyn Broker>,
    store: Arc<dyn VisitStore>,
    reporter: Arc<DayReporter>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(config: Config, broker: Arc<dyn Broker>, store: Arc<dyn VisitStore>) -> Self {
        Self {
            config,
            broker,
            store,
            reporter: Arc::new(DayReporter::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the whole pipeline when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Callback of the report loop, for inspecting its tally.
    pub fn reporter(&self) -> Arc<DayReporter> {
        Arc::clone(&self.reporter)
    }

    /// Starts every task, waits for cancellation, then joins them.
    ///
    /// `addr` is bound by the listener task; a bind failure cancels the
    /// pipeline like any other listener failure.
    ///
    /// # Errors
    ///
    /// Returns `VisitstreamError::Broker` if a producer or consumer handle
    /// cannot be created. Task failures after startup are collected in the
    /// returned [`PipelineReport`].
    pub async fn run(self, addr: SocketAddr) -> Result<PipelineReport> {
        let kafka = &self.config.kafka;
        let mut tasks = JoinSet::new();

        if let Err(e) = self.spawn_loops(&mut tasks) {
            self.cancel.cancel();
            return Err(e);
        }

        let producer = match self.broker.producer() {
            Ok(producer) => producer,
            Err(e) => {
                self.cancel.cancel();
                return Err(VisitstreamError::Broker(e.to_string()).into());
            }
        };
        let publisher = Arc::new(Publisher::new(producer, kafka.topic.clone()));
        let service = VisitService::new(publisher, Arc::clone(&self.store));

        let router = http::router(service, self.config.http.request_timeout());
        let cancel = self.cancel.clone();
        tasks.spawn(async move {
            let result = match http::bind(addr).await {
                Ok(listener) => http::serve(listener, router, cancel.clone()).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                error!(error = %e, "HTTP listener failed, cancelling pipeline");
                cancel.cancel();
            }
            TaskOutcome::Listener(result)
        });

        info!(
            topic = %kafka.topic,
            insert_workers = kafka.insert_workers,
            addr = %addr,
            "Pipeline running"
        );

        self.cancel.cancelled().await;

        let grace = self.config.shutdown_grace();
        info!(grace_secs = grace.as_secs(), "Shutting down");

        let mut report = PipelineReport::default();
        let joined = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(TaskOutcome::Loop {
                        group_id,
                        result: Ok(summary),
                    }) => report.loops.push(LoopReport { group_id, summary }),
                    Ok(TaskOutcome::Loop {
                        group_id,
                        result: Err(e),
                    }) => report.failures.push(format!("{}: {}", group_id, e)),
                    Ok(TaskOutcome::Listener(Ok(()))) => {}
                    Ok(TaskOutcome::Listener(Err(e))) => report.failures.push(e.to_string()),
                    Err(e) => report.failures.push(format!("task aborted: {}", e)),
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!(
                remaining = tasks.len(),
                "Grace period elapsed, abandoning remaining tasks"
            );
            report.timed_out = true;
            tasks.abort_all();
        }

        for LoopReport { group_id, summary } in &report.loops {
            info!(
                group_id = %group_id,
                dispatched = summary.dispatched,
                decode_failures = summary.decode_failures,
                handler_failures = summary.handler_failures,
                commits = summary.commits,
                commit_failures = summary.commit_failures,
                "Loop summary"
            );
        }
        for failure in &report.failures {
            error!(failure = %failure, "Pipeline task failed");
        }

        Ok(report)
    }

    fn spawn_loops(&self, tasks: &mut JoinSet<TaskOutcome>) -> Result<()> {
        let kafka = &self.config.kafka;
        let insert_handler: Arc<dyn EventHandler> =
            Arc::new(InsertVisitHandler::new(Arc::clone(&self.store)));

        for _ in 0..kafka.insert_workers {
            let consumption =
                ConsumptionLoop::new(&kafka.topic, &kafka.insert_group_id, CommitMode::Auto)
                    .with_poll_timeout(kafka.poll_timeout());
            self.spawn_loop(tasks, consumption, Arc::clone(&insert_handler))?;
        }

        let consumption = ConsumptionLoop::new(
            &kafka.topic,
            &kafka.report_group_id,
            CommitMode::Manual(self.config.commit.policy()),
        )
        .with_poll_timeout(kafka.poll_timeout());
        let reporter: Arc<dyn EventHandler> = self.reporter.clone();
        self.spawn_loop(tasks, consumption, reporter)
    }

    fn spawn_loop(
        &self,
        tasks: &mut JoinSet<TaskOutcome>,
        consumption: ConsumptionLoop,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        let consumer = self
            .broker
            .consumer(consumption.group_id(), consumption.mode().is_manual())
            .map_err(|e| VisitstreamError::Broker(e.to_string()))?;
        let cancel = self.cancel.clone();

        tasks.spawn(async move {
            let result = consumption.run(consumer, handler, cancel).await;
            TaskOutcome::Loop {
                group_id: consumption.group_id().to_string(),
                result,
            }
        });
        Ok(())
    }
}

/// Waits for SIGINT or, on Unix, SIGQUIT.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let quit = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::quit()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGQUIT");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let quit = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("Received SIGINT"),
        _ = quit => info!("Received SIGQUIT"),
    }
}
