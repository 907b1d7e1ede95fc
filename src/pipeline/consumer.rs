//! The consumption loop
//!
//! One [`ConsumptionLoop::run`] call owns one broker handle for its whole
//! life: it subscribes, polls with a bounded timeout so the shared
//! cancellation token is observed promptly, decodes and dispatches every
//! message, and on cancellation drains in-flight work before closing the
//! handle.
//!
//! In [`CommitMode::Auto`] the broker commits offsets on its own and the
//! callback runs inline. In [`CommitMode::Manual`] every callback runs on
//! its own task and reports back through a bounded completion channel; the
//! loop feeds those completions into a [`CommitCursor`] and commits when
//! the [`CommitPolicy`] says so, plus once more while draining. Commits
//! cover only the offsets an [`OffsetTracker`] reports as finished, so a
//! message whose callback is still running is never acknowledged.
//!
//! A failed subscription or a fatal broker error stops the loop and
//! cancels the token so sibling loops and the HTTP listener stop too.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use super::commit::{CommitCursor, CommitPolicy, CommitReason, OffsetTracker};
use super::{ConsumeError, EventHandler, LoopState, LoopSummary};
use crate::broker::{BrokerConsumer, ConsumedMessage, PollOutcome};
use crate::codec;

/// Default upper bound on a single broker poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// How consumed offsets are acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// The broker client commits periodically on its own.
    Auto,
    /// The loop commits according to the given policy.
    Manual(CommitPolicy),
}

impl CommitMode {
    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Manual(_))
    }
}

/// Report sent by a dispatch task once its callback returns.
#[derive(Debug)]
struct Completion {
    partition: i32,
    offset: i64,
    handled: bool,
}

/// Configuration of one loop instance.
#[derive(Debug, Clone)]
pub struct ConsumptionLoop {
    topic: String,
    group_id: String,
    poll_timeout: Duration,
    mode: CommitMode,
}

impl ConsumptionLoop {
    /// Creates a loop for `topic` in `group_id` with the default poll timeout.
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>, mode: CommitMode) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            mode,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn mode(&self) -> CommitMode {
        self.mode
    }

    /// Runs the loop until `cancel` fires or the broker fails fatally.
    ///
    /// `consumer` must have been created for this loop's group with the
    /// matching commit mode; it is closed before this returns.
    ///
    /// # Errors
    ///
    /// Returns `ConsumeError::Subscription` if the handle cannot join the
    /// group and `ConsumeError::Fatal` if the broker reports a fatal
    /// error. Both cancel `cancel` before returning.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use tokio_util::sync::CancellationToken;
    /// use visitstream::broker::{Broker, MemoryBroker};
    /// use visitstream::pipeline::{CommitMode, ConsumptionLoop, DayReporter};
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let broker = MemoryBroker::default();
    /// let cancel = CancellationToken::new();
    /// cancel.cancel();
    ///
    /// let consumer = broker.consumer("report", false).unwrap();
    /// let summary = ConsumptionLoop::new("visits", "report", CommitMode::Auto)
    ///     .run(consumer, Arc::new(DayReporter::new()), cancel)
    ///     .await
    ///     .unwrap();
    /// assert_eq!(summary.dispatched, 0);
    /// # }
    /// ```
    pub async fn run(
        &self,
        mut consumer: Box<dyn BrokerConsumer>,
        handler: Arc<dyn EventHandler>,
        cancel: CancellationToken,
    ) -> Result<LoopSummary, ConsumeError> {
        let mut state = LoopState::Subscribing;

        if let Err(err) = consumer.subscribe(&self.topic) {
            error!(
                topic = %self.topic,
                group_id = %self.group_id,
                error = %err,
                "Subscription failed, cancelling pipeline"
            );
            self.transition(&mut state, LoopState::Stopped);
            consumer.close();
            cancel.cancel();
            return Err(ConsumeError::Subscription(err));
        }

        info!(
            topic = %self.topic,
            group_id = %self.group_id,
            manual_commit = self.mode.is_manual(),
            "Subscribed"
        );
        self.transition(&mut state, LoopState::Polling);

        let policy = match self.mode {
            CommitMode::Manual(policy) => Some(policy),
            CommitMode::Auto => None,
        };
        let (done_tx, mut done_rx) = mpsc::channel(policy.map_or(1, |p| p.batch_size.max(1)));
        let mut in_flight = JoinSet::new();
        let mut cursor = CommitCursor::new(Instant::now());
        let mut tracker = OffsetTracker::new();
        let mut summary = LoopSummary::default();

        let fatal = loop {
            if let Some(policy) = &policy {
                if let Some(reason) = cursor.decide(policy, Instant::now()) {
                    self.commit(&mut consumer, &mut cursor, &tracker, &mut summary, reason)
                        .await;
                }
            }

            while let Some(joined) = in_flight.try_join_next() {
                self.log_join_error(joined);
            }

            if cancel.is_cancelled() {
                break None;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break None,

                Some(done) = done_rx.recv() => {
                    self.absorb(done, &mut cursor, &mut tracker, &mut summary);
                }

                outcome = consumer.poll(self.poll_timeout) => match outcome {
                    PollOutcome::Empty => {}
                    PollOutcome::Message(message) => {
                        self.transition(&mut state, LoopState::Dispatching);
                        self.dispatch(
                            message,
                            &handler,
                            &done_tx,
                            &mut in_flight,
                            &mut cursor,
                            &mut tracker,
                            &mut summary,
                        )
                        .await;
                        self.transition(&mut state, LoopState::Polling);
                    }
                    PollOutcome::Error(err) if err.is_fatal() => break Some(err),
                    PollOutcome::Error(err) => {
                        warn!(group_id = %self.group_id, error = %err, "Consumer error");
                    }
                    PollOutcome::Ignored(what) => {
                        debug!(group_id = %self.group_id, event = %what, "Ignored consumer event");
                    }
                },
            }
        };

        if let Some(err) = fatal {
            error!(
                topic = %self.topic,
                group_id = %self.group_id,
                error = %err,
                "Fatal consumer error, cancelling pipeline"
            );
            in_flight.abort_all();
            consumer.close();
            self.transition(&mut state, LoopState::Stopped);
            cancel.cancel();
            return Err(ConsumeError::Fatal(err));
        }

        self.transition(&mut state, LoopState::Draining);

        // Dispatch tasks hold the remaining senders.
        drop(done_tx);
        while let Some(done) = done_rx.recv().await {
            self.absorb(done, &mut cursor, &mut tracker, &mut summary);
        }
        while let Some(joined) = in_flight.join_next().await {
            self.log_join_error(joined);
        }

        if policy.is_some() {
            self.commit(
                &mut consumer,
                &mut cursor,
                &tracker,
                &mut summary,
                CommitReason::Drain,
            )
            .await;
        }

        consumer.close();
        self.transition(&mut state, LoopState::Stopped);

        info!(
            topic = %self.topic,
            group_id = %self.group_id,
            dispatched = summary.dispatched,
            decode_failures = summary.decode_failures,
            handler_failures = summary.handler_failures,
            commits = summary.commits,
            commit_failures = summary.commit_failures,
            "Consumption loop stopped"
        );

        Ok(summary)
    }

    async fn dispatch(
        &self,
        message: ConsumedMessage,
        handler: &Arc<dyn EventHandler>,
        done_tx: &mpsc::Sender<Completion>,
        in_flight: &mut JoinSet<()>,
        cursor: &mut CommitCursor,
        tracker: &mut OffsetTracker,
        summary: &mut LoopSummary,
    ) {
        let span = info_span!(
            "dispatch",
            group_id = %self.group_id,
            partition = message.partition,
            offset = message.offset
        );

        let event = match codec::decode(message.payload.as_deref().unwrap_or_default()) {
            Ok(event) => event,
            Err(err) => {
                warn!(parent: &span, error = %err, "Skipping undecodable message");
                summary.decode_failures += 1;
                if self.mode.is_manual() {
                    cursor.record_ack();
                    tracker.finish(message.partition, message.offset);
                }
                return;
            }
        };

        summary.dispatched += 1;

        if !self.mode.is_manual() {
            match handler.handle(event).instrument(span.clone()).await {
                Ok(()) => trace!(parent: &span, "Event handled"),
                Err(err) => {
                    summary.handler_failures += 1;
                    warn!(parent: &span, error = %err, "Handler failed");
                }
            }
            return;
        }

        let handler = Arc::clone(handler);
        let done_tx = done_tx.clone();
        let (partition, offset) = (message.partition, message.offset);
        tracker.begin(partition, offset);
        in_flight.spawn(
            async move {
                let handled = match handler.handle(event).await {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(error = %err, "Handler failed");
                        false
                    }
                };
                // The loop only drops the receiver after every task finished.
                let _ = done_tx
                    .send(Completion {
                        partition,
                        offset,
                        handled,
                    })
                    .await;
            }
            .instrument(span),
        );
    }

    fn absorb(
        &self,
        done: Completion,
        cursor: &mut CommitCursor,
        tracker: &mut OffsetTracker,
        summary: &mut LoopSummary,
    ) {
        cursor.record_ack();
        tracker.finish(done.partition, done.offset);
        if !done.handled {
            summary.handler_failures += 1;
        }
        trace!(
            group_id = %self.group_id,
            partition = done.partition,
            offset = done.offset,
            pending_acks = cursor.pending_acks(),
            "Dispatch finished"
        );
    }

    async fn commit(
        &self,
        consumer: &mut Box<dyn BrokerConsumer>,
        cursor: &mut CommitCursor,
        tracker: &OffsetTracker,
        summary: &mut LoopSummary,
        reason: CommitReason,
    ) {
        let pending_acks = cursor.pending_acks();
        let offsets = tracker.committable();
        match consumer.commit(&offsets).await {
            Ok(()) => {
                cursor.reset(Instant::now());
                summary.commits += 1;
                debug!(
                    group_id = %self.group_id,
                    reason = reason.as_str(),
                    pending_acks,
                    offsets = ?offsets,
                    in_flight = tracker.in_flight(),
                    "Offsets committed"
                );
            }
            Err(err) => {
                summary.commit_failures += 1;
                warn!(
                    group_id = %self.group_id,
                    reason = reason.as_str(),
                    pending_acks,
                    error = %err,
                    "Offset commit failed"
                );
            }
        }
    }

    fn log_join_error(&self, joined: Result<(), JoinError>) {
        if let Err(err) = joined {
            if err.is_panic() {
                error!(group_id = %self.group_id, "Dispatch task panicked");
            }
        }
    }

    fn transition(&self, state: &mut LoopState, next: LoopState) {
        trace!(group_id = %self.group_id, from = ?state, to = ?next, "Loop state change");
        *state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerError, BrokerProducer, MemoryBroker};
    use crate::event::VisitEvent;
    use crate::pipeline::HandlerError;
    use crate::test_utils;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    const TOPIC: &str = "visits";
    const GROUP: &str = "test-group";

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<VisitEvent>>,
        fail_keys: Vec<String>,
    }

    impl Recorder {
        fn failing_on(key: &str) -> Self {
            Self {
                fail_keys: vec![key.to_string()],
                ..Self::default()
            }
        }

        fn count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, event: VisitEvent) -> Result<(), HandlerError> {
            let fail = self.fail_keys.iter().any(|k| k == event.origin_key());
            self.seen.lock().unwrap().push(event);
            if fail {
                return Err("rejected".into());
            }
            Ok(())
        }
    }

    /// Holds events keyed "slow" until a permit is released.
    struct Gate {
        release: Semaphore,
        finished: Mutex<Vec<String>>,
    }

    impl Default for Gate {
        fn default() -> Self {
            Self {
                release: Semaphore::new(0),
                finished: Mutex::default(),
            }
        }
    }

    impl Gate {
        fn finished(&self, key: &str) -> bool {
            self.finished.lock().unwrap().iter().any(|k| k == key)
        }
    }

    #[async_trait]
    impl EventHandler for Gate {
        async fn handle(&self, event: VisitEvent) -> Result<(), HandlerError> {
            if event.origin_key() == "slow" {
                self.release.acquire().await?.forget();
            }
            self.finished
                .lock()
                .unwrap()
                .push(event.origin_key().to_string());
            Ok(())
        }
    }

    async fn wait_until(done: impl FnMut() -> bool) {
        test_utils::wait_until(Duration::from_secs(5), done).await;
    }

    async fn publish(producer: &Arc<dyn BrokerProducer>, keys: &[&str]) -> Vec<VisitEvent> {
        let mut events = Vec::new();
        for key in keys {
            let event = VisitEvent::now(*key);
            producer
                .send(TOPIC, key, &codec::encode(&event).unwrap())
                .await
                .unwrap();
            events.push(event);
        }
        events
    }

    fn spawn_loop<H: EventHandler + 'static>(
        broker: &MemoryBroker,
        mode: CommitMode,
        handler: Arc<H>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<LoopSummary, ConsumeError>> {
        let consumer = broker.consumer(GROUP, mode.is_manual()).unwrap();
        let consumption = ConsumptionLoop::new(TOPIC, GROUP, mode)
            .with_poll_timeout(Duration::from_millis(20));
        tokio::spawn(async move { consumption.run(consumer, handler, cancel).await })
    }

    fn quiet_policy() -> CommitMode {
        CommitMode::Manual(CommitPolicy::new(100, Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_published_events_reach_handler_unchanged() {
        let broker = MemoryBroker::new(1);
        let producer = broker.producer().unwrap();
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let handle = spawn_loop(&broker, CommitMode::Auto, Arc::clone(&recorder), cancel.clone());
        let events = publish(&producer, &["a", "b", "a"]).await;

        wait_until(|| recorder.count() == 3).await;
        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(*recorder.seen.lock().unwrap(), events);
        assert_eq!(summary.dispatched, 3);
        assert_eq!(summary.commits, 0);
    }

    #[tokio::test]
    async fn test_undecodable_message_is_skipped() {
        let broker = MemoryBroker::default();
        let producer = broker.producer().unwrap();
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let handle = spawn_loop(&broker, CommitMode::Auto, Arc::clone(&recorder), cancel.clone());
        producer.send(TOPIC, "x", b"not json").await.unwrap();
        publish(&producer, &["x"]).await;

        wait_until(|| recorder.count() == 1).await;
        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.decode_failures, 1);
        assert_eq!(summary.dispatched, 1);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_stop_loop() {
        let broker = MemoryBroker::new(1);
        let producer = broker.producer().unwrap();
        let recorder = Arc::new(Recorder::failing_on("bad"));
        let cancel = CancellationToken::new();

        let handle = spawn_loop(&broker, CommitMode::Auto, Arc::clone(&recorder), cancel.clone());
        publish(&producer, &["bad", "good"]).await;

        wait_until(|| recorder.count() == 2).await;
        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.handler_failures, 1);
    }

    #[tokio::test]
    async fn test_non_fatal_error_keeps_polling() {
        let broker = MemoryBroker::default();
        let producer = broker.producer().unwrap();
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        broker.inject_error(BrokerError::Consume {
            message: "transport failure".to_string(),
            fatal: false,
        });
        let handle = spawn_loop(&broker, CommitMode::Auto, Arc::clone(&recorder), cancel.clone());
        publish(&producer, &["a"]).await;

        wait_until(|| recorder.count() == 1).await;
        assert!(!cancel.is_cancelled());
        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_fatal_error_cancels_without_commit() {
        let broker = MemoryBroker::default();
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        broker.inject_error(BrokerError::Consume {
            message: "fenced".to_string(),
            fatal: true,
        });
        let handle = spawn_loop(&broker, quiet_policy(), recorder, cancel.clone());

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ConsumeError::Fatal(_))));
        assert!(cancel.is_cancelled());
        assert_eq!(broker.commit_attempts(GROUP, TOPIC), 0);
    }

    #[tokio::test]
    async fn test_subscription_failure_cancels() {
        let broker = MemoryBroker::default();
        let cancel = CancellationToken::new();
        broker.fail_next_subscriptions(1);

        let handle = spawn_loop(&broker, CommitMode::Auto, Arc::new(Recorder::default()), cancel.clone());

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(ConsumeError::Subscription(_))));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_with_pending_acks_commits_exactly_once() {
        let broker = MemoryBroker::default();
        let producer = broker.producer().unwrap();
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let handle = spawn_loop(&broker, quiet_policy(), Arc::clone(&recorder), cancel.clone());
        publish(&producer, &["a", "b", "c"]).await;

        wait_until(|| recorder.count() == 3).await;
        assert_eq!(broker.commit_attempts(GROUP, TOPIC), 0);

        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(broker.commit_attempts(GROUP, TOPIC), 1);
        assert_eq!(broker.committed_messages(GROUP, TOPIC), 3);
        assert_eq!(summary.commits, 1);
    }

    #[tokio::test]
    async fn test_drain_commit_is_attempted_when_idle() {
        let broker = MemoryBroker::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let handle = spawn_loop(&broker, quiet_policy(), Arc::new(Recorder::default()), cancel);
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(broker.commit_attempts(GROUP, TOPIC), 1);
        assert_eq!(summary.dispatched, 0);
    }

    #[tokio::test]
    async fn test_failed_drain_commit_is_not_escalated() {
        let broker = MemoryBroker::default();
        let producer = broker.producer().unwrap();
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        broker.fail_commits(true);

        let handle = spawn_loop(&broker, quiet_policy(), Arc::clone(&recorder), cancel.clone());
        publish(&producer, &["a"]).await;
        wait_until(|| recorder.count() == 1).await;

        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert_eq!(summary.commit_failures, 1);
        assert_eq!(summary.commits, 0);
        assert_eq!(broker.committed_messages(GROUP, TOPIC), 0);
    }

    #[tokio::test]
    async fn test_batch_rule_commits_before_shutdown() {
        let broker = MemoryBroker::default();
        let producer = broker.producer().unwrap();
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let mode = CommitMode::Manual(CommitPolicy::new(2, Duration::from_secs(60)));

        let handle = spawn_loop(&broker, mode, Arc::clone(&recorder), cancel.clone());
        publish(&producer, &["a", "b", "c", "d"]).await;

        wait_until(|| broker.commit_attempts(GROUP, TOPIC) >= 1).await;
        wait_until(|| recorder.count() == 4).await;
        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert!(summary.commits >= 2);
        assert_eq!(broker.committed_messages(GROUP, TOPIC), 4);
    }

    #[tokio::test]
    async fn test_interval_rule_commits_pending_acks() {
        let broker = MemoryBroker::default();
        let producer = broker.producer().unwrap();
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let mode = CommitMode::Manual(CommitPolicy::new(100, Duration::from_millis(50)));

        let handle = spawn_loop(&broker, mode, Arc::clone(&recorder), cancel.clone());
        publish(&producer, &["a"]).await;

        wait_until(|| broker.committed_messages(GROUP, TOPIC) == 1).await;
        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert!(summary.commits >= 2);
    }

    #[tokio::test]
    async fn test_uncommitted_messages_are_redelivered() {
        let broker = MemoryBroker::new(1);
        let producer = broker.producer().unwrap();
        publish(&producer, &["a", "b"]).await;

        // First run commits everything on drain.
        let first = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let handle = spawn_loop(&broker, quiet_policy(), Arc::clone(&first), cancel.clone());
        wait_until(|| first.count() == 2).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        // Second run fails its drain commit, so its message comes back.
        publish(&producer, &["c"]).await;
        broker.fail_commits(true);
        let second = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let handle = spawn_loop(&broker, quiet_policy(), Arc::clone(&second), cancel.clone());
        wait_until(|| second.count() == 1).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        broker.fail_commits(false);
        let third = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let handle = spawn_loop(&broker, quiet_policy(), Arc::clone(&third), cancel.clone());
        wait_until(|| third.count() == 1).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(third.seen.lock().unwrap()[0].origin_key(), "c");
    }

    #[tokio::test]
    async fn test_ignored_events_keep_polling() {
        let broker = MemoryBroker::new(1);
        let producer = broker.producer().unwrap();
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        broker.inject_ignored("rebalance in progress");
        let handle = spawn_loop(&broker, CommitMode::Auto, Arc::clone(&recorder), cancel.clone());
        publish(&producer, &["a"]).await;

        wait_until(|| recorder.count() == 1).await;
        assert!(!cancel.is_cancelled());
        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.dispatched, 1);
    }

    #[tokio::test]
    async fn test_commit_waits_for_slowest_message() {
        let broker = MemoryBroker::new(1);
        let producer = broker.producer().unwrap();
        let gate = Arc::new(Gate::default());
        let cancel = CancellationToken::new();
        let mode = CommitMode::Manual(CommitPolicy::new(1, Duration::from_secs(60)));

        let handle = spawn_loop(&broker, mode, gate.clone(), cancel.clone());
        publish(&producer, &["slow", "fast"]).await;

        // "fast" finishing triggers a batch commit while "slow" still runs.
        wait_until(|| gate.finished("fast") && broker.commit_attempts(GROUP, TOPIC) >= 1).await;
        assert!(!gate.finished("slow"));
        assert_eq!(broker.committed_messages(GROUP, TOPIC), 0);

        gate.release.add_permits(1);
        wait_until(|| broker.committed_messages(GROUP, TOPIC) == 2).await;

        cancel.cancel();
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.dispatched, 2);
        assert_eq!(broker.committed_messages(GROUP, TOPIC), 2);
    }
}
