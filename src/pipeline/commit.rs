//! Offset commit policy for manual-commit consumers.
//!
//! Acknowledgements are batched: the loop commits once `batch_size`
//! dispatched messages have finished, or once `interval` has passed since
//! the last commit with at least one acknowledgement pending. This bounds
//! both the number of messages re-processed after a crash and the number
//! of broker round-trips.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Default number of finished messages that forces a commit.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Default staleness window before pending acknowledgements are committed.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Thresholds for committing consumed offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPolicy {
    pub batch_size: usize,
    pub interval: Duration,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl CommitPolicy {
    pub fn new(batch_size: usize, interval: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            interval,
        }
    }
}

/// Why a commit was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitReason {
    /// `batch_size` acknowledgements accumulated.
    Batch,
    /// The interval elapsed with acknowledgements pending.
    Interval,
    /// The loop is shutting down.
    Drain,
}

impl CommitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Interval => "interval",
            Self::Drain => "drain",
        }
    }
}

/// Per-subscription commit state, owned by a single loop.
#[derive(Debug, Clone)]
pub struct CommitCursor {
    pending_acks: usize,
    last_commit: Instant,
}

impl CommitCursor {
    pub fn new(now: Instant) -> Self {
        Self {
            pending_acks: 0,
            last_commit: now,
        }
    }

    pub fn pending_acks(&self) -> usize {
        self.pending_acks
    }

    pub fn last_commit(&self) -> Instant {
        self.last_commit
    }

    /// Records that one dispatched message finished processing.
    pub fn record_ack(&mut self) {
        self.pending_acks += 1;
    }

    /// Decides whether the loop should commit now.
    ///
    /// The batch rule is checked before the interval rule. The interval
    /// rule never fires with nothing pending.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::{Duration, Instant};
    /// use visitstream::pipeline::commit::{CommitCursor, CommitPolicy, CommitReason};
    ///
    /// let start = Instant::now();
    /// let policy = CommitPolicy::new(2, Duration::from_secs(5));
    /// let mut cursor = CommitCursor::new(start);
    ///
    /// cursor.record_ack();
    /// assert_eq!(cursor.decide(&policy, start), None);
    /// cursor.record_ack();
    /// assert_eq!(cursor.decide(&policy, start), Some(CommitReason::Batch));
    /// ```
    pub fn decide(&self, policy: &CommitPolicy, now: Instant) -> Option<CommitReason> {
        if self.pending_acks >= policy.batch_size {
            return Some(CommitReason::Batch);
        }

        if self.pending_acks > 0 && now.saturating_duration_since(self.last_commit) > policy.interval
        {
            return Some(CommitReason::Interval);
        }

        None
    }

    /// Clears pending acknowledgements after a successful commit.
    pub fn reset(&mut self, now: Instant) {
        self.pending_acks = 0;
        self.last_commit = now;
    }
}

#[derive(Debug, Clone, Default)]
struct PartitionOffsets {
    // Dispatched offsets mapped to whether their handler has finished.
    outstanding: BTreeMap<i64, bool>,
    committable: Option<i64>,
}

/// Finished-offset watermark per partition.
///
/// Handlers run concurrently, so a later offset can finish before an
/// earlier one. Only the contiguous run of finished offsets from the front
/// of each partition may be committed; an offset whose handler is still
/// running holds back everything after it.
#[derive(Debug, Clone, Default)]
pub struct OffsetTracker {
    partitions: BTreeMap<i32, PartitionOffsets>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `offset` was handed to a handler.
    pub fn begin(&mut self, partition: i32, offset: i64) {
        self.partitions
            .entry(partition)
            .or_default()
            .outstanding
            .insert(offset, false);
    }

    /// Records that the handler for `offset` returned, successfully or not.
    pub fn finish(&mut self, partition: i32, offset: i64) {
        let state = self.partitions.entry(partition).or_default();
        state.outstanding.insert(offset, true);

        while let Some(entry) = state.outstanding.first_entry() {
            if !*entry.get() {
                break;
            }
            let (done, _) = entry.remove_entry();
            state.committable = Some(done + 1);
        }
    }

    /// Next offset to read per partition, covering only finished messages.
    ///
    /// # Examples
    ///
    /// ```
    /// use visitstream::pipeline::commit::OffsetTracker;
    ///
    /// let mut tracker = OffsetTracker::new();
    /// tracker.begin(0, 0);
    /// tracker.begin(0, 1);
    /// tracker.finish(0, 1);
    /// assert!(tracker.committable().is_empty());
    ///
    /// tracker.finish(0, 0);
    /// assert_eq!(tracker.committable(), vec![(0, 2)]);
    /// ```
    pub fn committable(&self) -> Vec<(i32, i64)> {
        self.partitions
            .iter()
            .filter_map(|(partition, state)| state.committable.map(|next| (*partition, next)))
            .collect()
    }

    /// Number of dispatched messages still running.
    pub fn in_flight(&self) -> usize {
        self.partitions
            .values()
            .map(|state| state.outstanding.values().filter(|done| !**done).count())
            .sum()
    }
}
