//! Partitioning of large identifier sets
//!
//! Backends cap the size of list predicates (`uid IN (...)`). Operations over
//! larger sets run one partition at a time; each partition succeeds or fails
//! on its own and failures are reported with the effects already committed.

use log::{debug, warn};

use crate::error::{FailedPartition, PartialBatchFailure, Result};
use crate::models::{MailboxMessage, MessageMetadata, MessageUid};

/// Result of one partition that can be merged with the others
pub trait PartitionOutcome: Default {
    fn absorb(&mut self, other: Self);

    /// Record what the successful partitions did on a failure report
    fn report_into(self, failure: &mut PartialBatchFailure);
}

impl PartitionOutcome for Vec<MessageMetadata> {
    fn absorb(&mut self, other: Self) {
        self.extend(other);
    }

    fn report_into(self, failure: &mut PartialBatchFailure) {
        failure.committed = self;
    }
}

impl PartitionOutcome for Vec<MailboxMessage> {
    fn absorb(&mut self, other: Self) {
        self.extend(other);
    }

    fn report_into(self, failure: &mut PartialBatchFailure) {
        failure.committed = self.iter().map(MailboxMessage::metadata).collect();
    }
}

/// Outcome of clearing `\Recent` on a set of UIDs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecentReset {
    /// Rows changed by this call, with their new metadata
    pub updated: Vec<MessageMetadata>,
    /// Rows already at the target modification sequence (earlier attempt)
    pub already_applied: Vec<MessageUid>,
    /// Requested UIDs that matched no row
    pub missing: Vec<MessageUid>,
}

impl RecentReset {
    /// Requested rows this call did not change
    pub fn skipped(&self) -> usize {
        self.already_applied.len() + self.missing.len()
    }
}

impl PartitionOutcome for RecentReset {
    fn absorb(&mut self, other: Self) {
        self.updated.extend(other.updated);
        self.already_applied.extend(other.already_applied);
        self.missing.extend(other.missing);
    }

    fn report_into(self, failure: &mut PartialBatchFailure) {
        failure.committed = self.updated;
        failure.already_applied = self.already_applied;
        failure.missing = self.missing;
    }
}

/// Run `op` over `uids` in partitions of at most `max_partition` UIDs
///
/// A single partition returns its own error unchanged. With several
/// partitions, any failure yields [`PartialBatchFailure`] listing the failed
/// UIDs and the rows committed by the partitions that succeeded.
pub fn run_partitioned<T, F>(uids: &[MessageUid], max_partition: usize, mut op: F) -> Result<T>
where
    T: PartitionOutcome,
    F: FnMut(&[MessageUid]) -> Result<T>,
{
    if uids.is_empty() {
        return Ok(T::default());
    }

    let max_partition = max_partition.max(1);
    if uids.len() <= max_partition {
        return op(uids);
    }

    let mut outcome = T::default();
    let mut failed = Vec::new();
    let mut succeeded_partitions = 0;

    for partition in uids.chunks(max_partition) {
        match op(partition) {
            Ok(result) => {
                debug!("[STORE] Partition of {} uids committed", partition.len());
                outcome.absorb(result);
                succeeded_partitions += 1;
            }
            Err(error) => {
                warn!(
                    "[STORE] Partition of {} uids starting at {} failed: {}",
                    partition.len(),
                    partition[0],
                    error
                );
                failed.push(FailedPartition {
                    uids: partition.to_vec(),
                    error,
                });
            }
        }
    }

    if failed.is_empty() {
        return Ok(outcome);
    }
    let mut failure = PartialBatchFailure {
        failed,
        succeeded_partitions,
        ..Default::default()
    };
    outcome.report_into(&mut failure);
    Err(failure.into())
}
