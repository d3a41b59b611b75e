use std::sync::{Mutex, PoisonError};

/// Terminal outcome for one lease, queued by a worker for the next flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LeaseOutcome {
    Ack {
        lease_id: String,
    },
    Retry {
        lease_id: String,
        delay_seconds: u32,
    },
}

/// Producer/consumer buffer between workers and the lease loop. Workers
/// append under the lock; only the loop drains.
#[derive(Debug, Default)]
pub(crate) struct OutcomeBuffer {
    pending: Mutex<Vec<LeaseOutcome>>,
}

impl OutcomeBuffer {
    pub(crate) fn push(&self, outcome: LeaseOutcome) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome);
    }

    /// Drain everything queued so far, partitioned into acks and
    /// `(lease_id, delay_seconds)` retries. Outcomes with an empty lease id
    /// cannot be acked and are dropped here.
    pub(crate) fn drain(&self) -> (Vec<String>, Vec<(String, u32)>) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut acks = Vec::new();
        let mut retries = Vec::new();
        for outcome in pending.drain(..) {
            match outcome {
                LeaseOutcome::Ack { lease_id } if !lease_id.is_empty() => acks.push(lease_id),
                LeaseOutcome::Retry {
                    lease_id,
                    delay_seconds,
                } if !lease_id.is_empty() => retries.push((lease_id, delay_seconds)),
                _ => {}
            }
        }
        (acks, retries)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}
