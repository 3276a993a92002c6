//! Deadline enforcement for outstanding collectors.
//!
//! A single sweeper task keeps all deadlines in a sorted map and sleeps until
//! the earliest one. Expiry goes through the registry's single-winner
//! transition, so a write that already completed makes its expiry a no-op,
//! and each scheduled deadline is popped (hence fires) exactly once.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::collect::{CollectorRegistry, OperationId, WriteError};
use crate::utils::{AckgridError, Timer};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Longest deadline a write can be given; longer ones are clamped.
pub const MAX_WRITE_TIMEOUT: Duration = Duration::from_secs(86400 * 365);

/// Deadline registration sent to the sweeper task.
type DeadlineReq = (Instant, OperationId, Duration);

/// Handle to the deadline sweeper of one registry.
#[derive(Debug)]
pub struct TimeoutSupervisor {
    /// Sender side of the deadline channel.
    tx_deadline: mpsc::UnboundedSender<DeadlineReq>,

    /// Join handle of the sweeper task.
    sweeper_handle: JoinHandle<()>,
}

impl TimeoutSupervisor {
    /// Spawns the sweeper task over `registry`. Must be called within the
    /// context of a tokio runtime.
    pub fn new_and_setup(registry: Arc<CollectorRegistry>) -> Self {
        let (tx_deadline, rx_deadline) = mpsc::unbounded_channel();
        let mut sweeper = SweeperTask {
            registry,
            rx_deadline,
            deadlines: BTreeMap::new(),
            timer: Timer::new(),
        };
        let sweeper_handle = tokio::spawn(async move { sweeper.run().await });

        TimeoutSupervisor {
            tx_deadline,
            sweeper_handle,
        }
    }

    /// Schedules expiry of write `id` after `timeout` from now, at most
    /// `MAX_WRITE_TIMEOUT`.
    pub fn schedule(
        &self,
        id: OperationId,
        timeout: Duration,
    ) -> Result<(), AckgridError> {
        let timeout = timeout.min(MAX_WRITE_TIMEOUT);
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return logged_err!("deadline of {} out of range: {:?}", id, timeout);
        };
        self.tx_deadline
            .send((deadline, id, timeout))
            .map_err(|e| AckgridError::msg(format!("deadline channel: {}", e)))
    }

    /// Stops the sweeper task; pending deadlines are dropped.
    pub fn stop(&self) {
        self.sweeper_handle.abort();
    }
}

/// Sorted-deadline sweeper task.
struct SweeperTask {
    registry: Arc<CollectorRegistry>,

    rx_deadline: mpsc::UnboundedReceiver<DeadlineReq>,

    /// Map from (deadline, write ID) -> configured timeout of that write.
    deadlines: BTreeMap<(Instant, OperationId), Duration>,

    /// Armed at the earliest deadline in `deadlines`.
    timer: Timer,
}

impl SweeperTask {
    /// Adds a deadline, re-arming the timer if it is the new earliest one.
    fn add_deadline(&mut self, deadline: Instant, id: OperationId, dur: Duration) {
        self.deadlines.insert((deadline, id), dur);
        if self.timer.deadline().map_or(true, |armed| deadline < armed) {
            self.timer.kickoff_at(deadline);
        }
    }

    /// Expires every write whose deadline has passed, then re-arms the timer
    /// at the next remaining deadline.
    fn expire_due(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.deadlines.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), dur) = entry.remove_entry();
            let after_ms = u64::try_from(dur.as_millis()).unwrap_or(u64::MAX);
            if self
                .registry
                .finish(id, Err(WriteError::Timeout { after_ms }))
            {
                pf_debug!("write {} timed out after {} ms", id, after_ms);
            }
        }

        match self.deadlines.keys().next() {
            Some(&(next, _)) => self.timer.kickoff_at(next),
            None => self.timer.cancel(),
        }
    }

    /// Starts the sweeper task loop.
    async fn run(&mut self) {
        pf_debug!("timeout sweeper task spawned");

        loop {
            tokio::select! {
                req = self.rx_deadline.recv() => {
                    match req {
                        Some((deadline, id, dur)) => {
                            self.add_deadline(deadline, id, dur);
                        }
                        None => break, // supervisor dropped
                    }
                },

                _ = self.timer.timeout() => {
                    self.expire_due();
                },
            }
        }

        pf_debug!("timeout sweeper task exited");
    }
}
