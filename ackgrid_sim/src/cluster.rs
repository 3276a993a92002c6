//! Simulated primary + backups cluster exercising the ack collector.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ackgrid::{
    AckCollector, AckMsg, AckgridError, NodeAddress, OperationId,
    OwnershipView, SegmentId, TopologyId, WriteError, pf_debug, pf_error,
    pf_info, pf_warn,
};

use bytes::Bytes;

use get_size::GetSize;

use rand::prelude::*;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

/// Node address of the simulated primary.
pub(crate) const PRIMARY: NodeAddress = 0;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub(crate) struct SimParams {
    pub(crate) backups: u32,
    pub(crate) copies: u32,
    pub(crate) segments: u32,
    pub(crate) writes: usize,
    pub(crate) batch: usize,
    pub(crate) interval_us: u64,
    pub(crate) max_delay_ms: u64,
    pub(crate) fail_rate: f64,
    pub(crate) drop_rate: f64,
    pub(crate) rebalance_every: usize,
    pub(crate) config: Option<String>,
}

/// Write forwarded from the primary to one backup.
#[derive(Debug, Clone)]
struct ForwardMsg {
    op: OperationId,
    topology: TopologyId,
    /// `None` for a single-key write.
    segments: Option<Vec<SegmentId>>,
}

/// Outcome tally of a simulation run.
#[derive(Debug, Default)]
pub(crate) struct SimReport {
    pub(crate) succeeded: usize,
    pub(crate) failed: usize,
    pub(crate) timed_out: usize,
    pub(crate) invalidated: usize,
    pub(crate) stopped: usize,
    pub(crate) rejected: usize,
    pub(crate) reply_bytes: usize,
    pub(crate) latencies_ms: Vec<f64>,
}

impl SimReport {
    fn record(&mut self, outcome: &Result<(), WriteError>, latency: Duration) {
        match outcome {
            Ok(()) => {
                self.succeeded += 1;
                self.latencies_ms.push(latency.as_secs_f64() * 1000.0);
            }
            Err(WriteError::Remote { .. }) => self.failed += 1,
            Err(WriteError::Timeout { .. }) => self.timed_out += 1,
            Err(WriteError::TopologyChanged { .. }) => self.invalidated += 1,
            Err(WriteError::Stopping) => self.stopped += 1,
            Err(WriteError::Overloaded { .. }) => self.rejected += 1,
        }
    }

    /// Prints the tally through the logger.
    pub(crate) fn print(&self) {
        pf_info!(
            "ok {} | remote err {} | timeout {} | topology {} | stopped {} | rejected {}",
            self.succeeded,
            self.failed,
            self.timed_out,
            self.invalidated,
            self.stopped,
            self.rejected
        );
        if self.latencies_ms.len() >= 2 {
            pf_info!(
                "ack latency ms: mean {:.3} stdev {:.3} | reply payload {} B",
                statistical::mean(&self.latencies_ms),
                statistical::standard_deviation(&self.latencies_ms, None),
                self.reply_bytes
            );
        }
    }
}

/// Segment ownership assignment of one topology version. Backups of segment
/// `s` are `copies` consecutive backups starting at `(s + shift) % backups`.
fn make_view(
    topology: TopologyId,
    params: &SimParams,
    shift: u32,
    handed_off: bool,
) -> OwnershipView {
    let owners = (0..params.segments)
        .map(|s| {
            let mut owners = vec![PRIMARY];
            owners.extend(
                (0..params.copies)
                    .map(|c| 1 + (s + shift + c) % params.backups),
            );
            // segment 0 periodically moves its primary to its first backup
            if s == 0 && handed_off {
                owners.swap(0, 1);
            }
            (s, owners)
        })
        .collect();
    OwnershipView::new(topology, (1..=params.backups).chain([PRIMARY]), owners)
}

/// Simulated backup node task: replies to every forwarded write after a
/// random delay, occasionally failing or losing the reply.
fn spawn_backup(
    me: NodeAddress,
    params: SimParams,
    mut rx_forward: mpsc::UnboundedReceiver<ForwardMsg>,
    tx_reply: mpsc::UnboundedSender<(NodeAddress, Bytes)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(fwd) = rx_forward.recv().await {
            let (delay, roll) = {
                let mut rng = thread_rng();
                (
                    rng.gen_range(0..=params.max_delay_ms),
                    rng.gen::<f64>(),
                )
            };
            let tx_reply = tx_reply.clone();
            let (fail_rate, drop_rate) = (params.fail_rate, params.drop_rate);

            tokio::spawn(async move {
                time::sleep(Duration::from_millis(delay)).await;
                if roll < drop_rate {
                    pf_debug!("backup {} drops reply to {}", me, fwd.op);
                    return;
                }
                let replies = if roll < drop_rate + fail_rate {
                    vec![AckMsg::ErrorAck {
                        op: fwd.op,
                        topology: fwd.topology,
                        cause: format!("injected failure at backup {}", me),
                    }]
                } else {
                    match fwd.segments {
                        None => vec![AckMsg::Ack {
                            op: fwd.op,
                            topology: fwd.topology,
                        }],
                        Some(segments) => segments
                            .into_iter()
                            .map(|segment| AckMsg::SegmentAck {
                                op: fwd.op,
                                topology: fwd.topology,
                                segment,
                            })
                            .collect(),
                    }
                };
                for msg in replies {
                    match msg.encode() {
                        Ok(bytes) => {
                            let _ = tx_reply.send((me, bytes));
                        }
                        Err(e) => pf_error!("backup {} encode: {}", me, e),
                    }
                }
            });
        }
    })
}

/// Runs the whole simulation until all writes resolve or termination is
/// requested.
pub(crate) async fn run_sim(
    params: SimParams,
    mut rx_term: watch::Receiver<bool>,
) -> Result<SimReport, AckgridError> {
    let mut topology: TopologyId = 1;
    let mut shift = 0;
    let mut handed_off = false;
    let mut view = make_view(topology, &params, shift, handed_off);

    let acks = Arc::new(AckCollector::new_and_setup(
        PRIMARY,
        topology,
        params.config.as_deref(),
    )?);

    // backups and reply pump
    let (tx_reply, mut rx_reply) = mpsc::unbounded_channel();
    let mut tx_forwards = HashMap::new();
    let mut backup_handles = Vec::new();
    for b in 1..=params.backups {
        let (tx_forward, rx_forward) = mpsc::unbounded_channel();
        tx_forwards.insert(b, tx_forward);
        backup_handles.push(spawn_backup(
            b,
            params.clone(),
            rx_forward,
            tx_reply.clone(),
        ));
    }
    drop(tx_reply);

    let acks_ref = acks.clone();
    let pump_handle = tokio::spawn(async move {
        let mut reply_bytes = 0;
        while let Some((from, bytes)) = rx_reply.recv().await {
            reply_bytes += bytes.len();
            acks_ref.handle_bytes(from, &bytes);
        }
        reply_bytes
    });

    let mut waiters = Vec::with_capacity(params.writes);
    let mut interval = time::interval(Duration::from_micros(params.interval_us));
    let mut terminated = false;

    for i in 0..params.writes {
        tokio::select! {
            _ = interval.tick() => {},
            _ = rx_term.changed() => {
                pf_warn!("termination requested after {} writes", i);
                terminated = true;
                break;
            },
        }

        if params.rebalance_every > 0 && i > 0 && i % params.rebalance_every == 0 {
            topology += 1;
            shift += 1;
            handed_off = !handed_off;
            view = make_view(topology, &params, shift, handed_off);
            let resolved = acks.on_topology_changed(&view);
            pf_debug!("activated topology {}: {} writes resolved", topology, resolved);
        }

        // only write to segments this node is primary of
        let candidates: Vec<SegmentId> = (0..params.segments)
            .filter(|&s| view.primary_of(s) == Some(PRIMARY))
            .collect();
        let chosen: Vec<SegmentId> = candidates
            .choose_multiple(&mut thread_rng(), params.batch)
            .copied()
            .collect();

        let start = Instant::now();
        let (op, handle, per_backup) = if params.batch == 1 {
            let segment = chosen[0];
            let backups: HashSet<NodeAddress> =
                view.backups_of(segment).iter().copied().collect();
            let (op, handle) = acks.create(backups.clone(), segment, topology);
            let per_backup: HashMap<NodeAddress, Option<Vec<SegmentId>>> =
                backups.into_iter().map(|b| (b, None)).collect();
            (op, handle, per_backup)
        } else {
            let per_segment: HashMap<SegmentId, HashSet<NodeAddress>> = chosen
                .iter()
                .map(|&s| (s, view.backups_of(s).iter().copied().collect()))
                .collect();
            let mut per_backup: HashMap<NodeAddress, Option<Vec<SegmentId>>> =
                HashMap::new();
            for (&s, owners) in &per_segment {
                for &b in owners {
                    per_backup
                        .entry(b)
                        .or_insert_with(|| Some(Vec::new()))
                        .get_or_insert_with(Vec::new)
                        .push(s);
                }
            }
            let (op, handle) = acks.create_segmented(per_segment, topology);
            (op, handle, per_backup)
        };

        for (b, segments) in per_backup {
            let fwd = ForwardMsg {
                op,
                topology,
                segments,
            };
            if let Some(tx_forward) = tx_forwards.get(&b) {
                tx_forward.send(fwd)?;
            }
        }

        waiters.push(tokio::spawn(async move {
            let outcome = handle.wait().await;
            (outcome, Instant::now().duration_since(start))
        }));
    }

    if terminated {
        acks.stop();
    }

    let mut report = SimReport::default();
    for joined in futures::future::join_all(waiters).await {
        match joined {
            Ok((outcome, latency)) => report.record(&outcome, latency),
            Err(e) => pf_error!("waiter task failed: {}", e),
        }
    }

    if !terminated {
        acks.stop();
    }
    drop(tx_forwards);
    for h in backup_handles {
        let _ = h.await;
    }
    // reply senders live in lingering reply tasks; bound the wait on them
    match time::timeout(
        Duration::from_millis(params.max_delay_ms + 100),
        pump_handle,
    )
    .await
    {
        Ok(Ok(bytes)) => report.reply_bytes = bytes,
        _ => pf_warn!("reply pump did not drain in time"),
    }

    pf_debug!(
        "sample reply in-memory size {} B",
        AckMsg::Ack {
            op: OperationId {
                origin: PRIMARY,
                seq: 0
            },
            topology
        }
        .get_size()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SimParams {
        SimParams {
            backups: 4,
            copies: 2,
            segments: 8,
            writes: 200,
            batch: 1,
            interval_us: 50,
            max_delay_ms: 5,
            fail_rate: 0.0,
            drop_rate: 0.0,
            rebalance_every: 0,
            config: Some("remote_timeout_ms = 2000".into()),
        }
    }

    #[test]
    fn view_assignment() {
        let p = params();
        let v = make_view(1, &p, 0, false);
        assert_eq!(v.primary_of(0), Some(PRIMARY));
        assert_eq!(v.backups_of(0), &[1, 2]);
        assert_eq!(v.backups_of(3), &[4, 1]);
        let v = make_view(2, &p, 1, true);
        assert_eq!(v.primary_of(0), Some(2));
        assert_eq!(v.backups_of(0), &[PRIMARY, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn all_writes_succeed() -> Result<(), AckgridError> {
        let (_tx_term, rx_term) = watch::channel(false);
        let report = run_sim(params(), rx_term).await?;
        assert_eq!(report.succeeded, 200);
        assert_eq!(report.latencies_ms.len(), 200);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn segmented_with_faults() -> Result<(), AckgridError> {
        let mut p = params();
        p.batch = 3;
        p.fail_rate = 0.05;
        p.drop_rate = 0.05;
        p.rebalance_every = 50;
        p.config = Some("remote_timeout_ms = 300".into());
        let (_tx_term, rx_term) = watch::channel(false);
        let report = run_sim(p, rx_term).await?;
        let total = report.succeeded
            + report.failed
            + report.timed_out
            + report.invalidated
            + report.stopped
            + report.rejected;
        assert_eq!(total, 200);
        assert_eq!(report.stopped, 0);
        Ok(())
    }
}
