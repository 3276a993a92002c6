//! Reconciliation of outstanding collectors against topology changes.
//!
//! A backup owner that left the cluster, or that lost ownership of the
//! segment without leaving, can no longer be expected to ack; its
//! requirement is dropped without any network message. Once a collector has
//! been moved to a newer epoch, acks stamped with the older one are rejected
//! by the usual staleness check.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::collect::{
    Collector, CollectorRegistry, OperationId, Owners, Verdict, WriteError,
};
use crate::topology::{NodeAddress, OwnershipView, TopologyId};

impl Collector {
    /// Adjusts the collector to a newly activated ownership view on behalf of
    /// primary node `local`.
    pub(crate) fn reconcile(
        &mut self,
        local: NodeAddress,
        view: &OwnershipView,
    ) -> Verdict {
        let new_id = view.topology_id();
        if new_id <= self.topology_id {
            // same epoch, or the write was issued against a newer one already
            return Verdict::Pending;
        }

        let moved_away = match &self.owners {
            Owners::Single { segment, .. } => {
                view.primary_of(*segment) != Some(local)
            }
            Owners::Segmented { remaining } => remaining
                .keys()
                .any(|&segment| view.primary_of(segment) != Some(local)),
        };
        if moved_away {
            return Verdict::Terminal(Err(WriteError::TopologyChanged {
                topology: new_id,
            }));
        }

        match &mut self.owners {
            Owners::Single { segment, remaining } => {
                remaining.retain(|&node| view.is_owner(*segment, node));
            }
            Owners::Segmented { remaining } => {
                remaining.retain(|&segment, owners| {
                    owners.retain(|&node| view.is_owner(segment, node));
                    !owners.is_empty()
                });
            }
        }
        self.topology_id = new_id;

        if self.owners.is_satisfied() {
            Verdict::Terminal(Ok(()))
        } else {
            Verdict::Pending
        }
    }

    /// Drops requirements on owners that are no longer cluster members. The
    /// epoch is left untouched.
    pub(crate) fn drop_departed(
        &mut self,
        members: &HashSet<NodeAddress>,
    ) -> Verdict {
        match &mut self.owners {
            Owners::Single { remaining, .. } => {
                remaining.retain(|node| members.contains(node));
            }
            Owners::Segmented { remaining } => {
                remaining.retain(|_, owners| {
                    owners.retain(|node| members.contains(node));
                    !owners.is_empty()
                });
            }
        }

        if self.owners.is_satisfied() {
            Verdict::Terminal(Ok(()))
        } else {
            Verdict::Pending
        }
    }
}

/// Drives reconciliation of a registry whenever a new topology activates.
/// Invoked by the membership component once per topology, in increasing
/// order.
#[derive(Debug)]
pub struct TopologyReconciler {
    /// Primary node whose writes are being collected.
    local: NodeAddress,

    /// Highest topology ID applied so far.
    active: AtomicU32,

    /// Ownership view of the active topology, once one has been applied.
    /// Writes registered against an older epoch catch up through it.
    latest: RwLock<Option<Arc<OwnershipView>>>,
}

impl TopologyReconciler {
    pub fn new(local: NodeAddress, initial: TopologyId) -> Self {
        TopologyReconciler {
            local,
            active: AtomicU32::new(initial),
            latest: RwLock::new(None),
        }
    }

    /// Highest topology ID applied so far.
    #[inline]
    pub fn active_topology(&self) -> TopologyId {
        self.active.load(Ordering::Acquire)
    }

    /// Reconciles every outstanding collector of `registry` against `view`.
    /// Returns the number of writes this resolved.
    pub fn on_topology_changed(
        &self,
        registry: &CollectorRegistry,
        view: &OwnershipView,
    ) -> usize {
        let new_id = view.topology_id();
        {
            // view and active ID move together, so `catch_up` never sees an
            // ID newer than the view it can read
            let mut latest =
                self.latest.write().unwrap_or_else(PoisonError::into_inner);
            let prev = self.active.load(Ordering::Acquire);
            if new_id < prev {
                pf_warn!("ignoring out-of-order topology {} < {}", new_id, prev);
                return 0;
            }
            *latest = Some(Arc::new(view.clone()));
            self.active.store(new_id, Ordering::Release);
        }

        let (mut succeeded, mut invalidated) = (0, 0);
        let resolved = registry.sweep(|collector| {
            let verdict = collector.reconcile(self.local, view);
            match verdict {
                Verdict::Terminal(Ok(())) => succeeded += 1,
                Verdict::Terminal(Err(_)) => invalidated += 1,
                _ => {}
            }
            verdict
        });

        pf_debug!(
            "topology {} active: {} writes satisfied, {} invalidated",
            new_id,
            succeeded,
            invalidated
        );
        resolved
    }

    /// Reconciles a write just registered at `topology_id` against the active
    /// view, if that view is newer. Must be called after the write entered
    /// `registry`; a topology activated concurrently is then covered either
    /// here or by that activation's own sweep. Returns true iff this resolved
    /// the write.
    pub fn catch_up(
        &self,
        registry: &CollectorRegistry,
        id: OperationId,
        topology_id: TopologyId,
    ) -> bool {
        if topology_id >= self.active_topology() {
            return false;
        }
        let Some(view) = self
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            // behind the initial topology, with no view to compare against
            return false;
        };

        pf_debug!(
            "write {} registered @ {} behind active {}",
            id,
            topology_id,
            view.topology_id()
        );
        registry.apply(id, "catch-up", |collector| {
            collector.reconcile(self.local, &view)
        })
    }

    /// Drops requirements on nodes absent from `members` without changing
    /// epochs. Returns the number of writes this resolved.
    pub fn on_members_changed(
        &self,
        registry: &CollectorRegistry,
        members: &HashSet<NodeAddress>,
    ) -> usize {
        let resolved =
            registry.sweep(|collector| collector.drop_departed(members));
        pf_debug!(
            "membership {:?}: {} writes satisfied",
            members,
            resolved
        );
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::thread;

    const ME: NodeAddress = 0;

    fn owners(nodes: &[NodeAddress]) -> HashSet<NodeAddress> {
        nodes.iter().copied().collect()
    }

    fn view(
        id: TopologyId,
        assignment: Vec<(u32, Vec<NodeAddress>)>,
    ) -> OwnershipView {
        OwnershipView::new(id, std::iter::empty(), assignment.into_iter().collect())
    }

    #[test]
    fn departed_owner_implicitly_satisfied() {
        let reg = CollectorRegistry::new(ME, 0);
        let rec = TopologyReconciler::new(ME, 5);
        let (id, handle) = reg.create(owners(&[1, 2]), 0, 5);
        reg.ack(id, 1, 5);
        // node 2 left before acking
        assert_eq!(rec.on_topology_changed(&reg, &view(6, vec![(0, vec![ME, 1])])), 1);
        assert_eq!(handle.result(), Some(Ok(())));
        assert!(reg.is_empty());
        assert_eq!(rec.active_topology(), 6);
    }

    #[test]
    fn rebalanced_owner_implicitly_satisfied() {
        let reg = CollectorRegistry::new(ME, 0);
        let rec = TopologyReconciler::new(ME, 5);
        let (id, handle) = reg.create(owners(&[1, 2]), 0, 5);
        // node 2 still a member through segment 1, but no longer owns 0
        rec.on_topology_changed(&reg, &view(6, vec![(0, vec![ME, 1]), (1, vec![2])]));
        assert!(!handle.is_done());
        assert_eq!(reg.outstanding(id), Some(1));
        reg.ack(id, 1, 6);
        assert_eq!(handle.result(), Some(Ok(())));
    }

    #[test]
    fn old_epoch_ack_rejected_after_reconcile() {
        let reg = CollectorRegistry::new(ME, 0);
        let rec = TopologyReconciler::new(ME, 5);
        let (id, handle) = reg.create(owners(&[1, 2]), 0, 5);
        rec.on_topology_changed(&reg, &view(6, vec![(0, vec![ME, 1, 2])]));
        reg.ack(id, 1, 5);
        reg.ack(id, 2, 5);
        assert!(!handle.is_done());
        assert_eq!(reg.outstanding(id), Some(2));
        reg.ack(id, 1, 6);
        reg.ack(id, 2, 6);
        assert_eq!(handle.result(), Some(Ok(())));
    }

    #[test]
    fn primary_moved_away() {
        let reg = CollectorRegistry::new(ME, 0);
        let rec = TopologyReconciler::new(ME, 5);
        let (_, handle) = reg.create(owners(&[1, 2]), 0, 5);
        rec.on_topology_changed(&reg, &view(6, vec![(0, vec![1, ME, 2])]));
        assert_eq!(
            handle.result(),
            Some(Err(WriteError::TopologyChanged { topology: 6 }))
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn same_epoch_untouched() {
        let reg = CollectorRegistry::new(ME, 0);
        let rec = TopologyReconciler::new(ME, 4);
        let (id, handle) = reg.create(owners(&[1, 2]), 0, 5);
        rec.on_topology_changed(&reg, &view(5, vec![(0, vec![1])]));
        assert!(!handle.is_done());
        assert_eq!(reg.outstanding(id), Some(2));
    }

    #[test]
    fn out_of_order_topology_ignored() {
        let reg = CollectorRegistry::new(ME, 0);
        let rec = TopologyReconciler::new(ME, 7);
        let (_, handle) = reg.create(owners(&[1]), 0, 5);
        assert_eq!(rec.on_topology_changed(&reg, &view(6, vec![(0, vec![ME])])), 0);
        assert!(!handle.is_done());
        assert_eq!(rec.active_topology(), 7);
    }

    #[test]
    fn segmented_reconcile() {
        let reg = CollectorRegistry::new(ME, 0);
        let rec = TopologyReconciler::new(ME, 5);
        let (id, handle) = reg.create_segmented(
            HashMap::from([(1, owners(&[11, 12])), (2, owners(&[12]))]),
            5,
        );
        // 12 leaves: segment 2 drains, segment 1 still waits on 11
        rec.on_topology_changed(&reg, &view(6, vec![(1, vec![ME, 11]), (2, vec![ME])]));
        assert_eq!(reg.outstanding(id), Some(1));
        reg.segment_ack(id, 11, 6, 1);
        assert_eq!(handle.result(), Some(Ok(())));
    }

    #[test]
    fn segmented_primary_moved_for_one_segment() {
        let reg = CollectorRegistry::new(ME, 0);
        let rec = TopologyReconciler::new(ME, 5);
        let (_, handle) = reg.create_segmented(
            HashMap::from([(1, owners(&[11])), (2, owners(&[12]))]),
            5,
        );
        rec.on_topology_changed(&reg, &view(6, vec![(1, vec![ME, 11]), (2, vec![12])]));
        assert_eq!(
            handle.result(),
            Some(Err(WriteError::TopologyChanged { topology: 6 }))
        );
    }

    #[test]
    fn members_changed() {
        let reg = CollectorRegistry::new(ME, 0);
        let rec = TopologyReconciler::new(ME, 5);
        let (a, ha) = reg.create(owners(&[1, 2]), 0, 5);
        let (_, hb) = reg.create(owners(&[2]), 0, 5);
        assert_eq!(rec.on_members_changed(&reg, &owners(&[ME, 1])), 1);
        assert_eq!(hb.result(), Some(Ok(())));
        assert!(!ha.is_done());
        // epoch unchanged, so acks from topology 5 still count
        reg.ack(a, 1, 5);
        assert_eq!(ha.result(), Some(Ok(())));
    }

    #[test]
    fn catch_up_late_registration() {
        let reg = CollectorRegistry::new(ME, 0);
        let rec = TopologyReconciler::new(ME, 5);
        rec.on_topology_changed(&reg, &view(6, vec![(0, vec![ME, 1])]));

        let (id, handle) = reg.create(owners(&[1, 2]), 0, 5);
        assert!(!rec.catch_up(&reg, id, 5));
        assert_eq!(reg.outstanding(id), Some(1));
        // moved to epoch 6 along with the view
        reg.ack(id, 1, 5);
        assert!(!handle.is_done());
        reg.ack(id, 1, 6);
        assert_eq!(handle.result(), Some(Ok(())));

        let (id, handle) = reg.create(owners(&[2]), 0, 5);
        assert!(rec.catch_up(&reg, id, 5));
        assert_eq!(handle.result(), Some(Ok(())));
        assert!(reg.is_empty());
    }

    #[test]
    fn catch_up_without_view() {
        let reg = CollectorRegistry::new(ME, 0);
        let rec = TopologyReconciler::new(ME, 5);
        let (id, handle) = reg.create(owners(&[1, 2]), 0, 3);
        assert!(!rec.catch_up(&reg, id, 3));
        assert!(!handle.is_done());
        assert_eq!(reg.outstanding(id), Some(2));
    }

    #[test]
    fn topology_change_races_acks() {
        let reg = Arc::new(CollectorRegistry::new(ME, 0));
        let rec = Arc::new(TopologyReconciler::new(ME, 5));
        // segment 0 stays with this node, segment 1 moves to node 1
        let writes: Vec<_> = (0..400u32)
            .map(|i| (i % 2, reg.create(owners(&[1, 2]), i % 2, 5)))
            .collect();
        let ids: Arc<Vec<OperationId>> =
            Arc::new(writes.iter().map(|(_, (id, _))| *id).collect());

        let mut acking: Vec<_> = [1, 2]
            .into_iter()
            .map(|b| {
                let reg = reg.clone();
                let ids = ids.clone();
                thread::spawn(move || {
                    for &id in ids.iter() {
                        // stamped with the new epoch, accepted either way
                        reg.ack(id, b, 6);
                    }
                    0
                })
            })
            .collect();
        let changing = {
            let reg = reg.clone();
            let rec = rec.clone();
            thread::spawn(move || {
                rec.on_topology_changed(
                    &reg,
                    &view(6, vec![(0, vec![ME, 1, 2]), (1, vec![1, ME, 2])]),
                )
            })
        };
        acking.push(changing);
        let swept = acking
            .into_iter()
            .map(|t| t.join().unwrap())
            .sum::<usize>();

        let mut invalidated = 0;
        for (segment, (_, handle)) in &writes {
            match handle.result().expect("write should be terminal") {
                Ok(()) => {}
                Err(WriteError::TopologyChanged { topology: 6 }) => {
                    assert_eq!(*segment, 1);
                    invalidated += 1;
                }
                Err(e) => panic!("unexpected outcome {:?}", e),
            }
        }
        // segment 0 writes keep waiting on the acks in every interleaving, so
        // the sweep resolved exactly the invalidated ones
        assert_eq!(swept, invalidated);
        assert!(reg.is_empty());
    }
}
